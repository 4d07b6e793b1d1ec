//! Keyserver discovery

use std::collections::BTreeMap;

use keysign_core::{CommandSpec, ProcessRunner, Result};

/// Runs the configured discovery tool
pub struct KeyserverDiscovery<'a> {
    runner: &'a dyn ProcessRunner,
    program: &'a str,
    args: &'a [String],
    env: &'a BTreeMap<String, String>,
}

impl<'a> KeyserverDiscovery<'a> {
    pub fn new(
        runner: &'a dyn ProcessRunner,
        program: &'a str,
        args: &'a [String],
        env: &'a BTreeMap<String, String>,
    ) -> Self {
        Self {
            runner,
            program,
            args,
            env,
        }
    }

    /// Keyserver endpoints in the order the tool printed them
    pub fn discover(&self) -> Result<Vec<String>> {
        let spec = CommandSpec::new(self.program)
            .args(self.args.iter().cloned())
            .env(self.env.clone());
        let output = self.runner.run(&spec)?;
        Ok(parse_keyservers(&output.text()))
    }
}

/// One endpoint per line; blank lines are ignored
pub fn parse_keyservers(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keyservers() {
        let servers = parse_keyservers("hkps://keys.example.org\n\n  hkp://pool.example.net:11371 \n");
        assert_eq!(
            servers,
            vec!["hkps://keys.example.org", "hkp://pool.example.net:11371"]
        );
    }

    #[test]
    fn test_empty_output_is_empty_list() {
        assert!(parse_keyservers("").is_empty());
        assert!(parse_keyservers("\n\n").is_empty());
    }
}
