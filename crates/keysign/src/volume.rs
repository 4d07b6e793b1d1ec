//! Ephemeral volume operations
//!
//! The ceremony keyring lives on a memory-backed volume managed by an
//! external utility invoked as `<tool> path|create|destroy <name>`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use keysign_core::{CommandSpec, ProcessRunner, Result};
use tracing::info;

pub struct EphemeralVolume<'a> {
    runner: &'a dyn ProcessRunner,
    program: &'a str,
    name: &'a str,
    env: &'a BTreeMap<String, String>,
}

impl<'a> EphemeralVolume<'a> {
    pub fn new(
        runner: &'a dyn ProcessRunner,
        program: &'a str,
        name: &'a str,
        env: &'a BTreeMap<String, String>,
    ) -> Self {
        Self {
            runner,
            program,
            name,
            env,
        }
    }

    fn command(&self, subcommand: &str) -> CommandSpec {
        CommandSpec::new(self.program)
            .arg(subcommand)
            .arg(self.name)
            .env(self.env.clone())
    }

    /// Mount point of the volume, or `None` if it does not exist
    pub fn locate(&self) -> Result<Option<PathBuf>> {
        match self.runner.run(&self.command("path")) {
            Ok(output) => {
                let text = output.text();
                let path = text.trim_end_matches(['\r', '\n']);
                if path.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(PathBuf::from(path)))
                }
            }
            Err(e) if e.is_non_zero_exit() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn create(&self) -> Result<()> {
        info!(volume = %self.name, "Creating ephemeral volume");
        self.runner.run(&self.command("create"))?;
        Ok(())
    }

    pub fn destroy(&self) -> Result<()> {
        info!(volume = %self.name, "Destroying ephemeral volume");
        self.runner.run(&self.command("destroy"))?;
        Ok(())
    }
}
