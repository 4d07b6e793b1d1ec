//! Ceremony configuration
//!
//! Loaded from a TOML file (by default `<config dir>/keysign/ceremony.toml`)
//! and then overridden from the command line.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KeysignError, Result};
use crate::target::TargetKey;

/// Configuration directory under the user's config dir
const CONFIG_DIR_NAME: &str = "keysign";

/// Configuration file name
const CONFIG_FILE_NAME: &str = "ceremony.toml";

/// Everything a ceremony needs to know before it starts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CeremonyConfig {
    /// Labels of the organizational identities that sign, in signing order
    #[serde(default)]
    pub identities: Vec<String>,

    /// Fingerprint (or key id, to be confirmed interactively) of the key to sign
    #[serde(default)]
    pub target: String,

    /// Name of the ephemeral volume holding the ceremony keyring
    #[serde(default = "default_volume_name")]
    pub volume_name: String,

    /// String the operator must type to approve a key id
    #[serde(default = "default_confirmation")]
    pub confirmation: String,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub environment: EnvironmentConfig,
}

/// External programs the ceremony drives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    #[serde(default = "default_gpg")]
    pub gpg: String,

    /// Secret lookup tool, called as `<tool> gnupg/<identity>/<field>`
    #[serde(default = "default_secret_store")]
    pub secret_store: String,

    /// Keyserver discovery tool; prints one endpoint per line
    #[serde(default = "default_discovery")]
    pub keyserver_discovery: String,

    #[serde(default = "default_discovery_args")]
    pub keyserver_discovery_args: Vec<String>,

    /// Ephemeral volume utility with `path|create|destroy <name>` subcommands
    #[serde(default = "default_volume_tool")]
    pub volume: String,

    /// Pass `--pinentry-mode loopback` when signing (GnuPG 2.1+)
    #[serde(default = "default_true")]
    pub loopback_pinentry: bool,
}

/// How the environment handed to every tool is scrubbed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Version-manager roots; PATH entries below them are dropped. `~/` is
    /// expanded against HOME.
    #[serde(default = "default_strip_path_prefixes")]
    pub strip_path_prefixes: Vec<String>,

    /// Variables whose values name further version-manager roots
    #[serde(default = "default_root_vars")]
    pub root_vars: Vec<String>,

    /// Variables removed outright
    #[serde(default = "default_remove_vars")]
    pub remove_vars: Vec<String>,

    /// Variables removed by prefix
    #[serde(default = "default_remove_prefixes")]
    pub remove_prefixes: Vec<String>,
}

fn default_volume_name() -> String {
    "gpg-ceremony".into()
}

fn default_confirmation() -> String {
    "sign".into()
}

fn default_gpg() -> String {
    "gpg".into()
}

fn default_secret_store() -> String {
    "fetch-password".into()
}

fn default_discovery() -> String {
    "ls-servers".into()
}

fn default_discovery_args() -> Vec<String> {
    ["--silent", "-NSat", "keyserver"].map(String::from).to_vec()
}

fn default_volume_tool() -> String {
    "ramdisk".into()
}

fn default_true() -> bool {
    true
}

fn default_strip_path_prefixes() -> Vec<String> {
    ["~/.rbenv", "~/.pyenv", "~/.nodenv", "~/.asdf", "~/.nvm"]
        .map(String::from)
        .to_vec()
}

fn default_root_vars() -> Vec<String> {
    ["RBENV_ROOT", "PYENV_ROOT", "NODENV_ROOT", "ASDF_DATA_DIR", "NVM_DIR"]
        .map(String::from)
        .to_vec()
}

fn default_remove_vars() -> Vec<String> {
    [
        "RBENV_VERSION",
        "PYENV_VERSION",
        "NODENV_VERSION",
        "ASDF_DIR",
        "RUBYOPT",
        "RUBYLIB",
        "GEM_HOME",
        "GEM_PATH",
    ]
    .map(String::from)
    .to_vec()
}

fn default_remove_prefixes() -> Vec<String> {
    vec!["BUNDLE_".into()]
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            gpg: default_gpg(),
            secret_store: default_secret_store(),
            keyserver_discovery: default_discovery(),
            keyserver_discovery_args: default_discovery_args(),
            volume: default_volume_tool(),
            loopback_pinentry: true,
        }
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            strip_path_prefixes: default_strip_path_prefixes(),
            root_vars: default_root_vars(),
            remove_vars: default_remove_vars(),
            remove_prefixes: default_remove_prefixes(),
        }
    }
}

impl Default for CeremonyConfig {
    fn default() -> Self {
        Self {
            identities: Vec::new(),
            target: String::new(),
            volume_name: default_volume_name(),
            confirmation: default_confirmation(),
            tools: ToolsConfig::default(),
            environment: EnvironmentConfig::default(),
        }
    }
}

impl CeremonyConfig {
    /// Default configuration file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| KeysignError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check the configuration is usable and parse the target key
    pub fn validate(&self) -> Result<TargetKey> {
        if self.identities.is_empty() {
            return Err(KeysignError::InvalidConfig(
                "at least one signing identity is required".into(),
            ));
        }

        let mut seen = HashSet::new();
        for identity in &self.identities {
            if identity.is_empty() || identity.contains('/') {
                return Err(KeysignError::InvalidConfig(format!(
                    "identity label '{}' must be non-empty and must not contain '/'",
                    identity
                )));
            }
            if !seen.insert(identity.as_str()) {
                return Err(KeysignError::InvalidConfig(format!(
                    "identity '{}' listed twice",
                    identity
                )));
            }
        }

        if self.volume_name.trim().is_empty() {
            return Err(KeysignError::InvalidConfig("volume_name is empty".into()));
        }
        if self.confirmation.is_empty() {
            return Err(KeysignError::InvalidConfig("confirmation string is empty".into()));
        }

        Ok(TargetKey::parse(&self.target)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FINGERPRINT: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = CeremonyConfig::from_toml(&format!(
            "identities = [\"org-release\"]\ntarget = \"{}\"\n",
            FINGERPRINT
        ))
        .unwrap();

        assert_eq!(config.volume_name, "gpg-ceremony");
        assert_eq!(config.confirmation, "sign");
        assert_eq!(config.tools.gpg, "gpg");
        assert_eq!(config.tools.secret_store, "fetch-password");
        assert_eq!(config.tools.keyserver_discovery_args, vec!["--silent", "-NSat", "keyserver"]);
        assert!(config.tools.loopback_pinentry);
        assert!(config.environment.remove_vars.contains(&"RBENV_VERSION".to_string()));

        assert!(config.validate().unwrap().is_fingerprint());
    }

    #[test]
    fn test_full_config() {
        let config = CeremonyConfig::from_toml(
            r#"
identities = ["org-release", "org-archive"]
target = "DEADBEEF"
volume_name = "keysign-test"
confirmation = "yes, sign it"

[tools]
gpg = "/usr/local/bin/gpg2"
volume = "/opt/bin/ramdisk"
loopback_pinentry = false

[environment]
remove_vars = ["FOO"]
"#,
        )
        .unwrap();

        assert_eq!(config.identities.len(), 2);
        assert_eq!(config.tools.gpg, "/usr/local/bin/gpg2");
        assert_eq!(config.tools.secret_store, "fetch-password");
        assert!(!config.tools.loopback_pinentry);
        assert_eq!(config.environment.remove_vars, vec!["FOO"]);
        assert_eq!(config.environment.remove_prefixes, vec!["BUNDLE_"]);
        assert!(!config.validate().unwrap().is_fingerprint());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = CeremonyConfig::from_toml("identities = []\ntargett = \"x\"\n").unwrap_err();
        assert!(matches!(err, KeysignError::Parse(_)));
    }

    #[test]
    fn test_validation() {
        let mut config = CeremonyConfig {
            target: FINGERPRINT.into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(KeysignError::InvalidConfig(_))));

        config.identities = vec!["a/b".into()];
        assert!(matches!(config.validate(), Err(KeysignError::InvalidConfig(_))));

        config.identities = vec!["org".into(), "org".into()];
        assert!(matches!(config.validate(), Err(KeysignError::InvalidConfig(_))));

        config.identities = vec!["org".into()];
        config.target = "not-a-key".into();
        assert!(matches!(config.validate(), Err(KeysignError::Target(_))));
    }

    #[test]
    fn test_toml_round_trip_of_defaults() {
        let config = CeremonyConfig {
            identities: vec!["org-release".into()],
            target: FINGERPRINT.into(),
            ..Default::default()
        };

        let text = config.to_toml().unwrap();
        let parsed = CeremonyConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.identities, config.identities);
        assert_eq!(parsed.environment.strip_path_prefixes, config.environment.strip_path_prefixes);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CeremonyConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, KeysignError::Io { .. }));
    }
}
