//! Secret store lookups
//!
//! Key material lives in an external secret store reached through a lookup
//! tool: `<tool> gnupg/<identity>/<field>` prints the secret on stdout.

use std::collections::BTreeMap;

use keysign_core::{CommandSpec, ProcessRunner, Result, SecretBytes};
use tracing::debug;

/// Per-identity entries kept in the secret store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretField {
    Fingerprint,
    PublicKey,
    PrivateKey,
    Passphrase,
}

impl SecretField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretField::Fingerprint => "fingerprint",
            SecretField::PublicKey => "pubkey",
            SecretField::PrivateKey => "privkey",
            SecretField::Passphrase => "passphrase",
        }
    }
}

/// Store path of `field` for the identity labelled `identity`
pub fn secret_path(identity: &str, field: SecretField) -> String {
    format!("gnupg/{}/{}", identity, field.as_str())
}

/// Lookup tool bound to a runner and the scrubbed environment
pub struct SecretStore<'a> {
    runner: &'a dyn ProcessRunner,
    program: &'a str,
    env: &'a BTreeMap<String, String>,
}

impl<'a> SecretStore<'a> {
    pub fn new(
        runner: &'a dyn ProcessRunner,
        program: &'a str,
        env: &'a BTreeMap<String, String>,
    ) -> Self {
        Self { runner, program, env }
    }

    /// Fetch a secret; the result is zeroized when dropped
    pub fn fetch(&self, identity: &str, field: SecretField) -> Result<SecretBytes> {
        let path = secret_path(identity, field);
        debug!(path = %path, "Fetching from secret store");

        let spec = CommandSpec::new(self.program)
            .arg(path)
            .env(self.env.clone());
        Ok(self.runner.run(&spec)?.into_secret())
    }

    /// Fetch a non-secret value such as a fingerprint, trimmed
    pub fn fetch_text(&self, identity: &str, field: SecretField) -> Result<String> {
        let value = self.fetch(identity, field)?;
        Ok(String::from_utf8_lossy(value.expose()).trim().to_string())
    }
}
