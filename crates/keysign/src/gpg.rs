//! Isolated gpg keyring
//!
//! Every gpg invocation the ceremony makes goes through [`IsolatedKeyring`],
//! which pins the home directory, keyrings and trust database to the
//! ephemeral volume and runs gpg from inside it. Nothing is read from or
//! written to the operator's own keyring.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use keysign_core::{probe, CommandSpec, ProcessError, ProcessRunner, Result, SecretBytes};
use tracing::debug;

/// Descriptor the passphrase is delivered on when signing
pub const PASSPHRASE_FD: i32 = 3;

/// Isolation flags placed ahead of every gpg command
pub fn isolation_args(home: &Path) -> Vec<String> {
    let file = |name: &str| home.join(name).display().to_string();
    vec![
        "--homedir".into(),
        home.display().to_string(),
        "--no-options".into(),
        "--no-default-keyring".into(),
        "--keyring".into(),
        file("pubring.gpg"),
        "--secret-keyring".into(),
        file("secring.gpg"),
        "--trustdb-name".into(),
        file("trustdb.gpg"),
    ]
}

/// Primary-key fingerprints in `--with-colons` output.
///
/// Only the `fpr` record directly following a `pub` record counts; subkey
/// fingerprints are ignored.
pub fn parse_primary_fingerprints(colons: &str) -> Vec<String> {
    let mut fingerprints = Vec::new();
    let mut after_primary = false;

    for line in colons.lines() {
        let mut fields = line.split(':');
        match fields.next() {
            Some("pub") => after_primary = true,
            Some("fpr") if after_primary => {
                after_primary = false;
                if let Some(fpr) = fields.nth(8).filter(|f| !f.is_empty()) {
                    fingerprints.push(fpr.to_ascii_uppercase());
                }
            }
            Some("sub") | Some("sec") | Some("ssb") => after_primary = false,
            _ => {}
        }
    }

    fingerprints
}

/// A gpg keyring rooted on the ephemeral volume
pub struct IsolatedKeyring<'a> {
    runner: &'a dyn ProcessRunner,
    program: &'a str,
    home: PathBuf,
    env: &'a BTreeMap<String, String>,
}

impl<'a> IsolatedKeyring<'a> {
    pub fn new(
        runner: &'a dyn ProcessRunner,
        program: &'a str,
        home: impl Into<PathBuf>,
        env: &'a BTreeMap<String, String>,
    ) -> Self {
        Self {
            runner,
            program,
            home: home.into(),
            env,
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// A gpg command confined to the volume
    pub fn command<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.program)
            .args(isolation_args(&self.home))
            .args(args)
            .current_dir(&self.home)
            .env(self.env.clone())
    }

    fn run(&self, spec: CommandSpec) -> std::result::Result<String, ProcessError> {
        Ok(self.runner.run(&spec)?.text())
    }

    pub fn has_public_key(&self, key: &str) -> Result<bool> {
        Ok(probe(self.runner.run(&self.command(["--list-keys", key])))?)
    }

    pub fn has_secret_key(&self, key: &str) -> Result<bool> {
        Ok(probe(
            self.runner.run(&self.command(["--list-secret-keys", key])),
        )?)
    }

    /// Import armored key material supplied on stdin
    pub fn import(&self, material: SecretBytes) -> std::result::Result<(), ProcessError> {
        self.runner
            .run(&self.command(["--batch", "--import"]).stdin(material))?;
        Ok(())
    }

    pub fn receive_key(&self, keyserver: &str, key: &str) -> Result<()> {
        debug!(keyserver = %keyserver, key = %key, "Receiving key");
        self.run(self.command(["--keyserver", keyserver, "--recv-keys", key]))?;
        Ok(())
    }

    /// Primary fingerprints of the keys matching `key`
    pub fn fingerprints(&self, key: &str) -> Result<Vec<String>> {
        let colons = self.run(self.command(["--with-colons", "--fingerprint", key]))?;
        Ok(parse_primary_fingerprints(&colons))
    }

    /// Human-readable listing for the operator
    pub fn describe(&self, key: &str) -> Result<String> {
        Ok(self.run(self.command(["--fingerprint", key]))?)
    }

    /// Sign `target` with `signer`; the passphrase only travels on
    /// [`PASSPHRASE_FD`].
    pub fn sign_key(
        &self,
        signer: &str,
        target: &str,
        passphrase: SecretBytes,
        loopback_pinentry: bool,
    ) -> std::result::Result<(), ProcessError> {
        let fd = PASSPHRASE_FD.to_string();
        let mut args = vec![
            "--default-key",
            signer,
            "--passphrase-fd",
            fd.as_str(),
            "--batch",
            "--yes",
        ];
        if loopback_pinentry {
            args.extend(["--pinentry-mode", "loopback"]);
        }
        args.extend(["--sign-key", target]);

        self.runner
            .run(&self.command(args).secret_fd(PASSPHRASE_FD, passphrase))?;
        Ok(())
    }

    pub fn send_key(&self, keyserver: &str, key: &str) -> Result<()> {
        debug!(keyserver = %keyserver, key = %key, "Sending key");
        self.run(self.command(["--keyserver", keyserver, "--send-keys", key]))?;
        Ok(())
    }
}
