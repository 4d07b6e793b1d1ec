//! The signing ceremony
//!
//! Eight steps over one context. Checked steps detect their own effect so an
//! interrupted ceremony can be re-run and pick up where it stopped; the
//! ephemeral volume is destroyed at the end of every invocation, whatever
//! happened.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use keysign_core::{
    Error, ProcessRunner, Result, SecretBytes, SequenceError, SequenceReport, Sequencer, Step,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::CeremonyConfig;
use crate::env::scrub_environment;
use crate::gpg::IsolatedKeyring;
use crate::keyservers::KeyserverDiscovery;
use crate::operator::Operator;
use crate::secrets::{SecretField, SecretStore};
use crate::target::TargetKey;
use crate::volume::EphemeralVolume;

pub const PROVISION_VOLUME: &str = "Provision ephemeral volume";
pub const LOAD_IDENTITIES: &str = "Load signing identities";
pub const DISCOVER_KEYSERVERS: &str = "Discover keyservers";
pub const PROVISION_KEYRING: &str = "Provision ceremony keyring";
pub const RETRIEVE_TARGET: &str = "Retrieve target key";
pub const CONFIRM_TARGET: &str = "Confirm target key";
pub const SIGN_TARGET: &str = "Sign target key";
pub const PUBLISH: &str = "Publish signed key";

/// A keyserver that refused the signed key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishFailure {
    pub keyserver: String,
    pub error: String,
}

/// Ceremony context handed to every step
pub struct SigningCeremony {
    config: CeremonyConfig,
    target: TargetKey,
    runner: Box<dyn ProcessRunner>,
    operator: Box<dyn Operator>,
    env: BTreeMap<String, String>,
    volume_path: Option<PathBuf>,
    identities: HashMap<String, String>,
    keyservers: Vec<String>,
    publish_failures: Vec<PublishFailure>,
}

impl SigningCeremony {
    /// Prepare a ceremony that runs tools under the scrubbed process environment
    pub fn new(
        config: CeremonyConfig,
        runner: Box<dyn ProcessRunner>,
        operator: Box<dyn Operator>,
    ) -> crate::error::Result<Self> {
        let vars = std::env::vars_os()
            .filter_map(|(name, value)| Some((name.into_string().ok()?, value.into_string().ok()?)));
        Self::from_environment(config, runner, operator, vars)
    }

    /// Prepare a ceremony from an explicit set of environment variables
    pub fn from_environment<I>(
        config: CeremonyConfig,
        runner: Box<dyn ProcessRunner>,
        operator: Box<dyn Operator>,
        vars: I,
    ) -> crate::error::Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let target = config.validate()?;
        let env = scrub_environment(vars, &config.environment);

        Ok(Self {
            config,
            target,
            runner,
            operator,
            env,
            volume_path: None,
            identities: HashMap::new(),
            keyservers: Vec::new(),
            publish_failures: Vec::new(),
        })
    }

    /// The ceremony's steps, in execution order
    pub fn steps() -> Vec<Step<Self>> {
        vec![
            Step::checked(
                PROVISION_VOLUME,
                Self::volume_provisioned,
                Self::provision_volume,
            ),
            Step::always(LOAD_IDENTITIES, Self::load_identities),
            Step::always(DISCOVER_KEYSERVERS, Self::discover_keyservers),
            Step::checked(
                PROVISION_KEYRING,
                |c: &mut Self| c.keyring_provisioned(),
                Self::provision_keyring,
            ),
            Step::checked(
                RETRIEVE_TARGET,
                |c: &mut Self| c.keyring()?.has_public_key(c.target.as_str()),
                Self::retrieve_target,
            ),
            Step::checked(
                CONFIRM_TARGET,
                |c: &mut Self| Ok(c.target.is_fingerprint()),
                Self::confirm_target,
            ),
            Step::always(SIGN_TARGET, Self::sign_target),
            Step::always(PUBLISH, Self::publish),
        ]
    }

    /// Run the ceremony. The volume is destroyed exactly once before this
    /// returns, and also if a step panics.
    pub fn run(&mut self) -> std::result::Result<SequenceReport, SequenceError> {
        info!(
            key = %self.target,
            identities = ?self.config.identities,
            volume = %self.config.volume_name,
            "Starting signing ceremony"
        );
        Sequencer::new(Self::steps()).run_scoped(self, Self::destroy_volume)
    }

    pub fn config(&self) -> &CeremonyConfig {
        &self.config
    }

    /// Key being signed; a full fingerprint once confirmed
    pub fn target(&self) -> &TargetKey {
        &self.target
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn volume_path(&self) -> Option<&Path> {
        self.volume_path.as_deref()
    }

    /// Loaded `(label, fingerprint)` pairs in configured order
    pub fn identities(&self) -> Vec<(&str, &str)> {
        self.config
            .identities
            .iter()
            .filter_map(|label| {
                self.identities
                    .get(label)
                    .map(|fpr| (label.as_str(), fpr.as_str()))
            })
            .collect()
    }

    pub fn keyservers(&self) -> &[String] {
        &self.keyservers
    }

    pub fn publish_failures(&self) -> &[PublishFailure] {
        &self.publish_failures
    }

    fn volume(&self) -> EphemeralVolume<'_> {
        EphemeralVolume::new(
            self.runner.as_ref(),
            &self.config.tools.volume,
            &self.config.volume_name,
            &self.env,
        )
    }

    fn secret_store(&self) -> SecretStore<'_> {
        SecretStore::new(self.runner.as_ref(), &self.config.tools.secret_store, &self.env)
    }

    fn keyring(&self) -> Result<IsolatedKeyring<'_>> {
        let home = self.volume_path.as_ref().ok_or_else(|| {
            Error::Precondition("ephemeral volume has not been provisioned".into())
        })?;
        Ok(IsolatedKeyring::new(
            self.runner.as_ref(),
            &self.config.tools.gpg,
            home.clone(),
            &self.env,
        ))
    }

    fn volume_provisioned(&mut self) -> Result<bool> {
        let located = self.volume().locate()?;
        match located {
            Some(path) => {
                info!(path = %path.display(), "Reusing existing volume");
                self.volume_path = Some(path);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn provision_volume(&mut self) -> Result<()> {
        let volume = self.volume();
        volume.create().map_err(|e| {
            Error::Precondition(format!(
                "could not create volume '{}': {}",
                self.config.volume_name, e
            ))
        })?;
        let located = volume.locate()?;

        let path = located.ok_or_else(|| {
            Error::Precondition(format!(
                "volume '{}' cannot be located after creation",
                self.config.volume_name
            ))
        })?;
        info!(path = %path.display(), "Volume ready");
        self.volume_path = Some(path);
        Ok(())
    }

    fn load_identities(&mut self) -> Result<()> {
        let store = self.secret_store();
        let mut loaded = HashMap::new();

        for label in &self.config.identities {
            let fingerprint = store.fetch_text(label, SecretField::Fingerprint)?;
            if fingerprint.is_empty() {
                return Err(Error::Precondition(format!(
                    "secret store returned an empty fingerprint for identity '{}'",
                    label
                )));
            }
            info!(identity = %label, fingerprint = %fingerprint, "Loaded signing identity");
            loaded.insert(label.clone(), fingerprint);
        }

        self.identities = loaded;
        Ok(())
    }

    fn discover_keyservers(&mut self) -> Result<()> {
        let keyservers = KeyserverDiscovery::new(
            self.runner.as_ref(),
            &self.config.tools.keyserver_discovery,
            &self.config.tools.keyserver_discovery_args,
            &self.env,
        )
        .discover()?;

        if keyservers.is_empty() {
            warn!("No keyservers discovered");
        } else {
            info!(count = keyservers.len(), keyservers = ?keyservers, "Discovered keyservers");
        }
        self.keyservers = keyservers;
        Ok(())
    }

    fn keyring_provisioned(&self) -> Result<bool> {
        let keyring = self.keyring()?;

        for label in &self.config.identities {
            let Some(fingerprint) = self.identities.get(label) else {
                return Ok(false);
            };
            if !keyring.has_public_key(fingerprint)? || !keyring.has_secret_key(fingerprint)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn provision_keyring(&mut self) -> Result<()> {
        let keyring = self.keyring()?;
        let store = self.secret_store();

        for label in &self.config.identities {
            let public = store.fetch(label, SecretField::PublicKey)?;
            let private = store.fetch(label, SecretField::PrivateKey)?;

            keyring
                .import(SecretBytes::concat(&[&public, &private]))
                .map_err(|source| Error::ImportFailed {
                    identity: label.clone(),
                    source,
                })?;
            info!(identity = %label, "Imported key material");
        }
        Ok(())
    }

    fn retrieve_target(&mut self) -> Result<()> {
        let keyring = self.keyring()?;
        let key = self.target.as_str();

        for keyserver in &self.keyservers {
            match keyring.receive_key(keyserver, key) {
                Ok(()) => {
                    info!(key = %key, keyserver = %keyserver, "Retrieved target key");
                    return Ok(());
                }
                Err(e) => warn!(key = %key, keyserver = %keyserver, error = %e, "Retrieval failed"),
            }
        }

        Err(Error::ExhaustedAlternatives {
            operation: format!("Retrieving key {}", key),
            attempted: self.keyservers.len(),
        })
    }

    fn confirm_target(&mut self) -> Result<()> {
        let keyring = self.keyring()?;
        let key = self.target.to_string();

        let fingerprint = match keyring.fingerprints(&key)?.as_slice() {
            [single] => single.clone(),
            [] => {
                return Err(Error::Precondition(format!(
                    "no key matching {} in the ceremony keyring",
                    key
                )))
            }
            several => {
                return Err(Error::Precondition(format!(
                    "key id {} is ambiguous: it matches {} keys ({})",
                    key,
                    several.len(),
                    several.join(", ")
                )))
            }
        };
        let listing = keyring.describe(&fingerprint)?;

        self.operator
            .show(&format!("Check that this is the key to sign:\n{}", listing))?;
        let answer = self.operator.prompt(&format!(
            "Type '{}' to sign the key above: ",
            self.config.confirmation
        ))?;

        match answer {
            Some(line) if line == self.config.confirmation => {
                info!(key = %key, fingerprint = %fingerprint, "Operator confirmed target key");
                self.target = TargetKey::confirmed(&fingerprint);
                Ok(())
            }
            Some(line) => Err(Error::OperatorAbort(format!(
                "typed '{}' instead of '{}'",
                line, self.config.confirmation
            ))),
            None => Err(Error::OperatorAbort(
                "input closed before confirmation".into(),
            )),
        }
    }

    fn sign_target(&mut self) -> Result<()> {
        let keyring = self.keyring()?;
        let store = self.secret_store();
        let target = self.target.as_str();

        for label in &self.config.identities {
            let signer = self.identities.get(label).ok_or_else(|| {
                Error::Precondition(format!("no fingerprint loaded for identity '{}'", label))
            })?;
            let passphrase = store
                .fetch(label, SecretField::Passphrase)?
                .trim_end_newlines();

            keyring
                .sign_key(signer, target, passphrase, self.config.tools.loopback_pinentry)
                .map_err(|source| Error::SignFailed {
                    identity: label.clone(),
                    source,
                })?;
            info!(identity = %label, key = %target, "Signed target key");
        }
        Ok(())
    }

    fn publish(&mut self) -> Result<()> {
        let key = self.target.to_string();
        let mut failures = Vec::new();

        if self.keyservers.is_empty() {
            warn!(key = %key, "No keyservers discovered, signed key was not published");
            self.publish_failures = failures;
            return Ok(());
        }

        let keyring = self.keyring()?;
        for keyserver in &self.keyservers {
            match keyring.send_key(keyserver, &key) {
                Ok(()) => info!(key = %key, keyserver = %keyserver, "Published"),
                Err(e) => {
                    warn!(key = %key, keyserver = %keyserver, error = %e, "Publishing failed");
                    failures.push(PublishFailure {
                        keyserver: keyserver.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let attempted = self.keyservers.len();
        let all_failed = failures.len() == attempted;
        self.publish_failures = failures;

        if all_failed {
            return Err(Error::ExhaustedAlternatives {
                operation: format!("Publishing key {}", key),
                attempted,
            });
        }
        Ok(())
    }

    fn destroy_volume(&mut self) -> Result<()> {
        self.volume().destroy()?;
        self.volume_path = None;
        Ok(())
    }
}
