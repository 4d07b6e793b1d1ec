//! Audit report of a ceremony run
//!
//! Records what was signed, by whom, where it was published and how each
//! step went. Fingerprints and step names only; no key material.

use std::path::Path;

use chrono::{DateTime, Utc};
use keysign_core::{SequenceError, SequenceReport, StepRecord};
use serde::Serialize;

use crate::ceremony::{PublishFailure, SigningCeremony};
use crate::error::{KeysignError, Result};
use crate::target::TargetKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityRecord {
    pub label: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CeremonyReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub target: TargetKey,
    pub identities: Vec<IdentityRecord>,
    pub keyservers: Vec<String>,
    pub steps: Vec<StepRecord>,
    pub failed_step: Option<String>,
    pub publish_failures: Vec<PublishFailure>,
    pub error: Option<String>,
    pub teardown_error: Option<String>,
}

impl CeremonyReport {
    pub fn new(
        ceremony: &SigningCeremony,
        started_at: DateTime<Utc>,
        outcome: &std::result::Result<SequenceReport, SequenceError>,
    ) -> Self {
        let (steps, failed_step, error, teardown_error) = match outcome {
            Ok(report) => (report.steps.clone(), None, None, None),
            Err(e) => (
                e.report().steps.clone(),
                e.failed_step().map(String::from),
                Some(error_chain(e.primary())),
                e.teardown_error().map(|t| error_chain(t)),
            ),
        };

        Self {
            started_at,
            finished_at: Utc::now(),
            target: ceremony.target().clone(),
            identities: ceremony
                .identities()
                .into_iter()
                .map(|(label, fingerprint)| IdentityRecord {
                    label: label.to_string(),
                    fingerprint: fingerprint.to_string(),
                })
                .collect(),
            keyservers: ceremony.keyservers().to_vec(),
            steps,
            failed_step,
            publish_failures: ceremony.publish_failures().to_vec(),
            error,
            teardown_error,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Write as pretty JSON via a temp file and rename
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        let io_error = |source| KeysignError::Io {
            path: path.to_path_buf(),
            source,
        };

        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).map_err(io_error)?;
        std::fs::rename(&temp_path, path).map_err(io_error)?;

        Ok(())
    }
}

/// An error and its sources, outermost first
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use keysign_core::{Error, ProcessError};

    #[test]
    fn test_error_chain_includes_sources() {
        let err = Error::ImportFailed {
            identity: "org-release".into(),
            source: ProcessError::NonZeroExit {
                program: "gpg".into(),
                code: Some(2),
                status: "exit status: 2".into(),
                stderr: "no valid OpenPGP data found".into(),
            },
        };

        assert_eq!(
            error_chain(&err),
            "Could not import key material for identity 'org-release': \
             gpg failed (exit status: 2): no valid OpenPGP data found"
        );
    }
}
