//! Error types for keysign ceremonies

use thiserror::Error;

use crate::process::ProcessError;

/// Result type alias for ceremony operations
pub type Result<T> = std::result::Result<T, Error>;

/// Fatal conditions raised by a step action.
///
/// An unmet precondition inside a completeness check is not an error: the
/// check simply answers `false` (see [`crate::probe`]).
#[derive(Debug, Error)]
pub enum Error {
    /// External tool exited non-zero or could not be run
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// Every alternative (e.g. every keyserver) was tried and failed
    #[error("{operation} failed on all {attempted} candidates")]
    ExhaustedAlternatives { operation: String, attempted: usize },

    /// Operator did not confirm
    #[error("Aborted by operator: {0}")]
    OperatorAbort(String),

    /// Importing an identity's key material failed
    #[error("Could not import key material for identity '{identity}'")]
    ImportFailed {
        identity: String,
        #[source]
        source: ProcessError,
    },

    /// Signing with an identity failed
    #[error("Could not sign with identity '{identity}'")]
    SignFailed {
        identity: String,
        #[source]
        source: ProcessError,
    },

    /// Ceremony input or state makes the step impossible
    #[error("Precondition not met: {0}")]
    Precondition(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether re-running the ceremony unchanged could get past this error.
    ///
    /// Operator aborts and precondition failures need a human to change
    /// something first.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::OperatorAbort(_) | Error::Precondition(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!Error::OperatorAbort("typed 'no'".into()).is_retryable());
        assert!(!Error::Precondition("ambiguous key id".into()).is_retryable());
        assert!(Error::ExhaustedAlternatives {
            operation: "retrieving key".into(),
            attempted: 3,
        }
        .is_retryable());
    }

    #[test]
    fn test_identity_named_in_message() {
        let err = Error::SignFailed {
            identity: "org-release".into(),
            source: ProcessError::NonZeroExit {
                program: "gpg".into(),
                code: Some(2),
                status: "exit status: 2".into(),
                stderr: String::new(),
            },
        };
        assert_eq!(err.to_string(), "Could not sign with identity 'org-release'");
    }
}
