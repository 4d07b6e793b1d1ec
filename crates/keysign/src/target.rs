//! Target key identifiers
//!
//! The key to be signed is named either by its full fingerprint or by a
//! short/long key id. Only a full fingerprint pins a key unambiguously; a
//! key id has to be resolved and confirmed by the operator first.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Hex digits in a v4 OpenPGP fingerprint
pub const FINGERPRINT_LEN: usize = 40;

/// A target identifier that cannot name a key
#[derive(Debug, Clone, Error)]
#[error("Invalid target key '{input}': {reason}")]
pub struct InvalidTargetKey {
    pub input: String,
    pub reason: String,
}

/// Identifier of the key being signed, normalized to upper-case hex
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TargetKey {
    /// Full 40-digit fingerprint
    Fingerprint(String),
    /// 8-digit short id or 16-digit long id
    KeyId(String),
}

impl TargetKey {
    /// Parse an identifier; spaces and a `0x` prefix are tolerated
    pub fn parse(input: &str) -> Result<Self, InvalidTargetKey> {
        let invalid = |reason: String| InvalidTargetKey {
            input: input.to_string(),
            reason,
        };

        let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
        let digits = compact
            .strip_prefix("0x")
            .or_else(|| compact.strip_prefix("0X"))
            .unwrap_or(compact.as_str());

        if digits.is_empty() {
            return Err(invalid("no key identifier given".into()));
        }
        if !matches!(digits.len(), 8 | 16 | FINGERPRINT_LEN) {
            return Err(invalid(format!(
                "{} digits; expected a {}-digit fingerprint or an 8/16-digit key id",
                digits.len(),
                FINGERPRINT_LEN
            )));
        }
        hex::decode(digits).map_err(|e| invalid(e.to_string()))?;

        let normalized = digits.to_ascii_uppercase();
        if normalized.len() == FINGERPRINT_LEN {
            Ok(TargetKey::Fingerprint(normalized))
        } else {
            Ok(TargetKey::KeyId(normalized))
        }
    }

    /// The fingerprint an operator confirmed for a key id
    pub fn confirmed(fingerprint: &str) -> Self {
        TargetKey::Fingerprint(fingerprint.to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        match self {
            TargetKey::Fingerprint(s) | TargetKey::KeyId(s) => s,
        }
    }

    /// Whether this identifier pins exactly one key
    pub fn is_fingerprint(&self) -> bool {
        matches!(self, TargetKey::Fingerprint(_))
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
