//! keysign - OpenPGP key signing ceremonies on an ephemeral keyring
//!
//! This crate provides the ceremony itself and everything around it:
//! - Configuration and target key parsing
//! - Environment scrubbing for spawned tools
//! - Secret store, keyserver discovery and ephemeral volume shims
//! - The isolated gpg keyring
//! - Operator confirmation
//! - The audit report
//!
//! Sequencing, subprocess plumbing and secret buffers live in `keysign-core`.

pub mod ceremony;
pub mod config;
pub mod env;
pub mod error;
pub mod gpg;
pub mod keyservers;
pub mod operator;
pub mod report;
pub mod secrets;
pub mod target;
pub mod volume;

pub use ceremony::{PublishFailure, SigningCeremony};
pub use config::{CeremonyConfig, EnvironmentConfig, ToolsConfig};
pub use error::{KeysignError, Result};
pub use gpg::IsolatedKeyring;
pub use operator::{Operator, TerminalOperator};
pub use report::CeremonyReport;
pub use target::{InvalidTargetKey, TargetKey};
