//! keysign Core - Step sequencing and secret plumbing for signing ceremonies
//!
//! This crate provides the engine underneath a keysign ceremony:
//! - [`Step`]s that know how to detect their own completion
//! - a [`Sequencer`] that skips completed steps, halts on the first failure
//!   and always runs a teardown
//! - a [`ProcessRunner`] seam for every external tool, including a one-shot
//!   secret handoff over a private file descriptor
//! - [`SecretBytes`], a zeroize-on-drop buffer that never prints itself

pub mod error;
pub mod process;
pub mod scope;
pub mod secret;
pub mod sequencer;
pub mod step;

pub use error::{Error, Result};
pub use process::{
    probe, CommandSpec, Output, ProcessError, ProcessRunner, SecretHandoff, SystemRunner,
};
pub use scope::Scoped;
pub use secret::SecretBytes;
pub use sequencer::{SequenceError, SequenceReport, Sequencer, StepFailure, StepOutcome, StepRecord};
pub use step::Step;
