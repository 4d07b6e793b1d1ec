//! Step sequencing
//!
//! The sequencer walks an ordered list of [`Step`]s. A checked step whose
//! effect is already in place is skipped; everything else runs. The first
//! failing action halts the sequence and is reported with the step's name.
//! [`Sequencer::run_scoped`] additionally guarantees a teardown runs exactly
//! once, whatever happened.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::scope::Scoped;
use crate::step::Step;

/// What happened to a step during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Completeness check said the effect was already in place
    Skipped,
    /// Action ran and succeeded
    Ran,
    /// Action ran and failed
    Failed,
}

/// One line of a [`SequenceReport`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub outcome: StepOutcome,
}

/// Outcomes of the steps reached, in order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceReport {
    pub steps: Vec<StepRecord>,
}

impl SequenceReport {
    fn record(&mut self, name: &str, outcome: StepOutcome) {
        self.steps.push(StepRecord {
            name: name.to_string(),
            outcome,
        });
    }

    /// Outcome of the named step, if it was reached
    pub fn outcome(&self, name: &str) -> Option<StepOutcome> {
        self.steps
            .iter()
            .find(|record| record.name == name)
            .map(|record| record.outcome)
    }

    /// Names of the steps whose action ran successfully
    pub fn ran(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|record| record.outcome == StepOutcome::Ran)
            .map(|record| record.name.as_str())
            .collect()
    }
}

/// A step action failed and the sequence stopped
#[derive(Debug, Error)]
#[error("Step '{step}' failed")]
pub struct StepFailure {
    pub step: String,
    #[source]
    pub source: Error,
    /// Outcomes up to and including the failed step
    pub report: SequenceReport,
}

/// Failure of a scoped run
#[derive(Debug, Error)]
pub enum SequenceError {
    /// A step failed; the teardown ran afterwards
    #[error("Sequence halted")]
    Step {
        #[source]
        failure: StepFailure,
        /// The teardown's own error, kept for reporting only
        teardown: Option<Error>,
    },

    /// Every step succeeded but the teardown did not
    #[error("Teardown failed after all steps completed")]
    Teardown {
        report: SequenceReport,
        #[source]
        source: Error,
    },
}

impl SequenceError {
    /// Outcomes of the steps that were reached
    pub fn report(&self) -> &SequenceReport {
        match self {
            SequenceError::Step { failure, .. } => &failure.report,
            SequenceError::Teardown { report, .. } => report,
        }
    }

    /// Name of the failed step, if a step failed
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            SequenceError::Step { failure, .. } => Some(&failure.step),
            SequenceError::Teardown { .. } => None,
        }
    }

    /// The error that decides the outcome of the run
    pub fn primary(&self) -> &Error {
        match self {
            SequenceError::Step { failure, .. } => &failure.source,
            SequenceError::Teardown { source, .. } => source,
        }
    }

    /// The teardown's error, whichever way the steps went
    pub fn teardown_error(&self) -> Option<&Error> {
        match self {
            SequenceError::Step { teardown, .. } => teardown.as_ref(),
            SequenceError::Teardown { source, .. } => Some(source),
        }
    }
}

/// Drives an ordered list of steps over a context
pub struct Sequencer<C> {
    steps: Vec<Step<C>>,
}

impl<C> Sequencer<C> {
    pub fn new(steps: Vec<Step<C>>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Step<C>] {
        &self.steps
    }

    /// Run every step in order, skipping checked steps that are complete.
    pub fn run(&self, ctx: &mut C) -> std::result::Result<SequenceReport, StepFailure> {
        let mut report = SequenceReport::default();
        let total = self.steps.len();

        for (index, step) in self.steps.iter().enumerate() {
            let position = index + 1;

            if step.is_complete(ctx) {
                info!("[{}/{}] {}: already complete", position, total, step.name());
                report.record(step.name(), StepOutcome::Skipped);
                continue;
            }

            info!("[{}/{}] {}", position, total, step.name());
            match step.execute(ctx) {
                Ok(()) => report.record(step.name(), StepOutcome::Ran),
                Err(source) => {
                    error!(step = step.name(), error = %source, "Step failed, halting");
                    report.record(step.name(), StepOutcome::Failed);
                    return Err(StepFailure {
                        step: step.name().to_string(),
                        source,
                        report,
                    });
                }
            }
        }

        Ok(report)
    }

    /// Run the steps inside a scope whose `teardown` runs exactly once,
    /// on success, on failure and while unwinding from a panic.
    ///
    /// A teardown error never replaces a step error; it is attached to it.
    pub fn run_scoped<F>(
        &self,
        ctx: &mut C,
        teardown: F,
    ) -> std::result::Result<SequenceReport, SequenceError>
    where
        F: FnOnce(&mut C) -> Result<()>,
    {
        let mut scope = Scoped::new(ctx, teardown);
        let outcome = self.run(&mut scope);
        let released = scope.release();

        match (outcome, released) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(report), Err(source)) => {
                error!(error = %source, "Teardown failed");
                Err(SequenceError::Teardown { report, source })
            }
            (Err(failure), released) => {
                if let Err(e) = &released {
                    error!(error = %e, step = %failure.step, "Teardown also failed");
                }
                Err(SequenceError::Step {
                    failure,
                    teardown: released.err(),
                })
            }
        }
    }
}
