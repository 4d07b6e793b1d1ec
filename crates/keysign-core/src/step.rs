//! Ceremony steps
//!
//! A step is either *checked* (it carries a predicate that detects its
//! effect is already in place, so a resumed ceremony can skip it) or
//! *always-run* (its effect is safe to repeat, or has to be redone every
//! run). Both kinds receive the ceremony context explicitly.

use std::fmt;

use tracing::warn;

use crate::error::Result;

type Check<C> = Box<dyn Fn(&mut C) -> Result<bool>>;
type Action<C> = Box<dyn Fn(&mut C) -> Result<()>>;

enum Completion<C> {
    Check(Check<C>),
    Always,
}

/// One unit of ceremony work
pub struct Step<C> {
    name: String,
    completion: Completion<C>,
    action: Action<C>,
}

impl<C> Step<C> {
    /// A step that is skipped when `check` reports its effect is in place
    pub fn checked<F, A>(name: impl Into<String>, check: F, action: A) -> Self
    where
        F: Fn(&mut C) -> Result<bool> + 'static,
        A: Fn(&mut C) -> Result<()> + 'static,
    {
        Self {
            name: name.into(),
            completion: Completion::Check(Box::new(check)),
            action: Box::new(action),
        }
    }

    /// A step whose action runs on every invocation
    pub fn always<A>(name: impl Into<String>, action: A) -> Self
    where
        A: Fn(&mut C) -> Result<()> + 'static,
    {
        Self {
            name: name.into(),
            completion: Completion::Always,
            action: Box::new(action),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_always(&self) -> bool {
        matches!(self.completion, Completion::Always)
    }

    /// Evaluate the completeness check.
    ///
    /// Always-run steps are never complete. A check that errors counts as
    /// not complete.
    pub fn is_complete(&self, ctx: &mut C) -> bool {
        match &self.completion {
            Completion::Always => false,
            Completion::Check(check) => match check(ctx) {
                Ok(done) => done,
                Err(e) => {
                    warn!(step = %self.name, error = %e, "Completeness check failed, treating step as incomplete");
                    false
                }
            },
        }
    }

    /// Perform the step's action
    pub fn execute(&self, ctx: &mut C) -> Result<()> {
        (self.action)(ctx)
    }
}

impl<C> fmt::Debug for Step<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("run_always", &self.run_always())
            .finish_non_exhaustive()
    }
}
