//! Scoped acquisition with guaranteed release
//!
//! [`Scoped`] borrows a context for the duration of some work and owns the
//! routine that tears it down. Calling [`Scoped::release`] runs the teardown
//! and returns its result; if the guard is dropped without being released
//! (an early return, or a panic unwinding through it) the teardown still
//! runs, and any error it produces is logged.

use std::ops::{Deref, DerefMut};

use tracing::error;

use crate::error::Result;

/// Context borrowed under a pending teardown
pub struct Scoped<'a, C, F>
where
    F: FnOnce(&mut C) -> Result<()>,
{
    ctx: &'a mut C,
    teardown: Option<F>,
}

impl<'a, C, F> Scoped<'a, C, F>
where
    F: FnOnce(&mut C) -> Result<()>,
{
    pub fn new(ctx: &'a mut C, teardown: F) -> Self {
        Self {
            ctx,
            teardown: Some(teardown),
        }
    }

    /// Run the teardown now and report how it went
    pub fn release(mut self) -> Result<()> {
        match self.teardown.take() {
            Some(teardown) => teardown(&mut *self.ctx),
            None => Ok(()),
        }
    }
}

impl<C, F> Deref for Scoped<'_, C, F>
where
    F: FnOnce(&mut C) -> Result<()>,
{
    type Target = C;

    fn deref(&self) -> &C {
        &*self.ctx
    }
}

impl<C, F> DerefMut for Scoped<'_, C, F>
where
    F: FnOnce(&mut C) -> Result<()>,
{
    fn deref_mut(&mut self) -> &mut C {
        &mut *self.ctx
    }
}

impl<C, F> Drop for Scoped<'_, C, F>
where
    F: FnOnce(&mut C) -> Result<()>,
{
    fn drop(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            if let Err(e) = teardown(&mut *self.ctx) {
                error!(error = %e, "Teardown failed while leaving scope");
            }
        }
    }
}
