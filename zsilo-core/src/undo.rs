//! Reversible-operation stack.
//!
//! Callers push an undo closure immediately after each side effect that may
//! need reverting. On failure the stack unwinds in LIFO order and undo
//! failures are joined with the originating error.

use crate::error::{Result, SiloError};
use futures::future::BoxFuture;
use std::future::Future;

type UndoFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

#[derive(Default)]
pub struct UndoStack {
    undos: Vec<UndoFn>,
}

impl UndoStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an undo for an effect that just succeeded.
    pub fn push<F, Fut>(&mut self, undo: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.undos.push(Box::new(move || {
            let future: BoxFuture<'static, Result<()>> = Box::pin(undo());
            future
        }));
    }

    /// Run every registered undo in LIFO order. Undos run even on a cancelled
    /// scope; a failing undo does not stop the rest.
    pub async fn unwind(mut self) -> Option<SiloError> {
        let mut failures = Vec::new();
        while let Some(undo) = self.undos.pop() {
            if let Err(err) = undo().await {
                failures.push(format!("cleanup failed: {err}"));
            }
        }
        if failures.is_empty() {
            None
        } else {
            Some(SiloError::Internal(failures.join("; ")))
        }
    }
}

/// Join an operation error with the result of unwinding its undo stack. With
/// a cleanup failure the combination is surfaced as `Internal`; otherwise the
/// original error passes through untouched.
pub fn join_errors(err: SiloError, cleanup: Option<SiloError>) -> SiloError {
    match cleanup {
        Some(cleanup) => SiloError::Internal(format!("{err}; {cleanup}")),
        None => err,
    }
}
