//! Progress reporting and cooperative cancellation (SPEC_FULL.md §5),
//! replacing the teacher's bevy `Schedule`/event-based iteration driver
//! (`NonLinearSchedulePlugin::run_outer_iteration`) per the REDESIGN
//! FLAGS note on async/coroutine UI progress. Shaped like
//! `monistowl-gat`'s `gat-batch/src/runner.rs` worker pool: a cheap
//! callback and an atomic flag, no channels, no async runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// What a solver call reports between iterations or CPF steps. Invoked
/// on the solver thread; implementations must be cheap and non-blocking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    /// One Newton-family iteration completed.
    Iteration { fraction: f64 },
    /// One CPF predictor/corrector step completed.
    CpfStep { lambda: f64 },
}

pub type ProgressCallback<'a> = dyn FnMut(Progress) + 'a;

/// A cooperative cancellation flag, polled at the top of each Newton
/// iteration and each CPF step. Cheap to clone and share across threads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uncancelled_and_observes_cancel() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
