//! Work handles: the completion contract between dispatch, the worker
//! pool, and callers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{CohortError, Result};
use crate::tensor::Tensor;
use crate::types::Rank;

/// A handle to a non-blocking collective operation.
///
/// `wait()` blocks until the operation completes, re-raises any captured
/// failure, and for accelerator variants joins the caller's stream with the
/// operation's completion events.
pub trait Work: Send + Sync + std::fmt::Debug {
    /// Block until the operation completes and surface its outcome.
    fn wait(&self) -> Result<()>;

    /// Whether the operation has finished (successfully or not).
    fn is_completed(&self) -> bool;

    /// Output tensors, if the operation produces any. Only meaningful
    /// after `wait()` returns.
    fn result(&self) -> Vec<Tensor> {
        Vec::new()
    }

    /// Resolved sender for receive operations, available after `wait()`.
    fn source_rank(&self) -> Option<Rank> {
        None
    }
}

/// Queue contract implemented by every enqueued collective variant.
pub(crate) trait CollectiveWork: Send {
    /// Execute the collective on a worker thread.
    fn run(&mut self) -> Result<()>;

    /// Join the caller's stream with the work's completion events. Host
    /// variants have nothing to do.
    fn synchronize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Output tensors exposed through [`Work::result`].
    fn outputs(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

#[derive(Debug)]
struct CompletionState {
    completed: bool,
    error: Option<CohortError>,
}

/// Shared handle for queued work.
pub struct AsyncWork {
    task: Mutex<Box<dyn CollectiveWork>>,
    state: Mutex<CompletionState>,
    completed_cv: Condvar,
}

impl std::fmt::Debug for AsyncWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncWork").field("state", &self.state).finish()
    }
}

impl AsyncWork {
    pub(crate) fn new(task: Box<dyn CollectiveWork>) -> Arc<Self> {
        Arc::new(Self {
            task: Mutex::new(task),
            state: Mutex::new(CompletionState {
                completed: false,
                error: None,
            }),
            completed_cv: Condvar::new(),
        })
    }

    /// Run the work item on the current (worker) thread, capturing any
    /// failure, then flip the completion flag exactly once.
    pub(crate) fn execute(&self) {
        let outcome = match self.task.lock() {
            Ok(mut task) => {
                match catch_unwind(AssertUnwindSafe(|| task.run())) {
                    Ok(res) => res,
                    Err(_) => Err(CohortError::runtime("work item panicked")),
                }
            }
            Err(_) => Err(CohortError::LockPoisoned("work item")),
        };
        if let Err(e) = &outcome {
            tracing::warn!(error = %e, "collective work failed");
        }
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.error = outcome.err();
        state.completed = true;
        self.completed_cv.notify_all();
    }

    fn wait_completed(&self) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| CohortError::LockPoisoned("work state"))?;
        while !state.completed {
            state = self
                .completed_cv
                .wait(state)
                .map_err(|_| CohortError::LockPoisoned("work state"))?;
        }
        match &state.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

impl Work for AsyncWork {
    fn wait(&self) -> Result<()> {
        self.wait_completed()?;
        let mut task = self
            .task
            .lock()
            .map_err(|_| CohortError::LockPoisoned("work item"))?;
        task.synchronize()
    }

    fn is_completed(&self) -> bool {
        self.state.lock().map(|s| s.completed).unwrap_or(true)
    }

    fn result(&self) -> Vec<Tensor> {
        self.task
            .lock()
            .map(|t| t.outputs())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flagged {
        fail: bool,
    }

    impl CollectiveWork for Flagged {
        fn run(&mut self) -> Result<()> {
            if self.fail {
                Err(CohortError::runtime("expected failure"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_wait_after_success() {
        let work = AsyncWork::new(Box::new(Flagged { fail: false }));
        assert!(!work.is_completed());
        work.execute();
        assert!(work.is_completed());
        work.wait().unwrap();
    }

    #[test]
    fn test_wait_reraises_failure_repeatedly() {
        let work = AsyncWork::new(Box::new(Flagged { fail: true }));
        work.execute();
        assert!(work.wait().is_err());
        assert!(work.wait().is_err());
    }

    #[test]
    fn test_wait_blocks_until_execute() {
        let work = AsyncWork::new(Box::new(Flagged { fail: false }));
        let w2 = Arc::clone(&work);
        let waiter = std::thread::spawn(move || w2.wait());
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(!waiter.is_finished());
        work.execute();
        waiter.join().unwrap().unwrap();
    }

    struct Panics;

    impl CollectiveWork for Panics {
        fn run(&mut self) -> Result<()> {
            panic!("boom");
        }
    }

    #[test]
    fn test_panic_is_captured() {
        let work = AsyncWork::new(Box::new(Panics));
        work.execute();
        let err = work.wait().unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }
}
