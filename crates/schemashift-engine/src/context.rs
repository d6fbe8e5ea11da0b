use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use schemashift_core::errors::CollaboratorError;
use schemashift_core::policy::Policy;
use schemashift_core::traits::CallResult;

/// How often blocked waits re-check cancellation.
const POLL: Duration = Duration::from_millis(25);

/// Shared cancellation flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A mutating call the context stopped waiting for.
#[derive(Debug)]
struct Abandoned {
    operation: String,
    worker: Option<JoinHandle<()>>,
}

/// Cancellable, deadline-bearing context for one pipeline invocation.
///
/// Every collaborator call goes through [`ExecutionContext::call`] (per-call
/// limit), [`ExecutionContext::mutate`] (per-call limit, state-changing) or
/// [`ExecutionContext::wait_for_approval`] (approval limit). The call runs on
/// a worker thread; when the limit passes or the token is cancelled the caller
/// gets an error immediately.
///
/// A read-only worker is left to finish on its own. An abandoned `mutate`
/// worker may still be changing state, so the context refuses every later
/// call and reports itself interrupted until the run ends.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    cancel: CancelToken,
    deadline: Option<Instant>,
    call_timeout: Duration,
    approval_timeout: Duration,
    abandoned: Arc<Mutex<Option<Abandoned>>>,
}

impl ExecutionContext {
    pub fn new(call_timeout: Duration, approval_timeout: Duration) -> Self {
        Self {
            cancel: CancelToken::new(),
            deadline: None,
            call_timeout,
            approval_timeout,
            abandoned: Arc::new(Mutex::new(None)),
        }
    }

    pub fn from_policy(policy: &Policy) -> Self {
        Self::new(policy.timeouts.call(), policy.timeouts.approval())
    }

    /// Overall deadline for the whole run.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn approval_timeout(&self) -> Duration {
        self.approval_timeout
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }

    /// True once the run can make no further calls.
    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled() || self.is_expired() || self.abandoned_call().is_some()
    }

    /// The mutating call this context gave up on, if any.
    pub fn abandoned_call(&self) -> Option<String> {
        self.abandoned_slot().as_ref().map(|a| a.operation.clone())
    }

    /// Wait up to `limit` for an abandoned mutating call to finish.
    ///
    /// Returns true when no abandoned worker is still running. The context
    /// stays interrupted either way.
    pub fn settle(&self, limit: Duration) -> bool {
        let until = Instant::now() + limit;
        loop {
            {
                let mut slot = self.abandoned_slot();
                let Some(abandoned) = slot.as_mut() else {
                    return true;
                };
                match abandoned.worker.take() {
                    None => return true,
                    Some(worker) if worker.is_finished() => {
                        // A panicking worker has still stopped.
                        let _ = worker.join();
                        return true;
                    }
                    Some(worker) => abandoned.worker = Some(worker),
                }
            }
            let now = Instant::now();
            if now >= until {
                return false;
            }
            thread::sleep((until - now).min(POLL));
        }
    }

    fn abandoned_slot(&self) -> MutexGuard<'_, Option<Abandoned>> {
        self.abandoned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail fast if the context is already cancelled, past its deadline, or
    /// has abandoned a mutating call.
    pub fn check(&self, operation: &str) -> CallResult<()> {
        if let Some(pending) = self.abandoned_call() {
            return Err(CollaboratorError::Abandoned {
                operation: operation.to_string(),
                pending,
            });
        }
        if self.cancel.is_cancelled() {
            return Err(CollaboratorError::Cancelled {
                operation: operation.to_string(),
            });
        }
        if self.is_expired() {
            return Err(CollaboratorError::Timeout {
                operation: operation.to_string(),
                after: Duration::ZERO,
            });
        }
        Ok(())
    }

    /// Blocking sleep that wakes early on cancellation or deadline.
    pub fn sleep(&self, duration: Duration) -> CallResult<()> {
        let until = Instant::now() + duration;
        loop {
            self.check("retry delay")?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            thread::sleep((until - now).min(POLL));
        }
    }

    /// Run a collaborator call under the per-call timeout.
    pub fn call<T, F>(&self, operation: &str, f: F) -> CallResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> CallResult<T> + Send + 'static,
    {
        self.bounded(operation, self.call_timeout, false, f)
    }

    /// Run a state-changing collaborator call under the per-call timeout.
    ///
    /// If the context stops waiting, the worker is tracked and no further
    /// call is made through this context.
    pub fn mutate<T, F>(&self, operation: &str, f: F) -> CallResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> CallResult<T> + Send + 'static,
    {
        self.bounded(operation, self.call_timeout, true, f)
    }

    /// Run an approval wait under the approval timeout.
    pub fn wait_for_approval<T, F>(&self, operation: &str, f: F) -> CallResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> CallResult<T> + Send + 'static,
    {
        self.bounded(operation, self.approval_timeout, false, f)
    }

    fn bounded<T, F>(
        &self,
        operation: &str,
        limit: Duration,
        mutating: bool,
        f: F,
    ) -> CallResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> CallResult<T> + Send + 'static,
    {
        self.check(operation)?;
        let limit = match self.remaining() {
            Some(remaining) => limit.min(remaining),
            None => limit,
        };

        let (tx, rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name(format!("shift:{operation}"))
            .spawn(move || {
                // Receiver may be gone after a timeout.
                let _ = tx.send(f());
            })
            .map_err(|e| {
                CollaboratorError::Unavailable(format!("cannot start {operation}: {e}"))
            })?;

        let started = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                if mutating {
                    self.abandon(operation, worker);
                }
                return Err(CollaboratorError::Cancelled {
                    operation: operation.to_string(),
                });
            }
            let elapsed = started.elapsed();
            if elapsed >= limit {
                tracing::warn!(operation, ?limit, "collaborator call timed out");
                if mutating {
                    self.abandon(operation, worker);
                }
                return Err(CollaboratorError::Timeout {
                    operation: operation.to_string(),
                    after: limit,
                });
            }
            match rx.recv_timeout((limit - elapsed).min(POLL)) {
                Ok(result) => return result,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(CollaboratorError::Failed(format!(
                        "{operation} ended without a result"
                    )));
                }
            }
        }
    }

    fn abandon(&self, operation: &str, worker: JoinHandle<()>) {
        tracing::error!(operation, "abandoned state-changing call, no further calls this run");
        let mut slot = self.abandoned_slot();
        if slot.is_none() {
            *slot = Some(Abandoned {
                operation: operation.to_string(),
                worker: Some(worker),
            });
        }
    }
}
