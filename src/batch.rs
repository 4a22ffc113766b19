//! Batching/throttle buffer for bare streamed actions
//!
//! Streams may emit many single actions in quick succession. Applying each
//! one on its own would notify subscribers per action, so they are coalesced
//! into one [`ActionsResponse`] per throttle quantum.
//!
//! Rules:
//! - a batch holds actions of a single target; an action for another target
//!   flushes the pending batch first;
//! - nothing flushed for at least a quantum: flush right away;
//! - otherwise one timer is armed for the rest of the quantum.
//!
//! A batch the sink rejects stops the buffer: the failure is returned by the
//! call that delivered it, or, for a timer flush, by the next `batch_action`
//! or `flush`. Pending actions behind a failure are dropped.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::tree::{Action, ActionsResponse, Target};

/// Receiver of flushed batches.
pub trait BatchSink: Send + Sync {
    fn apply_batch(&self, batch: ActionsResponse) -> Result<()>;
}

#[derive(Debug)]
struct BatchState {
    pending: Vec<Action>,
    target: Target,
    last_flush: Option<Instant>,
    timer: Option<(u64, JoinHandle<()>)>,
    generation: u64,
    /// Rejection from a timer flush, waiting to be reported.
    failure: Option<SyncError>,
}

impl BatchState {
    fn cancel_timer(&mut self) {
        if let Some((_, handle)) = self.timer.take() {
            handle.abort();
        }
    }

    fn take(&mut self) -> Option<ActionsResponse> {
        self.cancel_timer();
        if self.pending.is_empty() {
            return None;
        }
        self.last_flush = Some(Instant::now());
        Some(ActionsResponse::new(
            std::mem::take(&mut self.pending),
            self.target,
        ))
    }

    /// Report a stashed failure, dropping whatever queued up behind it.
    fn take_failure(&mut self) -> Result<()> {
        match self.failure.take() {
            Some(error) => {
                self.cancel_timer();
                self.pending.clear();
                Err(error)
            }
            None => Ok(()),
        }
    }
}

struct Shared {
    state: Mutex<BatchState>,
    quantum: Duration,
    sink: Weak<dyn BatchSink>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deliver(&self, batch: Option<ActionsResponse>) -> Result<()> {
        let Some(batch) = batch else {
            return Ok(());
        };
        match self.sink.upgrade() {
            Some(sink) => {
                debug!(
                    actions = batch.actions.len(),
                    for_target = batch.target.as_str(),
                    "flushing batched actions"
                );
                sink.apply_batch(batch)
            }
            None => {
                debug!(actions = batch.actions.len(), "batch sink gone, dropping actions");
                Ok(())
            }
        }
    }

    fn fire(&self, generation: u64) {
        let batch = {
            let mut state = self.state();
            let current = matches!(state.timer, Some((armed, _)) if armed == generation);
            if current {
                // Our own handle: detach, don't abort.
                state.timer = None;
                state.take()
            } else {
                None
            }
        };
        if let Err(e) = self.deliver(batch) {
            warn!(error = %e, "timed flush rejected");
            let mut state = self.state();
            state.pending.clear();
            state.failure = Some(e);
        }
    }
}

/// Coalesces bare actions and hands them to a [`BatchSink`].
pub struct ActionBatcher {
    shared: Arc<Shared>,
}

impl ActionBatcher {
    pub fn new(sink: Weak<dyn BatchSink>, quantum: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BatchState {
                    pending: Vec::new(),
                    target: Target::Fragment,
                    last_flush: None,
                    timer: None,
                    generation: 0,
                    failure: None,
                }),
                quantum,
                sink,
            }),
        }
    }

    pub fn quantum(&self) -> Duration {
        self.shared.quantum
    }

    /// Queue `action`. A bare action without a target belongs to the local
    /// (fragment) space of the receiving manager.
    pub fn batch_action(&self, action: Action) -> Result<()> {
        let target = action.target().unwrap_or(Target::Fragment);
        let mut ready = Vec::new();
        {
            let mut state = self.shared.state();
            state.take_failure()?;
            if !state.pending.is_empty() && state.target != target {
                ready.extend(state.take());
            }
            state.target = target;
            state.pending.push(action);

            if state.timer.is_none() {
                let elapsed = state.last_flush.map(|at| at.elapsed());
                match elapsed {
                    Some(elapsed) if elapsed < self.shared.quantum => {
                        self.arm(&mut state, self.shared.quantum - elapsed);
                    }
                    _ => ready.extend(state.take()),
                }
            }
        }
        for batch in ready {
            if let Err(e) = self.shared.deliver(Some(batch)) {
                self.discard();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Apply whatever is pending now and cancel the timer.
    pub fn flush(&self) -> Result<()> {
        let batch = {
            let mut state = self.shared.state();
            state.take_failure()?;
            state.take()
        };
        self.shared.deliver(batch)
    }

    /// Drop pending actions, any stashed failure and the timer.
    pub fn discard(&self) {
        let mut state = self.shared.state();
        state.cancel_timer();
        state.failure = None;
        if !state.pending.is_empty() {
            debug!(actions = state.pending.len(), "discarding batched actions");
            state.pending.clear();
        }
    }

    /// Number of actions waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.shared.state().pending.len()
    }

    pub fn is_armed(&self) -> bool {
        self.shared.state().timer.is_some()
    }

    fn arm(&self, state: &mut BatchState, delay: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // No runtime to wait on; flush on the next call instead.
            return;
        };
        state.generation += 1;
        let generation = state.generation;
        let shared = Arc::clone(&self.shared);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            shared.fire(generation);
        });
        state.timer = Some((generation, handle));
    }
}

impl Drop for ActionBatcher {
    fn drop(&mut self) {
        self.shared.state().cancel_timer();
    }
}

impl std::fmt::Debug for ActionBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state();
        f.debug_struct("ActionBatcher")
            .field("quantum", &self.shared.quantum)
            .field("pending", &state.pending.len())
            .field("target", &state.target)
            .field("armed", &state.timer.is_some())
            .field("failed", &state.failure.is_some())
            .finish()
    }
}
