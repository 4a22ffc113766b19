//! Per-target async mutex
//!
//! One `TargetMutex` serializes every interaction of a session. Ownership is
//! tagged with a target key (`"app"` or a fragment id):
//!
//! - a free mutex is acquired immediately;
//! - the current owner's target re-enters without queuing, but only once the
//!   owner's own acquisition has resolved and while nobody else waits;
//! - everyone else queues FIFO, so once contention exists the same target
//!   takes its turn like any other.
//!
//! The queue slot is reserved when [`TargetMutex::lock`] is *called*, not when
//! the returned future is first polled, so dispatch order is grant order. Two
//! acquisitions for one target issued back to back therefore serialize: the
//! second finds an owner that has not resolved yet and queues behind it.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{ready, Context, Poll};

use tokio::sync::oneshot;
use tracing::trace;

#[derive(Debug, Default)]
struct LockState {
    owner: Option<String>,
    /// The owner's acquisition future has resolved.
    granted: bool,
    depth: usize,
    waiters: VecDeque<Waiter>,
}

#[derive(Debug)]
struct Waiter {
    target: String,
    wake: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<LockState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, LockState> {
        // No code path panics while holding this lock.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self) {
        let mut state = self.state();
        state.depth = state.depth.saturating_sub(1);
        if state.depth > 0 {
            return;
        }
        state.owner = None;
        state.granted = false;
        // Hand off to the first waiter that is still listening.
        while let Some(waiter) = state.waiters.pop_front() {
            let target = waiter.target.clone();
            state.owner = Some(waiter.target);
            state.depth = 1;
            if waiter.wake.send(()).is_ok() {
                trace!(lock = %target, "lock handed off");
                return;
            }
            state.owner = None;
            state.depth = 0;
        }
    }
}

/// FIFO-fair, target-reentrant async mutex.
#[derive(Debug, Clone, Default)]
pub struct TargetMutex {
    inner: Arc<Inner>,
}

impl TargetMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the lock for `target` and return a future resolving to its guard.
    pub fn lock(&self, target: impl Into<String>) -> LockFuture {
        let target = target.into();
        let mut state = self.inner.state();

        let uncontended = state.waiters.is_empty()
            && match state.owner.as_deref() {
                None => true,
                Some(owner) => owner == target && state.granted,
            };
        if uncontended {
            if state.owner.is_none() {
                state.granted = false;
            }
            state.owner = Some(target.clone());
            state.depth += 1;
            trace!(lock = %target, depth = state.depth, "lock acquired");
            return LockFuture {
                inner: Arc::clone(&self.inner),
                target,
                wait: None,
                done: false,
            };
        }

        let (wake, rx) = oneshot::channel();
        state.waiters.push_back(Waiter {
            target: target.clone(),
            wake,
        });
        trace!(lock = %target, queued = state.waiters.len(), "lock queued");
        LockFuture {
            inner: Arc::clone(&self.inner),
            target,
            wait: Some(rx),
            done: false,
        }
    }

    /// Target currently holding the lock.
    pub fn owner(&self) -> Option<String> {
        self.inner.state().owner.clone()
    }

    /// Re-entrancy depth of the current owner (0 when free).
    pub fn depth(&self) -> usize {
        self.inner.state().depth
    }

    /// Number of queued acquisitions.
    pub fn waiters(&self) -> usize {
        self.inner.state().waiters.len()
    }
}

/// Pending acquisition returned by [`TargetMutex::lock`].
///
/// Dropping it before it resolves gives up the queue slot, or releases the
/// lock if it had already been handed over.
#[derive(Debug)]
pub struct LockFuture {
    inner: Arc<Inner>,
    target: String,
    wait: Option<oneshot::Receiver<()>>,
    done: bool,
}

impl Future for LockFuture {
    type Output = TargetGuard;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<TargetGuard> {
        let this = &mut *self;
        assert!(!this.done, "LockFuture polled after completion");
        if let Some(rx) = this.wait.as_mut() {
            // The sender lives in our own `Inner`, so it is only ever
            // consumed by a hand-off.
            let _ = ready!(Pin::new(rx).poll(cx));
            this.wait = None;
        }
        this.inner.state().granted = true;
        this.done = true;
        Poll::Ready(TargetGuard {
            inner: Some(Arc::clone(&this.inner)),
            target: this.target.clone(),
        })
    }
}

impl Drop for LockFuture {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        match self.wait.take() {
            // Reserved immediately but never polled: we own a depth level.
            None => self.inner.release(),
            Some(mut rx) => {
                rx.close();
                if rx.try_recv().is_ok() {
                    // Ownership was handed to us after all; pass it on.
                    self.inner.release();
                }
            }
        }
    }
}

/// Held lock level; released on drop.
#[derive(Debug)]
pub struct TargetGuard {
    inner: Option<Arc<Inner>>,
    target: String,
}

impl TargetGuard {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Release explicitly; same as dropping the guard.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            trace!(lock = %self.target, "lock released");
            inner.release();
        }
    }
}
