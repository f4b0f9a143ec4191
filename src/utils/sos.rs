//! Signal-of-Stop: cooperative cancellation primitive.
//!
//! Provides a thread-safe, async-aware cancellation token that can be:
//! - Cloned and shared across tasks
//! - Awaited for cancellation notification
//! - Forked into child tokens that stop with their parent
//!
//! The root token is cancelled by Ctrl-C; each transfer session owns a
//! child so that closing one session leaves the rest running.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// A cooperative cancellation token.
///
/// Clones share the same underlying state, so cancelling any clone
/// notifies all waiters.
#[derive(Debug, Clone, Default)]
pub struct SignalOfStop {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<SignalOfStop>>,
}

impl SignalOfStop {
    /// Create a new, uncancelled signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fork a child token.
    ///
    /// Cancelling the parent cancels the child; cancelling the child leaves
    /// the parent untouched. A child forked from an already-cancelled parent
    /// starts cancelled.
    pub fn child(&self) -> Self {
        let child = Self::new();
        if self.cancelled() {
            child.cancel();
            return child;
        }
        if let Ok(mut children) = self.internal.children.lock() {
            children.retain(|c| !c.cancelled());
            children.push(child.clone());
        }
        // Parent may have been cancelled between the check and the push.
        if self.cancelled() {
            child.cancel();
        }
        child
    }

    /// Signal cancellation to all waiters and all children.
    ///
    /// After this call, `cancelled()` returns `true` and all pending
    /// `wait()` futures complete.
    pub fn cancel(&self) {
        if self.internal.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.internal.notify.notify_waiters();

        let children = match self.internal.children.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        for child in children {
            child.cancel();
        }
    }

    /// Check if cancellation has been signaled.
    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Wait for cancellation to be signaled.
    ///
    /// Returns immediately if already cancelled.
    pub async fn wait(&self) {
        loop {
            let notified = self.internal.notify.notified();
            if self.cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Race a future against cancellation.
    ///
    /// Returns `Some(T)` if the future completes first,
    /// `None` if cancellation is signaled first.
    pub async fn select<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            res = fut => Some(res),
            _ = self.wait() => None,
        }
    }
}
