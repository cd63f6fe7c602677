//! Run-wide cancellation signal.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::warn;

/// Hook run once when a token is cancelled.
pub type CancelCallback = Box<dyn Fn() + Send + Sync>;

/// Shared by the coordinator and every stage task of one run.
///
/// Only the first `cancel` call has an effect. Tasks either poll
/// [`CancellationToken::is_cancelled`] or race work against
/// [`CancellationToken::cancelled`].
#[derive(Default)]
pub struct CancellationToken {
    flag: AtomicBool,
    reason: RwLock<Option<String>>,
    hooks: RwLock<Vec<CancelCallback>>,
    waiters: Notify,
}

impl CancellationToken {
    /// An uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels with `reason`, wakes waiters and runs hooks.
    ///
    /// A panicking hook is logged and does not stop the others.
    pub fn cancel(&self, reason: impl Into<String>) {
        {
            let mut slot = self.reason.write();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason.into());
            // Set under the lock so a reader seeing the flag also sees the reason.
            self.flag.store(true, Ordering::SeqCst);
        }
        self.waiters.notify_waiters();

        for hook in self.hooks.read().iter() {
            run_hook(hook.as_ref());
        }
    }

    /// Adds a hook; runs it right away if the token is already cancelled.
    pub fn on_cancel<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.is_cancelled() {
            run_hook(&hook);
        } else {
            self.hooks.write().push(Box::new(hook));
        }
    }

    /// True once any `cancel` call has landed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// The reason given to the first `cancel` call.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.waiters.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

fn run_hook(hook: &(dyn Fn() + Send + Sync)) {
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(hook)) {
        warn!(?payload, "Cancellation hook panicked");
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("is_cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish_non_exhaustive()
    }
}
