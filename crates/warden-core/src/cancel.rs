use std::sync::{Arc, OnceLock};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Caller-supplied cancellation signal, passed explicitly through every call.
///
/// Clones share state. The first reason recorded wins; later `cancel` calls
/// are no-ops.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn cancel_with_reason(&self, reason: impl Into<String>) {
        if !self.inner.is_cancelled() {
            let _ = self.reason.set(reason.into());
        }
        self.inner.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.get().cloned()
    }

    /// Resolves once the token fires. Resolves immediately if it already has.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.cancelled()
    }

    /// Token cancelled together with this one, but cancellable on its own.
    #[must_use]
    pub fn child_token(&self) -> Self {
        Self {
            inner: self.inner.child_token(),
            reason: Arc::clone(&self.reason),
        }
    }
}
