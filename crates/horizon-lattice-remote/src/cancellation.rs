//! Cooperative cancellation for in-flight requests.

use std::sync::Arc;

use tokio::sync::watch;

/// A cancellation token shared between a caller and the requests it starts.
///
/// Clones observe the same flag. Once cancelled, a token stays cancelled.
///
/// # Example
///
/// ```ignore
/// use horizon_lattice_remote::CancellationToken;
///
/// let token = CancellationToken::new();
/// let pending = remote.send(&builder, Some(&token));
/// token.cancel();
/// assert!(pending.await.unwrap_err().is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    /// Create a new, not yet cancelled token.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { inner: Arc::new(tx) }
    }

    /// Check if cancellation has been requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        *self.inner.borrow()
    }

    /// Request cancellation, waking every waiter.
    pub fn cancel(&self) {
        self.inner.send_replace(true);
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait on an optional token; pends forever when there is none.
pub(crate) async fn wait_cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
