//! Cancellation token for in-flight fetches.
//!
//! A fetch started for a session-dependent key carries a token. When a gate
//! tears down its subscriptions the token is cancelled and the result is
//! dropped on arrival instead of being written into the cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cancellation token shared between the cache and a running fetch.
///
/// Cloning shares the flag: cancelling any clone cancels all of them.
///
/// # Example
///
/// ```
/// use mirror_cache::cancel::CancellationToken;
///
/// let token = CancellationToken::new();
/// let in_flight = token.clone();
///
/// token.cancel();
/// assert!(in_flight.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation. All clones observe it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Return an error if cancellation has been requested.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError)
        } else {
            Ok(())
        }
    }
}

/// Error returned when a fetch result is discarded because of cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelledError;

impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fetch was cancelled")
    }
}

impl std::error::Error for CancelledError {}
