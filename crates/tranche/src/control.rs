use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

use crate::error::StopRequest;

/// Pause and stop signals for one attempt.
///
/// Both signals cancel the same token so pieces only have to select on one future;
/// the flags remember which one was raised. Pause takes precedence when both are set.
#[derive(Debug, Clone, Default)]
pub struct StopControl {
    token: CancellationToken,
    pause: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl StopControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The pending request, if any.
    pub fn check(&self) -> Option<StopRequest> {
        if self.pause.load(Ordering::SeqCst) {
            Some(StopRequest::paused())
        } else if self.stop.load(Ordering::SeqCst) {
            Some(StopRequest::cancelled())
        } else {
            None
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
