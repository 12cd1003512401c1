//! In-flight request accounting
//!
//! Every request holds a [`DrainGuard`] while it runs. Reload and unload wait
//! on [`DrainGate::wait_quiesced`] so that no module is torn down under a
//! running request.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use super::error::DrainError;

/// Counter of in-flight requests with a "reached zero" signal
#[derive(Debug)]
pub struct DrainGate {
    count: Mutex<usize>,
    quiesced: watch::Sender<bool>,
}

impl DrainGate {
    pub fn new() -> Self {
        let (quiesced, _) = watch::channel(true);
        Self {
            count: Mutex::new(0),
            quiesced,
        }
    }

    /// Increment the counter and clear the quiesced signal.
    ///
    /// Prefer [`DrainGate::enter`], which releases on every exit path.
    pub fn acquire(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count += 1;
        self.quiesced.send_replace(false);
    }

    /// Decrement the counter, setting the quiesced signal when it reaches zero.
    pub fn release(&self) -> Result<(), DrainError> {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        if *count == 0 {
            return Err(DrainError::CounterUnderflow);
        }
        *count -= 1;
        if *count == 0 {
            self.quiesced.send_replace(true);
        }
        Ok(())
    }

    /// Acquire and return a guard that releases when dropped.
    pub fn enter(self: &Arc<Self>) -> DrainGuard {
        self.acquire();
        DrainGuard {
            gate: Arc::clone(self),
        }
    }

    /// Number of requests currently in flight.
    pub fn in_flight(&self) -> usize {
        *self.count.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_quiesced(&self) -> bool {
        *self.quiesced.borrow()
    }

    /// Suspend until no request is in flight. Returns at once if already quiesced.
    pub async fn wait_quiesced(&self) {
        let mut rx = self.quiesced.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|quiesced| *quiesced).await;
    }
}

impl Default for DrainGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that releases one in-flight slot when dropped
pub struct DrainGuard {
    gate: Arc<DrainGate>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if let Err(e) = self.gate.release() {
            tracing::error!("Drain gate accounting error: {}", e);
        }
    }
}
