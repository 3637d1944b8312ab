//! One-shot abort signal from the persistence controller to the capture source
//!
//! Broadcast-based so any number of listeners can observe the stop request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Why capture must stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Free space fell below the margin plus the incoming chunk
    LowStorage { free: u64, required: u64 },
    /// The store rejected a write
    WriteFailed { message: String },
}

/// Abort signal broadcaster. Fires at most once.
#[derive(Clone)]
pub struct AbortSignal {
    sender: Arc<broadcast::Sender<AbortReason>>,
    fired: Arc<AtomicBool>,
}

impl AbortSignal {
    /// Create a new, unfired signal
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender: Arc::new(sender),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fire the signal. Returns false if it had already fired.
    pub fn fire(&self, reason: AbortReason) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _ = self.sender.send(reason);
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Create a new receiver for this signal
    pub fn subscribe(&self) -> broadcast::Receiver<AbortReason> {
        self.sender.subscribe()
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}
