use serde_json::json;
use std::sync::Arc;

use crate::events::EventBus;

/// Counts transferred bytes and emits `(bytesSoFar, total)` on `event`.
///
/// An event is emitted when the total is unknown (`<= 0`), when at least
/// `threshold` bytes passed since the last emission, or when the transfer
/// reaches the total. An empty event name disables emission.
pub struct ProgressTracker {
    bus: Arc<dyn EventBus>,
    event: String,
    total: i64,
    threshold: u64,
    progress: u64,
    last_emitted: u64,
    emitted: usize,
}

impl ProgressTracker {
    pub fn new(bus: Arc<dyn EventBus>, event: &str, total: i64, threshold: u64) -> Self {
        ProgressTracker {
            bus,
            event: event.to_string(),
            total,
            threshold: threshold.max(1),
            progress: 0,
            last_emitted: 0,
            emitted: 0,
        }
    }

    /// Record `n` more bytes. Returns true when an event went out.
    pub fn advance(&mut self, n: u64) -> bool {
        self.progress += n;
        if self.event.is_empty() {
            return false;
        }
        let should_emit = self.total <= 0
            || self.progress - self.last_emitted >= self.threshold
            || self.progress as i64 == self.total;
        if should_emit {
            self.bus
                .emit(&self.event, vec![json!(self.progress), json!(self.total)]);
            self.last_emitted = self.progress;
            self.emitted += 1;
        }
        should_emit
    }

    pub fn progress(&self) -> u64 {
        self.progress
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }
}
