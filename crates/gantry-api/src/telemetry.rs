//! Bounded in-engine telemetry event queue.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Maximum events retained between drains.
pub const MAX_TELEMETRY_QUEUE_SIZE: usize = 1000;

/// One recorded engine event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Microseconds since the Unix epoch at record time.
    pub timestamp_us: u64,
    /// Event name, e.g. `"post_xfer"`.
    pub name: String,
    /// Event value (bytes, counts — event-defined).
    pub value: u64,
}

/// Thread-safe event queue; a disabled queue records nothing.
#[derive(Debug)]
pub struct TelemetryQueue {
    enabled: bool,
    events: Mutex<Vec<TelemetryEvent>>,
}

impl TelemetryQueue {
    /// Create a queue; when `enabled` is false all records are dropped.
    pub fn new(enabled: bool) -> Self {
        TelemetryQueue { enabled, events: Mutex::new(Vec::new()) }
    }

    /// Record an event. Silently dropped when disabled or full.
    pub fn record(&self, name: &str, value: u64) {
        if !self.enabled {
            return;
        }
        let mut events = self.events.lock().unwrap();
        if events.len() >= MAX_TELEMETRY_QUEUE_SIZE {
            return;
        }
        let timestamp_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        events.push(TelemetryEvent { timestamp_us, name: name.to_string(), value });
    }

    /// Drain and return all recorded events.
    pub fn take(&self) -> Vec<TelemetryEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}
