// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Circuit breaker for the secondary (silent re-authentication) channel.
//!
//! Failures are kept as timestamped events in a sliding window. The circuit
//! is open while the window holds at least `threshold` events; there is no
//! stored open/closed flag. One success clears every event.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::LifecycleConfig;
use crate::event::LifecycleEvent;
use crate::storage::{get_json, set_json, KeyValueStore};

pub const BREAKER_KEY: &str = "circuitBreaker.failures";
pub const SILENT_FLOW_STATE_KEY: &str = "silent.flowState";
pub const SILENT_LAST_ATTEMPT_KEY: &str = "silent.lastAttempt";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureEvent {
    pub timestamp: u64,
    pub error_tag: String,
}

/// Answer to [`CircuitBreaker::can_attempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub allowed: bool,
    pub retry_after_secs: u64,
}

pub struct CircuitBreaker {
    store: Arc<dyn KeyValueStore>,
    threshold: usize,
    window_ms: u64,
    cooldown_ms: u64,
    event_tx: broadcast::Sender<LifecycleEvent>,
    lock: Mutex<()>,
}

impl CircuitBreaker {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        config: &LifecycleConfig,
        event_tx: broadcast::Sender<LifecycleEvent>,
    ) -> Self {
        Self {
            store,
            threshold: config.breaker_threshold.max(1),
            window_ms: config.breaker_window_secs * 1000,
            cooldown_ms: config.breaker_cooldown_secs * 1000,
            event_tx,
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> anyhow::Result<Vec<FailureEvent>> {
        Ok(get_json(self.store.as_ref(), BREAKER_KEY)?.unwrap_or_default())
    }

    fn in_window(&self, events: &[FailureEvent], now_ms: u64) -> usize {
        events.iter().filter(|e| now_ms.saturating_sub(e.timestamp) < self.window_ms).count()
    }

    /// Failures currently inside the window.
    pub fn failures(&self, now_ms: u64) -> anyhow::Result<Vec<FailureEvent>> {
        let mut events = self.load()?;
        events.retain(|e| now_ms.saturating_sub(e.timestamp) < self.window_ms);
        Ok(events)
    }

    pub fn is_open(&self, now_ms: u64) -> anyhow::Result<bool> {
        Ok(self.in_window(&self.load()?, now_ms) >= self.threshold)
    }

    /// Record a secondary-channel failure. Returns true when this failure
    /// opened the circuit, in which case secondary-channel metadata has been
    /// cleared and [`LifecycleEvent::CircuitOpen`] emitted.
    pub fn record_failure(&self, error_tag: &str, now_ms: u64) -> anyhow::Result<bool> {
        let _guard = self.lock.lock();
        let mut events = self.load()?;
        let was_open = self.in_window(&events, now_ms) >= self.threshold;

        events.retain(|e| now_ms.saturating_sub(e.timestamp) < self.window_ms);
        events.push(FailureEvent { timestamp: now_ms, error_tag: error_tag.to_owned() });
        set_json(self.store.as_ref(), BREAKER_KEY, &events)?;
        debug!(error_tag, failures = events.len(), "secondary channel failure recorded");

        let open = events.len() >= self.threshold;
        if open && !was_open {
            self.store.remove(SILENT_FLOW_STATE_KEY)?;
            self.store.remove(SILENT_LAST_ATTEMPT_KEY)?;
            let retry_after_secs = self.cooldown_ms.div_ceil(1000);
            warn!(failures = events.len(), retry_after_secs, "secondary channel circuit opened");
            let _ = self
                .event_tx
                .send(LifecycleEvent::CircuitOpen { failures: events.len(), retry_after_secs });
        }
        Ok(open && !was_open)
    }

    /// Close the circuit immediately.
    pub fn record_success(&self) -> anyhow::Result<()> {
        let _guard = self.lock.lock();
        if self.store.get(BREAKER_KEY)?.is_some() {
            self.store.remove(BREAKER_KEY)?;
            debug!("secondary channel circuit reset");
        }
        Ok(())
    }

    pub fn can_attempt(&self, now_ms: u64) -> anyhow::Result<Admission> {
        let events = self.load()?;
        if self.in_window(&events, now_ms) < self.threshold {
            return Ok(Admission { allowed: true, retry_after_secs: 0 });
        }
        let last = events.iter().map(|e| e.timestamp).max().unwrap_or(now_ms);
        let retry_after_ms = (last + self.cooldown_ms).saturating_sub(now_ms);
        Ok(Admission { allowed: false, retry_after_secs: retry_after_ms.div_ceil(1000) })
    }
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;
