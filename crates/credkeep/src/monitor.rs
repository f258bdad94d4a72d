// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Background credential maintenance.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::{RefreshCoordinator, RenewalOutcome};
use crate::event::LifecycleEvent;
use crate::tracker::AuthState;

/// What one [`Monitor::tick`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Blacklist entries removed, when a sweep ran.
    pub swept: Option<usize>,
    /// Outcome of a proactive renewal, when one ran.
    pub renewal: Option<RenewalOutcome>,
    pub state: AuthState,
}

/// Periodic maintenance state for one coordinator.
pub struct Monitor {
    coordinator: Arc<RefreshCoordinator>,
    last_sweep_at: Option<u64>,
    /// Session deadline already announced as expiring soon.
    warned_deadline: Option<u64>,
}

impl Monitor {
    pub fn new(coordinator: Arc<RefreshCoordinator>) -> Self {
        Self { coordinator, last_sweep_at: None, warned_deadline: None }
    }

    /// Sweep the blacklist when due, renew when due, and announce an expiring
    /// secondary-channel session once per deadline.
    pub async fn tick(&mut self) -> TickReport {
        let config = self.coordinator.config().clone();
        let now = self.coordinator.now_ms();

        let sweep_due = self
            .last_sweep_at
            .is_none_or(|last| now.saturating_sub(last) >= config.blacklist_sweep_secs * 1000);
        let swept = if sweep_due {
            self.last_sweep_at = Some(now);
            match self.coordinator.sweep_blacklist() {
                Ok(n) => {
                    if n > 0 {
                        info!(removed = n, "swept expired blacklist entries");
                    }
                    Some(n)
                }
                Err(e) => {
                    warn!(err = %e, "blacklist sweep failed");
                    None
                }
            }
        } else {
            None
        };

        let renewal = if self.coordinator.needs_renewal() {
            debug!("credential inside renewal window");
            Some(self.coordinator.renew().await)
        } else {
            None
        };

        self.check_secondary_session(now, config.expiring_soon_secs);

        TickReport { swept, renewal, state: self.coordinator.auth_state() }
    }

    fn check_secondary_session(&mut self, now: u64, threshold_secs: u64) {
        let Some(deadline) = self.coordinator.secondary_session_expires_at() else {
            return;
        };
        if deadline <= now || self.warned_deadline == Some(deadline) {
            return;
        }
        let expires_in_secs = (deadline - now) / 1000;
        if expires_in_secs <= threshold_secs {
            self.warned_deadline = Some(deadline);
            info!(expires_in_secs, "silent re-authentication session ending soon");
            self.coordinator.emit(LifecycleEvent::SecondaryChannelExpiringSoon { expires_in_secs });
        }
    }
}

/// Spawn the maintenance loop. The first tick runs immediately.
pub fn spawn_monitor(
    coordinator: Arc<RefreshCoordinator>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let interval = coordinator.config().check_interval();
    tokio::spawn(async move {
        let mut monitor = Monitor::new(coordinator);
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            let report = monitor.tick().await;
            debug!(state = ?report.state, swept = ?report.swept, "monitor tick");
        }
        debug!("credential monitor stopped");
    })
}

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;
