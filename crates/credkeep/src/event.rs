// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Lifecycle notifications for external consumers.

use serde::{Deserialize, Serialize};

/// Which channel produced a renewed credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalChannel {
    /// Refresh-grant exchange.
    Primary,
    /// Silent re-authentication.
    Secondary,
}

/// Events broadcast by the refresh coordinator and circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum LifecycleEvent {
    /// A credential was established by the external sign-in flow.
    SignedIn { principal: String, expires_at: u64 },
    /// A renewal rotated the credential.
    Renewed { principal: String, channel: RenewalChannel, expires_at: u64 },
    /// Both channels failed and the credential is gone; consumers must force
    /// re-authentication.
    RenewalExhausted {
        #[serde(skip_serializing_if = "Option::is_none")]
        principal: Option<String>,
        reason: String,
    },
    /// The silent re-authentication session ends soon.
    SecondaryChannelExpiringSoon { expires_in_secs: u64 },
    /// The secondary channel is blocked until the cool-down passes.
    CircuitOpen { failures: usize, retry_after_secs: u64 },
    /// The credential lapsed with no renewal path.
    Expired { principal: String },
    /// Credentials were removed by logout or clear-all.
    LoggedOut {
        #[serde(skip_serializing_if = "Option::is_none")]
        principal: Option<String>,
    },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SignedIn { .. } => "signed-in",
            Self::Renewed { .. } => "renewed",
            Self::RenewalExhausted { .. } => "renewal-exhausted",
            Self::SecondaryChannelExpiringSoon { .. } => "secondary-channel-expiring-soon",
            Self::CircuitOpen { .. } => "circuit-open",
            Self::Expired { .. } => "expired",
            Self::LoggedOut { .. } => "logged-out",
        }
    }
}
