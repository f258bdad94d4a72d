// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Token state tracking: pure validity arithmetic over a record's timestamps.

use serde::Serialize;

use crate::config::LifecycleConfig;
use crate::record::CredentialRecord;

/// Authentication state derived from a record at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    /// No record resident.
    Absent,
    /// Access secret unexpired.
    Authenticated,
    /// Access secret expired, but a usable refresh secret remains. Counted as
    /// authenticated so consumers don't flicker to logged-out mid-renewal.
    RenewalEligible,
    /// Access expired with no renewal path; the record should be purged.
    Expired,
}

impl AuthState {
    pub fn is_authenticated(self) -> bool {
        matches!(self, Self::Authenticated | Self::RenewalEligible)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenStateTracker {
    renewal_buffer_ms: u64,
    anti_thrash_ms: u64,
}

impl TokenStateTracker {
    pub fn new(renewal_buffer_ms: u64, anti_thrash_ms: u64) -> Self {
        Self { renewal_buffer_ms, anti_thrash_ms }
    }

    pub fn from_config(config: &LifecycleConfig) -> Self {
        Self::new(config.renewal_buffer_ms(), config.anti_thrash_ms())
    }

    /// Whole seconds of access lifetime left; 0 when absent or expired.
    pub fn time_to_expiry(&self, record: Option<&CredentialRecord>, now_ms: u64) -> u64 {
        record.map(|r| r.access_expires_at.saturating_sub(now_ms) / 1000).unwrap_or(0)
    }

    /// Access secret present and unexpired.
    pub fn is_valid(&self, record: Option<&CredentialRecord>, now_ms: u64) -> bool {
        record.is_some_and(|r| !r.access_expired(now_ms))
    }

    /// Valid with more than the renewal buffer remaining.
    pub fn is_comfortably_valid(&self, record: Option<&CredentialRecord>, now_ms: u64) -> bool {
        record.is_some_and(|r| r.access_expires_at.saturating_sub(now_ms) > self.renewal_buffer_ms)
    }

    /// Remaining lifetime within the renewal buffer, and the last attempt (if
    /// any) far enough back to not thrash re-entrant callers.
    pub fn needs_renewal(
        &self,
        record: Option<&CredentialRecord>,
        last_attempt_ms: Option<u64>,
        now_ms: u64,
    ) -> bool {
        let Some(record) = record else {
            return false;
        };
        let remaining = record.access_expires_at.saturating_sub(now_ms);
        if remaining > self.renewal_buffer_ms {
            return false;
        }
        match last_attempt_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.anti_thrash_ms,
            None => true,
        }
    }

    /// True when `last_ms` lies within the anti-thrash window.
    pub fn within_anti_thrash(&self, last_ms: Option<u64>, now_ms: u64) -> bool {
        last_ms.is_some_and(|last| now_ms.saturating_sub(last) < self.anti_thrash_ms)
    }

    pub fn auth_state(&self, record: Option<&CredentialRecord>, now_ms: u64) -> AuthState {
        match record {
            None => AuthState::Absent,
            Some(r) if !r.access_expired(now_ms) => AuthState::Authenticated,
            Some(r) if r.has_usable_refresh(now_ms) => AuthState::RenewalEligible,
            Some(_) => AuthState::Expired,
        }
    }
}

#[cfg(test)]
#[path = "tracker_tests.rs"]
mod tests;
