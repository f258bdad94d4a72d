// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Registry of revoked credential fingerprints with bounded retention.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::record::Fingerprint;
use crate::storage::{get_json, set_json, KeyValueStore};

pub const BLACKLIST_KEY: &str = "blacklist.entries";

/// Why a secret was revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Expired,
    Rotated,
    Logout,
    Cleared,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Rotated => "rotated",
            Self::Logout => "logout",
            Self::Cleared => "cleared",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlacklistEntry {
    #[serde(rename = "secretFingerprint")]
    pub fingerprint: Fingerprint,
    pub revoked_at: u64,
    pub reason: RevocationReason,
}

/// A fingerprint present here is untrusted until swept. Swept entries are
/// gone for good: reuse of the same secret afterwards is treated as new.
pub struct BlacklistRegistry {
    store: Arc<dyn KeyValueStore>,
    retention_ms: u64,
    /// Serializes read-modify-write cycles on the entry list.
    lock: Mutex<()>,
}

impl BlacklistRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>, retention_secs: u64) -> Self {
        Self { store, retention_ms: retention_secs * 1000, lock: Mutex::new(()) }
    }

    fn load(&self) -> anyhow::Result<Vec<BlacklistEntry>> {
        Ok(get_json(self.store.as_ref(), BLACKLIST_KEY)?.unwrap_or_default())
    }

    /// Insert `fingerprint`. A fingerprint already present keeps its original
    /// reason and timestamp.
    pub fn revoke(
        &self,
        fingerprint: Fingerprint,
        reason: RevocationReason,
        now_ms: u64,
    ) -> anyhow::Result<()> {
        let _guard = self.lock.lock();
        let mut entries = self.load()?;
        if entries.iter().any(|e| e.fingerprint == fingerprint) {
            return Ok(());
        }
        debug!(fingerprint = fingerprint.short(), ?reason, "blacklisted credential");
        entries.push(BlacklistEntry { fingerprint, revoked_at: now_ms, reason });
        set_json(self.store.as_ref(), BLACKLIST_KEY, &entries)
    }

    pub fn revoke_secret(&self, secret: &str, reason: RevocationReason, now_ms: u64) -> anyhow::Result<()> {
        self.revoke(Fingerprint::of(secret), reason, now_ms)
    }

    pub fn is_revoked(&self, fingerprint: &Fingerprint) -> anyhow::Result<bool> {
        Ok(self.load()?.iter().any(|e| &e.fingerprint == fingerprint))
    }

    pub fn is_secret_revoked(&self, secret: &str) -> anyhow::Result<bool> {
        self.is_revoked(&Fingerprint::of(secret))
    }

    pub fn entry(&self, fingerprint: &Fingerprint) -> anyhow::Result<Option<BlacklistEntry>> {
        Ok(self.load()?.into_iter().find(|e| &e.fingerprint == fingerprint))
    }

    pub fn len(&self) -> anyhow::Result<usize> {
        Ok(self.load()?.len())
    }

    pub fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop entries older than the retention window. Returns how many were
    /// removed.
    pub fn sweep(&self, now_ms: u64) -> anyhow::Result<usize> {
        let _guard = self.lock.lock();
        let entries = self.load()?;
        let before = entries.len();
        let kept: Vec<_> = entries
            .into_iter()
            .filter(|e| now_ms.saturating_sub(e.revoked_at) < self.retention_ms)
            .collect();
        let removed = before - kept.len();
        if removed > 0 {
            set_json(self.store.as_ref(), BLACKLIST_KEY, &kept)?;
            info!(removed, remaining = kept.len(), "swept blacklist");
        }
        Ok(removed)
    }
}

#[cfg(test)]
#[path = "blacklist_tests.rs"]
mod tests;
