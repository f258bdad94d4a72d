// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Refresh-secret persistence with encryption when a sealer is available.
//!
//! Two slots per namespace: the sealed slot, and the legacy cleartext slot
//! used when no sealer is configured (and by older installs). Reads prefer
//! the sealed slot and migrate legacy values forward.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::RenewalError;
use crate::storage::{KeyValueStore, Sealer};

pub const ENCRYPTED_SLOT: &str = "credential.encryptedRefreshSecret";
pub const LEGACY_SLOT: &str = "credential.refreshSecret";

/// Result of a successful [`SecureCredentialStore::persist`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PersistReport {
    pub success: bool,
    pub encrypted: bool,
}

pub struct SecureCredentialStore {
    store: Arc<dyn KeyValueStore>,
    sealer: Option<Arc<dyn Sealer>>,
    namespace: String,
}

impl SecureCredentialStore {
    /// `namespace` prefixes both slots and is the sealing associated data.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        sealer: Option<Arc<dyn Sealer>>,
        namespace: impl Into<String>,
    ) -> Self {
        Self { store, sealer, namespace: namespace.into() }
    }

    pub fn is_encrypting(&self) -> bool {
        self.sealer.is_some()
    }

    fn slot(&self, name: &str) -> String {
        format!("{}{name}", self.namespace)
    }

    /// Store `secret`, sealed when possible, and verify it reads back.
    ///
    /// A failed verification removes the partial write and reports
    /// [`RenewalError::StorageCorrupted`]; it is never reported as success.
    pub fn persist(&self, secret: &str) -> Result<PersistReport, RenewalError> {
        let encrypted_key = self.slot(ENCRYPTED_SLOT);
        let legacy_key = self.slot(LEGACY_SLOT);

        let Some(ref sealer) = self.sealer else {
            debug!(namespace = %self.namespace, "no sealer configured, storing refresh secret in cleartext");
            self.store.set(&legacy_key, secret)?;
            if self.store.get(&legacy_key)?.as_deref() != Some(secret) {
                let _ = self.store.remove(&legacy_key);
                return Err(RenewalError::StorageCorrupted("cleartext read-back mismatch".into()));
            }
            // A sealed value from an earlier key can't be read anymore.
            self.store.remove(&encrypted_key)?;
            return Ok(PersistReport { success: true, encrypted: false });
        };

        let sealed = sealer
            .seal(secret, &self.namespace)
            .map_err(|e| RenewalError::StorageUnavailable(format!("seal: {e:#}")))?;
        self.store.set(&encrypted_key, &sealed)?;

        let verified = match self.store.get(&encrypted_key)? {
            Some(stored) => sealer.open(&stored, &self.namespace).ok().as_deref() == Some(secret),
            None => false,
        };
        if !verified {
            if let Err(e) = self.store.remove(&encrypted_key) {
                warn!(namespace = %self.namespace, err = %e, "failed to remove unverified secret");
            }
            return Err(RenewalError::StorageCorrupted(
                "sealed refresh secret failed read-back verification".into(),
            ));
        }

        self.store.remove(&legacy_key)?;
        Ok(PersistReport { success: true, encrypted: true })
    }

    /// Read the refresh secret: sealed slot first, then the legacy slot.
    ///
    /// A legacy hit is migrated into the sealed slot when a sealer is
    /// available. A sealed value that fails to open with no legacy fallback
    /// is reported as [`RenewalError::StorageCorrupted`].
    pub fn retrieve(&self) -> Result<Option<String>, RenewalError> {
        let encrypted_key = self.slot(ENCRYPTED_SLOT);
        let mut unreadable = false;

        if let Some(sealed) = self.store.get(&encrypted_key)? {
            match self.sealer {
                Some(ref sealer) => match sealer.open(&sealed, &self.namespace) {
                    Ok(secret) => return Ok(Some(secret)),
                    Err(e) => {
                        warn!(namespace = %self.namespace, err = %e, "sealed refresh secret unreadable");
                        self.store.remove(&encrypted_key)?;
                        unreadable = true;
                    }
                },
                None => {
                    warn!(namespace = %self.namespace, "sealed refresh secret present but no sealer configured");
                }
            }
        }

        let Some(secret) = self.store.get(&self.slot(LEGACY_SLOT))? else {
            if unreadable {
                return Err(RenewalError::StorageCorrupted(
                    "sealed refresh secret could not be opened".into(),
                ));
            }
            return Ok(None);
        };

        if self.sealer.is_some() {
            match self.persist(&secret) {
                Ok(_) => info!(namespace = %self.namespace, "migrated legacy refresh secret to sealed slot"),
                Err(e) => warn!(namespace = %self.namespace, err = %e, "legacy migration failed, keeping cleartext copy"),
            }
        }
        Ok(Some(secret))
    }

    /// Migrate a legacy cleartext secret now. Returns whether one was moved.
    pub fn migrate_legacy(&self) -> Result<bool, RenewalError> {
        if self.sealer.is_none() {
            return Ok(false);
        }
        match self.store.get(&self.slot(LEGACY_SLOT))? {
            Some(secret) => {
                self.persist(&secret)?;
                info!(namespace = %self.namespace, "migrated legacy refresh secret to sealed slot");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Plaintext secret for moving to another store.
    pub fn export(&self) -> Result<Option<String>, RenewalError> {
        self.retrieve()
    }

    pub fn import(&self, secret: &str) -> Result<PersistReport, RenewalError> {
        self.persist(secret)
    }

    /// Remove both slots.
    pub fn clear(&self) -> Result<(), RenewalError> {
        self.store.remove(&self.slot(ENCRYPTED_SLOT))?;
        self.store.remove(&self.slot(LEGACY_SLOT))?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "secure_store_tests.rs"]
mod tests;
