// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Per-principal credential isolation.
//!
//! Each principal's record lives under `principal.<sanitized-id>.`; the
//! refresh secret goes through a [`SecureCredentialStore`] scoped to the same
//! namespace. An ordered index bounds how many principals stay resident.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::LifecycleConfig;
use crate::error::RenewalError;
use crate::record::CredentialRecord;
use crate::secure_store::{PersistReport, SecureCredentialStore};
use crate::storage::{get_json, remove_prefix, set_json, KeyValueStore, Sealer};

pub const INDEX_KEY: &str = "principalIndex";
pub const CURRENT_KEY: &str = "currentPrincipal";
const NAMESPACE_ROOT: &str = "principal.";

const ACCESS_SECRET: &str = "credential.accessSecret";
const ACCESS_EXPIRES_AT: &str = "credential.accessExpiresAt";
const TOKEN_KIND: &str = "credential.tokenKind";
const SCOPE: &str = "credential.scope";
const ISSUED_AT: &str = "credential.issuedAt";
const REFRESH_META: &str = "credential.refreshMeta";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    issued_at: Option<u64>,
}

/// Encode an identifier for use as a key segment. ASCII alphanumerics pass
/// through; every other char becomes `_<hex code point>_`, so the segment
/// never contains `.` and distinct ids never share a namespace.
pub fn sanitize_principal(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for c in id.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else {
            out.push_str(&format!("_{:x}_", u32::from(c)));
        }
    }
    out
}

/// Inverse of [`sanitize_principal`]. `None` for a segment it could not
/// have produced.
pub fn decode_principal(segment: &str) -> Option<String> {
    let mut out = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(c) = rest.chars().next() {
        if c == '_' {
            let (hex, tail) = rest[1..].split_once('_')?;
            out.push(char::from_u32(u32::from_str_radix(hex, 16).ok()?)?);
            rest = tail;
        } else if c.is_ascii_alphanumeric() {
            out.push(c);
            rest = &rest[1..];
        } else {
            return None;
        }
    }
    Some(out)
}

pub fn principal_namespace(id: &str) -> String {
    format!("{NAMESPACE_ROOT}{}.", sanitize_principal(id))
}

/// One resident principal in a [`SecurityAudit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrincipalAudit {
    /// Principal id as indexed, or the bare namespace for orphans.
    pub principal: String,
    pub indexed: bool,
    pub expired: bool,
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<u64>,
    pub has_refresh: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityAudit {
    pub principals: Vec<PrincipalAudit>,
    pub resident: usize,
    pub cap: usize,
    pub over_capacity: bool,
    pub issues: Vec<String>,
}

impl SecurityAudit {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

pub struct PrincipalStore {
    store: Arc<dyn KeyValueStore>,
    sealer: Option<Arc<dyn Sealer>>,
    cap: usize,
    clear_other_principals: bool,
    stale_after_ms: u64,
    lock: Mutex<()>,
}

impl PrincipalStore {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        sealer: Option<Arc<dyn Sealer>>,
        config: &LifecycleConfig,
    ) -> Self {
        Self {
            store,
            sealer,
            cap: config.principal_cap.max(1),
            clear_other_principals: config.clear_other_principals,
            stale_after_ms: config.stale_after_secs * 1000,
            lock: Mutex::new(()),
        }
    }

    /// The secure store scoped to `id`'s namespace.
    pub fn secure_store(&self, id: &str) -> SecureCredentialStore {
        SecureCredentialStore::new(
            Arc::clone(&self.store),
            self.sealer.clone(),
            principal_namespace(id),
        )
    }

    pub fn index(&self) -> Result<Vec<String>, RenewalError> {
        Ok(get_json(self.store.as_ref(), INDEX_KEY)?.unwrap_or_default())
    }

    pub fn current_principal(&self) -> Result<Option<String>, RenewalError> {
        Ok(self.store.get(CURRENT_KEY)?)
    }

    /// Save `record` for `id`, make `id` current, and enforce the cap.
    pub fn save_for_principal(
        &self,
        id: &str,
        record: &CredentialRecord,
    ) -> Result<PersistReport, RenewalError> {
        let _guard = self.lock.lock();
        let ns = principal_namespace(id);

        if self.clear_other_principals {
            for other in self.resident_namespaces()? {
                if other != ns {
                    debug!(namespace = %other, "clearing other principal");
                    remove_prefix(self.store.as_ref(), &other)?;
                }
            }
            let index = self.index()?;
            let kept: Vec<String> = index.into_iter().filter(|p| p == id).collect();
            set_json(self.store.as_ref(), INDEX_KEY, &kept)?;
        }

        let report = match self.write_record(&ns, id, record) {
            Ok(report) => report,
            Err(e) => {
                warn!(principal = %id, err = %e, "credential write failed, removing partial record");
                let _ = remove_prefix(self.store.as_ref(), &ns);
                return Err(e);
            }
        };

        let mut index = self.index()?;
        index.retain(|p| p != id);
        index.push(id.to_owned());
        while index.len() > self.cap {
            let evicted = index.remove(0);
            info!(principal = %evicted, cap = self.cap, "evicting principal beyond cap");
            remove_prefix(self.store.as_ref(), &principal_namespace(&evicted))?;
        }
        set_json(self.store.as_ref(), INDEX_KEY, &index)?;
        self.store.set(CURRENT_KEY, id)?;

        Ok(report)
    }

    fn write_record(
        &self,
        ns: &str,
        id: &str,
        record: &CredentialRecord,
    ) -> Result<PersistReport, RenewalError> {
        let s = self.store.as_ref();
        s.set(&format!("{ns}{ACCESS_SECRET}"), &record.access_secret)?;
        s.set(&format!("{ns}{ACCESS_EXPIRES_AT}"), &record.access_expires_at.to_string())?;
        s.set(&format!("{ns}{TOKEN_KIND}"), &record.token_kind)?;
        s.set(&format!("{ns}{SCOPE}"), &record.scope)?;
        s.set(&format!("{ns}{ISSUED_AT}"), &record.issued_at.to_string())?;

        let secure = self.secure_store(id);
        match record.refresh_secret {
            Some(ref secret) => {
                let meta = RefreshMeta {
                    expires_at: record.refresh_expires_at,
                    issued_at: record.refresh_issued_at,
                };
                set_json(s, &format!("{ns}{REFRESH_META}"), &meta)?;
                secure.persist(secret)
            }
            None => {
                s.remove(&format!("{ns}{REFRESH_META}"))?;
                secure.clear()?;
                Ok(PersistReport { success: true, encrypted: secure.is_encrypting() })
            }
        }
    }

    /// Raw record for `id`, expired or not.
    pub fn load_record(&self, id: &str) -> Result<Option<CredentialRecord>, RenewalError> {
        let ns = principal_namespace(id);
        let s = self.store.as_ref();
        let Some(access_secret) = s.get(&format!("{ns}{ACCESS_SECRET}"))? else {
            return Ok(None);
        };
        let num = |key: &str| -> Result<u64, RenewalError> {
            let raw = s.get(&format!("{ns}{key}"))?.unwrap_or_default();
            raw.parse().map_err(|_| RenewalError::StorageCorrupted(format!("{ns}{key} is not a timestamp")))
        };
        let access_expires_at = num(ACCESS_EXPIRES_AT)?;
        let issued_at = num(ISSUED_AT)?;
        let meta: RefreshMeta = get_json(s, &format!("{ns}{REFRESH_META}"))?.unwrap_or_default();
        let refresh_secret = self.secure_store(id).retrieve()?;

        Ok(Some(CredentialRecord {
            access_secret,
            refresh_secret,
            token_kind: s.get(&format!("{ns}{TOKEN_KIND}"))?.unwrap_or_else(|| "Bearer".to_owned()),
            access_expires_at,
            refresh_expires_at: meta.expires_at,
            scope: s.get(&format!("{ns}{SCOPE}"))?.unwrap_or_default(),
            issued_at,
            refresh_issued_at: meta.issued_at,
        }))
    }

    fn resolve(&self, id: Option<&str>) -> Result<Option<String>, RenewalError> {
        match id {
            Some(id) => Ok(Some(id.to_owned())),
            None => self.current_principal(),
        }
    }

    /// Record for `id` (or the current principal). A record whose access
    /// expiry has passed is purged and reported as absent.
    pub fn get_for_principal(
        &self,
        id: Option<&str>,
        now_ms: u64,
    ) -> Result<Option<CredentialRecord>, RenewalError> {
        let Some(id) = self.resolve(id)? else {
            return Ok(None);
        };
        let Some(record) = self.load_record(&id)? else {
            return Ok(None);
        };
        if record.access_expired(now_ms) {
            info!(principal = %id, "stored credential expired, purging");
            self.clear_principal(&id)?;
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Purge one principal's record and index entry.
    pub fn clear_principal(&self, id: &str) -> Result<(), RenewalError> {
        let _guard = self.lock.lock();
        remove_prefix(self.store.as_ref(), &principal_namespace(id))?;
        let mut index = self.index()?;
        let before = index.len();
        index.retain(|p| p != id);
        if index.len() != before {
            set_json(self.store.as_ref(), INDEX_KEY, &index)?;
        }
        if self.current_principal()?.as_deref() == Some(id) {
            self.store.remove(CURRENT_KEY)?;
        }
        Ok(())
    }

    /// Purge every principal, the index, and the current pointer.
    pub fn clear_all(&self) -> Result<usize, RenewalError> {
        let _guard = self.lock.lock();
        let namespaces = self.resident_namespaces()?;
        for ns in &namespaces {
            remove_prefix(self.store.as_ref(), ns)?;
        }
        self.store.remove(INDEX_KEY)?;
        self.store.remove(CURRENT_KEY)?;
        Ok(namespaces.len())
    }

    /// Namespaces holding any key, indexed or not.
    fn resident_namespaces(&self) -> Result<BTreeSet<String>, RenewalError> {
        let mut out = BTreeSet::new();
        for key in self.store.keys(NAMESPACE_ROOT)? {
            let rest = &key[NAMESPACE_ROOT.len()..];
            if let Some((name, _)) = rest.split_once('.') {
                out.insert(format!("{NAMESPACE_ROOT}{name}."));
            }
        }
        Ok(out)
    }

    /// Enumerate resident principals and flag expired, stale, orphaned, and
    /// over-capacity state.
    pub fn audit_security(&self, now_ms: u64) -> Result<SecurityAudit, RenewalError> {
        let index = self.index()?;
        let mut namespaces = self.resident_namespaces()?;
        let mut principals = Vec::new();
        let mut issues = Vec::new();

        let mut entries: Vec<(String, bool)> = Vec::new();
        for id in &index {
            namespaces.remove(&principal_namespace(id));
            entries.push((id.clone(), true));
        }
        for orphan in namespaces {
            issues.push(format!("orphaned credential namespace {orphan}"));
            let bare = orphan.trim_start_matches(NAMESPACE_ROOT).trim_end_matches('.');
            entries.push((decode_principal(bare).unwrap_or_else(|| bare.to_owned()), false));
        }

        for (id, indexed) in entries {
            let record = match self.load_record(&id) {
                Ok(r) => r,
                Err(e) => {
                    issues.push(format!("{id}: unreadable credential ({e})"));
                    None
                }
            };
            let Some(record) = record else {
                if indexed {
                    issues.push(format!("{id}: indexed without a stored credential"));
                }
                continue;
            };
            let expired = record.access_expired(now_ms);
            let stale = now_ms.saturating_sub(record.issued_at) > self.stale_after_ms;
            if expired {
                issues.push(format!("{id}: access credential expired"));
            }
            if stale {
                issues.push(format!("{id}: credential older than retention age"));
            }
            principals.push(PrincipalAudit {
                principal: id,
                indexed,
                expired,
                stale,
                issued_at: Some(record.issued_at),
                has_refresh: record.refresh_secret.is_some(),
            });
        }

        let resident = principals.len();
        let over_capacity = resident > self.cap;
        if over_capacity {
            issues.push(format!("{resident} principals resident, cap is {}", self.cap));
        }

        Ok(SecurityAudit { principals, resident, cap: self.cap, over_capacity, issues })
    }
}

#[cfg(test)]
#[path = "principal_tests.rs"]
mod tests;
