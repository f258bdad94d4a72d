// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

use super::*;
use crate::storage::{AeadSealer, MemoryStore};

const NS: &str = "principal.alice.";

fn sealer() -> anyhow::Result<Arc<dyn Sealer>> {
    Ok(Arc::new(AeadSealer::from_base64(&AeadSealer::generate_key()?)?))
}

/// Seals normally but opens to the wrong value.
struct MangledSealer;

impl Sealer for MangledSealer {
    fn seal(&self, plaintext: &str, _aad: &str) -> anyhow::Result<String> {
        Ok(format!("sealed:{plaintext}"))
    }

    fn open(&self, _sealed: &str, _aad: &str) -> anyhow::Result<String> {
        Ok("garbage".to_owned())
    }
}

#[test]
fn persist_encrypts_when_sealer_available() -> anyhow::Result<()> {
    let kv = Arc::new(MemoryStore::new());
    let store = SecureCredentialStore::new(kv.clone(), Some(sealer()?), NS);

    let report = store.persist("refresh-1")?;
    assert_eq!(report, PersistReport { success: true, encrypted: true });

    let raw = kv.get(&format!("{NS}{ENCRYPTED_SLOT}"))?.unwrap_or_default();
    assert!(!raw.is_empty());
    assert!(!raw.contains("refresh-1"));
    assert_eq!(kv.get(&format!("{NS}{LEGACY_SLOT}"))?, None);
    assert_eq!(store.retrieve()?.as_deref(), Some("refresh-1"));
    Ok(())
}

#[test]
fn persist_falls_back_to_cleartext_without_sealer() -> anyhow::Result<()> {
    let kv = Arc::new(MemoryStore::new());
    let store = SecureCredentialStore::new(kv.clone(), None, NS);

    let report = store.persist("refresh-1")?;
    assert_eq!(report, PersistReport { success: true, encrypted: false });
    assert_eq!(kv.get(&format!("{NS}{LEGACY_SLOT}"))?.as_deref(), Some("refresh-1"));
    assert_eq!(store.retrieve()?.as_deref(), Some("refresh-1"));
    Ok(())
}

#[test]
fn legacy_secret_migrates_on_first_retrieve() -> anyhow::Result<()> {
    let kv = Arc::new(MemoryStore::new());
    kv.set(&format!("{NS}{LEGACY_SLOT}"), "legacy-refresh")?;
    let store = SecureCredentialStore::new(kv.clone(), Some(sealer()?), NS);

    assert_eq!(store.retrieve()?.as_deref(), Some("legacy-refresh"));
    assert!(kv.get(&format!("{NS}{ENCRYPTED_SLOT}"))?.is_some());
    assert_eq!(kv.get(&format!("{NS}{LEGACY_SLOT}"))?, None);

    assert_eq!(store.retrieve()?.as_deref(), Some("legacy-refresh"));
    Ok(())
}

#[test]
fn failed_verification_is_hard_failure_and_cleans_up() -> anyhow::Result<()> {
    let kv = Arc::new(MemoryStore::new());
    let store = SecureCredentialStore::new(kv.clone(), Some(Arc::new(MangledSealer)), NS);

    let err = store.persist("refresh-1");
    assert!(matches!(err, Err(RenewalError::StorageCorrupted(_))), "got {err:?}");
    assert_eq!(kv.get(&format!("{NS}{ENCRYPTED_SLOT}"))?, None);
    Ok(())
}

#[test]
fn failed_migration_keeps_legacy_copy() -> anyhow::Result<()> {
    let kv = Arc::new(MemoryStore::new());
    kv.set(&format!("{NS}{LEGACY_SLOT}"), "legacy-refresh")?;
    let store = SecureCredentialStore::new(kv.clone(), Some(Arc::new(MangledSealer)), NS);

    assert_eq!(store.retrieve()?.as_deref(), Some("legacy-refresh"));
    assert_eq!(kv.get(&format!("{NS}{LEGACY_SLOT}"))?.as_deref(), Some("legacy-refresh"));
    Ok(())
}

#[test]
fn sealed_value_from_other_key_is_corrupted_without_legacy() -> anyhow::Result<()> {
    let kv = Arc::new(MemoryStore::new());
    SecureCredentialStore::new(kv.clone(), Some(sealer()?), NS).persist("refresh-1")?;

    let rekeyed = SecureCredentialStore::new(kv.clone(), Some(sealer()?), NS);
    assert!(matches!(rekeyed.retrieve(), Err(RenewalError::StorageCorrupted(_))));
    assert_eq!(kv.get(&format!("{NS}{ENCRYPTED_SLOT}"))?, None);
    Ok(())
}

#[test]
fn clear_removes_both_slots() -> anyhow::Result<()> {
    let kv = Arc::new(MemoryStore::new());
    kv.set(&format!("{NS}{LEGACY_SLOT}"), "legacy")?;
    let store = SecureCredentialStore::new(kv.clone(), Some(sealer()?), NS);
    store.persist("fresh")?;
    kv.set(&format!("{NS}{LEGACY_SLOT}"), "legacy")?;

    store.clear()?;
    assert!(kv.keys(NS)?.is_empty());
    assert_eq!(store.retrieve()?, None);
    Ok(())
}

#[test]
fn export_import_moves_secret_between_stores() -> anyhow::Result<()> {
    let legacy_kv = Arc::new(MemoryStore::new());
    legacy_kv.set(&format!("{NS}{LEGACY_SLOT}"), "portable")?;
    let source = SecureCredentialStore::new(legacy_kv, None, NS);

    let target_kv = Arc::new(MemoryStore::new());
    let target = SecureCredentialStore::new(target_kv.clone(), Some(sealer()?), NS);

    let secret = source.export()?.ok_or_else(|| anyhow::anyhow!("nothing exported"))?;
    let report = target.import(&secret)?;
    assert!(report.encrypted);
    assert_eq!(target.retrieve()?.as_deref(), Some("portable"));
    Ok(())
}

#[test]
fn migrate_legacy_reports_movement() -> anyhow::Result<()> {
    let kv = Arc::new(MemoryStore::new());
    let store = SecureCredentialStore::new(kv.clone(), Some(sealer()?), NS);
    assert!(!store.migrate_legacy()?);

    kv.set(&format!("{NS}{LEGACY_SLOT}"), "legacy")?;
    assert!(store.migrate_legacy()?);
    assert_eq!(kv.get(&format!("{NS}{LEGACY_SLOT}"))?, None);
    Ok(())
}
