// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Library-level lifecycle against an HTTP token endpoint and a file store.

use std::sync::Arc;
use std::time::Duration;

use credkeep::blacklist::RevocationReason;
use credkeep::channel::{HttpGrantClient, SilentFailure, SilentFailureKind};
use credkeep::clock::epoch_ms;
use credkeep::config::LifecycleConfig;
use credkeep::coordinator::{RefreshCoordinator, RenewalOutcome};
use credkeep::event::{LifecycleEvent, RenewalChannel};
use credkeep::record::{CredentialRecord, Fingerprint, TokenGrant};
use credkeep::storage::{AeadSealer, FileStore, KeyValueStore};
use credkeep::test_support::{grant, FakeSilentReauth};
use credkeep_specs::{grant_body, IdentityProvider};

fn fast_config() -> LifecycleConfig {
    LifecycleConfig { backoff_base_ms: 10, backoff_max_ms: 50, ..Default::default() }
}

fn signed_in_record(access: &str, refresh: Option<&str>, ttl_secs: u64) -> CredentialRecord {
    let grant = TokenGrant {
        access_secret: access.to_owned(),
        token_kind: None,
        expires_in: ttl_secs,
        scope: None,
        refresh_secret: refresh.map(str::to_owned),
        refresh_expires_in: None,
    };
    CredentialRecord::from_grant(&grant, None, epoch_ms())
}

fn sealer(key: &str) -> anyhow::Result<Arc<AeadSealer>> {
    Ok(Arc::new(AeadSealer::from_base64(key)?))
}

#[tokio::test]
async fn rotation_persists_across_restart() -> anyhow::Result<()> {
    let idp = IdentityProvider::start(vec![(200, grant_body("a2", Some("r2"), 3600))]).await?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("state.json");
    let key = AeadSealer::generate_key()?;

    {
        let store = Arc::new(FileStore::open(&path)?);
        let primary = HttpGrantClient::new(&idp.endpoint(), Duration::from_secs(5))?;
        let (coordinator, mut events) = RefreshCoordinator::builder(store)
            .config(fast_config())
            .sealer(sealer(&key)?)
            .primary(Arc::new(primary))
            .build();

        coordinator.sign_in("alice@example.com", signed_in_record("a1", Some("r1"), 200))?;
        let outcome = coordinator.renew().await;
        assert!(
            matches!(outcome, RenewalOutcome::Renewed { channel: RenewalChannel::Primary, .. }),
            "{outcome:?}"
        );

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names, vec!["signed-in", "renewed"]);
    }

    assert_eq!(idp.token_calls(), 1);
    let form = idp.token_bodies().join("&");
    assert!(form.contains("grant_type=refresh_token"));
    assert!(form.contains("refresh_token=r1"));

    // Nothing secret leaks into the state file in cleartext.
    let raw = std::fs::read_to_string(&path)?;
    assert!(!raw.contains("\"r2\""));

    let store = Arc::new(FileStore::open(&path)?);
    let (coordinator, _events) =
        RefreshCoordinator::builder(store).config(fast_config()).sealer(sealer(&key)?).build();
    assert_eq!(coordinator.current_principal().as_deref(), Some("alice@example.com"));
    assert_eq!(coordinator.authorization_header().as_deref(), Some("Bearer a2"));
    let stored = coordinator.principals().load_record("alice@example.com")?;
    assert_eq!(stored.and_then(|r| r.refresh_secret).as_deref(), Some("r2"));
    assert!(coordinator.blacklist().is_secret_revoked("a1")?);
    assert!(coordinator.blacklist().is_secret_revoked("r1")?);
    Ok(())
}

#[tokio::test]
async fn invalid_grant_over_http_falls_back_to_silent_reauth() -> anyhow::Result<()> {
    let idp = IdentityProvider::start(vec![(
        400,
        r#"{"error":"invalid_grant","error_description":"refresh token revoked"}"#.to_owned(),
    )])
    .await?;
    let store = Arc::new(credkeep::storage::MemoryStore::new());
    let primary = HttpGrantClient::new(&idp.endpoint(), Duration::from_secs(5))?;
    let secondary = Arc::new(FakeSilentReauth::new(vec![Ok(grant("a2", None, 3600))]));
    let (coordinator, _events) = RefreshCoordinator::builder(store)
        .config(fast_config())
        .primary(Arc::new(primary))
        .secondary(secondary.clone())
        .build();

    coordinator.sign_in("alice", signed_in_record("a1", Some("r1"), 200))?;
    let outcome = coordinator.renew().await;

    assert!(
        matches!(outcome, RenewalOutcome::Renewed { channel: RenewalChannel::Secondary, .. }),
        "{outcome:?}"
    );
    assert_eq!(idp.token_calls(), 1);
    assert_eq!(secondary.calls(), 1);
    let entry = coordinator.blacklist().entry(&Fingerprint::of("r1"))?;
    assert_eq!(entry.map(|e| e.reason), Some(RevocationReason::Cleared));
    Ok(())
}

#[tokio::test]
async fn server_errors_are_retried_over_http() -> anyhow::Result<()> {
    let idp = IdentityProvider::start(vec![
        (503, "unavailable".to_owned()),
        (502, "bad gateway".to_owned()),
        (200, grant_body("a2", Some("r2"), 3600)),
    ])
    .await?;
    let store = Arc::new(credkeep::storage::MemoryStore::new());
    let primary = HttpGrantClient::new(&idp.endpoint(), Duration::from_secs(5))?;
    let (coordinator, _events) =
        RefreshCoordinator::builder(store).config(fast_config()).primary(Arc::new(primary)).build();

    coordinator.sign_in("alice", signed_in_record("a1", Some("r1"), 200))?;
    assert!(matches!(coordinator.renew().await, RenewalOutcome::Renewed { .. }));
    assert_eq!(idp.token_calls(), 3);
    Ok(())
}

#[tokio::test]
async fn concurrent_renewals_make_one_http_exchange() -> anyhow::Result<()> {
    let idp = IdentityProvider::start(vec![(200, grant_body("a2", Some("r2"), 3600))]).await?;
    let store = Arc::new(credkeep::storage::MemoryStore::new());
    let primary = HttpGrantClient::new(&idp.endpoint(), Duration::from_secs(5))?;
    let (coordinator, _events) =
        RefreshCoordinator::builder(store).config(fast_config()).primary(Arc::new(primary)).build();
    coordinator.sign_in("alice", signed_in_record("a1", Some("r1"), 200))?;

    let outcomes =
        futures_util::future::join_all((0..16).map(|_| coordinator.renew())).await;

    assert_eq!(idp.token_calls(), 1);
    assert!(outcomes.iter().all(|o| o == &outcomes[0]));
    assert!(outcomes[0].succeeded());
    Ok(())
}

#[tokio::test]
async fn exhausted_renewal_of_expired_credential_forces_sign_in() -> anyhow::Result<()> {
    let idp =
        IdentityProvider::start(vec![(400, r#"{"error":"invalid_grant"}"#.to_owned())]).await?;
    let store = Arc::new(credkeep::storage::MemoryStore::new());
    let primary = HttpGrantClient::new(&idp.endpoint(), Duration::from_secs(5))?;
    let secondary = Arc::new(FakeSilentReauth::new(vec![Err(SilentFailure::new(
        SilentFailureKind::LoginRequired,
        "login_required",
    ))]));
    let (coordinator, mut events) = RefreshCoordinator::builder(store.clone())
        .config(fast_config())
        .primary(Arc::new(primary))
        .secondary(secondary)
        .build();

    // Access secret already lapsed; only the refresh secret is left.
    coordinator.sign_in("alice", signed_in_record("a1", Some("r1"), 0))?;
    assert!(coordinator.is_authenticated());

    let outcome = coordinator.renew().await;
    assert!(matches!(outcome, RenewalOutcome::Failed { .. }), "{outcome:?}");
    assert!(!coordinator.is_authenticated());
    assert!(store.keys("principal.")?.is_empty());

    let mut exhausted = false;
    while let Ok(event) = events.try_recv() {
        exhausted |= matches!(event, LifecycleEvent::RenewalExhausted { .. });
    }
    assert!(exhausted);
    Ok(())
}

#[tokio::test]
async fn legacy_cleartext_secret_migrates_when_key_arrives() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("state.json");

    {
        let store = Arc::new(FileStore::open(&path)?);
        let (coordinator, _events) = RefreshCoordinator::builder(store).build();
        let report = coordinator.sign_in("alice", signed_in_record("a1", Some("r1"), 3600))?;
        assert!(!report.encrypted);
    }
    assert!(std::fs::read_to_string(&path)?.contains("\"r1\""));

    let key = AeadSealer::generate_key()?;
    let store = Arc::new(FileStore::open(&path)?);
    let (coordinator, _events) = RefreshCoordinator::builder(store).sealer(sealer(&key)?).build();
    assert_eq!(coordinator.migrate_legacy()?, 1);
    assert_eq!(coordinator.migrate_legacy()?, 0);

    assert!(!std::fs::read_to_string(&path)?.contains("\"r1\""));
    let stored = coordinator.principals().load_record("alice")?;
    assert_eq!(stored.and_then(|r| r.refresh_secret).as_deref(), Some("r1"));
    Ok(())
}
