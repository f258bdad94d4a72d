// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! The `credkeep` command layer end to end, against a file-backed state dir.

use credkeep::storage::AeadSealer;
use credkeep_specs::{grant_body, write_config, Cli, IdentityProvider};

#[tokio::test]
async fn sign_in_then_status() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let key = AeadSealer::generate_key()?;
    let cli = Cli::new(dir.path()).store_key(key);

    let (body, code) = cli
        .run(&["sign-in", "alice", "--access", "a1", "--refresh", "r1", "--expires-in", "3600"])
        .await?;
    assert_eq!(code, 0);
    assert_eq!(body["principal"], "alice");
    assert_eq!(body["stored"]["encrypted"], true);

    let (status, code) = cli.run(&["status"]).await?;
    assert_eq!(code, 0);
    assert_eq!(status["principal"], "alice");
    assert_eq!(status["state"], "authenticated");
    assert_eq!(status["has_refresh"], true);
    assert_eq!(status["encrypted_at_rest"], true);

    assert!(!std::fs::read_to_string(cli.state_file())?.contains("\"r1\""));
    Ok(())
}

#[tokio::test]
async fn refresh_renews_through_configured_endpoint() -> anyhow::Result<()> {
    let idp = IdentityProvider::start(vec![(200, grant_body("a2", Some("r2"), 3600))]).await?;
    let dir = tempfile::tempdir()?;
    let config = write_config(dir.path(), Some(&idp.endpoint()), serde_json::json!({}))?;
    let cli = Cli::new(dir.path()).config(config);

    cli.run(&["sign-in", "alice", "--access", "a1", "--refresh", "r1", "--expires-in", "100"])
        .await?;
    let (body, code) = cli.run(&["refresh"]).await?;
    assert_eq!(code, 0, "{body}");
    assert_eq!(body["outcome"], "renewed");
    assert_eq!(body["channel"], "primary");
    assert_eq!(idp.token_calls(), 1);

    // Plenty of lifetime now; a second refresh stays off the network.
    let (body, _) = cli.run(&["refresh"]).await?;
    assert_eq!(body["outcome"], "still_valid");
    assert_eq!(idp.token_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn failed_refresh_exits_nonzero() -> anyhow::Result<()> {
    let idp =
        IdentityProvider::start(vec![(400, r#"{"error":"invalid_grant"}"#.to_owned())]).await?;
    let dir = tempfile::tempdir()?;
    let config = write_config(dir.path(), Some(&idp.endpoint()), serde_json::json!({}))?;
    let cli = Cli::new(dir.path()).config(config);

    cli.run(&["sign-in", "alice", "--access", "a1", "--refresh", "r1", "--expires-in", "0"])
        .await?;
    let (body, code) = cli.run(&["refresh"]).await?;
    assert_eq!(code, 1);
    assert_eq!(body["outcome"], "failed");
    assert_eq!(body["code"], "REFRESH_SECRET_INVALID");

    let (status, _) = cli.run(&["status"]).await?;
    assert_eq!(status["state"], "absent");
    Ok(())
}

#[tokio::test]
async fn logout_revokes_server_side() -> anyhow::Result<()> {
    let idp = IdentityProvider::start(vec![]).await?;
    let dir = tempfile::tempdir()?;
    let config = write_config(dir.path(), Some(&idp.endpoint()), serde_json::json!({}))?;
    let cli = Cli::new(dir.path()).config(config);

    cli.run(&["sign-in", "alice", "--access", "a1", "--refresh", "r1"]).await?;
    let (body, code) = cli.run(&["logout"]).await?;
    assert_eq!(code, 0);
    assert_eq!(body["loggedOut"], true);

    let revocations = idp.revocations();
    assert_eq!(revocations.len(), 2, "{revocations:?}");
    assert!(revocations[0].contains("token=a1"));
    assert!(revocations[0].contains("token_type_hint=access_token"));
    assert!(revocations[1].contains("token=r1"));

    // The old secrets can't be signed in again.
    let err = cli.run(&["sign-in", "alice", "--access", "a1"]).await.err();
    assert!(err.is_some_and(|e| e.to_string().contains("SECRET_REVOKED")));
    Ok(())
}

#[tokio::test]
async fn clear_and_audit() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = write_config(
        dir.path(),
        None,
        serde_json::json!({ "clear_other_principals": false, "principal_cap": 2 }),
    )?;
    let cli = Cli::new(dir.path()).config(config);

    for (who, secret) in [("alice", "a1"), ("bob", "b1"), ("carol", "c1")] {
        cli.run(&["sign-in", who, "--access", secret]).await?;
    }
    let (audit, code) = cli.run(&["audit"]).await?;
    assert_eq!(code, 0, "{audit}");
    assert_eq!(audit["resident"], 2);

    let (body, _) = cli.run(&["clear"]).await?;
    assert_eq!(body["cleared"], 2);
    let (status, _) = cli.run(&["status"]).await?;
    assert_eq!(status["state"], "absent");
    assert_eq!(status["blacklisted"], 2);
    Ok(())
}

#[tokio::test]
async fn migrate_requires_store_key() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let plain = Cli::new(dir.path());
    plain.run(&["sign-in", "alice", "--access", "a1", "--refresh", "r1"]).await?;
    assert!(plain.run(&["migrate"]).await.is_err());

    let sealed = Cli::new(dir.path()).store_key(AeadSealer::generate_key()?);
    let (body, code) = sealed.run(&["migrate"]).await?;
    assert_eq!(code, 0);
    assert_eq!(body["migrated"], 1);
    assert!(!std::fs::read_to_string(sealed.state_file())?.contains("\"r1\""));
    Ok(())
}
