// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! CLI subcommands. Each prints JSON on stdout and returns an exit code.

pub mod watch;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tracing::debug;

use crate::channel::{HttpGrantClient, HttpRevoker};
use crate::config::Config;
use crate::coordinator::{RefreshCoordinator, RenewalOutcome};
use crate::event::LifecycleEvent;
use crate::record::{CredentialRecord, TokenGrant};
use crate::storage::{AeadSealer, FileStore};

/// State file name inside the state directory.
pub const STATE_FILE: &str = "credentials.json";

/// How long logout waits for server-side revocation before exiting.
const REVOCATION_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Show the current principal and credential state.
    Status,
    /// Store a credential obtained from an interactive sign-in.
    SignIn(SignInArgs),
    /// Renew the current credential now.
    Refresh,
    /// Sign the current principal out and revoke its secrets.
    Logout,
    /// Blacklist and remove every stored credential.
    Clear,
    /// Report expired, stale, orphaned, and over-capacity credentials.
    Audit,
    /// Drop blacklist entries past retention.
    Sweep,
    /// Move cleartext refresh secrets into sealed storage.
    Migrate,
    /// Keep credentials fresh in the foreground and print lifecycle events.
    Watch,
}

#[derive(Debug, clap::Args)]
pub struct SignInArgs {
    /// Principal (account) identifier.
    pub principal: String,
    /// Access secret.
    #[arg(long, env = "CREDKEEP_ACCESS_SECRET", hide_env_values = true)]
    pub access: String,
    /// Refresh secret (optional).
    #[arg(long, env = "CREDKEEP_REFRESH_SECRET", hide_env_values = true)]
    pub refresh: Option<String>,
    /// Access secret lifetime in seconds.
    #[arg(long, default_value_t = 3600)]
    pub expires_in: u64,
    /// Refresh secret lifetime in seconds (optional).
    #[arg(long)]
    pub refresh_expires_in: Option<u64>,
    /// Granted scope.
    #[arg(long)]
    pub scope: Option<String>,
    /// Token kind used in the authorization header.
    #[arg(long, default_value = "Bearer")]
    pub token_kind: String,
}

/// Assemble a coordinator from the CLI config: file store in the state dir,
/// sealing when a key is given, HTTP channels when an endpoint is configured.
pub fn build_coordinator(
    config: &Config,
) -> anyhow::Result<(Arc<RefreshCoordinator>, broadcast::Receiver<LifecycleEvent>)> {
    let file = config.load_file_config()?;
    let path = config.resolved_state_dir().join(STATE_FILE);
    debug!(path = %path.display(), "opening credential store");
    let store = Arc::new(FileStore::open(path)?);

    let mut builder = RefreshCoordinator::builder(store).config(file.lifecycle.clone());
    if let Some(ref key) = config.store_key {
        builder = builder.sealer(Arc::new(AeadSealer::from_base64(key)?));
    }
    if let Some(ref endpoint) = file.endpoint {
        let timeout = file.lifecycle.attempt_timeout();
        builder = builder.primary(Arc::new(HttpGrantClient::new(endpoint, timeout)?));
        if let Some(revoker) = HttpRevoker::new(endpoint, timeout)? {
            builder = builder.revoker(Arc::new(revoker));
        }
    }
    Ok(builder.build())
}

/// Run the selected subcommand and print its JSON result. Returns a process
/// exit code.
pub async fn run(config: &Config) -> anyhow::Result<i32> {
    if let Command::Watch = config.command {
        let (coordinator, events) = build_coordinator(config)?;
        return watch::run(coordinator, events).await;
    }
    let (body, code) = execute(config).await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(code)
}

/// Run a one-shot subcommand, returning its JSON result and exit code.
pub async fn execute(config: &Config) -> anyhow::Result<(serde_json::Value, i32)> {
    let (coordinator, _events) = build_coordinator(config)?;

    let result = match config.command {
        Command::Status => (serde_json::to_value(coordinator.status()?)?, 0),
        Command::SignIn(ref args) => {
            let record = sign_in_record(args, coordinator.now_ms());
            let report = coordinator.sign_in(&args.principal, record)?;
            (json!({ "principal": args.principal, "stored": report }), 0)
        }
        Command::Refresh => {
            let outcome = coordinator.renew().await;
            let code = if outcome.succeeded() { 0 } else { 1 };
            (outcome_json(&outcome), code)
        }
        Command::Logout => {
            let logged_out = coordinator.logout()?;
            coordinator.flush_revocations(REVOCATION_GRACE).await;
            (json!({ "loggedOut": logged_out }), 0)
        }
        Command::Clear => {
            let cleared = coordinator.clear_all_credentials()?;
            (json!({ "cleared": cleared }), 0)
        }
        Command::Audit => {
            let audit = coordinator.audit()?;
            let code = if audit.is_clean() { 0 } else { 1 };
            (serde_json::to_value(audit)?, code)
        }
        Command::Sweep => (json!({ "removed": coordinator.sweep_blacklist()? }), 0),
        Command::Migrate => {
            if config.store_key.is_none() {
                anyhow::bail!("migrate requires --store-key");
            }
            (json!({ "migrated": coordinator.migrate_legacy()? }), 0)
        }
        Command::Watch => anyhow::bail!("watch runs in the foreground; use run()"),
    };
    Ok(result)
}

fn sign_in_record(args: &SignInArgs, now_ms: u64) -> CredentialRecord {
    let grant = TokenGrant {
        access_secret: args.access.clone(),
        token_kind: Some(args.token_kind.clone()),
        expires_in: args.expires_in,
        scope: args.scope.clone(),
        refresh_secret: args.refresh.clone(),
        refresh_expires_in: args.refresh_expires_in,
    };
    CredentialRecord::from_grant(&grant, None, now_ms)
}

/// JSON rendering of a renewal outcome.
pub fn outcome_json(outcome: &RenewalOutcome) -> serde_json::Value {
    let mut body = match outcome {
        RenewalOutcome::Renewed { channel, expires_at } => {
            json!({ "outcome": "renewed", "channel": channel, "expiresAt": expires_at })
        }
        RenewalOutcome::StillValid => json!({ "outcome": "still_valid" }),
        RenewalOutcome::Throttled { valid } => json!({ "outcome": "throttled", "valid": valid }),
        RenewalOutcome::Degraded { error } => {
            json!({ "outcome": "degraded", "code": error.as_str(), "error": error.to_string() })
        }
        RenewalOutcome::TimedOut { still_valid } => {
            json!({ "outcome": "timed_out", "valid": still_valid })
        }
        RenewalOutcome::ForcedLogout => json!({ "outcome": "forced_logout" }),
        RenewalOutcome::NotSignedIn => json!({ "outcome": "not_signed_in" }),
        RenewalOutcome::Failed { error } => {
            json!({ "outcome": "failed", "code": error.as_str(), "error": error.to_string() })
        }
    };
    body["succeeded"] = json!(outcome.succeeded());
    body
}
