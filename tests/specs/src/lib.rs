// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Test harness for end-to-end credential lifecycle tests.
//!
//! Runs an in-process identity-provider stand-in (token and revocation
//! endpoints) and drives `credkeep` against it, either through the library
//! or through the CLI command layer.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};

use axum::routing::post;
use axum::Router;
use clap::Parser;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use credkeep::config::{Config, EndpointConfig};

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Only the first call has any effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// A successful grant response body.
pub fn grant_body(access: &str, refresh: Option<&str>, expires_in: u64) -> String {
    let mut body = serde_json::json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_in": expires_in,
        "scope": "openid",
    });
    if let Some(refresh) = refresh {
        body["refresh_token"] = serde_json::json!(refresh);
        body["refresh_token_expires_in"] = serde_json::json!(86_400);
    }
    body.to_string()
}

#[derive(Default)]
struct Recorded {
    token_calls: AtomicU32,
    token_bodies: Mutex<Vec<String>>,
    revocations: Mutex<Vec<String>>,
}

/// Scripted identity provider. `/token` plays the script in order and
/// repeats the last entry; `/revoke` always accepts.
pub struct IdentityProvider {
    addr: SocketAddr,
    recorded: Arc<Recorded>,
}

impl IdentityProvider {
    pub async fn start(responses: Vec<(u16, String)>) -> anyhow::Result<Self> {
        ensure_crypto();
        let recorded = Arc::new(Recorded::default());
        let responses = Arc::new(responses);

        let token_rec = Arc::clone(&recorded);
        let revoke_rec = Arc::clone(&recorded);
        let app = Router::new()
            .route(
                "/token",
                post(move |body: String| {
                    let rec = Arc::clone(&token_rec);
                    let resps = Arc::clone(&responses);
                    async move {
                        rec.token_bodies.lock().push(body);
                        let idx = rec.token_calls.fetch_add(1, Ordering::SeqCst) as usize;
                        let (status, body) = resps
                            .get(idx)
                            .or_else(|| resps.last())
                            .cloned()
                            .unwrap_or((500, "{}".to_owned()));
                        (
                            axum::http::StatusCode::from_u16(status)
                                .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR),
                            body,
                        )
                    }
                }),
            )
            .route(
                "/revoke",
                post(move |body: String| {
                    let rec = Arc::clone(&revoke_rec);
                    async move {
                        rec.revocations.lock().push(body);
                        axum::http::StatusCode::OK
                    }
                }),
            );

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        Ok(Self { addr, recorded })
    }

    pub fn endpoint(&self) -> EndpointConfig {
        EndpointConfig {
            token_url: format!("http://{}/token", self.addr),
            revoke_url: Some(format!("http://{}/revoke", self.addr)),
            client_id: "credkeep-specs".to_owned(),
            client_secret: None,
        }
    }

    pub fn token_calls(&self) -> u32 {
        self.recorded.token_calls.load(Ordering::SeqCst)
    }

    /// Form bodies posted to `/token`.
    pub fn token_bodies(&self) -> Vec<String> {
        self.recorded.token_bodies.lock().clone()
    }

    /// Form bodies posted to `/revoke`.
    pub fn revocations(&self) -> Vec<String> {
        self.recorded.revocations.lock().clone()
    }
}

/// Write a config file with `endpoint` and lifecycle overrides.
pub fn write_config(
    dir: &Path,
    endpoint: Option<&EndpointConfig>,
    lifecycle: serde_json::Value,
) -> anyhow::Result<PathBuf> {
    let mut body = serde_json::json!({ "lifecycle": lifecycle });
    if let Some(endpoint) = endpoint {
        body["endpoint"] = serde_json::to_value(endpoint)?;
    }
    let path = dir.join("credkeep.json");
    std::fs::write(&path, serde_json::to_string_pretty(&body)?)?;
    Ok(path)
}

/// One CLI workspace: a state dir, an optional config file and store key.
pub struct Cli {
    state_dir: PathBuf,
    config: Option<PathBuf>,
    store_key: Option<String>,
}

impl Cli {
    pub fn new(state_dir: &Path) -> Self {
        Self { state_dir: state_dir.to_path_buf(), config: None, store_key: None }
    }

    pub fn config(mut self, path: PathBuf) -> Self {
        self.config = Some(path);
        self
    }

    pub fn store_key(mut self, key: impl Into<String>) -> Self {
        self.store_key = Some(key.into());
        self
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join(credkeep::command::STATE_FILE)
    }

    /// Parse `args` as a `credkeep` command line and execute it.
    pub async fn run(&self, args: &[&str]) -> anyhow::Result<(serde_json::Value, i32)> {
        ensure_crypto();
        let mut argv: Vec<String> = vec!["credkeep".into(), "--state-dir".into()];
        argv.push(self.state_dir.display().to_string());
        if let Some(ref config) = self.config {
            argv.push("--config".into());
            argv.push(config.display().to_string());
        }
        if let Some(ref key) = self.store_key {
            argv.push("--store-key".into());
            argv.push(key.clone());
        }
        argv.extend(args.iter().map(|a| a.to_string()));

        let config = Config::try_parse_from(argv)?;
        config.validate()?;
        credkeep::command::execute(&config).await
    }
}
