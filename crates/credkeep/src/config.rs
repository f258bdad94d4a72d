// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::clock::Backoff;
use crate::command::Command;

/// Client-side SSO credential keeper.
#[derive(Debug, Parser)]
#[command(name = "credkeep", version, about)]
pub struct Config {
    /// Directory holding the credential state file.
    #[arg(long, env = "CREDKEEP_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Path to the JSON lifecycle/endpoint config file.
    #[arg(long, env = "CREDKEEP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Base64-encoded 32-byte key for encrypting refresh secrets at rest.
    /// Without it, secrets are stored in cleartext.
    #[arg(long, env = "CREDKEEP_STORE_KEY", hide_env_values = true)]
    pub store_key: Option<String>,

    /// Log format (json or text).
    #[arg(long, env = "CREDKEEP_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "CREDKEEP_LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        Ok(())
    }

    /// Resolved state directory: explicit flag, else [`default_state_dir`].
    pub fn resolved_state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(default_state_dir)
    }

    /// Load the file config, or defaults when no file is configured.
    pub fn load_file_config(&self) -> anyhow::Result<FileConfig> {
        match self.config {
            Some(ref path) => FileConfig::load(path),
            None => Ok(FileConfig::default()),
        }
    }
}

/// Resolve the default state directory.
///
/// Checks `$XDG_STATE_HOME/credkeep`, then `$HOME/.local/state/credkeep`.
pub fn default_state_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(xdg).join("credkeep");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/state/credkeep");
    }
    PathBuf::from(".credkeep")
}

/// Contents of the `--config` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<EndpointConfig>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {}: {e}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
        config.lifecycle.validate()?;
        Ok(config)
    }
}

/// Identity-provider endpoints used by the HTTP channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Token endpoint for the refresh-grant exchange.
    pub token_url: String,
    /// Revocation endpoint, called best-effort on logout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke_url: Option<String>,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

/// Every tunable of the credential lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Renew when this little access lifetime remains.
    pub renewal_buffer_secs: u64,
    /// Minimum spacing between renewal attempts, and between a successful
    /// renewal and the next one.
    pub anti_thrash_secs: u64,
    /// Hard limit on how long a caller waits for an in-flight renewal.
    pub wait_timeout_ms: u64,
    /// Per network attempt timeout, independent of backoff delays.
    pub attempt_timeout_ms: u64,
    /// Total primary-channel attempts for retryable failures.
    pub primary_max_attempts: u32,
    /// Total secondary-channel attempts.
    pub secondary_max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_factor: u32,
    pub backoff_max_ms: u64,
    pub breaker_threshold: usize,
    pub breaker_window_secs: u64,
    pub breaker_cooldown_secs: u64,
    pub blacklist_retention_secs: u64,
    pub blacklist_sweep_secs: u64,
    /// Maximum number of principals with resident secrets.
    pub principal_cap: usize,
    /// Audit flags entries issued longer ago than this.
    pub stale_after_secs: u64,
    /// Purge every other principal before saving one.
    pub clear_other_principals: bool,
    /// Background monitor wake-up interval.
    pub check_interval_secs: u64,
    /// Warn when the silent-auth session ends within this window.
    pub expiring_soon_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            renewal_buffer_secs: 300,
            anti_thrash_secs: 30,
            wait_timeout_ms: 30_000,
            attempt_timeout_ms: 10_000,
            primary_max_attempts: 3,
            secondary_max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_factor: 2,
            backoff_max_ms: 60_000,
            breaker_threshold: 3,
            breaker_window_secs: 300,
            breaker_cooldown_secs: 600,
            blacklist_retention_secs: 24 * 3600,
            blacklist_sweep_secs: 3600,
            principal_cap: 5,
            stale_after_secs: 7 * 24 * 3600,
            clear_other_principals: true,
            check_interval_secs: 60,
            expiring_soon_secs: 300,
        }
    }
}

impl LifecycleConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.principal_cap == 0 {
            anyhow::bail!("principal_cap must be at least 1");
        }
        if self.breaker_threshold == 0 {
            anyhow::bail!("breaker_threshold must be at least 1");
        }
        if self.primary_max_attempts == 0 || self.secondary_max_attempts == 0 {
            anyhow::bail!("attempt counts must be at least 1");
        }
        if self.check_interval_secs == 0 {
            anyhow::bail!("check_interval_secs must be at least 1");
        }
        Ok(())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            base: Duration::from_millis(self.backoff_base_ms),
            factor: self.backoff_factor,
            max: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn renewal_buffer_ms(&self) -> u64 {
        self.renewal_buffer_secs * 1000
    }

    pub fn anti_thrash_ms(&self) -> u64 {
        self.anti_thrash_secs * 1000
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
