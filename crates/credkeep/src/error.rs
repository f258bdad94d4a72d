// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

use std::fmt;

/// Failure taxonomy for renewal and credential storage.
///
/// Refresh-secret failures are terminal for the primary channel only; the
/// coordinator always falls through to the secondary channel. Storage
/// failures are terminal for the whole renewal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalError {
    /// The grant endpoint reported the refresh secret as expired.
    RefreshSecretExpired(String),
    /// The grant endpoint rejected the refresh secret (malformed, revoked,
    /// unauthorized client).
    RefreshSecretInvalid(String),
    /// Transport-level failure: timeout, connection refused, unreadable body.
    NetworkError(String),
    /// Silent re-authentication did not produce a credential.
    SecondaryChannelFailed(String),
    /// The grant endpoint answered with a 5xx.
    ServerError { status: u16, detail: String },
    /// The secondary channel is blocked by the circuit breaker.
    CircuitOpen { retry_after_secs: u64 },
    /// A write could not be verified by reading it back.
    StorageCorrupted(String),
    /// The storage backend itself failed.
    StorageUnavailable(String),
    /// A secret offered for storage is on the blacklist.
    SecretRevoked(String),
}

impl RenewalError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RefreshSecretExpired(_) => "REFRESH_SECRET_EXPIRED",
            Self::RefreshSecretInvalid(_) => "REFRESH_SECRET_INVALID",
            Self::NetworkError(_) => "NETWORK_ERROR",
            Self::SecondaryChannelFailed(_) => "SECONDARY_CHANNEL_FAILED",
            Self::ServerError { .. } => "SERVER_ERROR",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::StorageCorrupted(_) => "STORAGE_CORRUPTED",
            Self::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            Self::SecretRevoked(_) => "SECRET_REVOKED",
        }
    }

    /// Retried under the primary-channel backoff policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkError(_) | Self::ServerError { .. })
    }

    /// Ends any further use of the current refresh secret.
    pub fn is_refresh_terminal(&self) -> bool {
        matches!(self, Self::RefreshSecretExpired(_) | Self::RefreshSecretInvalid(_))
    }

    /// Ends the renewal outright, without trying remaining channels.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::StorageCorrupted(_) | Self::StorageUnavailable(_))
    }
}

impl fmt::Display for RenewalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RefreshSecretExpired(msg)
            | Self::RefreshSecretInvalid(msg)
            | Self::NetworkError(msg)
            | Self::SecondaryChannelFailed(msg)
            | Self::StorageCorrupted(msg)
            | Self::StorageUnavailable(msg)
            | Self::SecretRevoked(msg) => write!(f, "{}: {msg}", self.as_str()),
            Self::ServerError { status, detail } => {
                write!(f, "{} ({status}): {detail}", self.as_str())
            }
            Self::CircuitOpen { retry_after_secs } => {
                write!(f, "{}: retry after {retry_after_secs}s", self.as_str())
            }
        }
    }
}

impl std::error::Error for RenewalError {}

impl From<anyhow::Error> for RenewalError {
    fn from(e: anyhow::Error) -> Self {
        Self::StorageUnavailable(format!("{e:#}"))
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
