// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Renewal channels and the collaborators the coordinator calls out to.
//!
//! The primary channel is the refresh-grant exchange ([`GrantClient`]); the
//! secondary channel is silent re-authentication ([`SilentReauth`]), whose
//! mechanics belong to the embedding application. [`Revoker`] notifies the
//! identity provider on logout.

pub mod grant;
pub mod revoke;

pub use grant::HttpGrantClient;
pub use revoke::HttpRevoker;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::RenewalError;
use crate::record::TokenGrant;

pub type ChannelFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Whether the embedding context can run a background re-authentication
/// right now (e.g. not mid-redirect, not on a sign-in page).
pub type BackgroundSafety = Arc<dyn Fn() -> bool + Send + Sync>;

/// Primary channel: exchange a refresh secret for a new credential pair.
pub trait GrantClient: Send + Sync + 'static {
    fn exchange<'a>(&'a self, refresh_secret: &'a str) -> ChannelFuture<'a, Result<TokenGrant, RenewalError>>;
}

/// Secondary channel: obtain a new credential without user interaction.
pub trait SilentReauth: Send + Sync + 'static {
    fn reauthenticate(&self) -> ChannelFuture<'_, Result<TokenGrant, SilentFailure>>;

    /// When the identity-provider session backing silent re-authentication
    /// ends, as epoch milliseconds, if known.
    fn session_expires_at(&self) -> Option<u64> {
        None
    }
}

/// Which secret a revocation call refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenHint {
    AccessToken,
    RefreshToken,
}

impl TokenHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessToken => "access_token",
            Self::RefreshToken => "refresh_token",
        }
    }
}

/// Server-side invalidation on logout. Outcomes are only logged.
pub trait Revoker: Send + Sync + 'static {
    fn revoke<'a>(&'a self, secret: &'a str, hint: TokenHint) -> ChannelFuture<'a, anyhow::Result<()>>;
}

/// Classified failure of a silent re-authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilentFailureKind {
    /// The provider demands an interactive login.
    LoginRequired,
    /// The session or grant was revoked.
    Revoked,
    /// The principal is not allowed to obtain a credential.
    Forbidden,
    /// Another authentication flow is already running.
    InProgress,
    Timeout,
    Network,
    Other,
}

impl SilentFailureKind {
    /// Map an OAuth/OIDC error code or message to a kind.
    pub fn from_error_code(code: &str) -> Self {
        let lower = code.to_lowercase();
        if lower.contains("login_required")
            || lower.contains("interaction_required")
            || lower.contains("consent_required")
            || lower.contains("account_selection_required")
        {
            Self::LoginRequired
        } else if lower.contains("revoked") || lower.contains("invalid_grant") {
            Self::Revoked
        } else if lower.contains("forbidden") || lower.contains("access_denied") {
            Self::Forbidden
        } else if lower.contains("in_progress") || lower.contains("already in progress") {
            Self::InProgress
        } else if lower.contains("timeout") || lower.contains("timed out") {
            Self::Timeout
        } else if lower.contains("network") || lower.contains("connection") {
            Self::Network
        } else {
            Self::Other
        }
    }

    /// Critical kinds abort the retry loop immediately.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::LoginRequired | Self::Revoked | Self::Forbidden | Self::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoginRequired => "login_required",
            Self::Revoked => "revoked",
            Self::Forbidden => "forbidden",
            Self::InProgress => "in_progress",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SilentFailure {
    pub kind: SilentFailureKind,
    pub message: String,
}

impl SilentFailure {
    pub fn new(kind: SilentFailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// Classify from a provider error code.
    pub fn from_error_code(code: &str) -> Self {
        Self::new(SilentFailureKind::from_error_code(code), code)
    }

    pub fn is_critical(&self) -> bool {
        self.kind.is_critical()
    }
}

impl fmt::Display for SilentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for SilentFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[yare::parameterized(
        login_required = { "login_required", SilentFailureKind::LoginRequired, true },
        interaction = { "interaction_required", SilentFailureKind::LoginRequired, true },
        consent = { "consent_required", SilentFailureKind::LoginRequired, true },
        revoked = { "token revoked", SilentFailureKind::Revoked, true },
        invalid_grant = { "invalid_grant", SilentFailureKind::Revoked, true },
        denied = { "access_denied", SilentFailureKind::Forbidden, true },
        forbidden = { "Forbidden", SilentFailureKind::Forbidden, true },
        in_progress = { "flow already in progress", SilentFailureKind::InProgress, true },
        timeout = { "iframe timed out", SilentFailureKind::Timeout, false },
        network = { "network unreachable", SilentFailureKind::Network, false },
        other = { "server_error", SilentFailureKind::Other, false },
    )]
    fn classify_silent_failure(code: &str, kind: SilentFailureKind, critical: bool) {
        let failure = SilentFailure::from_error_code(code);
        assert_eq!(failure.kind, kind);
        assert_eq!(failure.is_critical(), critical);
    }
}
