// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Credential records, grant payloads, and secret fingerprints.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RenewalError;

/// Longest lifetime accepted from a grant (ten years).
pub const MAX_GRANT_LIFETIME_SECS: u64 = 10 * 365 * 24 * 3600;

/// `now_ms` plus `secs`, saturating instead of wrapping.
fn expiry_after(now_ms: u64, secs: u64) -> u64 {
    now_ms.saturating_add(secs.saturating_mul(1000))
}

/// The credential pair for one principal.
///
/// Instants are epoch milliseconds. Records are replaced whole on rotation,
/// never edited field by field.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    pub access_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_secret: Option<String>,
    pub token_kind: String,
    pub access_expires_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_expires_at: Option<u64>,
    #[serde(default)]
    pub scope: String,
    pub issued_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_issued_at: Option<u64>,
}

impl CredentialRecord {
    /// Build a record from a grant issued at `now_ms`.
    ///
    /// When the grant carries no new refresh secret, the previous one (and
    /// its expiry) carries over.
    pub fn from_grant(grant: &TokenGrant, previous: Option<&CredentialRecord>, now_ms: u64) -> Self {
        let (refresh_secret, refresh_expires_at, refresh_issued_at) = match grant.refresh_secret {
            Some(ref secret) => (
                Some(secret.clone()),
                grant.refresh_expires_in.map(|s| expiry_after(now_ms, s)),
                Some(now_ms),
            ),
            None => match previous {
                Some(prev) => {
                    (prev.refresh_secret.clone(), prev.refresh_expires_at, prev.refresh_issued_at)
                }
                None => (None, None, None),
            },
        };
        Self {
            access_secret: grant.access_secret.clone(),
            refresh_secret,
            token_kind: grant.token_kind.clone().unwrap_or_else(|| "Bearer".to_owned()),
            access_expires_at: expiry_after(now_ms, grant.expires_in),
            refresh_expires_at,
            scope: grant.scope.clone().unwrap_or_default(),
            issued_at: now_ms,
            refresh_issued_at,
        }
    }

    pub fn access_expired(&self, now_ms: u64) -> bool {
        self.access_expires_at <= now_ms
    }

    /// True when a refresh secret exists and has not passed its expiry.
    /// A refresh secret without a known expiry is treated as usable.
    pub fn has_usable_refresh(&self, now_ms: u64) -> bool {
        match (&self.refresh_secret, self.refresh_expires_at) {
            (None, _) => false,
            (Some(s), _) if s.is_empty() => false,
            (Some(_), Some(exp)) => exp > now_ms,
            (Some(_), None) => true,
        }
    }

    pub fn access_fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.access_secret)
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("access_secret", &self.access_fingerprint().short())
            .field("refresh_secret", &self.refresh_secret.as_ref().map(|_| "<redacted>"))
            .field("token_kind", &self.token_kind)
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .field("scope", &self.scope)
            .field("issued_at", &self.issued_at)
            .field("refresh_issued_at", &self.refresh_issued_at)
            .finish()
    }
}

/// Success payload of a renewal exchange (either channel).
///
/// Accepts both the OAuth wire names and the camelCase names some identity
/// providers return.
#[derive(Clone, Deserialize)]
pub struct TokenGrant {
    #[serde(alias = "access_token", alias = "accessSecret")]
    pub access_secret: String,
    #[serde(default, alias = "token_type", alias = "tokenKind")]
    pub token_kind: Option<String>,
    #[serde(default, alias = "expiresIn")]
    pub expires_in: u64,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default, alias = "refresh_token", alias = "refreshSecret")]
    pub refresh_secret: Option<String>,
    #[serde(default, alias = "refresh_token_expires_in", alias = "refreshExpiresIn")]
    pub refresh_expires_in: Option<u64>,
}

impl TokenGrant {
    /// Reject grants that would rotate in an unusable credential: an empty
    /// access secret, a missing or zero lifetime, or a lifetime out of range.
    pub fn validate(&self) -> Result<(), RenewalError> {
        let problem = if self.access_secret.is_empty() {
            "empty access secret".to_owned()
        } else if self.expires_in == 0 {
            "missing or zero expires_in".to_owned()
        } else if self.expires_in > MAX_GRANT_LIFETIME_SECS {
            format!("expires_in {} out of range", self.expires_in)
        } else if self.refresh_expires_in.is_some_and(|s| s > MAX_GRANT_LIFETIME_SECS) {
            "refresh_expires_in out of range".to_owned()
        } else {
            return Ok(());
        };
        Err(RenewalError::ServerError { status: 200, detail: format!("malformed grant: {problem}") })
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("token_kind", &self.token_kind)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .field("has_refresh", &self.refresh_secret.is_some())
            .field("refresh_expires_in", &self.refresh_expires_in)
            .finish_non_exhaustive()
    }
}

/// Lowercase hex SHA-256 of a secret. Only fingerprints are ever written to
/// the blacklist or logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut hex = String::with_capacity(digest.len() * 2);
        for b in digest {
            hex.push_str(&format!("{b:02x}"));
        }
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log fields.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
#[path = "record_tests.rs"]
mod tests;
