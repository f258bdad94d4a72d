// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Refresh-grant exchange over HTTP.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::{ChannelFuture, GrantClient};
use crate::config::EndpointConfig;
use crate::error::RenewalError;
use crate::record::TokenGrant;

/// OAuth error response body.
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Posts `grant_type=refresh_token` to the token endpoint.
#[derive(Debug, Clone)]
pub struct HttpGrantClient {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
}

impl HttpGrantClient {
    /// `attempt_timeout` bounds each exchange end to end.
    pub fn new(endpoint: &EndpointConfig, attempt_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(attempt_timeout).build()?;
        Ok(Self {
            http,
            token_url: endpoint.token_url.clone(),
            client_id: endpoint.client_id.clone(),
            client_secret: endpoint.client_secret.clone(),
        })
    }

    async fn do_exchange(&self, refresh_secret: &str) -> Result<TokenGrant, RenewalError> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_secret),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(ref secret) = self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let resp = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| RenewalError::NetworkError(describe_transport(&e)))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| RenewalError::NetworkError(format!("read body: {e}")))?;
        debug!(status, "token endpoint responded");

        if (200..300).contains(&status) {
            let grant: TokenGrant =
                serde_json::from_str(&body).map_err(|e| RenewalError::ServerError {
                    status,
                    detail: format!("malformed grant response: {e}"),
                })?;
            grant.validate()?;
            return Ok(grant);
        }
        Err(classify_failure(status, &body))
    }
}

impl GrantClient for HttpGrantClient {
    fn exchange<'a>(&'a self, refresh_secret: &'a str) -> ChannelFuture<'a, Result<TokenGrant, RenewalError>> {
        Box::pin(self.do_exchange(refresh_secret))
    }
}

fn describe_transport(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("timed out: {e}")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        format!("HTTP error: {e}")
    }
}

/// Classify a non-2xx token endpoint response.
///
/// Client errors (4xx, including 401) are terminal for the refresh secret:
/// `expired` when the provider says so, `invalid` otherwise. Everything else
/// is a retryable server error.
pub fn classify_failure(status: u16, body: &str) -> RenewalError {
    if !(400..500).contains(&status) {
        let detail: String = body.chars().take(200).collect();
        return RenewalError::ServerError { status, detail };
    }

    let (code, description) = match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(err) => (err.error, err.error_description.unwrap_or_default()),
        Err(_) => (format!("http_{status}"), body.chars().take(200).collect()),
    };
    let detail = if description.is_empty() { code.clone() } else { format!("{code}: {description}") };

    let mentions_expiry = code.to_lowercase().contains("expired")
        || description.to_lowercase().contains("expired");
    if mentions_expiry {
        RenewalError::RefreshSecretExpired(detail)
    } else {
        RenewalError::RefreshSecretInvalid(detail)
    }
}

#[cfg(test)]
#[path = "grant_tests.rs"]
mod tests;
