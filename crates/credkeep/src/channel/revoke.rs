// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Token revocation (RFC 7009) on logout.

use std::time::Duration;

use super::{ChannelFuture, Revoker, TokenHint};
use crate::config::EndpointConfig;

#[derive(Debug, Clone)]
pub struct HttpRevoker {
    http: reqwest::Client,
    revoke_url: String,
    client_id: String,
    client_secret: Option<String>,
}

impl HttpRevoker {
    /// `None` when the endpoint has no revocation URL configured.
    pub fn new(endpoint: &EndpointConfig, timeout: Duration) -> anyhow::Result<Option<Self>> {
        let Some(ref revoke_url) = endpoint.revoke_url else {
            return Ok(None);
        };
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Some(Self {
            http,
            revoke_url: revoke_url.clone(),
            client_id: endpoint.client_id.clone(),
            client_secret: endpoint.client_secret.clone(),
        }))
    }

    async fn do_revoke(&self, secret: &str, hint: TokenHint) -> anyhow::Result<()> {
        let mut form = vec![
            ("token", secret),
            ("token_type_hint", hint.as_str()),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(ref cs) = self.client_secret {
            form.push(("client_secret", cs.as_str()));
        }
        let resp = self.http.post(&self.revoke_url).form(&form).send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("revocation endpoint returned {status}");
        }
        Ok(())
    }
}

impl Revoker for HttpRevoker {
    fn revoke<'a>(&'a self, secret: &'a str, hint: TokenHint) -> ChannelFuture<'a, anyhow::Result<()>> {
        Box::pin(self.do_revoke(secret, hint))
    }
}
