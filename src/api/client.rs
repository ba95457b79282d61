//! Authenticated HTTP client for the mail API
//!
//! Wraps reqwest::Client with token injection. A 401 marks the token as
//! rejected, renews it once and retries the request once.

use anyhow::{bail, Context, Result};
use std::time::Duration;

use crate::auth::TokenManager;

pub struct MailClient {
    http: reqwest::Client,
    tokens: TokenManager,
    base: String,
}

impl MailClient {
    pub fn new(tokens: TokenManager, api_base: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            tokens,
            base: api_base.trim_end_matches('/').to_string(),
        })
    }

    /// GET `{api_base}{path}` with bearer auth.
    ///
    /// Token errors are returned as [`crate::auth::AuthError`] inside the
    /// `anyhow::Error`, so callers can tell "sign in again" from HTTP failures.
    pub async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base, path);
        tracing::debug!("GET {}", url);

        let token = self.tokens.ensure_token(false).await?;
        let resp = self.send(&url, &token).await?;
        if resp.status() != reqwest::StatusCode::UNAUTHORIZED {
            return check_response(resp, &url).await;
        }

        tracing::info!("Access token rejected by mail API, renewing...");
        self.tokens.reject_token(&token);
        let token = self.tokens.ensure_token(false).await?;
        let resp = self.send(&url, &token).await?;
        check_response(resp, &url).await
    }

    async fn send(&self, url: &str, token: &str) -> Result<reqwest::Response> {
        self.http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))
    }
}

/// Check HTTP response status code and return a clear error on failure.
async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        bail!(
            "401 Unauthorized for {} after renewing the token -- run 'pigeon login'.",
            url
        );
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("HTTP {} for {}: {}", status.as_u16(), url, body);
    }
    Ok(resp)
}
