// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OAuth access-token refresh for endpoints with `auth.type: oauth`.
//!
//! Refresh is mutex-protected per endpoint: concurrent requests that find
//! an expired token serialize on the material lock, and the second one in
//! sees the fresh token instead of refreshing again.

use anyhow::{bail, Context};
use serde_json::Value;
use tracing::info;

use crate::endpoint::Endpoint;

/// Refresh this long before the advertised expiry.
const EXPIRY_SKEW_SECS: i64 = 300;

/// Return a currently-valid access token for the endpoint, refreshing it
/// first when expired or inside the skew window.  `persist` runs after a
/// successful refresh so the new token reaches the config file.
pub async fn ensure_fresh_token(
    ep: &Endpoint,
    client: &reqwest::Client,
    persist: &(dyn Fn(&Endpoint) + Send + Sync),
) -> anyhow::Result<String> {
    let mut material = ep.oauth_material().lock().await;
    let Some(oauth) = material.as_mut() else {
        bail!("endpoint {} has no oauth material", ep.name);
    };

    let now = chrono::Utc::now().timestamp();
    if !oauth.access_token.is_empty() && now < oauth.expires_at - EXPIRY_SKEW_SECS {
        return Ok(oauth.access_token.clone());
    }

    info!(endpoint = %ep.name, "refreshing oauth access token");
    let resp = client
        .post(&oauth.token_url)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", oauth.refresh_token.as_str()),
            ("client_id", oauth.client_id.as_str()),
        ])
        .send()
        .await
        .with_context(|| format!("oauth refresh for {}", ep.name))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        bail!("oauth refresh for {} failed: {status}: {text}", ep.name);
    }

    let body: Value = resp.json().await.context("parsing oauth token response")?;
    let access = body["access_token"]
        .as_str()
        .context("token response missing access_token")?
        .to_string();
    let expires_in = body["expires_in"].as_i64().unwrap_or(3600);

    oauth.access_token = access.clone();
    oauth.expires_at = now + expires_in;
    if let Some(new_refresh) = body["refresh_token"].as_str() {
        oauth.refresh_token = new_refresh.to_string();
    }
    drop(material);

    persist(ep);
    Ok(access)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_config::EndpointConfig;

    fn oauth_endpoint(access: &str, expires_at: i64) -> Endpoint {
        let config: EndpointConfig = serde_yaml::from_str(&format!(
            "name: oauth-ep\nurl_anthropic: https://api.anthropic.com\nauth:\n  type: oauth\n  oauth:\n    token_url: http://127.0.0.1:1/token\n    client_id: cid\n    refresh_token: rt\n    access_token: {access}\n    expires_at: {expires_at}\n"
        ))
        .unwrap();
        Endpoint::new(config, 0)
    }

    #[tokio::test]
    async fn valid_token_is_returned_without_refresh() {
        let ep = oauth_endpoint("tok", chrono::Utc::now().timestamp() + 3600);
        let client = reqwest::Client::new();
        let token = ensure_fresh_token(&ep, &client, &|_: &Endpoint| {}).await.unwrap();
        assert_eq!(token, "tok");
    }

    #[tokio::test]
    async fn expired_token_attempts_refresh_and_propagates_error() {
        // token_url points at a closed port, so the refresh must fail with
        // a network error rather than silently returning the stale token.
        let ep = oauth_endpoint("stale", chrono::Utc::now().timestamp() - 10);
        let client = reqwest::Client::new();
        let err = ensure_fresh_token(&ep, &client, &|_: &Endpoint| {}).await.unwrap_err();
        assert!(err.to_string().contains("oauth refresh"), "{err}");
    }

    #[tokio::test]
    async fn token_inside_skew_window_is_treated_as_expired() {
        let ep = oauth_endpoint("soon", chrono::Utc::now().timestamp() + 60);
        let client = reqwest::Client::new();
        assert!(ensure_fresh_token(&ep, &client, &|_: &Endpoint| {}).await.is_err());
    }

    #[tokio::test]
    async fn non_oauth_endpoint_is_an_error() {
        let config: EndpointConfig =
            serde_yaml::from_str("name: plain\nurl_openai: https://api.example.com\n").unwrap();
        let ep = Endpoint::new(config, 0);
        let client = reqwest::Client::new();
        let err = ensure_fresh_token(&ep, &client, &|_: &Endpoint| {}).await.unwrap_err();
        assert!(err.to_string().contains("no oauth material"));
    }
}
