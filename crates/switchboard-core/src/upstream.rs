// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Upstream request construction: URL assembly, auth injection, header and
//! parameter overrides, and the timed send.

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use switchboard_config::AuthType;
use switchboard_endpoint::{ensure_fresh_token, Endpoint};
use switchboard_wire::Dialect;

use crate::error::ProxyError;

/// Headers the override mechanism may never replace.
const PROTECTED_HEADERS: &[&str] = &["authorization", "x-api-key", "x-goog-api-key", "content-type"];

/// Fully assembled upstream request, ready to send.
#[derive(Debug)]
pub struct PreparedRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

/// Upstream URL for a request.
///
/// Native requests keep their original path (so `/v1/messages/count_tokens`
/// and legacy `/v1/completions` pass through untouched); converted requests
/// use the canonical path of the upstream dialect.
pub fn upstream_url(
    ep: &Endpoint,
    upstream: Dialect,
    requested: Dialect,
    original_path: &str,
    model: &str,
    stream: bool,
) -> Result<String, ProxyError> {
    let base = ep
        .base_url(upstream)
        .ok_or_else(|| {
            ProxyError::Config(format!("endpoint {} has no URL for {}", ep.name, upstream.as_str()))
        })?
        .trim_end_matches('/');

    if upstream == requested && upstream != Dialect::Gemini {
        return Ok(format!("{base}{original_path}"));
    }

    Ok(match upstream {
        Dialect::Anthropic => format!("{base}/v1/messages"),
        Dialect::OpenaiChat => format!("{base}/v1/chat/completions"),
        Dialect::OpenaiResponses => format!("{base}/v1/responses"),
        Dialect::Gemini => {
            let action = if stream { "streamGenerateContent?alt=sse" } else { "generateContent" };
            format!("{base}/v1beta/models/{model}:{action}")
        }
        Dialect::Unknown => {
            return Err(ProxyError::Internal("cannot build URL for unknown dialect".into()))
        }
    })
}

/// Auth headers for this endpoint and upstream dialect.
///
/// When a `detected_auth_header` has been learned, only that header is
/// sent; otherwise the auth type decides (api_key and auto send both).
pub async fn auth_headers(
    ep: &Endpoint,
    upstream: Dialect,
    client: &reqwest::Client,
    persist: &(dyn Fn(&Endpoint) + Send + Sync),
) -> Result<Vec<(String, String)>, ProxyError> {
    if upstream == Dialect::Gemini {
        return Ok(vec![("x-goog-api-key".into(), ep.config.auth.value.clone())]);
    }

    let value = match ep.auth_type() {
        AuthType::OAuth => ensure_fresh_token(ep, client, persist)
            .await
            .map_err(|e| ProxyError::Network(e.to_string()))?,
        _ => ep.config.auth.value.clone(),
    };

    let learned = ep.detected_auth_header();
    if !learned.is_empty() {
        return Ok(match learned.as_str() {
            "x-api-key" => vec![("x-api-key".into(), value)],
            _ => vec![("authorization".into(), format!("Bearer {value}"))],
        });
    }

    Ok(match ep.auth_type() {
        AuthType::ApiKey | AuthType::Auto => vec![
            ("x-api-key".into(), value.clone()),
            ("authorization".into(), format!("Bearer {value}")),
        ],
        AuthType::AuthToken | AuthType::OAuth => {
            vec![("authorization".into(), format!("Bearer {value}"))]
        }
    })
}

/// JSON-merge the endpoint's parameter overrides into the body.
pub fn merge_parameters(body: &mut Value, overrides: &serde_json::Map<String, Value>) {
    if overrides.is_empty() {
        return;
    }
    if let Some(obj) = body.as_object_mut() {
        for (k, v) in overrides {
            obj.insert(k.clone(), v.clone());
        }
    }
}

/// Drop parameters the upstream has rejected before.
pub fn strip_unsupported(body: &mut Value, params: &std::collections::BTreeSet<String>) {
    if params.is_empty() {
        return;
    }
    if let Some(obj) = body.as_object_mut() {
        for name in params {
            obj.remove(name);
        }
    }
}

/// Assemble the complete upstream request.
pub async fn prepare(
    ep: &Endpoint,
    upstream: Dialect,
    requested: Dialect,
    original_path: &str,
    model: &str,
    mut body: Value,
    stream: bool,
    client: &reqwest::Client,
    persist: &(dyn Fn(&Endpoint) + Send + Sync),
) -> Result<PreparedRequest, ProxyError> {
    let url = upstream_url(ep, upstream, requested, original_path, model, stream)?;

    let mut headers = auth_headers(ep, upstream, client, persist).await?;
    if upstream == Dialect::Anthropic {
        headers.push(("anthropic-version".into(), "2023-06-01".into()));
    }

    // Endpoint header overrides apply after the built-ins and win, except
    // for authentication and content-type safety.
    for (name, value) in ep.header_overrides() {
        let lower = name.to_ascii_lowercase();
        if PROTECTED_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&lower));
        headers.push((lower, value));
    }

    merge_parameters(&mut body, &ep.config.parameters);
    strip_unsupported(&mut body, &ep.unsupported_params());

    Ok(PreparedRequest { url, headers, body })
}

/// Send the prepared request, timing first byte (response headers).
pub async fn send(
    client: &reqwest::Client,
    prepared: &PreparedRequest,
) -> Result<(reqwest::Response, Duration), ProxyError> {
    let mut req = client.post(&prepared.url).json(&prepared.body);
    for (name, value) in &prepared.headers {
        req = req.header(name.as_str(), value.as_str());
    }
    debug!(url = %prepared.url, "upstream call");
    let started = Instant::now();
    let resp = req.send().await.map_err(|e| ProxyError::Network(e.to_string()))?;
    Ok((resp, started.elapsed()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchboard_config::EndpointConfig;

    fn ep(yaml: &str) -> Endpoint {
        let config: EndpointConfig = serde_yaml::from_str(yaml).unwrap();
        Endpoint::new(config, 0)
    }

    fn noop_persist(_: &Endpoint) {}

    #[test]
    fn native_anthropic_keeps_original_path() {
        let e = ep("name: a\nurl_anthropic: https://api.anthropic.com\n");
        let url = upstream_url(
            &e,
            Dialect::Anthropic,
            Dialect::Anthropic,
            "/v1/messages",
            "claude-3-5-sonnet",
            false,
        )
        .unwrap();
        assert_eq!(url, "https://api.anthropic.com/v1/messages");
        let url = upstream_url(
            &e,
            Dialect::Anthropic,
            Dialect::Anthropic,
            "/v1/messages/count_tokens",
            "",
            false,
        )
        .unwrap();
        assert_eq!(url, "https://api.anthropic.com/v1/messages/count_tokens");
    }

    #[test]
    fn converted_request_uses_canonical_path() {
        let e = ep("name: o\nurl_openai: https://api.example.com/\n");
        let url = upstream_url(
            &e,
            Dialect::OpenaiChat,
            Dialect::OpenaiResponses,
            "/v1/responses",
            "gpt-5",
            false,
        )
        .unwrap();
        assert_eq!(url, "https://api.example.com/v1/chat/completions");
    }

    #[test]
    fn gemini_url_encodes_model_and_action() {
        let e = ep("name: g\nurl_gemini: https://generativelanguage.googleapis.com\n");
        let url = upstream_url(&e, Dialect::Gemini, Dialect::Anthropic, "/v1/messages", "gemini-2.0-flash", true)
            .unwrap();
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse"
        );
        let url = upstream_url(&e, Dialect::Gemini, Dialect::Anthropic, "/v1/messages", "gemini-2.0-flash", false)
            .unwrap();
        assert!(url.ends_with(":generateContent"));
    }

    #[tokio::test]
    async fn api_key_auth_sends_both_headers() {
        let e = ep("name: a\nurl_anthropic: https://api.anthropic.com\nauth:\n  type: api_key\n  value: K\n");
        let client = reqwest::Client::new();
        let headers = auth_headers(&e, Dialect::Anthropic, &client, &noop_persist).await.unwrap();
        assert!(headers.contains(&("x-api-key".into(), "K".into())));
        assert!(headers.contains(&("authorization".into(), "Bearer K".into())));
    }

    #[tokio::test]
    async fn auth_token_sends_bearer_only() {
        let e = ep("name: a\nurl_openai: https://x\nauth:\n  type: auth_token\n  value: T\n");
        let client = reqwest::Client::new();
        let headers = auth_headers(&e, Dialect::OpenaiChat, &client, &noop_persist).await.unwrap();
        assert_eq!(headers, vec![("authorization".into(), "Bearer T".into())]);
    }

    #[tokio::test]
    async fn learned_header_narrows_auto_auth() {
        let e = ep("name: a\nurl_anthropic: https://x\nauth:\n  type: auto\n  value: V\n");
        e.set_detected_auth_header("x-api-key");
        let client = reqwest::Client::new();
        let headers = auth_headers(&e, Dialect::Anthropic, &client, &noop_persist).await.unwrap();
        assert_eq!(headers, vec![("x-api-key".into(), "V".into())]);
    }

    #[tokio::test]
    async fn gemini_uses_goog_api_key() {
        let e = ep("name: g\nurl_gemini: https://g\nauth:\n  type: api_key\n  value: GK\n");
        let client = reqwest::Client::new();
        let headers = auth_headers(&e, Dialect::Gemini, &client, &noop_persist).await.unwrap();
        assert_eq!(headers, vec![("x-goog-api-key".into(), "GK".into())]);
    }

    #[test]
    fn parameter_overrides_merge_into_body() {
        let mut body = json!({ "model": "m", "temperature": 0.5 });
        let overrides: serde_json::Map<String, Value> =
            serde_json::from_value(json!({ "temperature": 1.0, "top_k": 40 })).unwrap();
        merge_parameters(&mut body, &overrides);
        assert_eq!(body["temperature"], json!(1.0));
        assert_eq!(body["top_k"], json!(40));
    }

    #[test]
    fn unsupported_params_are_stripped() {
        let mut body = json!({ "model": "m", "logprobs": true, "temperature": 0.2 });
        let params: std::collections::BTreeSet<String> = ["logprobs".to_string()].into();
        strip_unsupported(&mut body, &params);
        assert!(body.get("logprobs").is_none());
        assert!(body.get("temperature").is_some());
    }

    #[tokio::test]
    async fn header_overrides_cannot_touch_auth() {
        let e = ep(
            "name: a\nurl_anthropic: https://api.anthropic.com\nauth:\n  type: api_key\n  value: K\nheaders:\n  x-api-key: EVIL\n  x-custom: yes\n",
        );
        let client = reqwest::Client::new();
        let prepared = prepare(
            &e,
            Dialect::Anthropic,
            Dialect::Anthropic,
            "/v1/messages",
            "m",
            json!({ "model": "m" }),
            false,
            &client,
            &noop_persist,
        )
        .await
        .unwrap();
        let api_key = prepared.headers.iter().find(|(n, _)| n == "x-api-key").unwrap();
        assert_eq!(api_key.1, "K", "auth override must be ignored");
        assert!(prepared.headers.iter().any(|(n, v)| n == "x-custom" && v == "yes"));
        assert!(prepared
            .headers
            .iter()
            .any(|(n, v)| n == "anthropic-version" && v == "2023-06-01"));
    }
}
