// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Latency benchmark against one upstream endpoint.
//!
//! Speaks one of the three client dialects directly at a base URL (or a
//! configured endpoint) and reports per-iteration first-byte and total
//! latency as JSON.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use serde_json::{json, Value};

use crate::cli::BenchArgs;

struct Target {
    url: String,
    headers: Vec<(String, String)>,
    body: Value,
}

fn build_target(args: &BenchArgs, config_path: Option<&Path>) -> anyhow::Result<Target> {
    // Resolve base URL and auth: --base-url wins, otherwise look the
    // named endpoint up in the config file.
    let (base, auth_value) = match (&args.base_url, &args.endpoint) {
        (Some(url), _) => (url.trim_end_matches('/').to_string(), String::new()),
        (None, Some(name)) => {
            let path = config_path
                .map(Path::to_path_buf)
                .unwrap_or_else(|| {
                    dirs::home_dir()
                        .unwrap_or_default()
                        .join(".config/switchboard/config.yaml")
                });
            let config = switchboard_config::load(&path)?;
            let ep = config
                .endpoints
                .iter()
                .find(|e| &e.name == name)
                .with_context(|| format!("endpoint {name} not found in config"))?;
            let url = match args.agent.as_str() {
                "claude" => ep.url_anthropic.as_deref(),
                _ => ep.url_openai.as_deref(),
            }
            .with_context(|| format!("endpoint {name} has no URL for agent {}", args.agent))?;
            (url.trim_end_matches('/').to_string(), ep.auth.value.clone())
        }
        (None, None) => bail!("either --endpoint or --base-url is required"),
    };

    let mut headers: Vec<(String, String)> = Vec::new();
    let target = match args.agent.as_str() {
        "claude" => {
            if !auth_value.is_empty() {
                headers.push(("x-api-key".into(), auth_value));
            }
            headers.push(("anthropic-version".into(), "2023-06-01".into()));
            Target {
                url: format!("{base}/v1/messages"),
                headers,
                body: json!({
                    "model": args.model,
                    "messages": [{ "role": "user", "content": args.prompt }],
                    "max_tokens": 64,
                }),
            }
        }
        "codex" => {
            if !auth_value.is_empty() {
                headers.push(("authorization".into(), format!("Bearer {auth_value}")));
            }
            Target {
                url: format!("{base}/v1/responses"),
                headers,
                body: json!({
                    "model": args.model,
                    "instructions": "You are a latency probe.",
                    "input": [{
                        "role": "user",
                        "content": [{ "type": "input_text", "text": args.prompt }],
                    }],
                }),
            }
        }
        _ => {
            if !auth_value.is_empty() {
                headers.push(("authorization".into(), format!("Bearer {auth_value}")));
            }
            Target {
                url: format!("{base}/v1/chat/completions"),
                headers,
                body: json!({
                    "model": args.model,
                    "messages": [{ "role": "user", "content": args.prompt }],
                    "max_tokens": 64,
                }),
            }
        }
    };
    Ok(target)
}

pub async fn run(args: &BenchArgs, config_path: Option<&Path>) -> anyhow::Result<()> {
    let target = build_target(args, config_path)?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout.max(1)))
        .build()
        .context("building bench client")?;

    let mut iterations: Vec<Value> = Vec::new();
    let mut total_sum = 0u128;
    let mut ok_count = 0u32;

    for i in 0..args.iterations {
        let started = Instant::now();
        let mut req = client.post(&target.url).json(&target.body);
        for (name, value) in &target.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let record = match req.send().await {
            Ok(resp) => {
                let first_byte = started.elapsed();
                let status = resp.status().as_u16();
                let ok = resp.status().is_success();
                let _ = resp.bytes().await;
                let total = started.elapsed();
                if ok {
                    ok_count += 1;
                    total_sum += total.as_millis();
                }
                json!({
                    "iteration": i + 1,
                    "status": status,
                    "ok": ok,
                    "first_byte_ms": first_byte.as_millis() as u64,
                    "total_ms": total.as_millis() as u64,
                })
            }
            Err(e) => json!({
                "iteration": i + 1,
                "ok": false,
                "error": e.to_string(),
                "total_ms": started.elapsed().as_millis() as u64,
            }),
        };
        iterations.push(record);
    }

    let report = json!({
        "url": target.url,
        "model": args.model,
        "agent": args.agent,
        "iterations": args.iterations,
        "succeeded": ok_count,
        "avg_total_ms": if ok_count > 0 { (total_sum / ok_count as u128) as u64 } else { 0 },
        "results": iterations,
    });
    let rendered = serde_json::to_string_pretty(&report)?;

    match &args.output {
        Some(path) => {
            std::fs::write(path, &rendered)
                .with_context(|| format!("writing {}", path.display()))?;
            eprintln!("report written to {}", path.display());
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn args(agent: &str) -> BenchArgs {
        BenchArgs {
            endpoint: None,
            base_url: Some("https://api.example.com/".into()),
            model: "m".into(),
            prompt: "hi".into(),
            iterations: 1,
            timeout: 5,
            agent: agent.into(),
            output: None,
        }
    }

    #[test]
    fn claude_target_uses_messages_path() {
        let t = build_target(&args("claude"), None).unwrap();
        assert_eq!(t.url, "https://api.example.com/v1/messages");
        assert!(t.headers.iter().any(|(n, _)| n == "anthropic-version"));
        assert_eq!(t.body["max_tokens"], json!(64));
    }

    #[test]
    fn codex_target_uses_responses_path() {
        let t = build_target(&args("codex"), None).unwrap();
        assert_eq!(t.url, "https://api.example.com/v1/responses");
        assert!(t.body["instructions"].is_string());
    }

    #[test]
    fn openai_target_uses_chat_path() {
        let t = build_target(&args("openai"), None).unwrap();
        assert_eq!(t.url, "https://api.example.com/v1/chat/completions");
    }

    #[test]
    fn missing_target_is_an_error() {
        let mut a = args("claude");
        a.base_url = None;
        assert!(build_target(&a, None).is_err());
    }
}
