// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The dispatcher: one request's whole journey.
//!
//! ```text
//! detect → tag → select → [per candidate: rewrite → convert → call →
//! validate → learn] → stream/convert back → client
//! ```
//!
//! Fail-over walks the candidate list; retry rules may pin extra attempts
//! onto the same endpoint first.  Once the first streamed byte has been
//! forwarded there is no further fail-over — a mid-stream failure emits an
//! error event in the client's dialect and closes the stream.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::Stream;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use switchboard_config::{Config, OpenAiPreference, RetryAction, RetryConfig, SseCompleteness, UpstreamErrorRule};
use switchboard_endpoint::{ClientManager, Endpoint, EndpointRegistry};
use switchboard_tagging::{RequestView, TaggingPipeline};
use switchboard_wire::adapter::AdapterManager;
use switchboard_wire::convert::{self, ConversionHints};
use switchboard_wire::detect::split_gemini_segment;
use switchboard_wire::rewrite::{restore_model, restore_model_in_frame, ModelRewriter, RewriteRecord};
use switchboard_wire::{sse, Dialect, FormatDetector, StreamTranslator};

use crate::error::{error_body, error_frame, ErrorKind, ProxyError};
use crate::learn::{ratelimit_from_headers, AttemptReport, Learner};
use crate::select::select_candidates;
use crate::stats::StatsSink;
use crate::toolmap::{reattach_tool_context, ToolCallCache};
use crate::upstream;
use crate::validate::{classify_http, sniff_content_type, SseValidator};

pub type FrameStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// One buffered inbound request.
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// What goes back to the client.
pub enum Outbound {
    Json { status: u16, body: Value },
    /// SSE stream; served as `text/event-stream; charset=utf-8`.
    Stream(FrameStream),
}

pub struct Dispatcher {
    registry: Arc<EndpointRegistry>,
    detector: FormatDetector,
    tagging: TaggingPipeline,
    adapters: AdapterManager,
    clients: Arc<ClientManager>,
    retry: RetryConfig,
    strict_sse: bool,
    learner: Arc<Learner>,
    tool_calls: dashmap::DashMap<String, Arc<ToolCallCache>>,
}

/// First matching retry rule for an error preview.
pub fn find_rule<'a>(rules: &'a [UpstreamErrorRule], error: &ProxyError) -> Option<&'a UpstreamErrorRule> {
    let preview = error.preview();
    rules.iter().find(|r| {
        if r.case_insensitive {
            preview.to_ascii_lowercase().contains(&r.pattern.to_ascii_lowercase())
        } else {
            preview.contains(&r.pattern)
        }
    })
}

/// Local token estimate for `count_tokens` when the endpoint cannot serve
/// it: the usual 4-chars-per-token heuristic over all message text.
pub fn approximate_count_tokens(body: &Value) -> Value {
    let mut chars = 0usize;
    if let Some(system) = body["system"].as_str() {
        chars += system.len();
    }
    for m in body["messages"].as_array().unwrap_or(&Vec::new()) {
        match &m["content"] {
            Value::String(s) => chars += s.len(),
            Value::Array(blocks) => {
                for b in blocks {
                    if let Some(t) = b["text"].as_str() {
                        chars += t.len();
                    }
                }
            }
            _ => {}
        }
    }
    json!({ "input_tokens": (chars / 4).max(1) })
}

impl Dispatcher {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        tagging: TaggingPipeline,
        config: &Config,
        clients: Arc<ClientManager>,
        stats: Arc<dyn StatsSink>,
    ) -> Arc<Self> {
        let learner = Arc::new(Learner::new(registry.clone(), stats));
        Arc::new(Self {
            registry,
            detector: FormatDetector::default(),
            tagging,
            adapters: AdapterManager::new(&config.conversion),
            clients,
            retry: config.retry.clone(),
            strict_sse: config.validation.strict_sse_terminator,
            learner,
            tool_calls: dashmap::DashMap::new(),
        })
    }

    pub fn adapters(&self) -> &AdapterManager {
        &self.adapters
    }

    /// Serve one request end to end.
    pub async fn handle(&self, req: InboundRequest) -> Outbound {
        let detection = self.detector.detect(&req.path, Some(&req.body));
        if detection.format == Dialect::Unknown {
            return Outbound::Json {
                status: 400,
                body: error_body(
                    Dialect::OpenaiChat,
                    400,
                    ErrorKind::Business,
                    "unrecognized request format",
                ),
            };
        }

        let body_json: Value = serde_json::from_slice(&req.body).unwrap_or(Value::Null);
        if !body_json.is_object() {
            return Outbound::Json {
                status: 400,
                body: error_body(detection.format, 400, ErrorKind::Business, "request body must be a JSON object"),
            };
        }

        // Gemini model and action live in the URL path.
        let (url_model, gemini_stream) = if detection.format == Dialect::Gemini {
            match req.path.rsplit('/').next().and_then(split_gemini_segment) {
                Some((model, action)) => (model.to_string(), action.starts_with("streamGenerateContent")),
                None => (String::new(), false),
            }
        } else {
            (String::new(), false)
        };
        let wants_stream = body_json["stream"].as_bool().unwrap_or(false) || gemini_stream;

        // Tag under the pipeline deadline; the body is buffered exactly once.
        let view = RequestView::new(
            req.method.clone(),
            req.path.clone(),
            req.query.clone(),
            req.headers.clone(),
            req.body.clone(),
        );
        let tagged = self.tagging.run(&view).await;

        let endpoints = self.registry.get_all();
        let candidates = select_candidates(&endpoints, &tagged.tags, &detection);
        if candidates.is_empty() {
            warn!(
                format = detection.format.as_str(),
                tags = ?tagged.tags,
                "no endpoint can serve this request"
            );
            return Outbound::Json {
                status: 503,
                body: error_body(
                    detection.format,
                    503,
                    ErrorKind::Network,
                    "no available endpoint for this request",
                ),
            };
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let mut last_error = ProxyError::Internal("dispatch did not run".into());

        for candidate in &candidates {
            let mut endpoint_attempts = 0u32;
            loop {
                match self
                    .attempt(candidate, &req, &body_json, detection.format, &url_model, wants_stream, &request_id)
                    .await
                {
                    Ok(outbound) => return outbound,
                    Err(e) => {
                        debug!(endpoint = %candidate.name, error = %e, "attempt failed");
                        let rule = find_rule(&self.retry.upstream_errors, &e);
                        let verdict = match rule {
                            Some(r) if r.action == RetryAction::RetryEndpoint
                                && endpoint_attempts < r.max_retries =>
                            {
                                endpoint_attempts += 1;
                                last_error = e;
                                continue;
                            }
                            Some(r) if r.action == RetryAction::SwitchEndpoint => {
                                last_error = e;
                                "switch"
                            }
                            Some(_) => {
                                last_error = e;
                                "exhausted"
                            }
                            None => match e.kind() {
                                // Without a rule, endpoint-level failures
                                // fail over; request-level errors surface.
                                ErrorKind::Network | ErrorKind::Format => {
                                    last_error = e;
                                    "switch"
                                }
                                _ => {
                                    last_error = e;
                                    "surface"
                                }
                            },
                        };
                        if verdict == "surface" {
                            return self.error_response(detection.format, &last_error);
                        }
                        break;
                    }
                }
            }
        }

        info!(request_id = %request_id, error = %last_error, "all candidates exhausted");
        self.error_response(detection.format, &last_error)
    }

    /// Whether a retry rule marks this error safe for the endpoint's
    /// health, regardless of the action it prescribes.
    fn is_safe_error(&self, error: &ProxyError) -> bool {
        find_rule(&self.retry.upstream_errors, error).is_some_and(|r| r.safe)
    }

    fn error_response(&self, dialect: Dialect, error: &ProxyError) -> Outbound {
        // Business errors pass the upstream body through after shape
        // conversion when possible; everything else gets a fresh shape.
        if let ProxyError::Business { status, body } = error {
            if body.get("error").is_some() {
                return Outbound::Json { status: *status, body: body.clone() };
            }
        }
        Outbound::Json {
            status: error.client_status(),
            body: error_body(dialect, error.client_status(), error.kind(), &error.to_string()),
        }
    }

    fn tool_cache(&self, endpoint_id: &str) -> Arc<ToolCallCache> {
        self.tool_calls
            .entry(endpoint_id.to_string())
            .or_insert_with(|| Arc::new(ToolCallCache::default()))
            .clone()
    }

    /// Remember tool calls from a complete response body for the
    /// tool-calling enhancer's id round trip.
    fn record_tool_calls(&self, endpoint_id: &str, body: &Value) {
        let cache = self.tool_cache(endpoint_id);
        for b in body["content"].as_array().unwrap_or(&Vec::new()) {
            if b["type"].as_str() == Some("tool_use") {
                cache.insert(
                    b["id"].as_str().unwrap_or(""),
                    b["name"].as_str().unwrap_or(""),
                    &b["input"].to_string(),
                    "",
                );
            }
        }
        if let Some(tool_calls) = body["choices"][0]["message"]["tool_calls"].as_array() {
            for tc in tool_calls {
                cache.insert(
                    tc["id"].as_str().unwrap_or(""),
                    tc["function"]["name"].as_str().unwrap_or(""),
                    tc["function"]["arguments"].as_str().unwrap_or(""),
                    "",
                );
            }
        }
        for item in body["output"].as_array().unwrap_or(&Vec::new()) {
            if item["type"].as_str() == Some("function_call") {
                cache.insert(
                    item["call_id"].as_str().unwrap_or(""),
                    item["name"].as_str().unwrap_or(""),
                    item["arguments"].as_str().unwrap_or(""),
                    "",
                );
            }
        }
    }

    /// Pick the upstream dialect, honouring the endpoint's OpenAI
    /// preference on OpenAI-family targets.
    fn resolve_upstream_dialect(&self, ep: &Endpoint, requested: Dialect) -> Option<Dialect> {
        let mut upstream = ep.upstream_dialect_for(requested)?;
        if matches!(upstream, Dialect::OpenaiChat | Dialect::OpenaiResponses) {
            match ep.config.openai_preference {
                OpenAiPreference::Responses
                    if ep.supports_responses() != Some(false)
                        && convert::convertible(requested, Dialect::OpenaiResponses) =>
                {
                    upstream = Dialect::OpenaiResponses;
                }
                OpenAiPreference::ChatCompletions
                    if convert::convertible(requested, Dialect::OpenaiChat) =>
                {
                    upstream = Dialect::OpenaiChat;
                }
                _ => {}
            }
        }
        Some(upstream)
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        ep: &Arc<Endpoint>,
        req: &InboundRequest,
        body_json: &Value,
        requested: Dialect,
        url_model: &str,
        wants_stream: bool,
        request_id: &str,
    ) -> Result<Outbound, ProxyError> {
        let upstream_dialect = self
            .resolve_upstream_dialect(ep, requested)
            .ok_or_else(|| ProxyError::Internal(format!("endpoint {} cannot serve {}", ep.name, requested.as_str())))?;

        let is_count_tokens = req.path.ends_with("/count_tokens");
        if is_count_tokens
            && (upstream_dialect != Dialect::Anthropic
                || !ep.config.count_tokens_enabled
                || ep.count_tokens_support() == Some(false))
        {
            // Serve the estimate locally rather than bouncing off an
            // endpoint that cannot answer.
            return Ok(Outbound::Json { status: 200, body: approximate_count_tokens(body_json) });
        }

        let mut body = body_json.clone();

        // ── Tool-call context repair ─────────────────────────────────────────
        // A tool result whose originating call the client dropped gets
        // the cached call block re-injected before conversion.
        let reattached = reattach_tool_context(self.tool_cache(&ep.id).as_ref(), &mut body, requested);
        if reattached > 0 {
            debug!(endpoint = %ep.name, reattached, "re-attached cached tool-call context");
        }

        // ── Model rewrite ────────────────────────────────────────────────────
        let rewriter = ModelRewriter::new(ep.config.model_rewrite.clone().unwrap_or_default());
        let mut record: Option<RewriteRecord> = None;
        let mut model = if requested == Dialect::Gemini {
            url_model.to_string()
        } else {
            convert::model_of(&body, requested).unwrap_or_default().to_string()
        };
        if requested == Dialect::Gemini {
            if let Some((new_model, rec)) = rewriter.apply_url_model(&model) {
                model = new_model;
                record = Some(rec);
            }
        } else if let Some(rec) = rewriter.apply_body(&mut body, requested) {
            model = rec.rewritten.clone();
            record = Some(rec);
        }

        // ── Convert ──────────────────────────────────────────────────────────
        let hints = ConversionHints { max_tokens_field: ep.config.max_tokens_field_name.as_deref() };
        let mut converted = self
            .adapters
            .convert_request(requested, upstream_dialect, &body, hints)
            .map_err(|e| ProxyError::Internal(format!("request conversion failed: {e}")))?;
        if upstream_dialect == requested {
            if let (Some(field), true) = (
                ep.config.max_tokens_field_name.as_deref(),
                matches!(upstream_dialect, Dialect::OpenaiChat | Dialect::OpenaiResponses),
            ) {
                convert::apply_max_tokens_field(&mut converted, field);
            }
        }
        if wants_stream && upstream_dialect != Dialect::Gemini {
            converted["stream"] = json!(true);
        }

        // ── Call ─────────────────────────────────────────────────────────────
        let client = self.clients.for_endpoint(&ep.id, ep.config.proxy.as_ref());
        let registry = self.registry.clone();
        let persist = move |e: &Endpoint| registry.persist_endpoint(e);
        let prepared = upstream::prepare(
            ep.as_ref(),
            upstream_dialect,
            requested,
            &req.path,
            &model,
            converted,
            wants_stream,
            &client,
            &persist,
        )
        .await?;
        let sent_params: Vec<String> = prepared
            .body
            .as_object()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default();

        let started = Instant::now();
        let mut report = AttemptReport {
            request_id: request_id.to_string(),
            upstream: upstream_dialect,
            was_responses_call: upstream_dialect == Dialect::OpenaiResponses,
            was_count_tokens_call: is_count_tokens && upstream_dialect == Dialect::Anthropic,
            status: 0,
            sent_params,
            ratelimit_reset: None,
            ratelimit_status: None,
            safe_error: false,
            first_byte: std::time::Duration::ZERO,
            total: std::time::Duration::ZERO,
        };

        let (resp, first_byte) = match upstream::send(&client, &prepared).await {
            Ok(ok) => ok,
            Err(e) => {
                report.total = started.elapsed();
                report.safe_error = self.is_safe_error(&e);
                self.learner.after_attempt(ep.as_ref(), &report, Err(&e));
                return Err(e);
            }
        };
        report.first_byte = first_byte;
        report.status = resp.status().as_u16();
        let (rl_reset, rl_status) = ratelimit_from_headers(resp.headers());
        report.ratelimit_reset = rl_reset;
        report.ratelimit_status = rl_status;

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let is_sse = content_type.contains("text/event-stream");

        if report.status < 300 && is_sse && wants_stream {
            return Ok(self.stream_response(ep.clone(), resp, requested, upstream_dialect, record, report, started));
        }

        // ── Full-body path ───────────────────────────────────────────────────
        let text = match resp.text().await {
            Ok(t) => t,
            Err(e) => {
                let err = ProxyError::Network(e.to_string());
                report.total = started.elapsed();
                report.safe_error = self.is_safe_error(&err);
                self.learner.after_attempt(ep.as_ref(), &report, Err(&err));
                return Err(err);
            }
        };
        report.total = started.elapsed();

        if let Some(corrected) = sniff_content_type(&content_type, &text) {
            info!(endpoint = %ep.name, from = %content_type, to = corrected, "content-type corrected by sniffing");
        }

        // count_tokens answers are `{input_tokens}` rather than a message
        // body; skip the message-shape check and pass them through.
        let shape_dialect = if is_count_tokens { Dialect::Unknown } else { upstream_dialect };

        match classify_http(shape_dialect, report.status, &text) {
            Ok(value) => {
                self.learner.after_attempt(ep.as_ref(), &report, Ok(()));
                if is_count_tokens {
                    return Ok(Outbound::Json { status: 200, body: value });
                }
                self.record_tool_calls(&ep.id, &value);
                let mut out = convert::convert_response(upstream_dialect, requested, &value)
                    .map_err(|e| ProxyError::Internal(format!("response conversion failed: {e}")))?;
                if let Some(rec) = &record {
                    restore_model(&mut out, rec);
                }
                Ok(Outbound::Json { status: 200, body: out })
            }
            Err(e) => {
                report.safe_error = self.is_safe_error(&e);
                self.learner.after_attempt(ep.as_ref(), &report, Err(&e));
                Err(e)
            }
        }
    }

    /// Copy the upstream SSE body to the client, translating dialects on
    /// the fly.  Validation and the learner run when the stream ends.
    #[allow(clippy::too_many_arguments)]
    fn stream_response(
        &self,
        ep: Arc<Endpoint>,
        mut resp: reqwest::Response,
        requested: Dialect,
        upstream_dialect: Dialect,
        record: Option<RewriteRecord>,
        mut report: AttemptReport,
        started: Instant,
    ) -> Outbound {
        let learner = self.learner.clone();
        let strict = self.strict_sse || ep.config.sse_completeness == SseCompleteness::Strict;
        let retry_rules = self.retry.upstream_errors.clone();

        let stream = async_stream::stream! {
            let mut validator = SseValidator::new(strict);
            let mut translator =
                (upstream_dialect != requested).then(|| StreamTranslator::new(upstream_dialect, requested));
            // Passthrough with a model rewrite still needs line framing so
            // restoration only ever touches complete events.
            let mut passthrough_buf = String::new();
            let mut network_failed = false;

            loop {
                match resp.chunk().await {
                    Ok(Some(chunk)) => {
                        let text = String::from_utf8_lossy(&chunk).to_string();
                        validator.observe_text(&text);
                        match (&mut translator, &record) {
                            (Some(t), rec) => {
                                for frame in t.push(&chunk) {
                                    let frame = match rec {
                                        Some(r) => restore_model_in_frame(&frame, r),
                                        None => frame,
                                    };
                                    yield Bytes::from(frame);
                                }
                            }
                            (None, Some(rec)) => {
                                passthrough_buf.push_str(&text);
                                for line in sse::drain_complete_lines(&mut passthrough_buf) {
                                    let restored = restore_model_in_frame(&line, rec);
                                    yield Bytes::from(format!("{restored}\n"));
                                }
                            }
                            (None, None) => {
                                // Native stream, no rewrite: byte-for-byte.
                                yield chunk;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(endpoint = %ep.name, error = %e, "upstream stream failed mid-flight");
                        network_failed = true;
                        yield Bytes::from(error_frame(requested, &format!("upstream stream failed: {e}")));
                        break;
                    }
                }
            }

            if let Some(t) = &mut translator {
                if !network_failed {
                    for frame in t.finish() {
                        let frame = match &record {
                            Some(r) => restore_model_in_frame(&frame, r),
                            None => frame,
                        };
                        yield Bytes::from(frame);
                    }
                }
            }
            if !passthrough_buf.is_empty() {
                yield Bytes::from(std::mem::take(&mut passthrough_buf));
            }

            let verdict = if network_failed {
                Err(ProxyError::Network("stream interrupted".into()))
            } else {
                validator.finish()
            };
            if let Err(e) = &verdict {
                if !network_failed {
                    error!(endpoint = %ep.name, error = %e, "stream validation failed");
                    yield Bytes::from(error_frame(requested, &e.to_string()));
                }
                report.safe_error = find_rule(&retry_rules, e).is_some_and(|r| r.safe);
            }

            report.total = started.elapsed();
            learner.after_attempt(ep.as_ref(), &report, match &verdict {
                Ok(()) => Ok(()),
                Err(e) => Err(e),
            });
        };

        Outbound::Stream(Box::pin(stream))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::NoopStats;
    use switchboard_config::{Config, TaggingConfig};
    use switchboard_endpoint::{EndpointStatus, InactiveThresholds};

    fn dispatcher_with(config: Config) -> (Arc<Dispatcher>, Arc<EndpointRegistry>) {
        let registry = Arc::new(EndpointRegistry::new(
            config.endpoints.clone(),
            InactiveThresholds { failure_threshold: 2, min_samples: 2 },
        ));
        let tagging = TaggingPipeline::from_config(&TaggingConfig::default()).unwrap();
        let clients = Arc::new(ClientManager::new().unwrap());
        let d = Dispatcher::new(registry.clone(), tagging, &config, clients, Arc::new(NoopStats));
        (d, registry)
    }

    fn anthropic_request(body: Value) -> InboundRequest {
        InboundRequest {
            method: "POST".into(),
            path: "/v1/messages".into(),
            query: String::new(),
            headers: vec![("content-type".into(), "application/json".into())],
            body: body.to_string().into_bytes(),
        }
    }

    fn config_with_endpoints(yaml: &[&str]) -> Config {
        let mut config = Config::default();
        for y in yaml {
            config.endpoints.push(serde_yaml::from_str(y).unwrap());
        }
        config
    }

    #[tokio::test]
    async fn unknown_format_is_rejected_with_400() {
        let (d, _) = dispatcher_with(Config::default());
        let req = InboundRequest {
            method: "POST".into(),
            path: "/nowhere".into(),
            query: String::new(),
            headers: vec![],
            body: b"{\"x\": 1}".to_vec(),
        };
        match d.handle(req).await {
            Outbound::Json { status, body } => {
                assert_eq!(status, 400);
                assert!(body["error"]["message"].as_str().unwrap().contains("unrecognized"));
            }
            _ => panic!("expected json error"),
        }
    }

    #[tokio::test]
    async fn no_candidates_yields_503_in_client_shape() {
        let (d, _) = dispatcher_with(Config::default());
        let req = anthropic_request(json!({
            "model": "claude-3-5-sonnet",
            "messages": [{ "role": "user", "content": "Hi" }],
            "max_tokens": 10,
        }));
        match d.handle(req).await {
            Outbound::Json { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body["type"], "error", "anthropic error shape expected");
            }
            _ => panic!("expected json error"),
        }
    }

    #[tokio::test]
    async fn failover_walks_candidates_and_records_failures() {
        // Both endpoints point at closed ports; the dispatcher must try
        // each once and surface the last network error.
        let config = config_with_endpoints(&[
            "name: e3a\npriority: 1\nurl_anthropic: http://127.0.0.1:1\n",
            "name: e3b\npriority: 2\nurl_anthropic: http://127.0.0.1:1\n",
        ]);
        let (d, registry) = dispatcher_with(config);
        let req = anthropic_request(json!({
            "model": "claude-3-5-sonnet",
            "messages": [{ "role": "user", "content": "Hi" }],
            "max_tokens": 10,
        }));
        match d.handle(req).await {
            Outbound::Json { status, body } => {
                assert_eq!(status, 502);
                assert_eq!(body["type"], "error");
            }
            _ => panic!("expected json error"),
        }
        for ep in registry.get_all() {
            assert_eq!(ep.counters().0, 1, "{} must have exactly one attempt", ep.name);
            assert_eq!(ep.counters().1, 0, "{} attempt must be a failure", ep.name);
        }
    }

    #[tokio::test]
    async fn retry_endpoint_rule_pins_attempts_to_same_endpoint() {
        let mut config = config_with_endpoints(&[
            "name: only\npriority: 1\nurl_anthropic: http://127.0.0.1:1\n",
        ]);
        config.retry.upstream_errors.push(UpstreamErrorRule {
            pattern: "network".into(),
            action: RetryAction::RetryEndpoint,
            max_retries: 2,
            case_insensitive: true,
            safe: false,
        });
        let (d, registry) = dispatcher_with(config);
        let req = anthropic_request(json!({
            "model": "claude-3-5-sonnet",
            "messages": [{ "role": "user", "content": "Hi" }],
            "max_tokens": 10,
        }));
        let _ = d.handle(req).await;
        // 1 initial + 2 retries.
        assert_eq!(registry.get_all()[0].counters().0, 3);
    }

    #[tokio::test]
    async fn safe_switch_rule_never_hurts_endpoint_health() {
        // Network errors normally count against the ring buffer; a safe
        // rule must keep the endpoint healthy while still failing over.
        let mut config = config_with_endpoints(&[
            "name: flaky\npriority: 1\nurl_anthropic: http://127.0.0.1:1\n",
        ]);
        config.retry.upstream_errors.push(UpstreamErrorRule {
            pattern: "network".into(),
            action: RetryAction::SwitchEndpoint,
            max_retries: 0,
            case_insensitive: true,
            safe: true,
        });
        let (d, registry) = dispatcher_with(config);
        let req = anthropic_request(json!({
            "model": "claude-3-5-sonnet",
            "messages": [{ "role": "user", "content": "Hi" }],
            "max_tokens": 10,
        }));
        match d.handle(req).await {
            Outbound::Json { status, .. } => assert_eq!(status, 502),
            _ => panic!("expected json error"),
        }
        let ep = &registry.get_all()[0];
        assert_eq!(ep.counters(), (1, 1), "safe error records as endpoint success");
        assert_eq!(ep.failure_counters(), (0, 1));
        assert_eq!(ep.status(), EndpointStatus::Active);
    }

    #[tokio::test]
    async fn unsafe_rule_still_counts_failures() {
        let mut config = config_with_endpoints(&[
            "name: flaky\npriority: 1\nurl_anthropic: http://127.0.0.1:1\n",
        ]);
        config.retry.upstream_errors.push(UpstreamErrorRule {
            pattern: "network".into(),
            action: RetryAction::SwitchEndpoint,
            max_retries: 0,
            case_insensitive: true,
            safe: false,
        });
        let (d, registry) = dispatcher_with(config);
        let req = anthropic_request(json!({
            "model": "claude-3-5-sonnet",
            "messages": [{ "role": "user", "content": "Hi" }],
            "max_tokens": 10,
        }));
        let _ = d.handle(req).await;
        assert_eq!(registry.get_all()[0].counters(), (1, 0));
    }

    #[test]
    fn recorded_tool_calls_repair_later_orphan_results() {
        let (d, registry) = dispatcher_with(config_with_endpoints(&[
            "name: tools\nurl_anthropic: http://127.0.0.1:1\n",
        ]));
        let ep_id = registry.get_all()[0].id.clone();

        // A complete response carrying a tool call feeds the cache...
        d.record_tool_calls(
            &ep_id,
            &json!({
                "id": "msg_1",
                "type": "message",
                "content": [{
                    "type": "tool_use",
                    "id": "toolu_9",
                    "name": "read_file",
                    "input": { "path": "/etc/hosts" },
                }],
            }),
        );

        // ...so a follow-up whose call turn was dropped gets it back.
        let mut followup = json!({
            "model": "claude-3-5-sonnet",
            "messages": [{
                "role": "user",
                "content": [{ "type": "tool_result", "tool_use_id": "toolu_9", "content": "127.0.0.1" }],
            }],
        });
        let n = reattach_tool_context(d.tool_cache(&ep_id).as_ref(), &mut followup, Dialect::Anthropic);
        assert_eq!(n, 1);
        let call = &followup["messages"][0];
        assert_eq!(call["content"][0]["name"], "read_file");
        assert_eq!(call["content"][0]["input"]["path"], "/etc/hosts");
    }

    #[test]
    fn rule_matching_is_literal_substring() {
        let rules = vec![UpstreamErrorRule {
            pattern: "503".into(),
            action: RetryAction::SwitchEndpoint,
            max_retries: 0,
            case_insensitive: false,
            safe: true,
        }];
        let hit = ProxyError::Business { status: 503, body: json!({"error": "Service Unavailable"}) };
        assert!(find_rule(&rules, &hit).is_some());
        let miss = ProxyError::Business { status: 429, body: json!({"error": "slow down"}) };
        assert!(find_rule(&rules, &miss).is_none());
    }

    #[test]
    fn rule_case_sensitivity_is_per_rule() {
        let sensitive = vec![UpstreamErrorRule {
            pattern: "OVERLOADED".into(),
            action: RetryAction::SwitchEndpoint,
            max_retries: 0,
            case_insensitive: false,
            safe: false,
        }];
        let e = ProxyError::Business { status: 529, body: json!({"error": "overloaded"}) };
        assert!(find_rule(&sensitive, &e).is_none());

        let insensitive = vec![UpstreamErrorRule {
            pattern: "OVERLOADED".into(),
            action: RetryAction::SwitchEndpoint,
            max_retries: 0,
            case_insensitive: true,
            safe: false,
        }];
        assert!(find_rule(&insensitive, &e).is_some());
    }

    #[test]
    fn count_tokens_estimate_uses_chars_over_four() {
        let body = json!({
            "system": "abcd",
            "messages": [{ "role": "user", "content": "12345678" }],
        });
        let out = approximate_count_tokens(&body);
        assert_eq!(out["input_tokens"], json!(3));
    }

    #[tokio::test]
    async fn count_tokens_served_locally_when_endpoint_cannot() {
        let config = config_with_endpoints(&[
            // Unreachable, but count_tokens must never hit the network here.
            "name: no-ct\nurl_anthropic: http://127.0.0.1:1\ncount_tokens_enabled: false\n",
        ]);
        let (d, _) = dispatcher_with(config);
        let req = InboundRequest {
            method: "POST".into(),
            path: "/v1/messages/count_tokens".into(),
            query: String::new(),
            headers: vec![],
            body: json!({
                "model": "claude-3-5-sonnet",
                "messages": [{ "role": "user", "content": "hello world" }],
            })
            .to_string()
            .into_bytes(),
        };
        match d.handle(req).await {
            Outbound::Json { status, body } => {
                assert_eq!(status, 200);
                assert!(body["input_tokens"].as_u64().unwrap() >= 1);
            }
            _ => panic!("expected json"),
        }
    }
}
