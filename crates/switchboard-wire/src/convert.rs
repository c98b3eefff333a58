// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Request and response body conversion between the four dialects.
//!
//! Six directed pairs are supported:
//!
//! ```text
//!          Anthropic ◄─► OpenAI-Chat
//!          Anthropic ◄─► OpenAI-Responses
//!          OpenAI-Chat ◄─► OpenAI-Responses
//!          Anthropic ◄─► Gemini
//! ```
//!
//! Conversions are pure functions over `serde_json::Value` plus endpoint
//! hints.  Anthropic↔Responses goes through the chat shape internally; the
//! chat dialect is the hub all OpenAI-family conversions share.

use anyhow::bail;
use serde_json::{json, Map, Value};

use crate::Dialect;

/// Endpoint-specific knobs consulted during conversion.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversionHints<'a> {
    /// Upstream's name for the max-tokens field (e.g.
    /// `max_completion_tokens`).  `None` keeps the dialect default.
    pub max_tokens_field: Option<&'a str>,
}

/// Whether a request in `from` can be sent to an endpoint speaking `to`.
pub fn convertible(from: Dialect, to: Dialect) -> bool {
    use Dialect::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (Anthropic, OpenaiChat)
            | (OpenaiChat, Anthropic)
            | (Anthropic, OpenaiResponses)
            | (OpenaiResponses, Anthropic)
            | (OpenaiChat, OpenaiResponses)
            | (OpenaiResponses, OpenaiChat)
            | (Anthropic, Gemini)
            | (Gemini, Anthropic)
    )
}

/// Convert a request body from one dialect to another.
pub fn convert_request(
    from: Dialect,
    to: Dialect,
    body: &Value,
    hints: ConversionHints<'_>,
) -> anyhow::Result<Value> {
    use Dialect::*;
    match (from, to) {
        (a, b) if a == b => Ok(body.clone()),
        (Anthropic, OpenaiChat) => Ok(anthropic_to_chat(body, hints)),
        (OpenaiChat, Anthropic) => Ok(chat_to_anthropic(body)),
        (OpenaiResponses, OpenaiChat) => Ok(responses_to_chat(body, hints)),
        (OpenaiChat, OpenaiResponses) => Ok(chat_to_responses(body)),
        (Anthropic, OpenaiResponses) => Ok(chat_to_responses(&anthropic_to_chat(body, ConversionHints::default()))),
        (OpenaiResponses, Anthropic) => Ok(chat_to_anthropic(&responses_to_chat(body, ConversionHints::default()))),
        (Anthropic, Gemini) => Ok(anthropic_to_gemini(body)),
        (Gemini, Anthropic) => Ok(gemini_to_anthropic(body, None)),
        (a, b) => bail!("no conversion path from {} to {}", a.as_str(), b.as_str()),
    }
}

/// Convert a complete (non-streaming) response body back into the
/// client's dialect.  Directions mirror [`convert_request`], reversed.
pub fn convert_response(upstream: Dialect, client: Dialect, body: &Value) -> anyhow::Result<Value> {
    use Dialect::*;
    match (upstream, client) {
        (a, b) if a == b => Ok(body.clone()),
        (OpenaiChat, Anthropic) => Ok(chat_response_to_anthropic(body)),
        (Anthropic, OpenaiChat) => Ok(anthropic_response_to_chat(body)),
        (OpenaiChat, OpenaiResponses) => Ok(chat_response_to_responses(body)),
        (OpenaiResponses, OpenaiChat) => Ok(responses_response_to_chat(body)),
        (Anthropic, OpenaiResponses) => {
            Ok(chat_response_to_responses(&anthropic_response_to_chat(body)))
        }
        (OpenaiResponses, Anthropic) => {
            Ok(chat_response_to_anthropic(&responses_response_to_chat(body)))
        }
        (Gemini, Anthropic) => Ok(gemini_response_to_anthropic(body)),
        (Anthropic, Gemini) => Ok(anthropic_response_to_gemini(body)),
        (a, b) => bail!("no response conversion from {} to {}", a.as_str(), b.as_str()),
    }
}

// ─── Model field access ───────────────────────────────────────────────────────

/// Read the model from a request body.  Gemini carries it in the URL, so
/// this returns `None` for Gemini bodies.
pub fn model_of(body: &Value, dialect: Dialect) -> Option<&str> {
    match dialect {
        Dialect::Gemini => None,
        _ => body["model"].as_str(),
    }
}

pub fn set_model(body: &mut Value, dialect: Dialect, model: &str) {
    if dialect != Dialect::Gemini {
        body["model"] = json!(model);
    }
}

/// Rename the max-tokens field on an OpenAI-family body in place.
///
/// Used when an endpoint declares `max_tokens_field_name` but the request
/// is already in the endpoint's native dialect (no conversion ran).
pub fn apply_max_tokens_field(body: &mut Value, field: &str) {
    let Some(obj) = body.as_object_mut() else { return };
    for candidate in ["max_tokens", "max_completion_tokens", "max_output_tokens"] {
        if candidate == field {
            continue;
        }
        if let Some(v) = obj.remove(candidate) {
            obj.insert(field.to_string(), v);
            return;
        }
    }
}

// ─── Anthropic ◄─► OpenAI-Chat ────────────────────────────────────────────────

/// Flatten anthropic content (string or block array) to plain text.
fn anthropic_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| match b["type"].as_str() {
                Some("text") => b["text"].as_str(),
                None => b["text"].as_str(),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn max_tokens_key<'a>(hints: ConversionHints<'a>) -> &'a str {
    hints.max_tokens_field.unwrap_or("max_tokens")
}

pub fn anthropic_to_chat(body: &Value, hints: ConversionHints<'_>) -> Value {
    let mut messages: Vec<Value> = Vec::new();

    let system = anthropic_text(&body["system"]);
    if !system.is_empty() {
        messages.push(json!({ "role": "system", "content": system }));
    }

    for m in body["messages"].as_array().unwrap_or(&Vec::new()) {
        let role = m["role"].as_str().unwrap_or("user");
        match &m["content"] {
            Value::String(s) => messages.push(json!({ "role": role, "content": s })),
            Value::Array(blocks) => {
                let mut text = String::new();
                let mut tool_calls: Vec<Value> = Vec::new();
                for b in blocks {
                    match b["type"].as_str().unwrap_or("text") {
                        "text" => {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(b["text"].as_str().unwrap_or(""));
                        }
                        "tool_use" => tool_calls.push(json!({
                            "id": b["id"],
                            "type": "function",
                            "function": {
                                "name": b["name"],
                                "arguments": b["input"].to_string(),
                            },
                        })),
                        "tool_result" => messages.push(json!({
                            "role": "tool",
                            "tool_call_id": b["tool_use_id"],
                            "content": anthropic_text(&b["content"]),
                        })),
                        _ => {}
                    }
                }
                if !tool_calls.is_empty() {
                    let mut msg = json!({ "role": role, "content": Value::Null });
                    if !text.is_empty() {
                        msg["content"] = json!(text);
                    }
                    msg["tool_calls"] = json!(tool_calls);
                    messages.push(msg);
                } else if !text.is_empty() {
                    messages.push(json!({ "role": role, "content": text }));
                }
            }
            _ => {}
        }
    }

    let mut out = json!({ "model": body["model"], "messages": messages });

    if let Some(tools) = body["tools"].as_array() {
        let tools: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t["name"],
                        "description": t["description"],
                        "parameters": t["input_schema"],
                    },
                })
            })
            .collect();
        if !tools.is_empty() {
            out["tools"] = json!(tools);
        }
    }

    if let Some(mt) = body["max_tokens"].as_u64() {
        out[max_tokens_key(hints)] = json!(mt);
    }
    for key in ["temperature", "top_p", "stream"] {
        if !body[key].is_null() {
            out[key] = body[key].clone();
        }
    }
    if let Some(stops) = body["stop_sequences"].as_array() {
        out["stop"] = json!(stops);
    }
    out
}

pub fn chat_to_anthropic(body: &Value) -> Value {
    let mut system = String::new();
    let mut messages: Vec<Value> = Vec::new();

    for m in body["messages"].as_array().unwrap_or(&Vec::new()) {
        let role = m["role"].as_str().unwrap_or("user");
        match role {
            "system" | "developer" => {
                let text = anthropic_text(&m["content"]);
                if !system.is_empty() {
                    system.push_str("\n\n");
                }
                system.push_str(&text);
            }
            "tool" => messages.push(json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": m["tool_call_id"],
                    "content": anthropic_text(&m["content"]),
                }],
            })),
            "assistant" if m.get("tool_calls").is_some_and(|t| t.is_array()) => {
                let mut blocks: Vec<Value> = Vec::new();
                let text = anthropic_text(&m["content"]);
                if !text.is_empty() {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
                for tc in m["tool_calls"].as_array().unwrap_or(&Vec::new()) {
                    let input: Value = tc["function"]["arguments"]
                        .as_str()
                        .and_then(|s| serde_json::from_str(s).ok())
                        .unwrap_or(json!({}));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": tc["id"],
                        "name": tc["function"]["name"],
                        "input": input,
                    }));
                }
                messages.push(json!({ "role": "assistant", "content": blocks }));
            }
            _ => {
                let text = anthropic_text(&m["content"]);
                messages.push(json!({ "role": role, "content": text }));
            }
        }
    }

    let max_tokens = body["max_tokens"]
        .as_u64()
        .or_else(|| body["max_completion_tokens"].as_u64())
        .unwrap_or(4096);

    let mut out = json!({
        "model": body["model"],
        "messages": messages,
        "max_tokens": max_tokens,
    });
    if !system.is_empty() {
        out["system"] = json!(system);
    }
    if let Some(tools) = body["tools"].as_array() {
        let tools: Vec<Value> = tools
            .iter()
            .filter(|t| t["type"].as_str() == Some("function"))
            .map(|t| {
                json!({
                    "name": t["function"]["name"],
                    "description": t["function"]["description"],
                    "input_schema": t["function"]["parameters"],
                })
            })
            .collect();
        if !tools.is_empty() {
            out["tools"] = json!(tools);
        }
    }
    for key in ["temperature", "top_p", "stream"] {
        if !body[key].is_null() {
            out[key] = body[key].clone();
        }
    }
    if let Some(stop) = body["stop"].as_array() {
        out["stop_sequences"] = json!(stop);
    }
    out
}

// ─── OpenAI-Responses ◄─► OpenAI-Chat ─────────────────────────────────────────

/// Flatten a Responses content value (string or typed part array).
fn responses_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

pub fn responses_to_chat(body: &Value, hints: ConversionHints<'_>) -> Value {
    let mut messages: Vec<Value> = Vec::new();

    if let Some(instructions) = body["instructions"].as_str() {
        if !instructions.is_empty() {
            messages.push(json!({ "role": "system", "content": instructions }));
        }
    }

    match &body["input"] {
        Value::String(s) => messages.push(json!({ "role": "user", "content": s })),
        Value::Array(items) => {
            for item in items {
                match item["type"].as_str() {
                    Some("function_call") => messages.push(json!({
                        "role": "assistant",
                        "content": Value::Null,
                        "tool_calls": [{
                            "id": item["call_id"],
                            "type": "function",
                            "function": {
                                "name": item["name"],
                                "arguments": item["arguments"],
                            },
                        }],
                    })),
                    Some("function_call_output") => messages.push(json!({
                        "role": "tool",
                        "tool_call_id": item["call_id"],
                        "content": responses_text(&item["output"]),
                    })),
                    // Plain message items: {role, content: [...]} — also the
                    // untyped `{"type":"message"}` form.
                    _ => {
                        if let Some(role) = item["role"].as_str() {
                            messages.push(json!({
                                "role": role,
                                "content": responses_text(&item["content"]),
                            }));
                        }
                    }
                }
            }
        }
        _ => {}
    }

    let mut out = json!({ "model": body["model"], "messages": messages });

    if let Some(tools) = body["tools"].as_array() {
        let tools: Vec<Value> = tools
            .iter()
            .filter(|t| t["type"].as_str() == Some("function"))
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t["name"],
                        "description": t["description"],
                        "parameters": t["parameters"],
                    },
                })
            })
            .collect();
        if !tools.is_empty() {
            out["tools"] = json!(tools);
        }
    }
    if let Some(mt) = body["max_output_tokens"].as_u64() {
        out[max_tokens_key(hints)] = json!(mt);
    }
    for key in ["temperature", "top_p", "stream"] {
        if !body[key].is_null() {
            out[key] = body[key].clone();
        }
    }
    out
}

pub fn chat_to_responses(body: &Value) -> Value {
    let mut instructions = String::new();
    let mut input: Vec<Value> = Vec::new();

    for m in body["messages"].as_array().unwrap_or(&Vec::new()) {
        let role = m["role"].as_str().unwrap_or("user");
        match role {
            "system" | "developer" => {
                let text = anthropic_text(&m["content"]);
                if !instructions.is_empty() {
                    instructions.push_str("\n\n");
                }
                instructions.push_str(&text);
            }
            "tool" => input.push(json!({
                "type": "function_call_output",
                "call_id": m["tool_call_id"],
                "output": anthropic_text(&m["content"]),
            })),
            "assistant" if m.get("tool_calls").is_some_and(|t| t.is_array()) => {
                for tc in m["tool_calls"].as_array().unwrap_or(&Vec::new()) {
                    input.push(json!({
                        "type": "function_call",
                        "call_id": tc["id"],
                        "name": tc["function"]["name"],
                        "arguments": tc["function"]["arguments"],
                    }));
                }
            }
            _ => {
                let part_type = if role == "assistant" { "output_text" } else { "input_text" };
                input.push(json!({
                    "role": role,
                    "content": [{ "type": part_type, "text": anthropic_text(&m["content"]) }],
                }));
            }
        }
    }

    let mut out = json!({ "model": body["model"], "input": input });
    if !instructions.is_empty() {
        out["instructions"] = json!(instructions);
    }
    if let Some(tools) = body["tools"].as_array() {
        let tools: Vec<Value> = tools
            .iter()
            .filter(|t| t["type"].as_str() == Some("function"))
            .map(|t| {
                json!({
                    "type": "function",
                    "name": t["function"]["name"],
                    "description": t["function"]["description"],
                    "parameters": t["function"]["parameters"],
                })
            })
            .collect();
        if !tools.is_empty() {
            out["tools"] = json!(tools);
        }
    }
    if let Some(mt) = body["max_tokens"].as_u64().or_else(|| body["max_completion_tokens"].as_u64())
    {
        out["max_output_tokens"] = json!(mt);
    }
    for key in ["temperature", "top_p", "stream"] {
        if !body[key].is_null() {
            out[key] = body[key].clone();
        }
    }
    out
}

// ─── Anthropic ◄─► Gemini ─────────────────────────────────────────────────────

pub fn anthropic_to_gemini(body: &Value) -> Value {
    // Gemini matches functionResponse to functionCall by name, not id, so
    // build the id → name map first.
    let mut tc_names: Map<String, Value> = Map::new();
    for m in body["messages"].as_array().unwrap_or(&Vec::new()) {
        if let Some(blocks) = m["content"].as_array() {
            for b in blocks {
                if b["type"].as_str() == Some("tool_use") {
                    if let (Some(id), Some(name)) = (b["id"].as_str(), b["name"].as_str()) {
                        tc_names.insert(id.to_string(), json!(name));
                    }
                }
            }
        }
    }

    let mut contents: Vec<Value> = Vec::new();
    for m in body["messages"].as_array().unwrap_or(&Vec::new()) {
        let role = match m["role"].as_str() {
            Some("assistant") => "model",
            _ => "user",
        };
        let parts: Vec<Value> = match &m["content"] {
            Value::String(s) => vec![json!({ "text": s })],
            Value::Array(blocks) => blocks
                .iter()
                .filter_map(|b| match b["type"].as_str().unwrap_or("text") {
                    "text" => Some(json!({ "text": b["text"] })),
                    "tool_use" => Some(json!({
                        "functionCall": { "name": b["name"], "args": b["input"] }
                    })),
                    "tool_result" => {
                        let id = b["tool_use_id"].as_str().unwrap_or("");
                        let name = tc_names.get(id).and_then(|v| v.as_str()).unwrap_or(id);
                        Some(json!({
                            "functionResponse": {
                                "name": name,
                                "response": { "output": anthropic_text(&b["content"]) },
                            }
                        }))
                    }
                    _ => None,
                })
                .collect(),
            _ => vec![],
        };
        if !parts.is_empty() {
            contents.push(json!({ "role": role, "parts": parts }));
        }
    }

    let mut generation = json!({});
    if let Some(mt) = body["max_tokens"].as_u64() {
        generation["maxOutputTokens"] = json!(mt);
    }
    if !body["temperature"].is_null() {
        generation["temperature"] = body["temperature"].clone();
    }
    if !body["top_p"].is_null() {
        generation["topP"] = body["top_p"].clone();
    }
    if let Some(stops) = body["stop_sequences"].as_array() {
        generation["stopSequences"] = json!(stops);
    }

    let mut out = json!({ "contents": contents, "generationConfig": generation });

    let system = anthropic_text(&body["system"]);
    if !system.is_empty() {
        out["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }
    if let Some(tools) = body["tools"].as_array() {
        let decls: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t["name"],
                    "description": t["description"],
                    "parameters": t["input_schema"],
                })
            })
            .collect();
        if !decls.is_empty() {
            out["tools"] = json!([{ "functionDeclarations": decls }]);
        }
    }
    out
}

pub fn gemini_to_anthropic(body: &Value, model: Option<&str>) -> Value {
    let mut messages: Vec<Value> = Vec::new();
    for c in body["contents"].as_array().unwrap_or(&Vec::new()) {
        let role = match c["role"].as_str() {
            Some("model") => "assistant",
            _ => "user",
        };
        let mut blocks: Vec<Value> = Vec::new();
        for p in c["parts"].as_array().unwrap_or(&Vec::new()) {
            if let Some(text) = p["text"].as_str() {
                blocks.push(json!({ "type": "text", "text": text }));
            } else if let Some(fc) = p.get("functionCall") {
                let name = fc["name"].as_str().unwrap_or("");
                blocks.push(json!({
                    "type": "tool_use",
                    "id": name,
                    "name": name,
                    "input": fc["args"],
                }));
            } else if let Some(fr) = p.get("functionResponse") {
                blocks.push(json!({
                    "type": "tool_result",
                    "tool_use_id": fr["name"],
                    "content": fr["response"]["output"].as_str().unwrap_or(""),
                }));
            }
        }
        if !blocks.is_empty() {
            messages.push(json!({ "role": role, "content": blocks }));
        }
    }

    let gen = &body["generationConfig"];
    let mut out = json!({
        "model": model.unwrap_or(""),
        "messages": messages,
        "max_tokens": gen["maxOutputTokens"].as_u64().unwrap_or(4096),
    });
    let system: String = body["systemInstruction"]["parts"]
        .as_array()
        .map(|ps| ps.iter().filter_map(|p| p["text"].as_str()).collect::<Vec<_>>().join("\n"))
        .unwrap_or_default();
    if !system.is_empty() {
        out["system"] = json!(system);
    }
    if !gen["temperature"].is_null() {
        out["temperature"] = gen["temperature"].clone();
    }
    if let Some(tools) = body["tools"][0]["functionDeclarations"].as_array() {
        let tools: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t["name"],
                    "description": t["description"],
                    "input_schema": t["parameters"],
                })
            })
            .collect();
        if !tools.is_empty() {
            out["tools"] = json!(tools);
        }
    }
    out
}

// ─── Response bodies ──────────────────────────────────────────────────────────

pub fn chat_response_to_anthropic(body: &Value) -> Value {
    let choice = &body["choices"][0];
    let message = &choice["message"];
    let mut content: Vec<Value> = Vec::new();
    if let Some(text) = message["content"].as_str() {
        if !text.is_empty() {
            content.push(json!({ "type": "text", "text": text }));
        }
    }
    for tc in message["tool_calls"].as_array().unwrap_or(&Vec::new()) {
        let input: Value = tc["function"]["arguments"]
            .as_str()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(json!({}));
        content.push(json!({
            "type": "tool_use",
            "id": tc["id"],
            "name": tc["function"]["name"],
            "input": input,
        }));
    }
    let stop_reason = match choice["finish_reason"].as_str() {
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        _ => "end_turn",
    };
    json!({
        "id": body["id"],
        "type": "message",
        "role": "assistant",
        "model": body["model"],
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": body["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            "output_tokens": body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        },
    })
}

pub fn anthropic_response_to_chat(body: &Value) -> Value {
    let mut text = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    for (i, b) in body["content"].as_array().unwrap_or(&Vec::new()).iter().enumerate() {
        match b["type"].as_str() {
            Some("text") => text.push_str(b["text"].as_str().unwrap_or("")),
            Some("tool_use") => tool_calls.push(json!({
                "index": i,
                "id": b["id"],
                "type": "function",
                "function": { "name": b["name"], "arguments": b["input"].to_string() },
            })),
            _ => {}
        }
    }
    let finish = match body["stop_reason"].as_str() {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        _ => "stop",
    };
    let mut message = json!({ "role": "assistant", "content": text });
    if !tool_calls.is_empty() {
        message["tool_calls"] = json!(tool_calls);
    }
    json!({
        "id": body["id"],
        "object": "chat.completion",
        "model": body["model"],
        "choices": [{ "index": 0, "message": message, "finish_reason": finish }],
        "usage": {
            "prompt_tokens": body["usage"]["input_tokens"].as_u64().unwrap_or(0),
            "completion_tokens": body["usage"]["output_tokens"].as_u64().unwrap_or(0),
            "total_tokens": body["usage"]["input_tokens"].as_u64().unwrap_or(0)
                + body["usage"]["output_tokens"].as_u64().unwrap_or(0),
        },
    })
}

pub fn chat_response_to_responses(body: &Value) -> Value {
    let choice = &body["choices"][0];
    let message = &choice["message"];
    let mut output: Vec<Value> = Vec::new();
    if let Some(text) = message["content"].as_str() {
        output.push(json!({
            "type": "message",
            "role": "assistant",
            "content": [{ "type": "output_text", "text": text }],
        }));
    }
    for tc in message["tool_calls"].as_array().unwrap_or(&Vec::new()) {
        output.push(json!({
            "type": "function_call",
            "call_id": tc["id"],
            "name": tc["function"]["name"],
            "arguments": tc["function"]["arguments"],
        }));
    }
    let status = match choice["finish_reason"].as_str() {
        Some("length") => "incomplete",
        _ => "completed",
    };
    json!({
        "id": body["id"],
        "object": "response",
        "model": body["model"],
        "status": status,
        "output": output,
        "usage": {
            "input_tokens": body["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            "output_tokens": body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            "total_tokens": body["usage"]["total_tokens"].as_u64().unwrap_or(0),
        },
    })
}

pub fn responses_response_to_chat(body: &Value) -> Value {
    let mut text = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    for item in body["output"].as_array().unwrap_or(&Vec::new()) {
        match item["type"].as_str() {
            Some("message") => {
                for part in item["content"].as_array().unwrap_or(&Vec::new()) {
                    if let Some(t) = part["text"].as_str() {
                        text.push_str(t);
                    }
                }
            }
            Some("function_call") => tool_calls.push(json!({
                "index": tool_calls.len(),
                "id": item["call_id"],
                "type": "function",
                "function": { "name": item["name"], "arguments": item["arguments"] },
            })),
            _ => {}
        }
    }
    let finish = if !tool_calls.is_empty() {
        "tool_calls"
    } else if body["status"].as_str() == Some("incomplete") {
        "length"
    } else {
        "stop"
    };
    let mut message = json!({ "role": "assistant", "content": text });
    if !tool_calls.is_empty() {
        message["tool_calls"] = json!(tool_calls);
    }
    json!({
        "id": body["id"],
        "object": "chat.completion",
        "model": body["model"],
        "choices": [{ "index": 0, "message": message, "finish_reason": finish }],
        "usage": {
            "prompt_tokens": body["usage"]["input_tokens"].as_u64().unwrap_or(0),
            "completion_tokens": body["usage"]["output_tokens"].as_u64().unwrap_or(0),
            "total_tokens": body["usage"]["total_tokens"].as_u64().unwrap_or(0),
        },
    })
}

pub fn gemini_response_to_anthropic(body: &Value) -> Value {
    let candidate = &body["candidates"][0];
    let mut content: Vec<Value> = Vec::new();
    for p in candidate["content"]["parts"].as_array().unwrap_or(&Vec::new()) {
        if let Some(text) = p["text"].as_str() {
            content.push(json!({ "type": "text", "text": text }));
        } else if let Some(fc) = p.get("functionCall") {
            let name = fc["name"].as_str().unwrap_or("");
            content.push(json!({
                "type": "tool_use", "id": name, "name": name, "input": fc["args"],
            }));
        }
    }
    let stop_reason = match candidate["finishReason"].as_str() {
        Some("MAX_TOKENS") => "max_tokens",
        _ => "end_turn",
    };
    json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": body["modelVersion"].as_str().unwrap_or(""),
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": body["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0),
            "output_tokens": body["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0),
        },
    })
}

pub fn anthropic_response_to_gemini(body: &Value) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    for b in body["content"].as_array().unwrap_or(&Vec::new()) {
        match b["type"].as_str() {
            Some("text") => parts.push(json!({ "text": b["text"] })),
            Some("tool_use") => parts.push(json!({
                "functionCall": { "name": b["name"], "args": b["input"] }
            })),
            _ => {}
        }
    }
    let finish = match body["stop_reason"].as_str() {
        Some("max_tokens") => "MAX_TOKENS",
        _ => "STOP",
    };
    json!({
        "candidates": [{
            "content": { "role": "model", "parts": parts },
            "finishReason": finish,
        }],
        "usageMetadata": {
            "promptTokenCount": body["usage"]["input_tokens"].as_u64().unwrap_or(0),
            "candidatesTokenCount": body["usage"]["output_tokens"].as_u64().unwrap_or(0),
            "totalTokenCount": body["usage"]["input_tokens"].as_u64().unwrap_or(0)
                + body["usage"]["output_tokens"].as_u64().unwrap_or(0),
        },
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
