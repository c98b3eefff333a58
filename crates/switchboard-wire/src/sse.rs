// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! SSE line framing shared by the stream translators and the validator.

/// Drain all complete `\n`-terminated lines from `buf`.
///
/// Any trailing incomplete line (bytes not yet terminated by `\n`) is left
/// in `buf` so it can be extended by the next TCP chunk.  This is necessary
/// because a single SSE event may be split across multiple TCP packets.
pub fn drain_complete_lines(buf: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        // Strip the optional Windows-style \r before \n.
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        lines.push(line);
    }
    lines
}

/// Extract the payload of a `data:` line, if it is one.
pub fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// Frame a payload as a plain `data:` event.
pub fn data_frame(payload: &str) -> String {
    format!("data: {payload}\n\n")
}

/// Frame a payload as a named event (Anthropic-style framing).
pub fn event_frame(event: &str, payload: &str) -> String {
    format!("event: {event}\ndata: {payload}\n\n")
}
