// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Request dispatch: selection, upstream calls, validation, learning, and
//! the retry/fail-over loop that ties them together.

mod dispatch;
mod error;
mod learn;
mod select;
mod stats;
mod toolmap;
mod upstream;
mod validate;

pub use dispatch::{Dispatcher, InboundRequest, Outbound};
pub use error::{error_body, ErrorKind, ProxyError};
pub use learn::Learner;
pub use select::select_candidates;
pub use stats::{stats_sink_from_config, JsonlStats, NoopStats, StatsSink};
pub use toolmap::{reattach_tool_context, ToolCallCache, ToolCallMapping};
pub use validate::{classify_http, sniff_content_type, SseValidator};
