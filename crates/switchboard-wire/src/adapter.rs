// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Conversion pipeline selection.
//!
//! Two pipelines implement the same conversions: the legacy direct
//! functions and the unified adapter registry.  `auto` prefers unified and
//! falls back to legacy when the failure ratio over the last 200 recorded
//! outcomes crosses the configured threshold.  The window size is fixed at
//! 200 — large enough to ride out a burst of malformed client bodies,
//! small enough to react within seconds under load.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde_json::Value;
use tracing::warn;

use switchboard_config::{ConversionConfig, ConversionMode};

use crate::convert::{self, ConversionHints};
use crate::Dialect;

const OUTCOME_WINDOW: usize = 200;

/// One registered conversion in the unified pipeline.
trait RequestAdapter: Send + Sync {
    fn convert(&self, body: &Value, hints: ConversionHints<'_>) -> anyhow::Result<Value>;
}

struct FnAdapter(fn(&Value, ConversionHints<'_>) -> anyhow::Result<Value>);

impl RequestAdapter for FnAdapter {
    fn convert(&self, body: &Value, hints: ConversionHints<'_>) -> anyhow::Result<Value> {
        (self.0)(body, hints)
    }
}

/// Which pipeline actually ran a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineChoice {
    Legacy,
    Unified,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AdapterStats {
    pub mode: ConversionMode,
    pub window_len: usize,
    pub failures: usize,
    pub failure_ratio_pct: u32,
    pub fallback_active: bool,
}

pub struct AdapterManager {
    mode: Mutex<ConversionMode>,
    failback_threshold: u32,
    outcomes: Mutex<VecDeque<bool>>,
    registry: HashMap<(Dialect, Dialect), Box<dyn RequestAdapter>>,
}

impl AdapterManager {
    pub fn new(config: &ConversionConfig) -> Self {
        use Dialect::*;
        let mut registry: HashMap<(Dialect, Dialect), Box<dyn RequestAdapter>> = HashMap::new();
        let mut reg = |from: Dialect,
                       to: Dialect,
                       f: fn(&Value, ConversionHints<'_>) -> anyhow::Result<Value>| {
            registry.insert((from, to), Box::new(FnAdapter(f)) as Box<dyn RequestAdapter>);
        };
        reg(Anthropic, OpenaiChat, |b, h| Ok(convert::anthropic_to_chat(b, h)));
        reg(OpenaiChat, Anthropic, |b, _| Ok(convert::chat_to_anthropic(b)));
        reg(OpenaiResponses, OpenaiChat, |b, h| Ok(convert::responses_to_chat(b, h)));
        reg(OpenaiChat, OpenaiResponses, |b, _| Ok(convert::chat_to_responses(b)));
        reg(Anthropic, Gemini, |b, _| Ok(convert::anthropic_to_gemini(b)));
        reg(Gemini, Anthropic, |b, _| Ok(convert::gemini_to_anthropic(b, None)));
        // Composite pairs route through the chat hub.
        reg(Anthropic, OpenaiResponses, |b, h| {
            convert::convert_request(Dialect::Anthropic, Dialect::OpenaiResponses, b, h)
        });
        reg(OpenaiResponses, Anthropic, |b, h| {
            convert::convert_request(Dialect::OpenaiResponses, Dialect::Anthropic, b, h)
        });

        Self {
            mode: Mutex::new(config.mode),
            failback_threshold: config.failback_threshold,
            outcomes: Mutex::new(VecDeque::with_capacity(OUTCOME_WINDOW)),
            registry,
        }
    }

    /// Pipeline the next conversion should use under the current mode and
    /// observed failure ratio.
    pub fn effective_pipeline(&self) -> PipelineChoice {
        match *self.mode.lock().expect("mode lock") {
            ConversionMode::Legacy => PipelineChoice::Legacy,
            ConversionMode::Unified => PipelineChoice::Unified,
            ConversionMode::Auto => {
                if self.failure_ratio_pct() >= self.failback_threshold {
                    PipelineChoice::Legacy
                } else {
                    PipelineChoice::Unified
                }
            }
        }
    }

    /// Convert a request, recording the outcome for auto-failback.
    pub fn convert_request(
        &self,
        from: Dialect,
        to: Dialect,
        body: &Value,
        hints: ConversionHints<'_>,
    ) -> anyhow::Result<Value> {
        if from == to {
            return Ok(body.clone());
        }
        let choice = self.effective_pipeline();
        let result = match choice {
            PipelineChoice::Legacy => convert::convert_request(from, to, body, hints),
            PipelineChoice::Unified => match self.registry.get(&(from, to)) {
                Some(adapter) => adapter.convert(body, hints),
                None => convert::convert_request(from, to, body, hints),
            },
        };
        if choice == PipelineChoice::Unified {
            self.record_outcome(result.is_ok());
            if result.is_err() && self.effective_pipeline() == PipelineChoice::Legacy {
                warn!(
                    from = from.as_str(),
                    to = to.as_str(),
                    "unified conversion failure ratio crossed threshold, falling back to legacy"
                );
            }
        }
        result
    }

    pub fn record_outcome(&self, ok: bool) {
        let mut outcomes = self.outcomes.lock().expect("outcomes lock");
        if outcomes.len() == OUTCOME_WINDOW {
            outcomes.pop_front();
        }
        outcomes.push_back(ok);
    }

    fn failure_ratio_pct(&self) -> u32 {
        let outcomes = self.outcomes.lock().expect("outcomes lock");
        if outcomes.is_empty() {
            return 0;
        }
        let failures = outcomes.iter().filter(|ok| !**ok).count();
        (failures * 100 / outcomes.len()) as u32
    }

    pub fn set_mode(&self, mode: ConversionMode) {
        *self.mode.lock().expect("mode lock") = mode;
    }

    pub fn stats(&self) -> AdapterStats {
        let outcomes = self.outcomes.lock().expect("outcomes lock");
        let failures = outcomes.iter().filter(|ok| !**ok).count();
        let ratio = if outcomes.is_empty() { 0 } else { (failures * 100 / outcomes.len()) as u32 };
        AdapterStats {
            mode: *self.mode.lock().expect("mode lock"),
            window_len: outcomes.len(),
            failures,
            failure_ratio_pct: ratio,
            fallback_active: ratio >= self.failback_threshold
                && *self.mode.lock().expect("mode lock") == ConversionMode::Auto,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager(mode: ConversionMode, threshold: u32) -> AdapterManager {
        AdapterManager::new(&ConversionConfig { mode, failback_threshold: threshold })
    }

    #[test]
    fn unified_is_preferred_in_auto_mode() {
        let m = manager(ConversionMode::Auto, 30);
        assert_eq!(m.effective_pipeline(), PipelineChoice::Unified);
    }

    #[test]
    fn fixed_modes_are_honoured() {
        assert_eq!(manager(ConversionMode::Legacy, 30).effective_pipeline(), PipelineChoice::Legacy);
        assert_eq!(
            manager(ConversionMode::Unified, 30).effective_pipeline(),
            PipelineChoice::Unified
        );
    }

    #[test]
    fn crossing_threshold_falls_back_to_legacy() {
        let m = manager(ConversionMode::Auto, 30);
        for _ in 0..7 {
            m.record_outcome(true);
        }
        for _ in 0..3 {
            m.record_outcome(false);
        }
        // 30% failures over the window.
        assert_eq!(m.effective_pipeline(), PipelineChoice::Legacy);
        assert!(m.stats().fallback_active);
    }

    #[test]
    fn window_is_bounded_and_slides() {
        let m = manager(ConversionMode::Auto, 30);
        // Saturate with failures, then push enough successes to slide every
        // failure out of the window.
        for _ in 0..OUTCOME_WINDOW {
            m.record_outcome(false);
        }
        assert_eq!(m.effective_pipeline(), PipelineChoice::Legacy);
        for _ in 0..OUTCOME_WINDOW {
            m.record_outcome(true);
        }
        assert_eq!(m.stats().window_len, OUTCOME_WINDOW);
        assert_eq!(m.stats().failures, 0);
        assert_eq!(m.effective_pipeline(), PipelineChoice::Unified);
    }

    #[test]
    fn mode_is_settable_at_runtime() {
        let m = manager(ConversionMode::Auto, 30);
        m.set_mode(ConversionMode::Legacy);
        assert_eq!(m.stats().mode, ConversionMode::Legacy);
        assert_eq!(m.effective_pipeline(), PipelineChoice::Legacy);
    }

    #[test]
    fn both_pipelines_convert_identically() {
        let body = json!({
            "model": "claude-3-5-sonnet",
            "messages": [{ "role": "user", "content": "Hi" }],
            "max_tokens": 10,
        });
        let unified = manager(ConversionMode::Unified, 30);
        let legacy = manager(ConversionMode::Legacy, 30);
        let a = unified
            .convert_request(Dialect::Anthropic, Dialect::OpenaiChat, &body, ConversionHints::default())
            .unwrap();
        let b = legacy
            .convert_request(Dialect::Anthropic, Dialect::OpenaiChat, &body, ConversionHints::default())
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn same_dialect_conversion_records_nothing() {
        let m = manager(ConversionMode::Auto, 30);
        let body = json!({ "model": "m" });
        let out = m
            .convert_request(Dialect::Anthropic, Dialect::Anthropic, &body, ConversionHints::default())
            .unwrap();
        assert_eq!(out, body);
        assert_eq!(m.stats().window_len, 0);
    }
}
