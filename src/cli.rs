// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Multi-dialect reverse proxy for LLM endpoints.
///
/// Accepts Anthropic, OpenAI chat/responses, and Gemini requests, routes
/// each to the best healthy upstream, and converts wire formats when the
/// chosen upstream speaks a different dialect.
#[derive(Parser, Debug)]
#[command(name = "switchboard", version)]
pub struct Cli {
    /// Path to the config file.  Defaults to
    /// `~/.config/switchboard/config.yaml`; a commented template is
    /// written there on first run.
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging (debug level).  RUST_LOG overrides this.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the proxy server (the default when no subcommand is given).
    Serve,

    /// Print the effective configuration and exit.
    ShowConfig,

    /// Measure latency of one upstream endpoint.
    ///
    /// Sends N identical completion requests and reports first-byte and
    /// total latency per iteration plus aggregates, as JSON.
    Bench(BenchArgs),
}

#[derive(Args, Debug)]
pub struct BenchArgs {
    /// Named endpoint from the config file to benchmark.
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Base URL to hit directly instead of a configured endpoint.
    #[arg(long)]
    pub base_url: Option<String>,

    /// Model requested in each iteration.
    #[arg(long, default_value = "claude-3-5-sonnet-20241022")]
    pub model: String,

    /// Prompt sent in each iteration.
    #[arg(long, default_value = "Reply with the single word: ready")]
    pub prompt: String,

    /// Number of requests to send.
    #[arg(long, default_value_t = 5)]
    pub iterations: u32,

    /// Per-request timeout in seconds.
    #[arg(long, default_value_t = 60)]
    pub timeout: u64,

    /// Client dialect to speak.
    #[arg(long, default_value = "claude", value_parser = ["claude", "codex", "openai"])]
    pub agent: String,

    /// Write the JSON report to this file instead of stdout.
    #[arg(long)]
    pub output: Option<PathBuf>,
}
