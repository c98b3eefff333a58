// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Role-based HTTP client factory.
//!
//! Three client roles with distinct timeout profiles share connection
//! pools across requests:
//!
//! | role     | connect | response header | idle | overall | conns/host |
//! |----------|---------|-----------------|------|---------|------------|
//! | proxy    | 10 s    | 60 s            | 90 s | none    | 100        |
//! | health   | 10 s    | 60 s            | 90 s | 30 s    | 10         |
//! | endpoint | 10 s    | 60 s            | 90 s | none    | 200        |
//!
//! Proxy and endpoint roles stream SSE, so they carry no overall deadline.
//! reqwest's `gzip` feature supplies the gzip round-tripper (injects
//! `Accept-Encoding: gzip` and transparently decompresses), and rustls
//! ALPN negotiates HTTP/2 where upstreams offer it.  Endpoints with a
//! `proxy` block get their own client with an HTTP or SOCKS5 dialer.

use std::sync::OnceLock;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;

use switchboard_config::ProxyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    /// Client-facing streaming copies.
    Proxy,
    /// Background health probes.
    Health,
    /// Upstream endpoint calls.
    Endpoint,
}

pub fn build_client(role: ClientRole, proxy: Option<&ProxyConfig>) -> reqwest::Result<Client> {
    let mut builder = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .read_timeout(Duration::from_secs(60))
        .pool_idle_timeout(Duration::from_secs(90));

    builder = match role {
        ClientRole::Proxy => builder.pool_max_idle_per_host(100),
        ClientRole::Health => builder.pool_max_idle_per_host(10).timeout(Duration::from_secs(30)),
        ClientRole::Endpoint => builder.pool_max_idle_per_host(200),
    };

    if let Some(p) = proxy {
        let mut rp = reqwest::Proxy::all(&p.url)?;
        if let (Some(user), Some(pass)) = (&p.username, &p.password) {
            rp = rp.basic_auth(user, pass);
        }
        builder = builder.proxy(rp);
    }

    builder.build()
}

/// Process-wide client manager.
///
/// Transports are immutable after creation and shared across requests.
/// Only [`ClientManager::global`] touches process state; tests construct
/// their own instances with [`ClientManager::new`].
pub struct ClientManager {
    proxy: Client,
    health: Client,
    endpoint: Client,
    /// Endpoint-specific clients (outbound proxy configured), keyed by
    /// stable endpoint id.
    per_endpoint: DashMap<String, Client>,
}

static GLOBAL: OnceLock<ClientManager> = OnceLock::new();

impl ClientManager {
    pub fn new() -> reqwest::Result<Self> {
        Ok(Self {
            proxy: build_client(ClientRole::Proxy, None)?,
            health: build_client(ClientRole::Health, None)?,
            endpoint: build_client(ClientRole::Endpoint, None)?,
            per_endpoint: DashMap::new(),
        })
    }

    /// The singleton instance, created on first use.
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(|| Self::new().expect("default HTTP clients must build"))
    }

    pub fn proxy(&self) -> &Client {
        &self.proxy
    }

    pub fn health(&self) -> &Client {
        &self.health
    }

    /// Client for one endpoint: the shared pool, or a dedicated client
    /// when the endpoint routes through an outbound proxy.
    pub fn for_endpoint(&self, id: &str, proxy: Option<&ProxyConfig>) -> Client {
        match proxy {
            None => self.endpoint.clone(),
            Some(p) => self
                .per_endpoint
                .entry(id.to_string())
                .or_insert_with(|| {
                    build_client(ClientRole::Endpoint, Some(p))
                        .unwrap_or_else(|_| self.endpoint.clone())
                })
                .clone(),
        }
    }

    /// Drop per-endpoint clients (hot reload / tests).
    pub fn close(&self) {
        self.per_endpoint.clear();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
