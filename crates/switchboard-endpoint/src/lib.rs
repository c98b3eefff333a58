// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Endpoint registry: upstream records, health state, request history,
//! dynamic priority sorting, OAuth refresh, and the role-based HTTP client
//! factory.

mod endpoint;
mod health;
mod httpc;
mod oauth;
mod registry;
mod ring;
mod sorter;

pub use endpoint::{stats_key, Endpoint, EndpointStatus, StatusChange};
pub use health::HealthChecker;
pub use httpc::{ClientManager, ClientRole};
pub use oauth::ensure_fresh_token;
pub use registry::EndpointRegistry;
pub use ring::{InactiveThresholds, RequestRecord, RequestRing};
pub use sorter::{resort, DynamicSorter};
