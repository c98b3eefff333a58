// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod loader;
mod persist;
mod schema;

pub use loader::{load, save};
pub use persist::{Persister, PersisterStats};
pub use schema::*;
