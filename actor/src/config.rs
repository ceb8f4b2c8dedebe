// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! System configuration.

use crate::ring::DEFAULT_CAPACITY;

use serde::{Deserialize, Serialize};

use std::time::Duration;

/// Tunables of an actor system. Missing fields take their defaults when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Ring capacity of pipes opened without an explicit one.
    pub pipe_capacity: usize,
    /// Timeout of the `*_default` query helpers, in milliseconds.
    pub query_timeout_ms: u64,
    /// Bound of each actor's stop channel.
    pub stop_capacity: usize,
    /// How long `register` waits for `pre_start`, in milliseconds.
    pub start_timeout_ms: u64,
}

impl SystemConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: DEFAULT_CAPACITY,
            query_timeout_ms: 30_000,
            stop_capacity: 100,
            start_timeout_ms: 5_000,
        }
    }
}
