// ABOUTME: Periodic background sweep of expired streaming records
// ABOUTME: Interval-driven task deleting finished generation state past its age threshold
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! Background sweeper
//!
//! Streaming records are transient coordination state; once a generation
//! is old enough that no client can still be watching it, the record is
//! garbage. The sweep runs on an interval and deletes per owning user.

use std::time::Duration;

use tracing::{error, info};

use crate::database::{Database, StreamManager};

/// Spawn the periodic sweeper task
///
/// Runs forever; errors are logged and the next tick retries.
pub fn spawn(database: Database, sweep_interval: Duration, max_age: Duration) {
    tokio::spawn(async move {
        let streams = StreamManager::new(database.pool().clone());
        let mut ticker = tokio::time::interval(sweep_interval);
        // First tick fires immediately; skip it so startup stays quick
        ticker.tick().await;

        info!(
            interval_secs = sweep_interval.as_secs(),
            max_age_secs = max_age.as_secs(),
            "Streaming record sweeper started"
        );

        loop {
            ticker.tick().await;
            match streams.sweep_expired(max_age).await {
                Ok(0) => {}
                Ok(swept) => info!(swept, "Sweeper removed expired streaming records"),
                Err(e) => error!("Sweep failed: {e}"),
            }
        }
    });
}
