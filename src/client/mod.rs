// ABOUTME: Client-side polling library for watching live generations
// ABOUTME: Converts repeated state snapshots into discrete update events
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! # Client Poller / Reconciler
//!
//! A reqwest-based client loop that repeatedly fetches the state of a
//! streaming record (or its message projection), detects meaningful
//! changes via the `updated_at` freshness marker, and emits append-safe
//! update events - with backoff-free fixed-interval polling, transport
//! error caps, an absolute wall-clock timeout, and user cancellation.

pub mod poller;

pub use poller::{ChatStreamClient, PollerConfig, PollerEvent, StreamPoller, WatchTarget};
