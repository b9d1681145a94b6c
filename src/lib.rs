// ABOUTME: Main library entry point for the Tidemark chat streaming backend
// ABOUTME: Exposes the streaming pipeline, persistence, routes, and client poller
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

#![deny(unsafe_code)]

//! # Tidemark Chat Server
//!
//! A durable AI chat streaming backend. Token-by-token output from an
//! upstream completion API becomes durably observable by polling clients
//! under concurrent writes, cancellation, and failure:
//!
//! - **Gateway adapter** (`llm`): streamed `OpenAI`-compatible completions
//!   parsed through a line-buffering SSE parser with opportunistic usage
//!   capture.
//! - **Persistence writer** (`database::streams`): one streaming record
//!   per generation - create, coalesced incremental update, completion,
//!   error, cancellation flag, periodic sweep.
//! - **Stream orchestrator** (`orchestrator`): drives the adapter into the
//!   writer under a time-or-size flush policy and finalizes into the
//!   permanent transcript plus the usage ledger.
//! - **Client poller** (`client`): converts repeated snapshots into
//!   discrete update events with error caps, timeout, and cancellation.
//! - **Usage ledger** (`database::usage`): append-only events plus atomic
//!   daily/monthly aggregate merges.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tidemark_server::config::environment::ServerConfig;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = ServerConfig::from_env()?;
//! println!("Tidemark configured for port {}", config.http_port);
//! # Ok(())
//! # }
//! ```

// ── Public API ──────────────────────────────────────────────────────────
// These modules are used by the binary crate (src/bin/) and integration
// tests (tests/). They must remain `pub` so external consumers can access
// them.

/// Authentication and session management
pub mod auth;

/// Client-side poller/reconciler for watching live generations
pub mod client;

/// Configuration management and persistence
pub mod config;

/// Cryptographic utilities and key management
pub mod crypto;

/// Durable storage: chats, messages, streaming records, credentials, usage
pub mod database;

/// Unified error handling system with standard error codes and HTTP responses
pub mod errors;

/// LLM provider abstraction for the upstream completion gateway
pub mod llm;

/// Production logging and structured output
pub mod logging;

/// Stream orchestrator state machine
pub mod orchestrator;

/// Centralized resource container for dependency injection
pub mod resources;

/// `HTTP` routes
pub mod routes;

/// Periodic expired-record sweeper
pub mod sweeper;
