// ABOUTME: Configuration management module
// ABOUTME: Re-exports environment-based server configuration
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! Configuration management and persistence

/// Environment-based configuration for deployment-specific settings
pub mod environment;

pub use environment::{Environment, ServerConfig};
