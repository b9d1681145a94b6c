// ABOUTME: Logging configuration and structured logging setup for observability
// ABOUTME: Selects level, format, and noise filters from the environment
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! Structured logging setup
//!
//! One call from the binary configures the global subscriber. The format
//! defaults to pretty output for development; production deployments set
//! `LOG_FORMAT=json`. Dependency noise (hyper, reqwest, sqlx) is capped at
//! `warn` regardless of the chosen application level.

use anyhow::Result;
use std::env;
use tracing::info;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Directives capping chatty dependencies below the application level
const NOISE_FILTERS: &[&str] = &["hyper=warn", "reqwest=warn", "sqlx=warn", "tower_http=info"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// `JSON` lines for production log pipelines
    Json,
    /// Human-readable output for development
    Pretty,
    /// Single-line output for space-constrained environments
    Compact,
}

impl LogFormat {
    fn from_env() -> Self {
        match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => Self::Json,
            Ok("compact") => Self::Compact,
            _ => Self::Pretty,
        }
    }
}

/// Logging configuration resolved from the environment
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Application log level or filter expression (`RUST_LOG`)
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Emit span open/close events
    pub include_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Pretty,
            include_spans: false,
        }
    }
}

impl LoggingConfig {
    /// Resolve the logging configuration from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            level: env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            format: LogFormat::from_env(),
            include_spans: env::var("LOG_INCLUDE_SPANS").is_ok(),
        }
    }

    fn build_filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::new(&self.level);
        for directive in NOISE_FILTERS {
            if let Ok(parsed) = directive.parse() {
                filter = filter.add_directive(parsed);
            }
        }
        if let Ok(parsed) = format!("tidemark_server={}", self.level).parse() {
            filter = filter.add_directive(parsed);
        }
        filter
    }

    /// Install the global tracing subscriber
    ///
    /// # Errors
    ///
    /// Returns an error if a subscriber is already installed.
    pub fn init(&self) -> Result<()> {
        let span_events = if self.include_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let registry = tracing_subscriber::registry().with(self.build_filter());
        let base = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(span_events);

        match self.format {
            LogFormat::Json => registry.with(base.json()).try_init()?,
            LogFormat::Pretty => registry.with(base).try_init()?,
            LogFormat::Compact => registry.with(base.compact().with_target(false)).try_init()?,
        }

        info!(
            version = env!("CARGO_PKG_VERSION"),
            format = ?self.format,
            "Logging initialized"
        );

        Ok(())
    }
}
