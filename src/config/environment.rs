// ABOUTME: Environment configuration management for deployment-specific settings
// ABOUTME: Handles environment variables, deployment modes, and runtime configuration parsing
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! Environment-based configuration management for production deployment

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{info, warn};

/// Environment type for security and other configurations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development
    #[default]
    Development,
    /// Production deployment
    Production,
    /// Automated testing
    Testing,
}

impl Environment {
    /// Parse from string with fallback
    #[must_use]
    pub fn from_str_or_default(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "testing" | "test" => Self::Testing,
            _ => Self::Development,
        }
    }

    /// Check if this is a production environment
    #[must_use]
    pub const fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Production => write!(f, "production"),
            Self::Testing => write!(f, "testing"),
        }
    }
}

/// Server configuration loaded from the environment
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen port
    pub http_port: u16,
    /// Deployment environment
    pub environment: Environment,
    /// Database connection string (sqlite file or `sqlite::memory:`)
    pub database_url: String,
    /// HS256 secret shared with the external identity provider
    pub token_secret: String,
    /// Base64-encoded 32-byte master key sealing stored provider API keys
    pub master_key: Option<String>,
    /// Default upstream completion endpoint base URL
    pub upstream_base_url: String,
    /// Default model when a chat does not specify one
    pub default_model: String,
    /// Minimum interval between durable content flushes
    pub flush_interval: Duration,
    /// Minimum buffered characters that force a flush before the interval
    pub flush_min_chars: usize,
    /// Age past which finished streaming records are swept
    pub stream_max_age: Duration,
    /// How often the background sweeper runs
    pub sweep_interval: Duration,
    /// Allowed CORS origins (`*` when empty)
    pub cors_origins: Vec<String>,
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if a present variable fails to parse or the
    /// token secret is missing outside development.
    pub fn from_env() -> Result<Self> {
        info!("Loading configuration from environment variables");

        let environment = Environment::from_str_or_default(
            &env::var("ENVIRONMENT").unwrap_or_else(|_| "development".into()),
        );

        let token_secret = match env::var("TIDEMARK_TOKEN_SECRET") {
            Ok(secret) => secret,
            Err(_) if environment.is_production() => {
                anyhow::bail!("TIDEMARK_TOKEN_SECRET must be set in production")
            }
            Err(_) => {
                warn!("TIDEMARK_TOKEN_SECRET not set - using development secret");
                "tidemark-development-secret".to_owned()
            }
        };

        let config = Self {
            http_port: env_var_or("HTTP_PORT", "8081")?
                .parse()
                .context("Invalid HTTP_PORT value")?,
            environment,
            database_url: env_var_or("DATABASE_URL", "sqlite:data/tidemark.db")?,
            token_secret,
            master_key: env::var("TIDEMARK_MASTER_KEY").ok(),
            upstream_base_url: env_var_or("UPSTREAM_BASE_URL", "https://api.openai.com/v1")?,
            default_model: env_var_or("DEFAULT_MODEL", "gpt-4o-mini")?,
            flush_interval: Duration::from_millis(
                env_var_or("FLUSH_INTERVAL_MS", "50")?
                    .parse()
                    .context("Invalid FLUSH_INTERVAL_MS value")?,
            ),
            flush_min_chars: env_var_or("FLUSH_MIN_CHARS", "24")?
                .parse()
                .context("Invalid FLUSH_MIN_CHARS value")?,
            stream_max_age: Duration::from_secs(
                env_var_or("STREAM_MAX_AGE_SECS", "86400")?
                    .parse()
                    .context("Invalid STREAM_MAX_AGE_SECS value")?,
            ),
            sweep_interval: Duration::from_secs(
                env_var_or("SWEEP_INTERVAL_SECS", "3600")?
                    .parse()
                    .context("Invalid SWEEP_INTERVAL_SECS value")?,
            ),
            cors_origins: env::var("CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_owned())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        };

        info!(
            port = config.http_port,
            environment = %config.environment,
            database = %config.database_url,
            "Configuration loaded"
        );

        Ok(config)
    }
}

/// Read an environment variable with a default value
fn env_var_or(name: &str, default: &str) -> Result<String> {
    match env::var(name) {
        Ok(value) => Ok(value),
        Err(env::VarError::NotPresent) => Ok(default.to_owned()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {name}")),
    }
}
