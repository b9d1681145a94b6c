// ABOUTME: Shared test utilities and setup functions for integration tests
// ABOUTME: Provides in-memory database resources, token minting, and scripted providers
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

//! Shared test utilities for `tidemark_server`
//!
//! Common setup to reduce duplication across integration tests: an
//! in-memory database, a key vault with a fixed master key, bearer-token
//! minting, and scripted LLM providers standing in for the upstream.

use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use tidemark_server::auth::AuthManager;
use tidemark_server::config::environment::{Environment, ServerConfig};
use tidemark_server::crypto::KeyVault;
use tidemark_server::database::{CredentialManager, Database};
use tidemark_server::errors::AppError;
use tidemark_server::llm::{
    ChatRequest, ChatStream, LlmProvider, ProviderFactory, StreamChunk, TokenUsage,
};
use tidemark_server::resources::ServerResources;
use uuid::Uuid;

static INIT_LOGGER: Once = Once::new();

/// Initialize quiet logging for tests (call once per test process)
pub fn init_test_logging() {
    INIT_LOGGER.call_once(|| {
        let log_level = match std::env::var("TEST_LOG").as_deref() {
            Ok("TRACE") => tracing::Level::TRACE,
            Ok("DEBUG") => tracing::Level::DEBUG,
            Ok("INFO") => tracing::Level::INFO,
            _ => tracing::Level::WARN,
        };

        let _ = tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_test_writer()
            .try_init();
    });
}

/// Test server configuration with a fast flush policy
pub fn test_config() -> ServerConfig {
    ServerConfig {
        http_port: 0,
        environment: Environment::Testing,
        database_url: "sqlite::memory:".to_owned(),
        token_secret: "tidemark-test-secret".to_owned(),
        master_key: None,
        upstream_base_url: "http://127.0.0.1:9/v1".to_owned(),
        default_model: "gpt-4o-mini".to_owned(),
        flush_interval: Duration::from_millis(10),
        flush_min_chars: 1,
        stream_max_age: Duration::from_secs(24 * 60 * 60),
        sweep_interval: Duration::from_secs(3600),
        cors_origins: Vec::new(),
    }
}

// ============================================================================
// Scripted provider
// ============================================================================

/// One scripted step of a fake upstream stream
#[derive(Clone)]
pub enum ScriptStep {
    /// Emit a content delta
    Delta(&'static str),
    /// Emit a usage-bearing frame (prompt, completion, total)
    Usage(u32, u32, u32),
    /// Emit the final frame with a finish reason
    Final(&'static str),
    /// Sleep before the next step
    Sleep(Duration),
    /// Emit a stream error
    Error(&'static str),
}

/// Provider that replays a script instead of calling an upstream
pub struct ScriptedProvider {
    script: Arc<Vec<ScriptStep>>,
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    async fn complete_stream(&self, _request: &ChatRequest) -> Result<ChatStream, AppError> {
        let script = Arc::clone(&self.script);
        let stream = async_stream::stream! {
            for step in script.iter() {
                match step {
                    ScriptStep::Delta(text) => {
                        yield Ok(StreamChunk {
                            delta: (*text).to_owned(),
                            is_final: false,
                            finish_reason: None,
                            usage: None,
                        });
                    }
                    ScriptStep::Usage(prompt, completion, total) => {
                        yield Ok(StreamChunk {
                            delta: String::new(),
                            is_final: false,
                            finish_reason: None,
                            usage: Some(TokenUsage {
                                prompt_tokens: *prompt,
                                completion_tokens: *completion,
                                total_tokens: *total,
                            }),
                        });
                    }
                    ScriptStep::Final(reason) => {
                        yield Ok(StreamChunk {
                            delta: String::new(),
                            is_final: true,
                            finish_reason: Some((*reason).to_owned()),
                            usage: None,
                        });
                    }
                    ScriptStep::Sleep(duration) => {
                        tokio::time::sleep(*duration).await;
                    }
                    ScriptStep::Error(message) => {
                        yield Err(AppError::external_service("Scripted", *message));
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn health_check(&self) -> Result<bool, AppError> {
        Ok(true)
    }
}

/// Factory returning scripted providers regardless of the API key
pub struct ScriptedProviderFactory {
    /// Steps replayed by every created provider
    pub script: Arc<Vec<ScriptStep>>,
    /// What `health_check` reports
    pub healthy: bool,
}

impl ScriptedProviderFactory {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script: Arc::new(script),
            healthy: true,
        }
    }
}

/// Provider whose health check fails and whose stream never opens
struct UnhealthyProvider;

#[async_trait]
impl LlmProvider for UnhealthyProvider {
    fn name(&self) -> &'static str {
        "unhealthy"
    }

    fn default_model(&self) -> &str {
        "unhealthy-model"
    }

    async fn complete_stream(&self, _request: &ChatRequest) -> Result<ChatStream, AppError> {
        Err(AppError::external_service("Scripted", "no stream"))
    }

    async fn health_check(&self) -> Result<bool, AppError> {
        Ok(false)
    }
}

impl ProviderFactory for ScriptedProviderFactory {
    fn create(&self, _api_key: &str) -> Result<Arc<dyn LlmProvider>, AppError> {
        if self.healthy {
            Ok(Arc::new(ScriptedProvider {
                script: Arc::clone(&self.script),
            }))
        } else {
            Ok(Arc::new(UnhealthyProvider))
        }
    }
}

/// The default happy-path script: two deltas, a usage frame, then stop
pub fn default_script() -> Vec<ScriptStep> {
    vec![
        ScriptStep::Delta("Hello"),
        ScriptStep::Delta(" world"),
        ScriptStep::Usage(5, 2, 7),
        ScriptStep::Final("stop"),
    ]
}

// ============================================================================
// Resources
// ============================================================================

/// Build test server resources around an in-memory database and a script
pub async fn create_test_resources(script: Vec<ScriptStep>) -> Arc<ServerResources> {
    create_test_resources_with_factory(ScriptedProviderFactory::new(script)).await
}

/// Build test server resources with a custom provider factory
pub async fn create_test_resources_with_factory(
    factory: ScriptedProviderFactory,
) -> Arc<ServerResources> {
    init_test_logging();

    let config = Arc::new(test_config());
    let database = Database::new(&config.database_url)
        .await
        .expect("Failed to create test database");
    let auth_manager = AuthManager::new(config.token_secret.as_bytes(), 24);
    let key_vault = KeyVault::from_bytes([42u8; 32]);

    Arc::new(ServerResources::with_provider_factory(
        database,
        auth_manager,
        key_vault,
        Arc::new(factory),
        config,
    ))
}

/// Mint a user id and its bearer token
pub fn create_test_user(resources: &ServerResources) -> (Uuid, String) {
    let user_id = Uuid::new_v4();
    let token = resources
        .auth_manager
        .generate_token(user_id, "user@example.com")
        .expect("Failed to mint token");
    (user_id, format!("Bearer {token}"))
}

/// Store a sealed provider key for a user, bypassing the settings route
pub async fn store_test_key(resources: &ServerResources, user_id: Uuid) {
    let sealed = resources
        .key_vault
        .seal(b"sk-test-key")
        .expect("Failed to seal test key");
    CredentialManager::new(resources.database.pool().clone())
        .store(&user_id.to_string(), &sealed)
        .await
        .expect("Failed to store test key");
}

/// Poll until `check` returns `Some`, or panic after `timeout`
pub async fn wait_for<T, F, Fut>(timeout: Duration, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "Condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
