// ABOUTME: Centralized resource container for dependency injection
// ABOUTME: Manages shared resources like database, auth, key vault, and the generation service
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! # Server Resources Module
//!
//! Centralized resource container for dependency injection. Routes receive
//! one `Arc<ServerResources>`; nothing reaches for globals, so tests can
//! assemble resources around in-memory databases and scripted providers.

use std::sync::Arc;

use crate::auth::AuthManager;
use crate::config::environment::ServerConfig;
use crate::crypto::KeyVault;
use crate::database::Database;
use crate::llm::{OpenAiProviderFactory, ProviderFactory};
use crate::orchestrator::{FlushPolicy, GenerationService};

/// Centralized resource container for dependency injection
#[derive(Clone)]
pub struct ServerResources {
    /// Durable store
    pub database: Database,
    /// Bearer-token validator
    pub auth_manager: Arc<AuthManager>,
    /// Vault sealing stored provider keys
    pub key_vault: Arc<KeyVault>,
    /// Factory binding decrypted keys to upstream providers
    pub provider_factory: Arc<dyn ProviderFactory>,
    /// Orchestrator for generations
    pub generation_service: GenerationService,
    /// Loaded configuration
    pub config: Arc<ServerConfig>,
}

impl ServerResources {
    /// Create new server resources with the default upstream provider factory
    #[must_use]
    pub fn new(
        database: Database,
        auth_manager: AuthManager,
        key_vault: KeyVault,
        config: Arc<ServerConfig>,
    ) -> Self {
        let provider_factory: Arc<dyn ProviderFactory> = Arc::new(OpenAiProviderFactory {
            base_url: config.upstream_base_url.clone(),
            default_model: config.default_model.clone(),
        });
        Self::with_provider_factory(database, auth_manager, key_vault, provider_factory, config)
    }

    /// Create new server resources with an injected provider factory
    ///
    /// Tests substitute scripted providers here.
    #[must_use]
    pub fn with_provider_factory(
        database: Database,
        auth_manager: AuthManager,
        key_vault: KeyVault,
        provider_factory: Arc<dyn ProviderFactory>,
        config: Arc<ServerConfig>,
    ) -> Self {
        let key_vault = Arc::new(key_vault);
        let flush_policy = FlushPolicy {
            min_interval: config.flush_interval,
            min_chars: config.flush_min_chars,
        };

        let generation_service = GenerationService::new(
            database.clone(),
            Arc::clone(&key_vault),
            Arc::clone(&provider_factory),
            flush_policy,
            config.default_model.clone(),
            config.stream_max_age,
        );

        Self {
            database,
            auth_manager: Arc::new(auth_manager),
            key_vault,
            provider_factory,
            generation_service,
            config,
        }
    }
}
