// ABOUTME: Settings routes for the upstream provider API key
// ABOUTME: Stores the key sealed under the master key; verifies it upstream before accepting
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! Provider-key settings routes
//!
//! The key is verified against the upstream (one authenticated round trip)
//! before it is sealed and stored, so a bad key is rejected at entry
//! instead of failing the first generation. The key itself is never
//! returned; reads expose only validity and timestamps.

use crate::{
    database::CredentialManager,
    errors::AppError,
    resources::ServerResources,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use zeroize::Zeroize;

/// Request to store a provider API key
#[derive(Debug, Deserialize)]
pub struct StoreKeyRequest {
    /// The plaintext key; sealed before it touches storage
    pub api_key: String,
}

/// Response describing the stored credential (never the key itself)
#[derive(Debug, Serialize, Deserialize)]
pub struct KeyStatusResponse {
    /// Whether a key is stored
    pub configured: bool,
    /// Whether the stored key is currently usable
    pub is_valid: bool,
    /// When the key was last replaced or invalidated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Settings routes handler
pub struct SettingsRoutes;

impl SettingsRoutes {
    /// Create all settings routes
    pub fn routes(resources: Arc<ServerResources>) -> Router {
        Router::new()
            .route("/api/settings/provider-key", put(Self::store_key))
            .route("/api/settings/provider-key", get(Self::key_status))
            .route("/api/settings/provider-key", delete(Self::delete_key))
            .with_state(resources)
    }

    fn credentials(resources: &ServerResources) -> CredentialManager {
        CredentialManager::new(resources.database.pool().clone())
    }

    /// Store a provider key after verifying it upstream
    async fn store_key(
        State(resources): State<Arc<ServerResources>>,
        headers: axum::http::HeaderMap,
        Json(mut request): Json<StoreKeyRequest>,
    ) -> Result<Response, AppError> {
        let auth = resources.auth_manager.authenticate(&headers)?;

        let api_key = request.api_key.trim().to_owned();
        request.api_key.zeroize();
        if api_key.is_empty() {
            return Err(AppError::invalid_input("API key must not be empty"));
        }

        // One authenticated round trip before we accept the key
        let provider = resources.provider_factory.create(&api_key)?;
        let healthy = provider.health_check().await.unwrap_or(false);
        if !healthy {
            return Err(AppError::invalid_input(
                "The provider rejected this API key",
            ));
        }

        let sealed = resources.key_vault.seal(api_key.as_bytes())?;
        Self::credentials(&resources)
            .store(&auth.user_id.to_string(), &sealed)
            .await?;

        Ok((
            StatusCode::OK,
            Json(serde_json::json!({"success": true})),
        )
            .into_response())
    }

    /// Describe the stored credential
    async fn key_status(
        State(resources): State<Arc<ServerResources>>,
        headers: axum::http::HeaderMap,
    ) -> Result<Response, AppError> {
        let auth = resources.auth_manager.authenticate(&headers)?;

        let credential = Self::credentials(&resources)
            .get(&auth.user_id.to_string())
            .await?;

        let response = credential.map_or(
            KeyStatusResponse {
                configured: false,
                is_valid: false,
                updated_at: None,
            },
            |c| KeyStatusResponse {
                configured: true,
                is_valid: c.is_valid,
                updated_at: Some(c.updated_at),
            },
        );

        Ok((StatusCode::OK, Json(response)).into_response())
    }

    /// Remove the stored credential
    async fn delete_key(
        State(resources): State<Arc<ServerResources>>,
        headers: axum::http::HeaderMap,
    ) -> Result<Response, AppError> {
        let auth = resources.auth_manager.authenticate(&headers)?;

        let deleted = Self::credentials(&resources)
            .delete(&auth.user_id.to_string())
            .await?;

        if !deleted {
            return Err(AppError::not_found("Provider key"));
        }

        Ok((StatusCode::NO_CONTENT, ()).into_response())
    }
}
