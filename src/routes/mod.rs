// ABOUTME: HTTP route assembly with CORS and tracing middleware
// ABOUTME: Combines chat, settings, usage, and health routers into the app router
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! HTTP routes for the Tidemark server
//!
//! Every route answers CORS preflight through the shared [`CorsLayer`];
//! streaming responses additionally disable caching per response.

pub mod chat;
pub mod settings;
pub mod usage;

use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::resources::ServerResources;

/// Build the complete application router
#[must_use]
pub fn router(resources: Arc<ServerResources>) -> Router {
    let cors = cors_layer(&resources.config.cors_origins);

    Router::new()
        .route("/health", get(health))
        .merge(chat::ChatRoutes::routes(Arc::clone(&resources)))
        .merge(settings::SettingsRoutes::routes(Arc::clone(&resources)))
        .merge(usage::UsageRoutes::routes(resources))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// CORS layer answering preflight on every route
///
/// With no configured origins the layer is permissive; configured origins
/// are matched exactly. All headers are exposed so streaming clients can
/// read freshness markers.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .expose_headers(Any);

    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| o.parse::<HeaderValue>().ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(parsed))
    }
}

/// Liveness probe
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "tidemark-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
