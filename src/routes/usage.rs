// ABOUTME: Usage dashboard routes serving rolling daily and monthly summaries
// ABOUTME: Read-only projections of the usage ledger aggregates
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! Usage dashboard routes

use crate::{
    database::usage::{UsageLedger, UsageSummary},
    errors::AppError,
    resources::ServerResources,
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Query parameters for daily summaries
#[derive(Debug, Deserialize)]
pub struct DailyQuery {
    /// How many most-recent days to return
    #[serde(default = "default_days")]
    pub days: i64,
}

const fn default_days() -> i64 {
    30
}

/// Query parameters for monthly summaries
#[derive(Debug, Deserialize)]
pub struct MonthlyQuery {
    /// How many most-recent months to return
    #[serde(default = "default_months")]
    pub months: i64,
}

const fn default_months() -> i64 {
    12
}

/// Response wrapping a list of summaries
#[derive(Debug, Serialize, Deserialize)]
pub struct SummariesResponse {
    /// Rolling aggregates, newest period first
    pub summaries: Vec<UsageSummary>,
}

/// Usage routes handler
pub struct UsageRoutes;

impl UsageRoutes {
    /// Create all usage routes
    pub fn routes(resources: Arc<ServerResources>) -> Router {
        Router::new()
            .route("/api/usage/daily", get(Self::daily))
            .route("/api/usage/monthly", get(Self::monthly))
            .with_state(resources)
    }

    fn ledger(resources: &ServerResources) -> UsageLedger {
        UsageLedger::new(resources.database.pool().clone())
    }

    /// Daily rolling aggregates for the caller
    async fn daily(
        State(resources): State<Arc<ServerResources>>,
        headers: axum::http::HeaderMap,
        Query(query): Query<DailyQuery>,
    ) -> Result<Response, AppError> {
        let auth = resources.auth_manager.authenticate(&headers)?;

        let summaries = Self::ledger(&resources)
            .get_daily_summaries(&auth.user_id.to_string(), query.days.clamp(1, 366))
            .await?;

        Ok((StatusCode::OK, Json(SummariesResponse { summaries })).into_response())
    }

    /// Monthly rolling aggregates for the caller
    async fn monthly(
        State(resources): State<Arc<ServerResources>>,
        headers: axum::http::HeaderMap,
        Query(query): Query<MonthlyQuery>,
    ) -> Result<Response, AppError> {
        let auth = resources.auth_manager.authenticate(&headers)?;

        let summaries = Self::ledger(&resources)
            .get_monthly_summaries(&auth.user_id.to_string(), query.months.clamp(1, 120))
            .await?;

        Ok((StatusCode::OK, Json(SummariesResponse { summaries })).into_response())
    }
}
