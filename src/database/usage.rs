// ABOUTME: Usage ledger - append-only token/cost events plus rolling daily/monthly aggregates
// ABOUTME: Aggregate merges are atomic JSON upserts so concurrent writers cannot lose increments
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! # Usage Ledger
//!
//! Every finished generation - successful or not - produces one event row
//! and increments the owner's daily and monthly summary rows, keyed by the
//! server wall-clock date at write time. Failed attempts record zero
//! tokens/cost but preserve the error text for audit.
//!
//! The per-model breakdown merge is a single `INSERT .. ON CONFLICT`
//! statement using `json_set`/`json_extract`, i.e. an atomic
//! increment-by-key-and-subkey. Event insert and both summary merges run
//! in one transaction, so a summary can never drift from its events.
//!
//! Recording is best-effort at the call sites that finish generations: a
//! ledger failure must never fail the generation it describes.

use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::error;
use uuid::Uuid;

/// One usage event to record
#[derive(Debug, Clone)]
pub struct UsageEvent {
    /// Owning user
    pub user_id: String,
    /// Correlation token of the generation, when one exists
    pub request_id: Option<String>,
    /// Model used
    pub model: String,
    /// Tokens in the prompt
    pub prompt_tokens: u32,
    /// Tokens in the completion
    pub completion_tokens: u32,
    /// Total tokens
    pub total_tokens: u32,
    /// Derived cost in USD
    pub cost: f64,
    /// Whether the generation succeeded
    pub success: bool,
    /// Error text preserved for audit on failures
    pub error_message: Option<String>,
}

impl UsageEvent {
    /// Event for a failed generation: zero tokens/cost, error preserved
    #[must_use]
    pub fn failure(user_id: &str, request_id: &str, model: &str, error_message: &str) -> Self {
        Self {
            user_id: user_id.to_owned(),
            request_id: Some(request_id.to_owned()),
            model: model.to_owned(),
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            cost: 0.0,
            success: false,
            error_message: Some(error_message.to_owned()),
        }
    }
}

/// Rolling aggregate for one `(user, period)` key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSummary {
    /// Period key: `YYYY-MM-DD` for daily, `YYYY-MM` for monthly
    pub period: String,
    /// Total tokens across all models
    pub total_tokens: i64,
    /// Total cost across all models
    pub total_cost: f64,
    /// Number of recorded generations
    pub request_count: i64,
    /// Per-model map of `{total_tokens, cost, requests}`
    pub model_breakdown: serde_json::Value,
}

/// Usage ledger database operations manager
pub struct UsageLedger {
    pool: SqlitePool,
}

impl UsageLedger {
    /// Create a new usage ledger
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a usage event and merge it into the rolling aggregates
    ///
    /// # Errors
    ///
    /// Returns an error if any statement in the transaction fails.
    pub async fn record(&self, event: &UsageEvent) -> AppResult<()> {
        let now = chrono::Utc::now();
        let day = now.format("%Y-%m-%d").to_string();
        let month = now.format("%Y-%m").to_string();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::database(format!("Failed to begin usage transaction: {e}")))?;

        sqlx::query(
            r"
            INSERT INTO usage_records
                (id, user_id, request_id, model, prompt_tokens, completion_tokens,
                 total_tokens, cost, success, error_message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&event.user_id)
        .bind(&event.request_id)
        .bind(&event.model)
        .bind(i64::from(event.prompt_tokens))
        .bind(i64::from(event.completion_tokens))
        .bind(i64::from(event.total_tokens))
        .bind(event.cost)
        .bind(i64::from(event.success))
        .bind(&event.error_message)
        .bind(now.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::database(format!("Failed to insert usage record: {e}")))?;

        Self::merge_summary(&mut tx, "usage_daily", "day", &day, event).await?;
        Self::merge_summary(&mut tx, "usage_monthly", "month", &month, event).await?;

        tx.commit()
            .await
            .map_err(|e| AppError::database(format!("Failed to commit usage transaction: {e}")))?;

        Ok(())
    }

    /// Record a usage event without letting a ledger failure propagate
    ///
    /// Failures to record usage must not affect the generation they
    /// describe; they are logged and dropped.
    pub async fn record_best_effort(&self, event: &UsageEvent) {
        if let Err(e) = self.record(event).await {
            error!(
                user_id = %event.user_id,
                model = %event.model,
                "Failed to record usage (ignored): {e}"
            );
        }
    }

    /// Atomic merge of one event into a summary row
    ///
    /// Single upsert statement: totals increment and the per-model subkey
    /// merges via `json_set`, so concurrent writers to the same period key
    /// serialize inside SQLite instead of racing read-modify-write.
    async fn merge_summary(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        table: &str,
        period_column: &str,
        period: &str,
        event: &UsageEvent,
    ) -> AppResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {table} (user_id, {period_column}, total_tokens, total_cost, request_count, model_breakdown)
            VALUES ($1, $2, $3, $4, 1,
                    json_object($5, json_object('total_tokens', $3, 'cost', $4, 'requests', 1)))
            ON CONFLICT(user_id, {period_column}) DO UPDATE SET
                total_tokens = {table}.total_tokens + excluded.total_tokens,
                total_cost = {table}.total_cost + excluded.total_cost,
                request_count = {table}.request_count + 1,
                model_breakdown = json_set(
                    {table}.model_breakdown,
                    '$."' || $5 || '"',
                    json_object(
                        'total_tokens',
                        COALESCE(json_extract({table}.model_breakdown, '$."' || $5 || '".total_tokens'), 0) + excluded.total_tokens,
                        'cost',
                        COALESCE(json_extract({table}.model_breakdown, '$."' || $5 || '".cost'), 0) + excluded.total_cost,
                        'requests',
                        COALESCE(json_extract({table}.model_breakdown, '$."' || $5 || '".requests'), 0) + 1
                    )
                )
            "#
        );

        sqlx::query(&sql)
            .bind(&event.user_id)
            .bind(period)
            .bind(i64::from(event.total_tokens))
            .bind(event.cost)
            .bind(&event.model)
            .execute(&mut **tx)
            .await
            .map_err(|e| AppError::database(format!("Failed to merge {table} summary: {e}")))?;

        Ok(())
    }

    /// Get the most recent daily summaries for a user
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn get_daily_summaries(
        &self,
        user_id: &str,
        days: i64,
    ) -> AppResult<Vec<UsageSummary>> {
        self.get_summaries("usage_daily", "day", user_id, days).await
    }

    /// Get the most recent monthly summaries for a user
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn get_monthly_summaries(
        &self,
        user_id: &str,
        months: i64,
    ) -> AppResult<Vec<UsageSummary>> {
        self.get_summaries("usage_monthly", "month", user_id, months)
            .await
    }

    async fn get_summaries(
        &self,
        table: &str,
        period_column: &str,
        user_id: &str,
        limit: i64,
    ) -> AppResult<Vec<UsageSummary>> {
        let sql = format!(
            "SELECT {period_column} AS period, total_tokens, total_cost, request_count, model_breakdown
             FROM {table}
             WHERE user_id = $1
             ORDER BY {period_column} DESC
             LIMIT $2"
        );

        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to read {table}: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|r| UsageSummary {
                period: r.get("period"),
                total_tokens: r.get("total_tokens"),
                total_cost: r.get("total_cost"),
                request_count: r.get("request_count"),
                model_breakdown: serde_json::from_str(&r.get::<String, _>("model_breakdown"))
                    .unwrap_or(serde_json::Value::Null),
            })
            .collect())
    }

    /// Recompute a day's totals from the raw event log
    ///
    /// Reconciliation helper: the result must equal the stored daily
    /// summary for that `(user, day)` key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn recompute_day_totals(
        &self,
        user_id: &str,
        day: &str,
    ) -> AppResult<(i64, f64, i64)> {
        let row = sqlx::query(
            r"
            SELECT COALESCE(SUM(total_tokens), 0) AS tokens,
                   COALESCE(SUM(cost), 0) AS cost,
                   COUNT(*) AS requests
            FROM usage_records
            WHERE user_id = $1 AND substr(created_at, 1, 10) = $2
            ",
        )
        .bind(user_id)
        .bind(day)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to recompute day totals: {e}")))?;

        Ok((row.get("tokens"), row.get("cost"), row.get("requests")))
    }
}
