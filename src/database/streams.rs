// ABOUTME: Persistence writer for in-flight generation state (streaming records)
// ABOUTME: Create, rate-limited incremental update, completion, error, cancel flag, and sweep
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! # Streaming Record Store
//!
//! One row per in-flight (or just-finished) generation. The row is the
//! externalized coordination state between the orchestrator writing it and
//! the pollers reading it - the process that opened the upstream request
//! may be gone by the time a client polls.
//!
//! Invariants enforced here:
//! - exactly one record per `request_id` (second create fails),
//! - content only mutates while `status = 'streaming'`,
//! - once status leaves `streaming` the record is terminal,
//! - every mutation bumps `updated_at` (the sole poller freshness signal),
//! - cross-user access reads as not-found, never as forbidden.

use crate::database::chat::{AiMetadata, ChatManager, MessageRecord};
use crate::errors::{AppError, AppResult};
use crate::llm::{pricing, TokenUsage};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tracing::{debug, info};

/// Status of a streaming record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    /// Generation in progress; content still growing
    Streaming,
    /// Terminal: finished successfully
    Completed,
    /// Terminal: finished with an error
    Error,
}

impl StreamStatus {
    /// String representation stored in the status column
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Parse from the stored column value
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "error" => Self::Error,
            _ => Self::Streaming,
        }
    }

    /// Whether this status permits no further mutation
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Streaming)
    }
}

/// Durable state of one in-flight generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingRecord {
    /// Caller-generated correlation token, unique per generation attempt
    pub request_id: String,
    /// Owning user
    pub user_id: String,
    /// Chat the generation belongs to
    pub chat_id: String,
    /// Pre-allocated ID of the permanent response message
    pub message_id: String,
    /// Model in use
    pub model: String,
    /// Accumulated text, monotonically non-decreasing while streaming
    pub content: String,
    /// Lifecycle status
    pub status: StreamStatus,
    /// Present iff status = error
    pub error: Option<String>,
    /// Present iff status = completed and the upstream reported usage
    pub usage: Option<TokenUsage>,
    /// Derived cost, set at completion
    pub cost: Option<f64>,
    /// Cooperative cancellation flag, settable by the cancel endpoint
    pub cancel_requested: bool,
    /// Creation timestamp (immutable, ISO 8601)
    pub created_at: String,
    /// Bumped on every mutation - the poller's change-detection signal
    pub updated_at: String,
}

fn row_to_record(r: &sqlx::sqlite::SqliteRow) -> StreamingRecord {
    let prompt_tokens: Option<i64> = r.get("prompt_tokens");
    let usage = prompt_tokens.map(|p| TokenUsage {
        prompt_tokens: u32::try_from(p).unwrap_or(0),
        completion_tokens: u32::try_from(r.get::<Option<i64>, _>("completion_tokens").unwrap_or(0))
            .unwrap_or(0),
        total_tokens: u32::try_from(r.get::<Option<i64>, _>("total_tokens").unwrap_or(0))
            .unwrap_or(0),
    });

    StreamingRecord {
        request_id: r.get("request_id"),
        user_id: r.get("user_id"),
        chat_id: r.get("chat_id"),
        message_id: r.get("message_id"),
        model: r.get("model"),
        content: r.get("content"),
        status: StreamStatus::parse(&r.get::<String, _>("status")),
        error: r.get("error"),
        usage,
        cost: r.get("cost"),
        cancel_requested: r.get::<i64, _>("cancel_requested") != 0,
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

const RECORD_COLUMNS: &str = "request_id, user_id, chat_id, message_id, model, content, status, \
                              error, prompt_tokens, completion_tokens, total_tokens, cost, \
                              cancel_requested, created_at, updated_at";

// ============================================================================
// Stream Manager
// ============================================================================

/// Streaming record database operations manager
pub struct StreamManager {
    pool: SqlitePool,
}

impl StreamManager {
    /// Create a new stream manager
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the record for a new generation
    ///
    /// # Errors
    ///
    /// Returns `ResourceAlreadyExists` if a record for `request_id` exists
    /// (at most one generation per request id), or a database error.
    pub async fn create(
        &self,
        chat_id: &str,
        request_id: &str,
        message_id: &str,
        user_id: &str,
        model: &str,
    ) -> AppResult<StreamingRecord> {
        let now = crate::database::now_rfc3339();

        let result = sqlx::query(
            r"
            INSERT INTO streaming_records
                (request_id, user_id, chat_id, message_id, model, content, status,
                 cancel_requested, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, '', 'streaming', 0, $6, $6)
            ",
        )
        .bind(request_id)
        .bind(user_id)
        .bind(chat_id)
        .bind(message_id)
        .bind(model)
        .bind(&now)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            let unique_violation = e
                .as_database_error()
                .is_some_and(|db_err| db_err.is_unique_violation());
            if unique_violation {
                return Err(AppError::already_exists(format!(
                    "Streaming record {request_id}"
                )));
            }
            return Err(AppError::database(format!(
                "Failed to create streaming record: {e}"
            )));
        }

        debug!(request_id, chat_id, "Created streaming record");

        Ok(StreamingRecord {
            request_id: request_id.to_owned(),
            user_id: user_id.to_owned(),
            chat_id: chat_id.to_owned(),
            message_id: message_id.to_owned(),
            model: model.to_owned(),
            content: String::new(),
            status: StreamStatus::Streaming,
            error: None,
            usage: None,
            cost: None,
            cancel_requested: false,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Append to (or replace) the accumulated content of a live record
    ///
    /// Only legal while `status = 'streaming'`; a missing or terminal
    /// record propagates as not-found - callers must have called
    /// [`Self::create`] first.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` when no live record matches, or a
    /// database error.
    pub async fn append_or_replace(
        &self,
        request_id: &str,
        user_id: &str,
        content: &str,
        append: bool,
    ) -> AppResult<()> {
        let now = crate::database::now_rfc3339();

        let query = if append {
            r"
            UPDATE streaming_records
            SET content = content || $1, updated_at = $2
            WHERE request_id = $3 AND user_id = $4 AND status = 'streaming'
            "
        } else {
            r"
            UPDATE streaming_records
            SET content = $1, updated_at = $2
            WHERE request_id = $3 AND user_id = $4 AND status = 'streaming'
            "
        };

        let result = sqlx::query(query)
            .bind(content)
            .bind(&now)
            .bind(request_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to update streaming record: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found(format!(
                "Streaming record {request_id}"
            )));
        }

        Ok(())
    }

    /// Transition a live record to `completed` and insert the permanent
    /// response message
    ///
    /// The message's `response_time_ms` is the **wall clock** elapsed since
    /// the record was created, not any model-reported latency.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` when no live record matches, or a
    /// database error.
    pub async fn complete(
        &self,
        request_id: &str,
        user_id: &str,
        final_content: &str,
        usage: Option<TokenUsage>,
        finish_reason: Option<&str>,
    ) -> AppResult<MessageRecord> {
        let record = self
            .get(request_id, user_id)
            .await?
            .filter(|r| r.status == StreamStatus::Streaming)
            .ok_or_else(|| AppError::not_found(format!("Streaming record {request_id}")))?;

        let now = chrono::Utc::now();
        let response_time_ms = chrono::DateTime::parse_from_rfc3339(&record.created_at)
            .map(|created| (now - created.with_timezone(&chrono::Utc)).num_milliseconds())
            .unwrap_or(0);

        let effective_usage = usage.unwrap_or(TokenUsage {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
        });
        let cost = usage.map_or(0.0, |u| pricing::cost_for(&record.model, &u));

        let result = sqlx::query(
            r"
            UPDATE streaming_records
            SET status = 'completed', content = $1,
                prompt_tokens = $2, completion_tokens = $3, total_tokens = $4,
                cost = $5, updated_at = $6
            WHERE request_id = $7 AND user_id = $8 AND status = 'streaming'
            ",
        )
        .bind(final_content)
        .bind(i64::from(effective_usage.prompt_tokens))
        .bind(i64::from(effective_usage.completion_tokens))
        .bind(i64::from(effective_usage.total_tokens))
        .bind(cost)
        .bind(now.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
        .bind(request_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to complete streaming record: {e}")))?;

        if result.rows_affected() == 0 {
            // Lost a race with another finalizer
            return Err(AppError::not_found(format!(
                "Streaming record {request_id}"
            )));
        }

        let metadata = AiMetadata {
            model: record.model.clone(),
            prompt_tokens: i64::from(effective_usage.prompt_tokens),
            completion_tokens: i64::from(effective_usage.completion_tokens),
            total_tokens: i64::from(effective_usage.total_tokens),
            cost,
            response_time_ms,
            finish_reason: finish_reason.map(ToOwned::to_owned),
        };

        let message = ChatManager::new(self.pool.clone())
            .insert_response_message(
                &record.message_id,
                &record.chat_id,
                user_id,
                final_content,
                &metadata,
            )
            .await?;

        info!(
            request_id,
            tokens = effective_usage.total_tokens,
            response_time_ms,
            "Generation completed"
        );

        Ok(message)
    }

    /// Transition a live record to `error`
    ///
    /// Does not create a transcript message; the record's `error` field is
    /// the user-visible failure surface.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` when no live record matches, or a
    /// database error.
    pub async fn fail(&self, request_id: &str, user_id: &str, error_text: &str) -> AppResult<()> {
        let now = crate::database::now_rfc3339();

        let result = sqlx::query(
            r"
            UPDATE streaming_records
            SET status = 'error', error = $1, updated_at = $2
            WHERE request_id = $3 AND user_id = $4 AND status = 'streaming'
            ",
        )
        .bind(error_text)
        .bind(&now)
        .bind(request_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to fail streaming record: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found(format!(
                "Streaming record {request_id}"
            )));
        }

        info!(request_id, error = error_text, "Generation failed");
        Ok(())
    }

    /// Request cooperative cancellation of a live generation
    ///
    /// Returns `true` when the flag was newly set on a live record and
    /// `false` when the record is already terminal (cancel after finish is
    /// a no-op, not an error).
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` when the record does not exist for this
    /// user, or a database error.
    pub async fn request_cancel(&self, request_id: &str, user_id: &str) -> AppResult<bool> {
        let now = crate::database::now_rfc3339();

        let result = sqlx::query(
            r"
            UPDATE streaming_records
            SET cancel_requested = 1, updated_at = $1
            WHERE request_id = $2 AND user_id = $3 AND status = 'streaming'
            ",
        )
        .bind(&now)
        .bind(request_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to request cancellation: {e}")))?;

        if result.rows_affected() > 0 {
            info!(request_id, "Cancellation requested");
            return Ok(true);
        }

        // Distinguish "already terminal" from "not yours / doesn't exist"
        match self.get(request_id, user_id).await? {
            Some(_) => Ok(false),
            None => Err(AppError::not_found(format!(
                "Streaming record {request_id}"
            ))),
        }
    }

    /// Check whether cancellation has been requested
    ///
    /// # Errors
    ///
    /// Returns a database error if the read fails.
    pub async fn is_cancel_requested(&self, request_id: &str, user_id: &str) -> AppResult<bool> {
        let row = sqlx::query(
            "SELECT cancel_requested FROM streaming_records WHERE request_id = $1 AND user_id = $2",
        )
        .bind(request_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to read cancel flag: {e}")))?;

        Ok(row.is_some_and(|r| r.get::<i64, _>("cancel_requested") != 0))
    }

    /// Get a record by request ID with ownership isolation
    ///
    /// # Errors
    ///
    /// Returns a database error if the read fails.
    pub async fn get(
        &self,
        request_id: &str,
        user_id: &str,
    ) -> AppResult<Option<StreamingRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM streaming_records
             WHERE request_id = $1 AND user_id = $2"
        ))
        .bind(request_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to get streaming record: {e}")))?;

        Ok(row.as_ref().map(row_to_record))
    }

    /// Get the live record projecting onto a pre-allocated message ID
    ///
    /// # Errors
    ///
    /// Returns a database error if the read fails.
    pub async fn get_by_message(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> AppResult<Option<StreamingRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM streaming_records
             WHERE message_id = $1 AND user_id = $2"
        ))
        .bind(message_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to get streaming record: {e}")))?;

        Ok(row.as_ref().map(row_to_record))
    }

    /// Delete records older than `max_age` for one user
    ///
    /// # Errors
    ///
    /// Returns a database error if the delete fails.
    pub async fn sweep_expired_for_user(
        &self,
        user_id: &str,
        max_age: Duration,
    ) -> AppResult<u64> {
        let cutoff = (chrono::Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|e| AppError::internal(format!("Invalid sweep age: {e}")))?)
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

        let result = sqlx::query(
            "DELETE FROM streaming_records WHERE user_id = $1 AND created_at < $2",
        )
        .bind(user_id)
        .bind(&cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to sweep streaming records: {e}")))?;

        Ok(result.rows_affected())
    }

    /// Delete all records older than `max_age`, iterating per owning user
    ///
    /// # Errors
    ///
    /// Returns a database error if a read or delete fails.
    pub async fn sweep_expired(&self, max_age: Duration) -> AppResult<u64> {
        let cutoff = (chrono::Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|e| AppError::internal(format!("Invalid sweep age: {e}")))?)
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

        let users: Vec<String> = sqlx::query(
            "SELECT DISTINCT user_id FROM streaming_records WHERE created_at < $1",
        )
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to list sweep candidates: {e}")))?
        .into_iter()
        .map(|r| r.get("user_id"))
        .collect();

        let mut total = 0;
        for user_id in users {
            total += self.sweep_expired_for_user(&user_id, max_age).await?;
        }

        if total > 0 {
            info!(swept = total, "Swept expired streaming records");
        }

        Ok(total)
    }
}
