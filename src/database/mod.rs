// ABOUTME: Database management for the durable chat and streaming state
// ABOUTME: Owns the SQLite pool and the idempotent schema migration step
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! # Database Management
//!
//! All coordination state lives here: the server executes each generation
//! as an independent unit of work with no shared in-process memory, so the
//! durable store is the only place a later request (or poller) can observe
//! an earlier one. Managers in the submodules scope every mutation by the
//! owning user.

pub mod chat;
pub mod credentials;
pub mod streams;
pub mod usage;

pub use chat::ChatManager;
pub use credentials::CredentialManager;
pub use streams::StreamManager;
pub use usage::UsageLedger;

use crate::errors::{AppError, AppResult};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::time::Duration;
use tracing::info;

/// Fixed-width RFC 3339 timestamp (microseconds, UTC)
///
/// Row timestamps are compared as strings (ordering and poller change
/// detection), so the width must not vary with fractional precision.
#[must_use]
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Database manager owning the connection pool
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection and run migrations
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created or migrations fail.
    pub async fn new(database_url: &str) -> AppResult<Self> {
        // Ensure SQLite creates the database file if it doesn't exist
        let connection_options = if database_url.starts_with("sqlite:")
            && !database_url.contains(":memory:")
            && !database_url.contains('?')
        {
            format!("{database_url}?mode=rwc")
        } else {
            database_url.to_owned()
        };

        // In-memory SQLite holds one database per connection; the pool must
        // stay at a single connection or later acquires see empty schemas
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            10
        };

        let pool = SqlitePoolOptions::new()
            // SQLite is single-writer, but can have multiple readers
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&connection_options)
            .await
            .map_err(|e| AppError::database(format!("Failed to connect to database: {e}")))?;

        let db = Self { pool };
        db.migrate().await?;

        Ok(db)
    }

    /// Access the underlying pool
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run database migrations
    ///
    /// Idempotent `CREATE TABLE IF NOT EXISTS` statements; safe to run on
    /// every startup.
    ///
    /// # Errors
    ///
    /// Returns an error if any schema statement fails.
    pub async fn migrate(&self) -> AppResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create chats table: {e}")))?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS chat_messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                is_ai_generated INTEGER NOT NULL DEFAULT 0,
                model TEXT,
                prompt_tokens INTEGER,
                completion_tokens INTEGER,
                total_tokens INTEGER,
                cost REAL,
                response_time_ms INTEGER,
                finish_reason TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (chat_id) REFERENCES chats(id)
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create chat_messages table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chat_messages_chat
             ON chat_messages(chat_id, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create message index: {e}")))?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS streaming_records (
                request_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                model TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'streaming',
                error TEXT,
                prompt_tokens INTEGER,
                completion_tokens INTEGER,
                total_tokens INTEGER,
                cost REAL,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::database(format!("Failed to create streaming_records table: {e}"))
        })?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_streaming_records_user
             ON streaming_records(user_id, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create stream index: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_streaming_records_message
             ON streaming_records(message_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create stream message index: {e}")))?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS provider_credentials (
                user_id TEXT PRIMARY KEY,
                encrypted_key BLOB NOT NULL,
                is_valid INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::database(format!("Failed to create provider_credentials table: {e}"))
        })?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS usage_records (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                request_id TEXT,
                model TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                cost REAL NOT NULL DEFAULT 0,
                success INTEGER NOT NULL,
                error_message TEXT,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create usage_records table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_usage_records_user
             ON usage_records(user_id, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create usage index: {e}")))?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS usage_daily (
                user_id TEXT NOT NULL,
                day TEXT NOT NULL,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                total_cost REAL NOT NULL DEFAULT 0,
                request_count INTEGER NOT NULL DEFAULT 0,
                model_breakdown TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (user_id, day)
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create usage_daily table: {e}")))?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS usage_monthly (
                user_id TEXT NOT NULL,
                month TEXT NOT NULL,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                total_cost REAL NOT NULL DEFAULT 0,
                request_count INTEGER NOT NULL DEFAULT 0,
                model_breakdown TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (user_id, month)
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create usage_monthly table: {e}")))?;

        info!("Database migrations complete");
        Ok(())
    }
}
