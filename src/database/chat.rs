// ABOUTME: Database operations for chat containers and transcript messages
// ABOUTME: Handles CRUD with ownership isolation, soft delete, and AI response metadata
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

// ============================================================================
// Database Record Types
// ============================================================================

/// Role of a transcript message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    /// User input
    Prompt,
    /// AI-generated output
    Response,
}

impl TranscriptRole {
    /// String representation stored in the role column
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Prompt => "prompt",
            Self::Response => "response",
        }
    }

    /// Parse from the stored column value
    #[must_use]
    pub fn parse(s: &str) -> Self {
        if s == "response" {
            Self::Response
        } else {
            Self::Prompt
        }
    }
}

/// Database representation of a chat container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    /// Unique chat ID
    pub id: String,
    /// User ID who owns the chat
    pub user_id: String,
    /// Chat title
    pub title: String,
    /// Soft-delete flag
    pub is_active: bool,
    /// When the chat was created (ISO 8601)
    pub created_at: String,
    /// When a message was last appended (ISO 8601)
    pub updated_at: String,
}

/// AI generation metadata attached to a finalized response message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiMetadata {
    /// Model that produced the response
    pub model: String,
    /// Tokens in the prompt
    pub prompt_tokens: i64,
    /// Tokens in the completion
    pub completion_tokens: i64,
    /// Total tokens
    pub total_tokens: i64,
    /// Derived cost in USD
    pub cost: f64,
    /// Wall-clock generation time in milliseconds
    pub response_time_ms: i64,
    /// Upstream finish reason
    pub finish_reason: Option<String>,
}

/// Database representation of a transcript message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Unique message ID
    pub id: String,
    /// Chat this message belongs to
    pub chat_id: String,
    /// Owning user
    pub user_id: String,
    /// Message role
    pub role: TranscriptRole,
    /// Message content
    pub content: String,
    /// Derived: true iff role = response
    pub is_ai_generated: bool,
    /// Generation metadata, set once at finalization
    pub ai_metadata: Option<AiMetadata>,
    /// When the message was created (ISO 8601)
    pub created_at: String,
}

fn row_to_message(r: &sqlx::sqlite::SqliteRow) -> MessageRecord {
    let role = TranscriptRole::parse(&r.get::<String, _>("role"));
    let model: Option<String> = r.get("model");
    let ai_metadata = model.map(|model| AiMetadata {
        model,
        prompt_tokens: r.get::<Option<i64>, _>("prompt_tokens").unwrap_or(0),
        completion_tokens: r.get::<Option<i64>, _>("completion_tokens").unwrap_or(0),
        total_tokens: r.get::<Option<i64>, _>("total_tokens").unwrap_or(0),
        cost: r.get::<Option<f64>, _>("cost").unwrap_or(0.0),
        response_time_ms: r.get::<Option<i64>, _>("response_time_ms").unwrap_or(0),
        finish_reason: r.get("finish_reason"),
    });

    MessageRecord {
        id: r.get("id"),
        chat_id: r.get("chat_id"),
        user_id: r.get("user_id"),
        role,
        content: r.get("content"),
        is_ai_generated: r.get::<i64, _>("is_ai_generated") != 0,
        ai_metadata,
        created_at: r.get("created_at"),
    }
}

// ============================================================================
// Chat Manager
// ============================================================================

/// Chat database operations manager
pub struct ChatManager {
    pool: SqlitePool,
}

impl ChatManager {
    /// Create a new chat manager
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ========================================================================
    // Chat Operations
    // ========================================================================

    /// Create a new chat
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn create_chat(&self, user_id: &str, title: &str) -> AppResult<ChatRecord> {
        let id = Uuid::new_v4().to_string();
        let now = crate::database::now_rfc3339();

        sqlx::query(
            r"
            INSERT INTO chats (id, user_id, title, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, 1, $4, $4)
            ",
        )
        .bind(&id)
        .bind(user_id)
        .bind(title)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create chat: {e}")))?;

        Ok(ChatRecord {
            id,
            user_id: user_id.to_owned(),
            title: title.to_owned(),
            is_active: true,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Get an active chat by ID with ownership isolation
    ///
    /// Another user's chat (or a soft-deleted one) reads as absent, never
    /// as forbidden.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn get_chat(&self, chat_id: &str, user_id: &str) -> AppResult<Option<ChatRecord>> {
        let row = sqlx::query(
            r"
            SELECT id, user_id, title, is_active, created_at, updated_at
            FROM chats
            WHERE id = $1 AND user_id = $2 AND is_active = 1
            ",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to get chat: {e}")))?;

        Ok(row.map(|r| ChatRecord {
            id: r.get("id"),
            user_id: r.get("user_id"),
            title: r.get("title"),
            is_active: r.get::<i64, _>("is_active") != 0,
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        }))
    }

    /// List a user's active chats, most recently updated first
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn list_chats(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<ChatRecord>> {
        let rows = sqlx::query(
            r"
            SELECT id, user_id, title, is_active, created_at, updated_at
            FROM chats
            WHERE user_id = $1 AND is_active = 1
            ORDER BY updated_at DESC
            LIMIT $2 OFFSET $3
            ",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to list chats: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|r| ChatRecord {
                id: r.get("id"),
                user_id: r.get("user_id"),
                title: r.get("title"),
                is_active: r.get::<i64, _>("is_active") != 0,
                created_at: r.get("created_at"),
                updated_at: r.get("updated_at"),
            })
            .collect())
    }

    /// Soft-delete a chat
    ///
    /// Messages are never deleted individually; removing the chat hides the
    /// whole transcript.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn soft_delete_chat(&self, chat_id: &str, user_id: &str) -> AppResult<bool> {
        let now = crate::database::now_rfc3339();

        let result = sqlx::query(
            r"
            UPDATE chats
            SET is_active = 0, updated_at = $1
            WHERE id = $2 AND user_id = $3 AND is_active = 1
            ",
        )
        .bind(&now)
        .bind(chat_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to delete chat: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Message Operations
    // ========================================================================

    /// Add a prompt message and bump the chat's `updated_at`
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn add_prompt_message(
        &self,
        chat_id: &str,
        user_id: &str,
        content: &str,
    ) -> AppResult<MessageRecord> {
        let id = Uuid::new_v4().to_string();
        let now = crate::database::now_rfc3339();

        sqlx::query(
            r"
            INSERT INTO chat_messages (id, chat_id, user_id, role, content, is_ai_generated, created_at)
            VALUES ($1, $2, $3, 'prompt', $4, 0, $5)
            ",
        )
        .bind(&id)
        .bind(chat_id)
        .bind(user_id)
        .bind(content)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to add message: {e}")))?;

        self.touch_chat(chat_id, &now).await?;

        Ok(MessageRecord {
            id,
            chat_id: chat_id.to_owned(),
            user_id: user_id.to_owned(),
            role: TranscriptRole::Prompt,
            content: content.to_owned(),
            is_ai_generated: false,
            ai_metadata: None,
            created_at: now,
        })
    }

    /// Insert a finalized response message with its generation metadata
    ///
    /// The message ID is pre-allocated by the caller (the streaming record
    /// carries it so watch routes can project the live generation under the
    /// same identity). Metadata is written exactly once, here.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn insert_response_message(
        &self,
        message_id: &str,
        chat_id: &str,
        user_id: &str,
        content: &str,
        metadata: &AiMetadata,
    ) -> AppResult<MessageRecord> {
        let now = crate::database::now_rfc3339();

        sqlx::query(
            r"
            INSERT INTO chat_messages (
                id, chat_id, user_id, role, content, is_ai_generated,
                model, prompt_tokens, completion_tokens, total_tokens,
                cost, response_time_ms, finish_reason, created_at
            )
            VALUES ($1, $2, $3, 'response', $4, 1, $5, $6, $7, $8, $9, $10, $11, $12)
            ",
        )
        .bind(message_id)
        .bind(chat_id)
        .bind(user_id)
        .bind(content)
        .bind(&metadata.model)
        .bind(metadata.prompt_tokens)
        .bind(metadata.completion_tokens)
        .bind(metadata.total_tokens)
        .bind(metadata.cost)
        .bind(metadata.response_time_ms)
        .bind(&metadata.finish_reason)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to insert response message: {e}")))?;

        self.touch_chat(chat_id, &now).await?;

        Ok(MessageRecord {
            id: message_id.to_owned(),
            chat_id: chat_id.to_owned(),
            user_id: user_id.to_owned(),
            role: TranscriptRole::Response,
            content: content.to_owned(),
            is_ai_generated: true,
            ai_metadata: Some(metadata.clone()),
            created_at: now,
        })
    }

    /// Get all messages for a chat in chronological order
    ///
    /// Ownership enforced in the query: another user's chat yields an empty
    /// transcript indistinguishable from a missing one.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn get_messages(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> AppResult<Vec<MessageRecord>> {
        let rows = sqlx::query(
            r"
            SELECT id, chat_id, user_id, role, content, is_ai_generated,
                   model, prompt_tokens, completion_tokens, total_tokens,
                   cost, response_time_ms, finish_reason, created_at
            FROM chat_messages
            WHERE chat_id = $1 AND user_id = $2
            ORDER BY created_at ASC, rowid ASC
            ",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to get messages: {e}")))?;

        Ok(rows.iter().map(row_to_message).collect())
    }

    /// Get the last N messages for a chat (the context window)
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn get_recent_messages(
        &self,
        chat_id: &str,
        user_id: &str,
        limit: i64,
    ) -> AppResult<Vec<MessageRecord>> {
        let rows = sqlx::query(
            r"
            SELECT id, chat_id, user_id, role, content, is_ai_generated,
                   model, prompt_tokens, completion_tokens, total_tokens,
                   cost, response_time_ms, finish_reason, created_at
            FROM chat_messages
            WHERE chat_id = $1 AND user_id = $2
            ORDER BY created_at DESC, rowid DESC
            LIMIT $3
            ",
        )
        .bind(chat_id)
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to get recent messages: {e}")))?;

        let mut messages: Vec<MessageRecord> = rows.iter().map(row_to_message).collect();
        messages.reverse();
        Ok(messages)
    }

    /// Get a single message by ID with ownership isolation
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn get_message(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> AppResult<Option<MessageRecord>> {
        let row = sqlx::query(
            r"
            SELECT id, chat_id, user_id, role, content, is_ai_generated,
                   model, prompt_tokens, completion_tokens, total_tokens,
                   cost, response_time_ms, finish_reason, created_at
            FROM chat_messages
            WHERE id = $1 AND user_id = $2
            ",
        )
        .bind(message_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to get message: {e}")))?;

        Ok(row.as_ref().map(row_to_message))
    }

    /// Bump the chat's `updated_at` after a message append
    async fn touch_chat(&self, chat_id: &str, now: &str) -> AppResult<()> {
        sqlx::query(
            r"
            UPDATE chats SET updated_at = $1 WHERE id = $2
            ",
        )
        .bind(now)
        .bind(chat_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to update chat timestamp: {e}")))?;
        Ok(())
    }
}
