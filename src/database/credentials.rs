// ABOUTME: Storage for per-user upstream provider credentials
// ABOUTME: Holds the AES-GCM sealed API key and its validity flag
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

use crate::errors::{AppError, AppResult};
use sqlx::{Row, SqlitePool};

/// Stored provider credential for one user
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    /// Owning user
    pub user_id: String,
    /// Sealed API key (`nonce || ciphertext`)
    pub encrypted_key: Vec<u8>,
    /// Cleared when decryption fails, forcing re-entry
    pub is_valid: bool,
    /// When the credential was first stored (ISO 8601)
    pub created_at: String,
    /// When the credential was last replaced or invalidated (ISO 8601)
    pub updated_at: String,
}

/// Provider credential database operations manager
pub struct CredentialManager {
    pool: SqlitePool,
}

impl CredentialManager {
    /// Create a new credential manager
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store (or replace) a user's sealed provider key, marking it valid
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn store(&self, user_id: &str, encrypted_key: &[u8]) -> AppResult<()> {
        let now = crate::database::now_rfc3339();

        sqlx::query(
            r"
            INSERT INTO provider_credentials (user_id, encrypted_key, is_valid, created_at, updated_at)
            VALUES ($1, $2, 1, $3, $3)
            ON CONFLICT(user_id) DO UPDATE SET
                encrypted_key = excluded.encrypted_key,
                is_valid = 1,
                updated_at = excluded.updated_at
            ",
        )
        .bind(user_id)
        .bind(encrypted_key)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to store credential: {e}")))?;

        Ok(())
    }

    /// Get a user's stored credential
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn get(&self, user_id: &str) -> AppResult<Option<CredentialRecord>> {
        let row = sqlx::query(
            r"
            SELECT user_id, encrypted_key, is_valid, created_at, updated_at
            FROM provider_credentials
            WHERE user_id = $1
            ",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to get credential: {e}")))?;

        Ok(row.map(|r| CredentialRecord {
            user_id: r.get("user_id"),
            encrypted_key: r.get("encrypted_key"),
            is_valid: r.get::<i64, _>("is_valid") != 0,
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        }))
    }

    /// Mark a user's credential invalid, forcing re-entry
    ///
    /// Called when the sealed key fails to decrypt (rotated or corrupted
    /// master key), a deliberate security response rather than retrying.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn mark_invalid(&self, user_id: &str) -> AppResult<()> {
        let now = crate::database::now_rfc3339();

        sqlx::query(
            r"
            UPDATE provider_credentials
            SET is_valid = 0, updated_at = $1
            WHERE user_id = $2
            ",
        )
        .bind(&now)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to invalidate credential: {e}")))?;

        Ok(())
    }

    /// Remove a user's stored credential
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn delete(&self, user_id: &str) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM provider_credentials WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to delete credential: {e}")))?;

        Ok(result.rows_affected() > 0)
    }
}
