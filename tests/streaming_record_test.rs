// ABOUTME: Integration tests for the streaming record persistence writer
// ABOUTME: Covers uniqueness, monotonic content, terminal exclusivity, and ownership isolation
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use std::time::Duration;

use common::{create_test_resources, default_script};
use tidemark_server::database::chat::{ChatManager, TranscriptRole};
use tidemark_server::database::streams::{StreamManager, StreamStatus};
use tidemark_server::errors::ErrorCode;
use tidemark_server::llm::TokenUsage;
use uuid::Uuid;

async fn setup() -> (StreamManager, ChatManager, String, String) {
    let resources = create_test_resources(default_script()).await;
    let pool = resources.database.pool().clone();
    let user_id = Uuid::new_v4().to_string();

    let chats = ChatManager::new(pool.clone());
    let chat = chats.create_chat(&user_id, "Test chat").await.unwrap();

    (StreamManager::new(pool), chats, user_id, chat.id)
}

// ============================================================================
// Creation
// ============================================================================

#[tokio::test]
async fn test_create_is_at_most_once_per_request_id() {
    let (streams, _, user_id, chat_id) = setup().await;

    streams
        .create(&chat_id, "r1", "m1", &user_id, "gpt-4o-mini")
        .await
        .unwrap();

    let err = streams
        .create(&chat_id, "r1", "m2", &user_id, "gpt-4o-mini")
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ResourceAlreadyExists);
}

#[tokio::test]
async fn test_new_record_starts_streaming_and_empty() {
    let (streams, _, user_id, chat_id) = setup().await;

    let record = streams
        .create(&chat_id, "r1", "m1", &user_id, "gpt-4o-mini")
        .await
        .unwrap();

    assert_eq!(record.status, StreamStatus::Streaming);
    assert!(record.content.is_empty());
    assert!(!record.cancel_requested);
    assert_eq!(record.created_at, record.updated_at);
}

// ============================================================================
// Content mutation
// ============================================================================

#[tokio::test]
async fn test_append_and_replace_accumulate_content() {
    let (streams, chats, user_id, chat_id) = setup().await;

    streams
        .create(&chat_id, "r1", "m1", &user_id, "gpt-4o-mini")
        .await
        .unwrap();

    // Replace then append, per the writer contract
    streams
        .append_or_replace("r1", &user_id, "Hello", false)
        .await
        .unwrap();
    streams
        .append_or_replace("r1", &user_id, " world", true)
        .await
        .unwrap();

    let record = streams.get("r1", &user_id).await.unwrap().unwrap();
    assert_eq!(record.content, "Hello world");

    // Completion inserts the permanent response message with metadata
    let message = streams
        .complete(
            "r1",
            &user_id,
            "Hello world",
            Some(TokenUsage {
                prompt_tokens: 5,
                completion_tokens: 2,
                total_tokens: 7,
            }),
            Some("stop"),
        )
        .await
        .unwrap();

    assert_eq!(message.id, "m1");
    assert_eq!(message.role, TranscriptRole::Response);
    assert_eq!(message.content, "Hello world");
    let metadata = message.ai_metadata.unwrap();
    assert_eq!(metadata.total_tokens, 7);
    assert!(metadata.response_time_ms >= 0);

    let record = streams.get("r1", &user_id).await.unwrap().unwrap();
    assert_eq!(record.status, StreamStatus::Completed);
    assert_eq!(record.usage.unwrap().total_tokens, 7);

    // The message is readable from the transcript under the same id
    let stored = chats.get_message("m1", &user_id).await.unwrap().unwrap();
    assert!(stored.is_ai_generated);
}

#[tokio::test]
async fn test_append_is_monotonic_and_bumps_updated_at() {
    let (streams, _, user_id, chat_id) = setup().await;

    streams
        .create(&chat_id, "r1", "m1", &user_id, "gpt-4o-mini")
        .await
        .unwrap();

    let mut previous_content = String::new();
    let mut previous_updated = String::new();

    for fragment in ["a", "bc", "def"] {
        // Successive flushes must extend the prior content
        tokio::time::sleep(Duration::from_millis(2)).await;
        streams
            .append_or_replace("r1", &user_id, fragment, true)
            .await
            .unwrap();

        let record = streams.get("r1", &user_id).await.unwrap().unwrap();
        assert!(record.content.starts_with(&previous_content));
        assert!(record.content.len() > previous_content.len());
        assert!(record.updated_at > previous_updated);

        previous_content = record.content;
        previous_updated = record.updated_at;
    }
}

#[tokio::test]
async fn test_append_without_create_is_not_found() {
    let (streams, _, user_id, _) = setup().await;

    let err = streams
        .append_or_replace("missing", &user_id, "data", true)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ResourceNotFound);
}

// ============================================================================
// Terminal exclusivity
// ============================================================================

#[tokio::test]
async fn test_no_mutation_after_terminal_state() {
    let (streams, _, user_id, chat_id) = setup().await;

    streams
        .create(&chat_id, "r1", "m1", &user_id, "gpt-4o-mini")
        .await
        .unwrap();
    streams
        .complete("r1", &user_id, "done", None, Some("stop"))
        .await
        .unwrap();

    // Appends fail after terminal
    let err = streams
        .append_or_replace("r1", &user_id, "more", true)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ResourceNotFound);

    // A second finalization fails too
    let err = streams
        .complete("r1", &user_id, "again", None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ResourceNotFound);

    let err = streams.fail("r1", &user_id, "late error").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ResourceNotFound);

    // And the stored state is unchanged
    let record = streams.get("r1", &user_id).await.unwrap().unwrap();
    assert_eq!(record.content, "done");
    assert_eq!(record.status, StreamStatus::Completed);
}

#[tokio::test]
async fn test_fail_sets_error_and_creates_no_message() {
    let (streams, chats, user_id, chat_id) = setup().await;

    streams
        .create(&chat_id, "r1", "m1", &user_id, "gpt-4o-mini")
        .await
        .unwrap();
    streams
        .fail("r1", &user_id, "upstream exploded")
        .await
        .unwrap();

    let record = streams.get("r1", &user_id).await.unwrap().unwrap();
    assert_eq!(record.status, StreamStatus::Error);
    assert_eq!(record.error.as_deref(), Some("upstream exploded"));

    // No response message is created on failure
    assert!(chats.get_message("m1", &user_id).await.unwrap().is_none());
}

// ============================================================================
// Cancellation flag
// ============================================================================

#[tokio::test]
async fn test_cancel_flag_lifecycle() {
    let (streams, _, user_id, chat_id) = setup().await;

    streams
        .create(&chat_id, "r1", "m1", &user_id, "gpt-4o-mini")
        .await
        .unwrap();

    assert!(!streams.is_cancel_requested("r1", &user_id).await.unwrap());
    assert!(streams.request_cancel("r1", &user_id).await.unwrap());
    assert!(streams.is_cancel_requested("r1", &user_id).await.unwrap());

    // Cancel after terminal is a no-op, not an error
    streams
        .complete("r1", &user_id, "partial", None, Some("cancelled"))
        .await
        .unwrap();
    assert!(!streams.request_cancel("r1", &user_id).await.unwrap());

    // Cancel of a missing record is not-found
    let err = streams
        .request_cancel("missing", &user_id)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ResourceNotFound);
}

// ============================================================================
// Authorization boundary
// ============================================================================

#[tokio::test]
async fn test_cross_user_access_reads_as_not_found() {
    let (streams, _, user_id, chat_id) = setup().await;
    let other_user = Uuid::new_v4().to_string();

    streams
        .create(&chat_id, "r1", "m1", &user_id, "gpt-4o-mini")
        .await
        .unwrap();

    // Reads return nothing
    assert!(streams.get("r1", &other_user).await.unwrap().is_none());
    assert!(streams
        .get_by_message("m1", &other_user)
        .await
        .unwrap()
        .is_none());

    // Mutations report not-found, never forbidden
    let err = streams
        .append_or_replace("r1", &other_user, "hijack", true)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ResourceNotFound);

    let err = streams
        .request_cancel("r1", &other_user)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ResourceNotFound);
}

// ============================================================================
// Sweep
// ============================================================================

#[tokio::test]
async fn test_sweep_removes_only_expired_records() {
    let resources = create_test_resources(default_script()).await;
    let pool = resources.database.pool().clone();
    let user_id = Uuid::new_v4().to_string();

    let chats = ChatManager::new(pool.clone());
    let chat = chats.create_chat(&user_id, "Sweep chat").await.unwrap();
    let streams = StreamManager::new(pool.clone());

    streams
        .create(&chat.id, "old", "m-old", &user_id, "gpt-4o-mini")
        .await
        .unwrap();
    streams
        .create(&chat.id, "fresh", "m-fresh", &user_id, "gpt-4o-mini")
        .await
        .unwrap();

    // Age the first record past the 24h threshold
    let aged = (chrono::Utc::now() - chrono::Duration::hours(25)).to_rfc3339();
    sqlx::query("UPDATE streaming_records SET created_at = $1 WHERE request_id = 'old'")
        .bind(&aged)
        .execute(&pool)
        .await
        .unwrap();

    let swept = streams
        .sweep_expired(Duration::from_secs(24 * 60 * 60))
        .await
        .unwrap();
    assert_eq!(swept, 1);

    assert!(streams.get("old", &user_id).await.unwrap().is_none());
    assert!(streams.get("fresh", &user_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_user_scoped_sweep_leaves_other_users_alone() {
    let resources = create_test_resources(default_script()).await;
    let pool = resources.database.pool().clone();
    let user_a = Uuid::new_v4().to_string();
    let user_b = Uuid::new_v4().to_string();

    let chats = ChatManager::new(pool.clone());
    let chat_a = chats.create_chat(&user_a, "A").await.unwrap();
    let chat_b = chats.create_chat(&user_b, "B").await.unwrap();
    let streams = StreamManager::new(pool.clone());

    streams
        .create(&chat_a.id, "ra", "ma", &user_a, "gpt-4o-mini")
        .await
        .unwrap();
    streams
        .create(&chat_b.id, "rb", "mb", &user_b, "gpt-4o-mini")
        .await
        .unwrap();

    let aged = (chrono::Utc::now() - chrono::Duration::hours(25)).to_rfc3339();
    sqlx::query("UPDATE streaming_records SET created_at = $1")
        .bind(&aged)
        .execute(&pool)
        .await
        .unwrap();

    let swept = streams
        .sweep_expired_for_user(&user_a, Duration::from_secs(24 * 60 * 60))
        .await
        .unwrap();
    assert_eq!(swept, 1);

    assert!(streams.get("ra", &user_a).await.unwrap().is_none());
    assert!(streams.get("rb", &user_b).await.unwrap().is_some());
}
