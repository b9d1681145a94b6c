// ABOUTME: Integration tests for the chat, settings, and usage route handlers
// ABOUTME: Exercises the full HTTP surface from generation start to polled completion
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;
mod helpers;

use std::time::Duration;

use axum::http::StatusCode;
use common::{create_test_resources, create_test_user, default_script, store_test_key, wait_for};
use helpers::axum_test::AxumTestRequest;
use serde_json::json;
use tidemark_server::routes;
use tidemark_server::routes::chat::{
    ChatListResponse, ChatResponse, MessageResponse, MessagesListResponse, SendMessageResponse,
    WatchResponse,
};
use tidemark_server::routes::settings::KeyStatusResponse;
use tidemark_server::routes::usage::SummariesResponse;

async fn setup() -> (axum::Router, String, uuid::Uuid, std::sync::Arc<tidemark_server::resources::ServerResources>) {
    let resources = create_test_resources(default_script()).await;
    let (user_id, auth) = create_test_user(&resources);
    let router = routes::router(std::sync::Arc::clone(&resources));
    (router, auth, user_id, resources)
}

async fn create_chat(router: &axum::Router, auth: &str, title: &str) -> ChatResponse {
    let response = AxumTestRequest::post("/api/chat/conversations")
        .auth(auth)
        .json(&json!({ "title": title }))
        .send(router.clone())
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    response.json()
}

// ============================================================================
// Conversation CRUD
// ============================================================================

#[tokio::test]
async fn test_create_and_list_chats() {
    let (router, auth, _, _) = setup().await;

    let chat = create_chat(&router, &auth, "My chat").await;
    assert_eq!(chat.title, "My chat");

    let response = AxumTestRequest::get("/api/chat/conversations")
        .auth(&auth)
        .send(router)
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let list: ChatListResponse = response.json();
    assert_eq!(list.total, 1);
    assert_eq!(list.chats[0].id, chat.id);
}

#[tokio::test]
async fn test_routes_require_authentication() {
    let (router, _, _, _) = setup().await;

    let response = AxumTestRequest::get("/api/chat/conversations")
        .send(router.clone())
        .await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);

    let response = AxumTestRequest::post("/api/chat/conversations")
        .header("authorization", "Bearer not-a-token")
        .json(&json!({ "title": "x" }))
        .send(router)
        .await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_soft_delete_hides_chat() {
    let (router, auth, _, _) = setup().await;
    let chat = create_chat(&router, &auth, "Doomed").await;

    let response = AxumTestRequest::delete(&format!("/api/chat/conversations/{}", chat.id))
        .auth(&auth)
        .send(router.clone())
        .await;
    assert_eq!(response.status_code(), StatusCode::NO_CONTENT);

    let list: ChatListResponse = AxumTestRequest::get("/api/chat/conversations")
        .auth(&auth)
        .send(router.clone())
        .await
        .json();
    assert_eq!(list.total, 0);

    // Deleting again reads as missing
    let response = AxumTestRequest::delete(&format!("/api/chat/conversations/{}", chat.id))
        .auth(&auth)
        .send(router)
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_foreign_chat_reads_as_not_found() {
    let (router, auth_a, _, resources) = setup().await;
    let (_, auth_b) = create_test_user(&resources);

    let chat = create_chat(&router, &auth_a, "Private").await;

    let response = AxumTestRequest::get(&format!("/api/chat/conversations/{}/messages", chat.id))
        .auth(&auth_b)
        .send(router.clone())
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);

    let response = AxumTestRequest::delete(&format!("/api/chat/conversations/{}", chat.id))
        .auth(&auth_b)
        .send(router)
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

// ============================================================================
// Generation flow
// ============================================================================

#[tokio::test]
async fn test_send_message_without_key_is_rejected_before_any_record() {
    let (router, auth, _, _) = setup().await;
    let chat = create_chat(&router, &auth, "No key yet").await;

    let response = AxumTestRequest::post(&format!("/api/chat/conversations/{}/messages", chat.id))
        .auth(&auth)
        .json(&json!({ "message": "Hello?" }))
        .send(router)
        .await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let body = response.text();
    assert!(body.contains("No provider API key configured"));
}

#[tokio::test]
async fn test_full_generation_flow_via_polling() {
    let (router, auth, user_id, resources) = setup().await;
    store_test_key(&resources, user_id).await;

    let chat = create_chat(&router, &auth, "Streaming chat").await;

    let response = AxumTestRequest::post(&format!("/api/chat/conversations/{}/messages", chat.id))
        .auth(&auth)
        .json(&json!({ "message": "Say hello" }))
        .send(router.clone())
        .await;
    assert_eq!(response.status_code(), StatusCode::ACCEPTED);
    let started: SendMessageResponse = response.json();

    // Poll the watch route until the record is terminal
    let watch_uri = format!(
        "/api/chat/streams/watch?request_id={}",
        started.request_id
    );
    let record: WatchResponse = wait_for(Duration::from_secs(5), || {
        let router = router.clone();
        let auth = auth.clone();
        let watch_uri = watch_uri.clone();
        async move {
            let response = AxumTestRequest::get(&watch_uri)
                .auth(&auth)
                .send(router)
                .await;
            if response.status_code() != StatusCode::OK {
                return None;
            }
            let record: WatchResponse = response.json();
            matches!(
                record.status,
                tidemark_server::database::streams::StreamStatus::Completed
            )
            .then_some(record)
        }
    })
    .await;

    assert_eq!(record.content, "Hello world");
    assert_eq!(record.usage.unwrap().total_tokens, 7);

    // The transcript now holds prompt and response in order
    let list: MessagesListResponse =
        AxumTestRequest::get(&format!("/api/chat/conversations/{}/messages", chat.id))
            .auth(&auth)
            .send(router.clone())
            .await
            .json();
    assert_eq!(list.messages.len(), 2);
    assert_eq!(list.messages[0].role, "prompt");
    assert_eq!(list.messages[1].role, "response");
    assert_eq!(list.messages[1].content, "Hello world");
    assert_eq!(
        list.messages[1].ai_metadata.as_ref().unwrap().total_tokens,
        7
    );

    // The message projection resolves to the final row
    let message: MessageResponse =
        AxumTestRequest::get(&format!("/api/chat/messages/{}", started.message_id))
            .auth(&auth)
            .send(router.clone())
            .await
            .json();
    assert!(!message.is_streaming);
    assert_eq!(message.content, "Hello world");

    // And the usage dashboard reflects the generation
    let summaries: SummariesResponse = AxumTestRequest::get("/api/usage/daily")
        .auth(&auth)
        .send(router)
        .await
        .json();
    assert_eq!(summaries.summaries.len(), 1);
    assert_eq!(summaries.summaries[0].total_tokens, 7);
    assert_eq!(summaries.summaries[0].request_count, 1);
}

#[tokio::test]
async fn test_watch_is_scoped_to_the_owner() {
    let (router, auth, user_id, resources) = setup().await;
    let (_, auth_b) = create_test_user(&resources);
    store_test_key(&resources, user_id).await;

    let chat = create_chat(&router, &auth, "Scoped").await;
    let started: SendMessageResponse =
        AxumTestRequest::post(&format!("/api/chat/conversations/{}/messages", chat.id))
            .auth(&auth)
            .json(&json!({ "message": "hi" }))
            .send(router.clone())
            .await
            .json();

    // Another user's valid token sees not-found, never the data
    let response = AxumTestRequest::get(&format!(
        "/api/chat/streams/watch?request_id={}",
        started.request_id
    ))
    .auth(&auth_b)
    .send(router.clone())
    .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);

    let response = AxumTestRequest::get(&format!("/api/chat/messages/{}", started.message_id))
        .auth(&auth_b)
        .send(router)
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_sse_variant_projects_the_same_generation() {
    let (router, auth, user_id, resources) = setup().await;
    store_test_key(&resources, user_id).await;

    let chat = create_chat(&router, &auth, "SSE chat").await;

    let response = AxumTestRequest::post(&format!("/api/chat/conversations/{}/stream", chat.id))
        .auth(&auth)
        .json(&json!({ "message": "stream it" }))
        .send(router)
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body = response.text();
    assert!(body.contains("\"type\":\"content\""));
    assert!(body.contains("Hello"));
    assert!(body.contains("\"type\":\"complete\""));
}

// ============================================================================
// Settings routes
// ============================================================================

#[tokio::test]
async fn test_provider_key_lifecycle() {
    let (router, auth, _, _) = setup().await;

    // Nothing stored yet
    let status: KeyStatusResponse = AxumTestRequest::get("/api/settings/provider-key")
        .auth(&auth)
        .send(router.clone())
        .await
        .json();
    assert!(!status.configured);

    // Store (the scripted provider accepts any key)
    let response = AxumTestRequest::put("/api/settings/provider-key")
        .auth(&auth)
        .json(&json!({ "api_key": "sk-live-abc" }))
        .send(router.clone())
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let status: KeyStatusResponse = AxumTestRequest::get("/api/settings/provider-key")
        .auth(&auth)
        .send(router.clone())
        .await
        .json();
    assert!(status.configured);
    assert!(status.is_valid);

    // Delete
    let response = AxumTestRequest::delete("/api/settings/provider-key")
        .auth(&auth)
        .send(router.clone())
        .await;
    assert_eq!(response.status_code(), StatusCode::NO_CONTENT);

    let status: KeyStatusResponse = AxumTestRequest::get("/api/settings/provider-key")
        .auth(&auth)
        .send(router)
        .await
        .json();
    assert!(!status.configured);
}

#[tokio::test]
async fn test_rejected_key_is_not_stored() {
    let resources = common::create_test_resources_with_factory(
        common::ScriptedProviderFactory {
            script: std::sync::Arc::new(default_script()),
            healthy: false,
        },
    )
    .await;
    let (_, auth) = create_test_user(&resources);
    let router = routes::router(std::sync::Arc::clone(&resources));

    let response = AxumTestRequest::put("/api/settings/provider-key")
        .auth(&auth)
        .json(&json!({ "api_key": "sk-bad" }))
        .send(router.clone())
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let status: KeyStatusResponse = AxumTestRequest::get("/api/settings/provider-key")
        .auth(&auth)
        .send(router)
        .await
        .json();
    assert!(!status.configured);
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health_is_public() {
    let (router, _, _, _) = setup().await;

    let response = AxumTestRequest::get("/health").send(router).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert!(response.text().contains("ok"));
}
