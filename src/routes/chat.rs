// ABOUTME: Chat route handlers for conversations, generation start, and live watch projections
// ABOUTME: REST endpoints plus the SSE streaming variant, all projections of the streaming record
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! Chat routes
//!
//! Conversation management, message transcript, generation start, and the
//! two live-watch routes. Both watch routes - by `request_id` and by
//! `message_id` - are thin projections of the same streaming record, so
//! the polling client can follow either without divergent behavior. The
//! SSE variant is a server-side projection of the same record.

use crate::{
    auth::AuthResult,
    database::chat::{AiMetadata, ChatManager, MessageRecord},
    database::streams::{StreamManager, StreamStatus, StreamingRecord},
    errors::AppError,
    llm::TokenUsage,
    resources::ServerResources,
};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        AppendHeaders, IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc, time::Duration};

/// How often the SSE projection re-reads the streaming record
const SSE_POLL_INTERVAL: Duration = Duration::from_millis(150);

/// Server-side ceiling on one SSE projection loop
const SSE_MAX_DURATION: Duration = Duration::from_secs(600);

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request to create a new chat
#[derive(Debug, Deserialize)]
pub struct CreateChatRequest {
    /// Chat title
    pub title: String,
}

/// Response for a chat
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Chat ID
    pub id: String,
    /// Chat title
    pub title: String,
    /// Creation timestamp
    pub created_at: String,
    /// Last update timestamp
    pub updated_at: String,
}

/// Response for listing chats
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatListResponse {
    /// List of chats
    pub chats: Vec<ChatResponse>,
    /// Total count returned
    pub total: usize,
}

/// Query parameters for listing chats
#[derive(Debug, Deserialize, Default)]
pub struct ListChatsQuery {
    /// Maximum number of chats to return
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Offset for pagination
    #[serde(default)]
    pub offset: i64,
}

const fn default_limit() -> i64 {
    20
}

/// Request to send a message and start a generation
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    /// Message content
    pub message: String,
    /// Model override (optional)
    #[serde(default)]
    pub model: Option<String>,
}

/// Response for starting a generation
#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageResponse {
    /// ID of the persisted prompt message
    pub user_message_id: String,
    /// Pre-allocated ID of the eventual response message
    pub message_id: String,
    /// Correlation token for watching the streaming record
    pub request_id: String,
}

/// Response for a transcript message (or its live projection)
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    /// Message ID
    pub id: String,
    /// Chat ID
    pub chat_id: String,
    /// Role (prompt/response)
    pub role: String,
    /// Message content (partial while streaming)
    pub content: String,
    /// Whether the message is still being generated
    pub is_streaming: bool,
    /// Whether the content is AI-generated
    pub is_ai_generated: bool,
    /// Generation metadata, present once finalized
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_metadata: Option<AiMetadata>,
    /// Inline error text when the generation failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Creation timestamp
    pub created_at: String,
    /// Freshness marker for pollers
    pub updated_at: String,
}

/// Response for a transcript listing
#[derive(Debug, Serialize, Deserialize)]
pub struct MessagesListResponse {
    /// Messages in chronological order
    pub messages: Vec<MessageResponse>,
}

/// Query parameters for the record watch route
#[derive(Debug, Deserialize)]
pub struct WatchQuery {
    /// Correlation token of the generation
    pub request_id: String,
}

/// Snapshot of a streaming record
#[derive(Debug, Serialize, Deserialize)]
pub struct WatchResponse {
    /// Correlation token
    pub request_id: String,
    /// Pre-allocated response message ID
    pub message_id: String,
    /// Chat the generation belongs to
    pub chat_id: String,
    /// Accumulated content so far
    pub content: String,
    /// Lifecycle status
    pub status: StreamStatus,
    /// Error text when status = error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Usage totals when status = completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// Whether cancellation has been requested
    pub cancel_requested: bool,
    /// Creation timestamp
    pub created_at: String,
    /// Freshness marker - the poller's change-detection signal
    pub updated_at: String,
}

impl From<StreamingRecord> for WatchResponse {
    fn from(r: StreamingRecord) -> Self {
        Self {
            request_id: r.request_id,
            message_id: r.message_id,
            chat_id: r.chat_id,
            content: r.content,
            status: r.status,
            error: r.error,
            usage: r.usage,
            cancel_requested: r.cancel_requested,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/// Response for a cancellation request
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    /// True when the flag was newly set on a live generation
    pub cancelled: bool,
}

fn message_to_response(m: MessageRecord) -> MessageResponse {
    let updated_at = m.created_at.clone();
    MessageResponse {
        id: m.id,
        chat_id: m.chat_id,
        role: m.role.as_str().to_owned(),
        content: m.content,
        is_streaming: false,
        is_ai_generated: m.is_ai_generated,
        ai_metadata: m.ai_metadata,
        error: None,
        created_at: m.created_at,
        updated_at,
    }
}

// ============================================================================
// Chat Routes
// ============================================================================

/// Chat routes handler
pub struct ChatRoutes;

impl ChatRoutes {
    /// Create all chat routes
    pub fn routes(resources: Arc<ServerResources>) -> Router {
        Router::new()
            // Conversation management
            .route("/api/chat/conversations", post(Self::create_chat))
            .route("/api/chat/conversations", get(Self::list_chats))
            .route("/api/chat/conversations/:chat_id", delete(Self::delete_chat))
            // Messages
            .route(
                "/api/chat/conversations/:chat_id/messages",
                get(Self::get_messages),
            )
            .route(
                "/api/chat/conversations/:chat_id/messages",
                post(Self::send_message),
            )
            .route("/api/chat/messages/:message_id", get(Self::get_message))
            // Live generation watch + cancel
            .route("/api/chat/streams/watch", get(Self::watch_stream))
            .route(
                "/api/chat/streams/:request_id/cancel",
                post(Self::cancel_stream),
            )
            // SSE variant
            .route(
                "/api/chat/conversations/:chat_id/stream",
                post(Self::send_message_stream),
            )
            .with_state(resources)
    }

    /// Extract and authenticate the user from the authorization header
    fn authenticate(
        headers: &axum::http::HeaderMap,
        resources: &Arc<ServerResources>,
    ) -> Result<AuthResult, AppError> {
        resources.auth_manager.authenticate(headers)
    }

    fn chat_manager(resources: &ServerResources) -> ChatManager {
        ChatManager::new(resources.database.pool().clone())
    }

    fn stream_manager(resources: &ServerResources) -> StreamManager {
        StreamManager::new(resources.database.pool().clone())
    }

    // ========================================================================
    // Conversation Handlers
    // ========================================================================

    /// Create a new chat
    async fn create_chat(
        State(resources): State<Arc<ServerResources>>,
        headers: axum::http::HeaderMap,
        Json(request): Json<CreateChatRequest>,
    ) -> Result<Response, AppError> {
        let auth = Self::authenticate(&headers, &resources)?;

        if request.title.trim().is_empty() {
            return Err(AppError::invalid_input("Title must not be empty"));
        }

        let chat = Self::chat_manager(&resources)
            .create_chat(&auth.user_id.to_string(), request.title.trim())
            .await?;

        let response = ChatResponse {
            id: chat.id,
            title: chat.title,
            created_at: chat.created_at,
            updated_at: chat.updated_at,
        };

        Ok((StatusCode::CREATED, Json(response)).into_response())
    }

    /// List the caller's active chats
    async fn list_chats(
        State(resources): State<Arc<ServerResources>>,
        headers: axum::http::HeaderMap,
        Query(query): Query<ListChatsQuery>,
    ) -> Result<Response, AppError> {
        let auth = Self::authenticate(&headers, &resources)?;

        let chats = Self::chat_manager(&resources)
            .list_chats(&auth.user_id.to_string(), query.limit, query.offset)
            .await?;

        let total = chats.len();
        let response = ChatListResponse {
            chats: chats
                .into_iter()
                .map(|c| ChatResponse {
                    id: c.id,
                    title: c.title,
                    created_at: c.created_at,
                    updated_at: c.updated_at,
                })
                .collect(),
            total,
        };

        Ok((StatusCode::OK, Json(response)).into_response())
    }

    /// Soft-delete a chat
    async fn delete_chat(
        State(resources): State<Arc<ServerResources>>,
        headers: axum::http::HeaderMap,
        Path(chat_id): Path<String>,
    ) -> Result<Response, AppError> {
        let auth = Self::authenticate(&headers, &resources)?;

        let deleted = Self::chat_manager(&resources)
            .soft_delete_chat(&chat_id, &auth.user_id.to_string())
            .await?;

        if !deleted {
            return Err(AppError::not_found("Chat"));
        }

        Ok((StatusCode::NO_CONTENT, ()).into_response())
    }

    // ========================================================================
    // Message Handlers
    // ========================================================================

    /// Get the transcript for a chat
    async fn get_messages(
        State(resources): State<Arc<ServerResources>>,
        headers: axum::http::HeaderMap,
        Path(chat_id): Path<String>,
    ) -> Result<Response, AppError> {
        let auth = Self::authenticate(&headers, &resources)?;
        let user_id = auth.user_id.to_string();

        let chat_manager = Self::chat_manager(&resources);

        // Verify the caller owns this chat
        chat_manager
            .get_chat(&chat_id, &user_id)
            .await?
            .ok_or_else(|| AppError::not_found("Chat"))?;

        let messages = chat_manager.get_messages(&chat_id, &user_id).await?;

        let response = MessagesListResponse {
            messages: messages.into_iter().map(message_to_response).collect(),
        };

        Ok((StatusCode::OK, Json(response)).into_response())
    }

    /// Persist a prompt message and start a generation
    ///
    /// Returns immediately with the IDs the client needs to poll; the
    /// generation itself runs as a background unit of work whose state
    /// lives entirely in the streaming record.
    async fn send_message(
        State(resources): State<Arc<ServerResources>>,
        headers: axum::http::HeaderMap,
        Path(chat_id): Path<String>,
        Json(request): Json<SendMessageRequest>,
    ) -> Result<Response, AppError> {
        let auth = Self::authenticate(&headers, &resources)?;
        let user_id = auth.user_id.to_string();

        let started = resources
            .generation_service
            .start(&user_id, &chat_id, &request.message, request.model.as_deref())
            .await?;

        resources
            .generation_service
            .spawn_run(started.request_id.clone(), user_id);

        let response = SendMessageResponse {
            user_message_id: started.user_message_id,
            message_id: started.message_id,
            request_id: started.request_id,
        };

        Ok((StatusCode::ACCEPTED, Json(response)).into_response())
    }

    /// Get a message - final row or live streaming projection
    ///
    /// While the generation is in flight the pre-allocated message ID
    /// resolves to a projection of the streaming record with
    /// `is_streaming: true`; once finalized it resolves to the permanent
    /// transcript row.
    async fn get_message(
        State(resources): State<Arc<ServerResources>>,
        headers: axum::http::HeaderMap,
        Path(message_id): Path<String>,
    ) -> Result<Response, AppError> {
        let auth = Self::authenticate(&headers, &resources)?;
        let user_id = auth.user_id.to_string();

        if let Some(message) = Self::chat_manager(&resources)
            .get_message(&message_id, &user_id)
            .await?
        {
            return Ok((StatusCode::OK, Json(message_to_response(message))).into_response());
        }

        // No finalized row yet: project the live record under the same ID
        let record = Self::stream_manager(&resources)
            .get_by_message(&message_id, &user_id)
            .await?
            .ok_or_else(|| AppError::not_found("Message"))?;

        let response = MessageResponse {
            id: record.message_id.clone(),
            chat_id: record.chat_id.clone(),
            role: "response".to_owned(),
            content: record.content.clone(),
            is_streaming: record.status == StreamStatus::Streaming,
            is_ai_generated: true,
            ai_metadata: None,
            error: record.error.clone(),
            created_at: record.created_at.clone(),
            updated_at: record.updated_at,
        };

        Ok((StatusCode::OK, Json(response)).into_response())
    }

    // ========================================================================
    // Live Generation Handlers
    // ========================================================================

    /// Snapshot the streaming record for a generation
    async fn watch_stream(
        State(resources): State<Arc<ServerResources>>,
        headers: axum::http::HeaderMap,
        Query(query): Query<WatchQuery>,
    ) -> Result<Response, AppError> {
        let auth = Self::authenticate(&headers, &resources)?;

        let record = Self::stream_manager(&resources)
            .get(&query.request_id, &auth.user_id.to_string())
            .await?
            .ok_or_else(|| AppError::not_found("Streaming record"))?;

        let headers = AppendHeaders([(header::CACHE_CONTROL, "no-cache")]);
        Ok((StatusCode::OK, headers, Json(WatchResponse::from(record))).into_response())
    }

    /// Request cooperative cancellation of a live generation
    async fn cancel_stream(
        State(resources): State<Arc<ServerResources>>,
        headers: axum::http::HeaderMap,
        Path(request_id): Path<String>,
    ) -> Result<Response, AppError> {
        let auth = Self::authenticate(&headers, &resources)?;

        let cancelled = Self::stream_manager(&resources)
            .request_cancel(&request_id, &auth.user_id.to_string())
            .await?;

        Ok((StatusCode::OK, Json(CancelResponse { cancelled })).into_response())
    }

    /// Send a message and stream the response via SSE
    ///
    /// The event stream is a projection of the same streaming record the
    /// polling routes read: the generation runs in the background exactly
    /// as for polling clients, and this handler re-reads the record on an
    /// interval, emitting `content` deltas and a terminal
    /// `complete`/`error` event.
    async fn send_message_stream(
        State(resources): State<Arc<ServerResources>>,
        headers: axum::http::HeaderMap,
        Path(chat_id): Path<String>,
        Json(request): Json<SendMessageRequest>,
    ) -> Result<
        (
            AppendHeaders<[(header::HeaderName, &'static str); 2]>,
            Sse<impl Stream<Item = Result<Event, Infallible>>>,
        ),
        AppError,
    > {
        let auth = Self::authenticate(&headers, &resources)?;
        let user_id = auth.user_id.to_string();

        let started = resources
            .generation_service
            .start(&user_id, &chat_id, &request.message, request.model.as_deref())
            .await?;

        resources
            .generation_service
            .spawn_run(started.request_id.clone(), user_id.clone());

        let request_id = started.request_id;
        let stream_manager = Self::stream_manager(&resources);

        let stream = async_stream::stream! {
            let deadline = tokio::time::Instant::now() + SSE_MAX_DURATION;
            let mut last_updated_at = String::new();
            let mut sent_len = 0usize;

            loop {
                if tokio::time::Instant::now() >= deadline {
                    let event = serde_json::json!({
                        "type": "error",
                        "error": "Stream timed out",
                        "request_id": request_id,
                    });
                    yield Ok(Event::default().data(event.to_string()));
                    return;
                }

                let record = match stream_manager.get(&request_id, &user_id).await {
                    Ok(Some(record)) => record,
                    // Startup race: the record may lag the spawn briefly
                    Ok(None) => {
                        tokio::time::sleep(SSE_POLL_INTERVAL).await;
                        continue;
                    }
                    Err(e) => {
                        let event = serde_json::json!({
                            "type": "error",
                            "error": e.message,
                            "request_id": request_id,
                        });
                        yield Ok(Event::default().data(event.to_string()));
                        return;
                    }
                };

                // Only emit when the freshness marker advanced
                if record.updated_at != last_updated_at {
                    last_updated_at = record.updated_at.clone();

                    if record.content.len() > sent_len {
                        let delta = record.content[sent_len..].to_owned();
                        sent_len = record.content.len();
                        let event = serde_json::json!({
                            "type": "content",
                            "content": delta,
                            "request_id": request_id,
                        });
                        yield Ok(Event::default().data(event.to_string()));
                    }

                    match record.status {
                        StreamStatus::Completed => {
                            let event = serde_json::json!({
                                "type": "complete",
                                "usage": record.usage,
                                "request_id": request_id,
                            });
                            yield Ok(Event::default().data(event.to_string()));
                            return;
                        }
                        StreamStatus::Error => {
                            let event = serde_json::json!({
                                "type": "error",
                                "error": record.error,
                                "request_id": request_id,
                            });
                            yield Ok(Event::default().data(event.to_string()));
                            return;
                        }
                        StreamStatus::Streaming => {}
                    }
                }

                tokio::time::sleep(SSE_POLL_INTERVAL).await;
            }
        };

        Ok((
            AppendHeaders([
                (header::CACHE_CONTROL, "no-cache"),
                (header::CONNECTION, "keep-alive"),
            ]),
            Sse::new(stream).keep_alive(KeepAlive::default()),
        ))
    }
}
