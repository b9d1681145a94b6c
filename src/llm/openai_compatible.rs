// ABOUTME: OpenAI-compatible LLM provider speaking the streamed chat completions protocol
// ABOUTME: Opens one upstream request per generation and yields parsed text deltas plus usage
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! # `OpenAI`-Compatible Provider
//!
//! Gateway adapter for any endpoint implementing the `OpenAI` chat
//! completions API (`OpenAI` itself, Azure-compatible proxies, Ollama,
//! vLLM). The adapter:
//!
//! - issues `POST {base}/chat/completions` with `stream: true` and
//!   `stream_options.include_usage: true`,
//! - maps non-2xx responses to a typed failure carrying the HTTP status
//!   and the upstream error body,
//! - parses `data: <json>` frames through the shared line-buffering SSE
//!   parser, skipping frames whose JSON does not parse (resilience against
//!   malformed frames at chunk boundaries),
//! - captures usage totals opportunistically from whichever frame carries
//!   them (they typically arrive once, near the end).
//!
//! The adapter has no side effects beyond the HTTP call; persistence is
//! the orchestrator's job.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

use super::sse_parser::create_sse_stream;
use super::{ChatMessage, ChatRequest, ChatStream, LlmProvider, ProviderFactory, StreamChunk, TokenUsage};
use crate::errors::{AppError, ErrorCode};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Connection timeout for the upstream endpoint
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Request timeout (generation can be slow; streaming keeps the socket warm)
const REQUEST_TIMEOUT_SECS: u64 = 300;

// ============================================================================
// API Request/Response Types (OpenAI-compatible format)
// ============================================================================

/// OpenAI-compatible API request structure
#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    stream_options: StreamOptions,
}

/// Streaming options - asks the upstream to append a usage frame
#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

/// Message structure for OpenAI-compatible API
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

impl From<&ChatMessage> for WireMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role.as_str().to_owned(),
            content: msg.content.clone(),
        }
    }
}

/// Streaming chunk structure
#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

/// Choice in streaming chunk
#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

/// Delta content in streaming chunk
#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Usage statistics in response
#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(rename = "prompt_tokens")]
    prompt: u32,
    #[serde(rename = "completion_tokens")]
    completion: u32,
    #[serde(rename = "total_tokens")]
    total: u32,
}

impl From<WireUsage> for TokenUsage {
    fn from(u: WireUsage) -> Self {
        Self {
            prompt_tokens: u.prompt,
            completion_tokens: u.completion,
            total_tokens: u.total,
        }
    }
}

/// Error response structure
#[derive(Debug, Deserialize)]
struct UpstreamErrorBody {
    error: UpstreamErrorDetail,
}

/// Error detail structure
#[derive(Debug, Deserialize)]
struct UpstreamErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

// ============================================================================
// Provider Configuration
// ============================================================================

/// Configuration for the `OpenAI`-compatible provider
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleConfig {
    /// Base URL for the API (e.g., <https://api.openai.com/v1>)
    pub base_url: String,
    /// API key - a previously validated, decrypted secret
    pub api_key: String,
    /// Default model to use
    pub default_model: String,
}

// ============================================================================
// Provider Implementation
// ============================================================================

/// Generic `OpenAI`-compatible streaming provider
pub struct OpenAiCompatibleProvider {
    client: Client,
    config: OpenAiCompatibleConfig,
}

impl OpenAiCompatibleProvider {
    /// Create a new provider with the given configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: OpenAiCompatibleConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| AppError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Build the API URL for a given endpoint
    fn api_url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint
        )
    }

    /// Convert internal messages to `OpenAI` format
    fn convert_messages(messages: &[ChatMessage]) -> Vec<WireMessage> {
        messages.iter().map(WireMessage::from).collect()
    }

    /// Parse a streamed `data:` frame into a chunk
    ///
    /// Returning `None` drops the frame whole: a frame with a JSON parse
    /// error never contributes content *or* usage, even if a usage object
    /// happens to sit inside the broken payload.
    fn parse_stream_frame(json_str: &str) -> Option<Result<StreamChunk, AppError>> {
        let chunk = match serde_json::from_str::<CompletionChunk>(json_str) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Skipping malformed stream frame: {e}");
                return None;
            }
        };

        let usage = chunk.usage.map(TokenUsage::from);

        // Usage-only frames have an empty choices array
        let Some(choice) = chunk.choices.into_iter().next() else {
            return usage.map(|u| {
                Ok(StreamChunk {
                    delta: String::new(),
                    is_final: false,
                    finish_reason: None,
                    usage: Some(u),
                })
            });
        };

        Some(Ok(StreamChunk {
            delta: choice.delta.content.unwrap_or_default(),
            is_final: choice.finish_reason.is_some(),
            finish_reason: choice.finish_reason,
            usage,
        }))
    }

    /// Map a non-2xx upstream response to a typed failure
    fn parse_error_response(status: reqwest::StatusCode, body: &str) -> AppError {
        if let Ok(error_response) = serde_json::from_str::<UpstreamErrorBody>(body) {
            let error_type = error_response
                .error
                .error_type
                .unwrap_or_else(|| "unknown".to_owned());

            match status.as_u16() {
                401 => AppError::auth_invalid(format!(
                    "Upstream rejected the API key: {}",
                    error_response.error.message
                )),
                429 => AppError::new(
                    ErrorCode::ExternalRateLimited,
                    format!("Upstream rate limit: {}", error_response.error.message),
                ),
                400 => AppError::invalid_input(format!(
                    "Upstream validation error: {}",
                    error_response.error.message
                )),
                404 => AppError::not_found(format!(
                    "Model or endpoint ({})",
                    error_response.error.message
                )),
                _ => AppError::external_service(
                    "Upstream",
                    format!("HTTP {status}: {error_type} - {}", error_response.error.message),
                ),
            }
        } else {
            // Non-JSON error body; keep the first part for diagnostics
            AppError::external_service(
                "Upstream",
                format!(
                    "HTTP {status}: {}",
                    body.chars().take(200).collect::<String>()
                ),
            )
        }
    }

    /// Map a request transport error to a typed failure
    fn map_request_error(e: &reqwest::Error) -> AppError {
        if e.is_connect() || e.is_timeout() {
            AppError::new(
                ErrorCode::ExternalServiceUnavailable,
                format!("Cannot reach upstream endpoint: {e}"),
            )
        } else {
            AppError::external_service("Upstream", format!("Request failed: {e}"))
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn default_model(&self) -> &str {
        &self.config.default_model
    }

    #[instrument(skip(self, request), fields(model = %request.model.as_deref().unwrap_or(&self.config.default_model)))]
    async fn complete_stream(&self, request: &ChatRequest) -> Result<ChatStream, AppError> {
        let model = request
            .model
            .as_deref()
            .unwrap_or(&self.config.default_model);

        debug!(
            messages = request.messages.len(),
            "Opening streamed completion request"
        );

        let openai_request = CompletionRequest {
            model: model.to_owned(),
            messages: Self::convert_messages(&request.messages),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        };

        let response = self
            .client
            .post(self.api_url("chat/completions"))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&openai_request)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to send streaming request: {e}");
                Self::map_request_error(&e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::parse_error_response(status, &body));
        }

        // Upstream answered 2xx but without an event stream - a distinct
        // "no stream available" failure, not a generic HTTP error
        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        if !is_event_stream {
            return Err(AppError::new(
                ErrorCode::ExternalServiceUnavailable,
                "Upstream returned no stream body",
            ));
        }

        Ok(create_sse_stream(
            response.bytes_stream(),
            Self::parse_stream_frame,
            "Upstream",
        ))
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<bool, AppError> {
        debug!("Checking upstream at {}", self.config.base_url);

        // The models endpoint is the cheapest authenticated round trip
        let response = self
            .client
            .get(self.api_url("models"))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .send()
            .await
            .map_err(|e| Self::map_request_error(&e))?;

        Ok(response.status().is_success())
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Factory binding decrypted per-user API keys to upstream providers
pub struct OpenAiProviderFactory {
    /// Upstream base URL shared by all users
    pub base_url: String,
    /// Model used when a chat does not name one
    pub default_model: String,
}

impl ProviderFactory for OpenAiProviderFactory {
    fn create(&self, api_key: &str) -> Result<std::sync::Arc<dyn LlmProvider>, AppError> {
        let provider = OpenAiCompatibleProvider::new(OpenAiCompatibleConfig {
            base_url: self.base_url.clone(),
            api_key: api_key.to_owned(),
            default_model: self.default_model.clone(),
        })?;
        Ok(std::sync::Arc::new(provider))
    }
}
