// ABOUTME: LLM provider abstraction layer for pluggable upstream completion APIs
// ABOUTME: Defines the contract for streamed chat completion with usage capture
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! # LLM Provider Service Provider Interface
//!
//! This module defines the contract the upstream completion gateway must
//! implement. The orchestrator only ever sees this interface, so tests can
//! substitute scripted providers for the real HTTP adapter.
//!
//! ## Key Concepts
//!
//! - **`ChatMessage`**: Role-based message structure for conversations
//! - **`ChatRequest`**: Request configuration including model and sampling
//! - **`StreamChunk`**: One increment of streamed output, optionally
//!   carrying the usage totals the upstream reports near stream end
//! - **`LlmProvider`**: Async trait producing a lazy, finite,
//!   non-restartable chunk stream
//! - **`ProviderFactory`**: Indirection so a decrypted per-user API key can
//!   be turned into a provider (or a test double) at generation time

mod openai_compatible;
pub mod pricing;
pub mod sse_parser;

pub use openai_compatible::{OpenAiCompatibleConfig, OpenAiCompatibleProvider, OpenAiProviderFactory};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;

use crate::errors::AppError;

// ============================================================================
// Message Types
// ============================================================================

/// Role of a message in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instruction message
    System,
    /// User input message
    User,
    /// Assistant response message
    Assistant,
}

impl MessageRole {
    /// Convert to string representation for API calls
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single message in a chat conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender
    pub role: MessageRole,
    /// Content of the message
    pub content: String,
}

impl ChatMessage {
    /// Create a new chat message
    #[must_use]
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a system message
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Create a user message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create an assistant message
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Configuration for a chat completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Conversation messages, newest user turn last
    pub messages: Vec<ChatMessage>,
    /// Model identifier (passed through unvalidated; bad models surface as
    /// an upstream HTTP error)
    pub model: Option<String>,
    /// Temperature for response randomness (0.0 - 2.0)
    pub temperature: Option<f32>,
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    /// Create a new chat request with messages
    #[must_use]
    pub const fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            model: None,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Set the model to use
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the temperature
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the maximum tokens
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of tokens in the prompt
    pub prompt_tokens: u32,
    /// Number of tokens in the completion
    pub completion_tokens: u32,
    /// Total tokens used
    pub total_tokens: u32,
}

/// A chunk of a streaming response
///
/// Usage totals typically arrive once, near the end of the stream, on a
/// frame that may or may not also carry a delta. Consumers must capture
/// `usage` opportunistically from whichever chunk carries it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Content delta for this chunk
    pub delta: String,
    /// Whether this is the final chunk
    pub is_final: bool,
    /// Finish reason if final
    pub finish_reason: Option<String>,
    /// Usage totals when the upstream reported them on this frame
    pub usage: Option<TokenUsage>,
}

impl StreamChunk {
    /// A terminal chunk with no delta (the `[DONE]` sentinel)
    #[must_use]
    pub fn done() -> Self {
        Self {
            delta: String::new(),
            is_final: true,
            finish_reason: Some("stop".to_owned()),
            usage: None,
        }
    }
}

/// Stream type for chat completion responses
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, AppError>> + Send>>;

// ============================================================================
// Provider Trait
// ============================================================================

/// LLM provider trait for streamed chat completion
///
/// Implementations open one upstream request per call and yield a lazy,
/// finite, non-restartable sequence of chunks.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Unique provider identifier (e.g., "openai", "scripted")
    fn name(&self) -> &'static str;

    /// Default model to use if not specified in request
    fn default_model(&self) -> &str;

    /// Perform a streaming chat completion
    async fn complete_stream(&self, request: &ChatRequest) -> Result<ChatStream, AppError>;

    /// Check if the provider is reachable and the API key is accepted
    async fn health_check(&self) -> Result<bool, AppError>;
}

/// Factory turning a decrypted per-user API key into a provider
///
/// The orchestrator receives this as an injected capability so tests can
/// return scripted providers instead of opening real HTTP connections.
pub trait ProviderFactory: Send + Sync {
    /// Build a provider bound to the given API key
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot be constructed.
    fn create(&self, api_key: &str) -> Result<Arc<dyn LlmProvider>, AppError>;
}
