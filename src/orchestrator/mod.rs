// ABOUTME: Stream orchestrator driving upstream token streams into durable storage
// ABOUTME: Owns write coalescing, cancellation, finalization, and usage accounting
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! # Stream Orchestrator
//!
//! Drives one generation: `idle → streaming → {completed | error}`, with no
//! transition out of a terminal state.
//!
//! The request-scoped half ([`GenerationService::start`]) validates the
//! caller owns the chat and has a usable provider key *before* any
//! streaming record exists, so pre-stream failures reject directly with an
//! actionable message. The background half ([`GenerationService::run`])
//! re-verifies ownership from durable state - it runs decoupled from the
//! originating request and must not trust a caller-supplied user id.
//!
//! Durable writes are coalesced: token fragments buffer until either a
//! minimum elapsed time or a minimum character count since the last flush
//! is exceeded, whichever comes first, bounding both perceived latency and
//! write amplification. The residue is always flushed when the upstream
//! stream ends. Between flush cycles the orchestrator polls the record's
//! cancellation flag and aborts the upstream read loop when it is set, so
//! a cancelled generation stops incurring upstream cost.
//!
//! Whether a generation succeeds or fails, one usage ledger event is
//! recorded (best-effort); failures record zero tokens/cost but preserve
//! the error text for audit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::crypto::KeyVault;
use crate::database::chat::TranscriptRole;
use crate::database::usage::UsageEvent;
use crate::database::{ChatManager, CredentialManager, Database, StreamManager, UsageLedger};
use crate::errors::{AppError, AppResult, ErrorCode};
use crate::llm::{ChatMessage, ChatRequest, ProviderFactory, TokenUsage};

/// System prompt prefixed to every generation
const SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer clearly and concisely using markdown.";

/// How many prior transcript turns are sent upstream
const CONTEXT_WINDOW_MESSAGES: i64 = 10;

// ============================================================================
// Flush Policy
// ============================================================================

/// Write-coalescing policy for durable content flushes
///
/// Flush when **either** the elapsed time since the last flush reaches
/// `min_interval` **or** the buffered character count reaches `min_chars`,
/// whichever occurs first. An empty buffer never flushes.
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    /// Minimum elapsed time since the last flush
    pub min_interval: Duration,
    /// Minimum buffered characters that force an early flush
    pub min_chars: usize,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(50),
            min_chars: 24,
        }
    }
}

impl FlushPolicy {
    /// Decide whether the buffer should be flushed now
    #[must_use]
    pub fn should_flush(&self, buffered_chars: usize, elapsed: Duration) -> bool {
        buffered_chars > 0 && (buffered_chars >= self.min_chars || elapsed >= self.min_interval)
    }
}

// ============================================================================
// Generation Service
// ============================================================================

/// IDs returned to the client when a generation starts
#[derive(Debug, Clone)]
pub struct StartedGeneration {
    /// ID of the persisted prompt message
    pub user_message_id: String,
    /// Pre-allocated ID of the eventual response message
    pub message_id: String,
    /// Correlation token for watching the streaming record
    pub request_id: String,
}

/// Orchestrator with its injected capabilities
///
/// Everything the orchestrator touches arrives through this struct - the
/// storage handle, the key vault, and the provider factory - so tests can
/// substitute scripted providers and observe the durable effects.
#[derive(Clone)]
pub struct GenerationService {
    database: Database,
    key_vault: Arc<KeyVault>,
    provider_factory: Arc<dyn ProviderFactory>,
    flush_policy: FlushPolicy,
    default_model: String,
    stream_max_age: Duration,
}

impl GenerationService {
    /// Create a new generation service
    #[must_use]
    pub fn new(
        database: Database,
        key_vault: Arc<KeyVault>,
        provider_factory: Arc<dyn ProviderFactory>,
        flush_policy: FlushPolicy,
        default_model: String,
        stream_max_age: Duration,
    ) -> Self {
        Self {
            database,
            key_vault,
            provider_factory,
            flush_policy,
            default_model,
            stream_max_age,
        }
    }

    fn chats(&self) -> ChatManager {
        ChatManager::new(self.database.pool().clone())
    }

    fn streams(&self) -> StreamManager {
        StreamManager::new(self.database.pool().clone())
    }

    fn credentials(&self) -> CredentialManager {
        CredentialManager::new(self.database.pool().clone())
    }

    fn ledger(&self) -> UsageLedger {
        UsageLedger::new(self.database.pool().clone())
    }

    /// Request-scoped start: validate, persist the prompt, create the record
    ///
    /// Validation failures here happen *before* any streaming record is
    /// created and reject directly - no partial state is left behind.
    ///
    /// # Errors
    ///
    /// Returns not-found for a foreign or missing chat, `invalid_input`
    /// when no usable provider key is configured, or a database error.
    pub async fn start(
        &self,
        user_id: &str,
        chat_id: &str,
        content: &str,
        model_override: Option<&str>,
    ) -> AppResult<StartedGeneration> {
        if content.trim().is_empty() {
            return Err(AppError::invalid_input("Message must not be empty"));
        }

        // Ownership: a foreign chat reads as missing, never as forbidden
        self.chats()
            .get_chat(chat_id, user_id)
            .await?
            .ok_or_else(|| AppError::not_found("Chat"))?;

        // A usable key must exist before we accept the generation
        let has_key = self
            .credentials()
            .get(user_id)
            .await?
            .is_some_and(|c| c.is_valid);
        if !has_key {
            return Err(AppError::invalid_input(
                "No provider API key configured. Add one under Settings before chatting.",
            ));
        }

        let user_message = self
            .chats()
            .add_prompt_message(chat_id, user_id, content)
            .await?;

        let request_id = Uuid::new_v4().to_string();
        let message_id = Uuid::new_v4().to_string();
        let model = model_override.unwrap_or(&self.default_model);

        self.streams()
            .create(chat_id, &request_id, &message_id, user_id, model)
            .await?;

        // Opportunistic user-scoped sweep keeps old records from piling up
        // even if the periodic sweeper is not running
        if let Err(e) = self
            .streams()
            .sweep_expired_for_user(user_id, self.stream_max_age)
            .await
        {
            warn!("Opportunistic sweep failed (ignored): {e}");
        }

        Ok(StartedGeneration {
            user_message_id: user_message.id,
            message_id,
            request_id,
        })
    }

    /// Spawn the background half of a generation
    pub fn spawn_run(&self, request_id: String, user_id: String) {
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = service.run(&request_id, &user_id).await {
                error!(request_id, "Generation task failed: {e}");
            }
        });
    }

    /// Background half: drive the upstream stream into durable storage
    ///
    /// Runs decoupled from the originating request, so ownership is
    /// re-verified from durable state before any work happens.
    ///
    /// # Errors
    ///
    /// Returns an error when the record cannot be finalized; upstream and
    /// key failures are absorbed into the record's terminal error state.
    pub async fn run(&self, request_id: &str, user_id: &str) -> AppResult<()> {
        let streams = self.streams();

        // Authorization re-check: the record must exist *for this user*
        let record = streams
            .get(request_id, user_id)
            .await?
            .ok_or_else(|| AppError::not_found("Streaming record"))?;

        // And the chat it references must still belong to them
        if self
            .chats()
            .get_chat(&record.chat_id, user_id)
            .await?
            .is_none()
        {
            streams
                .fail(request_id, user_id, "Access denied")
                .await?;
            return Err(AppError::not_found("Chat"));
        }

        let api_key = match self.decrypt_provider_key(user_id).await {
            Ok(key) => key,
            Err(e) => {
                return self
                    .abort_with_error(request_id, user_id, &record.model, &e.message)
                    .await;
            }
        };

        let provider = match self.provider_factory.create(&api_key) {
            Ok(provider) => provider,
            Err(e) => {
                return self
                    .abort_with_error(request_id, user_id, &record.model, &e.message)
                    .await;
            }
        };

        let messages = self
            .build_message_window(&record.chat_id, user_id)
            .await?;
        let request = ChatRequest::new(messages).with_model(&record.model);

        let stream = match provider.complete_stream(&request).await {
            Ok(stream) => stream,
            Err(e) => {
                return self
                    .abort_with_error(request_id, user_id, &record.model, &e.message)
                    .await;
            }
        };

        self.drive_stream(stream, request_id, user_id, &record.model)
            .await
    }

    /// Decrypt the stored provider key, invalidating it when the seal fails
    async fn decrypt_provider_key(&self, user_id: &str) -> AppResult<String> {
        let credentials = self.credentials();
        let credential = credentials
            .get(user_id)
            .await?
            .filter(|c| c.is_valid)
            .ok_or_else(|| AppError::invalid_input("No provider API key configured"))?;

        match self.key_vault.open(&credential.encrypted_key) {
            Ok(key) => Ok(key),
            Err(e) if e.code == ErrorCode::ConfigInvalid => {
                // Rotated/corrupted master key: force explicit re-entry
                // rather than silently failing every generation the same way
                warn!(user_id, "Stored provider key failed to decrypt; marking invalid");
                credentials.mark_invalid(user_id).await?;
                Err(AppError::new(
                    ErrorCode::ConfigInvalid,
                    "Stored API key could not be decrypted. Please re-enter your provider key.",
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Assemble the upstream message list: system prompt, then the trailing
    /// window of transcript turns ending with the newest user message
    async fn build_message_window(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> AppResult<Vec<ChatMessage>> {
        let history = self
            .chats()
            .get_recent_messages(chat_id, user_id, CONTEXT_WINDOW_MESSAGES + 1)
            .await?;

        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(SYSTEM_PROMPT));
        for msg in &history {
            match msg.role {
                TranscriptRole::Prompt => messages.push(ChatMessage::user(&msg.content)),
                TranscriptRole::Response => messages.push(ChatMessage::assistant(&msg.content)),
            }
        }

        Ok(messages)
    }

    /// Consume the upstream stream, coalescing durable writes
    ///
    /// The loop selects between the next upstream chunk and a flush tick.
    /// The tick path is what makes the time half of the flush policy real
    /// (a slow trickle of tokens still flushes on the interval) and what
    /// keeps cancellation responsive while the upstream stalls - the
    /// expensive case server-side cancellation exists for.
    async fn drive_stream(
        &self,
        mut stream: crate::llm::ChatStream,
        request_id: &str,
        user_id: &str,
        model: &str,
    ) -> AppResult<()> {
        let streams = self.streams();

        let mut full_content = String::new();
        let mut pending = String::new();
        let mut usage: Option<TokenUsage> = None;
        let mut finish_reason: Option<String> = None;
        let mut last_flush = Instant::now();
        let mut cancelled = false;

        let tick_period = self.flush_policy.min_interval.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(tick_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                chunk_result = stream.next() => {
                    let Some(chunk_result) = chunk_result else {
                        break;
                    };

                    let chunk = match chunk_result {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            // Flush the residue so the partial content
                            // survives, then finalize as error
                            if !pending.is_empty() {
                                if let Err(flush_err) = streams
                                    .append_or_replace(request_id, user_id, &pending, true)
                                    .await
                                {
                                    warn!(request_id, "Residue flush failed: {flush_err}");
                                }
                            }
                            return self
                                .abort_with_error(request_id, user_id, model, &e.message)
                                .await;
                        }
                    };

                    if !chunk.delta.is_empty() {
                        full_content.push_str(&chunk.delta);
                        pending.push_str(&chunk.delta);
                    }

                    // Usage arrives once, near the end, on whichever frame
                    // carries it
                    if chunk.usage.is_some() {
                        usage = chunk.usage;
                    }
                    if chunk.is_final {
                        finish_reason = chunk.finish_reason.clone();
                    }

                    if self
                        .flush_policy
                        .should_flush(pending.len(), last_flush.elapsed())
                    {
                        streams
                            .append_or_replace(request_id, user_id, &pending, true)
                            .await?;
                        pending.clear();
                        last_flush = Instant::now();

                        // Cooperative cancellation, polled between flushes
                        if streams.is_cancel_requested(request_id, user_id).await? {
                            cancelled = true;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if streams.is_cancel_requested(request_id, user_id).await? {
                        cancelled = true;
                        break;
                    }

                    if self
                        .flush_policy
                        .should_flush(pending.len(), last_flush.elapsed())
                    {
                        streams
                            .append_or_replace(request_id, user_id, &pending, true)
                            .await?;
                        pending.clear();
                        last_flush = Instant::now();
                    }
                }
            }
        }

        if cancelled {
            debug!(request_id, "Aborting upstream read after cancellation");
            finish_reason = Some("cancelled".to_owned());
        }

        // Stream ended (or was cancelled): finalize with the full
        // accumulated content; any buffered residue is included
        let message = streams
            .complete(
                request_id,
                user_id,
                &full_content,
                usage,
                finish_reason.as_deref(),
            )
            .await?;

        let cost = message.ai_metadata.as_ref().map_or(0.0, |m| m.cost);
        let effective = usage.unwrap_or(TokenUsage {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
        });
        self.ledger()
            .record_best_effort(&UsageEvent {
                user_id: user_id.to_owned(),
                request_id: Some(request_id.to_owned()),
                model: model.to_owned(),
                prompt_tokens: effective.prompt_tokens,
                completion_tokens: effective.completion_tokens,
                total_tokens: effective.total_tokens,
                cost,
                success: true,
                error_message: None,
            })
            .await;

        info!(request_id, cancelled, "Generation finalized");
        Ok(())
    }

    /// Finalize a generation as failed and record the failure to the ledger
    async fn abort_with_error(
        &self,
        request_id: &str,
        user_id: &str,
        model: &str,
        error_text: &str,
    ) -> AppResult<()> {
        self.streams().fail(request_id, user_id, error_text).await?;

        self.ledger()
            .record_best_effort(&UsageEvent::failure(
                user_id, request_id, model, error_text,
            ))
            .await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_policy_holds_below_both_thresholds() {
        let policy = FlushPolicy {
            min_interval: Duration::from_millis(50),
            min_chars: 3,
        };
        assert!(!policy.should_flush(1, Duration::from_millis(10)));
        assert!(!policy.should_flush(2, Duration::from_millis(49)));
    }

    #[test]
    fn test_flush_policy_trips_on_either_threshold() {
        let policy = FlushPolicy {
            min_interval: Duration::from_millis(50),
            min_chars: 3,
        };
        // Character count alone
        assert!(policy.should_flush(3, Duration::from_millis(0)));
        // Elapsed time alone
        assert!(policy.should_flush(1, Duration::from_millis(50)));
    }

    #[test]
    fn test_flush_policy_never_flushes_empty_buffer() {
        let policy = FlushPolicy::default();
        assert!(!policy.should_flush(0, Duration::from_secs(60)));
    }
}
