// ABOUTME: Polling loop converting streaming-record snapshots into discrete UI update events
// ABOUTME: Handles change detection, the startup 404 race, error caps, timeout, and cancellation
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! Stream poller
//!
//! Exit paths, each distinct and terminal:
//!
//! 1. terminal server status (`completed`/`error`) → completion event;
//! 2. authentication failure (401) → stop immediately, no retry;
//! 3. N consecutive transport/HTTP errors → visible error appended to the
//!    content, stop before issuing attempt N+1;
//! 4. absolute wall-clock timeout from poll start → timeout notice
//!    appended, stop, even if no errors occurred;
//! 5. user cancellation → "cancelled by user" marker appended, stop (and
//!    the cancel is propagated to the server so the generation stops
//!    incurring upstream cost).
//!
//! A 404 is explicitly *not* an error: the record may not exist yet for a
//! brief window after the client starts polling. The poller keeps waiting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::llm::TokenUsage;

/// Marker prefixed to inline failure notices appended to content
pub const ERROR_MARKER: &str = "⚠️ ";

/// Notice appended when the transport error cap is reached
const CONNECTION_LOST_NOTICE: &str = "Connection error - the response may be incomplete.";

/// Notice appended when the wall-clock timeout fires
const TIMEOUT_NOTICE: &str = "Response timed out.";

/// Marker appended on user cancellation
const CANCELLED_NOTICE: &str = "Cancelled by user.";

// ============================================================================
// Configuration
// ============================================================================

/// Poller configuration
#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    /// Fixed polling interval; no exponential backoff on success
    pub interval: Duration,
    /// Consecutive transport/HTTP errors tolerated before giving up
    pub max_consecutive_errors: u32,
    /// Absolute wall-clock ceiling from poll start
    pub timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(300),
            max_consecutive_errors: 5,
            timeout: Duration::from_secs(120),
        }
    }
}

/// What the poller watches
#[derive(Debug, Clone)]
pub enum WatchTarget {
    /// A streaming record by its correlation token
    Request(String),
    /// A message projection by its pre-allocated ID
    Message(String),
}

// ============================================================================
// Events
// ============================================================================

/// Discrete events emitted by the poller
#[derive(Debug, Clone)]
pub enum PollerEvent {
    /// The observed state advanced; fired exactly once per advance
    Update {
        /// Full accumulated content (append-safe: extends the previous)
        content: String,
        /// Freshness marker of this snapshot
        updated_at: String,
    },
    /// Terminal: the generation completed
    Completed {
        /// Final content
        content: String,
        /// Usage totals when the server recorded them
        usage: Option<TokenUsage>,
    },
    /// Terminal: the generation failed server-side
    Failed {
        /// Content with the inline error appended
        content: String,
        /// The server-reported error
        error: String,
    },
    /// Terminal: authentication was rejected; polling stopped immediately
    Unauthorized,
    /// Terminal: too many consecutive transport errors
    ConnectionLost {
        /// Content with the connection notice appended
        content: String,
    },
    /// Terminal: the wall-clock timeout fired
    TimedOut {
        /// Content with the timeout notice appended
        content: String,
    },
    /// Terminal: the user cancelled the watch
    Cancelled {
        /// Content with the cancellation marker appended
        content: String,
    },
}

impl PollerEvent {
    /// Whether this event ends the watch
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Update { .. })
    }
}

// ============================================================================
// Snapshot fetching
// ============================================================================

/// Unified view of one fetched state snapshot
#[derive(Debug, Clone)]
struct Snapshot {
    content: String,
    updated_at: String,
    terminal: Option<Terminal>,
}

#[derive(Debug, Clone)]
enum Terminal {
    Completed { usage: Option<TokenUsage> },
    Error { error: String },
}

/// Failure modes of one fetch attempt
enum FetchError {
    /// Record not created yet - keep waiting, not an error
    NotFoundYet,
    /// 401 - stop immediately
    Unauthorized,
    /// Network error or 5xx - counts toward the consecutive-error cap
    Transport(String),
}

/// Wire shape of the record watch route
#[derive(Debug, Deserialize)]
struct WatchWire {
    content: String,
    status: String,
    error: Option<String>,
    usage: Option<TokenUsage>,
    updated_at: String,
}

/// Wire shape of the message projection route
#[derive(Debug, Deserialize)]
struct MessageWire {
    content: String,
    is_streaming: bool,
    error: Option<String>,
    updated_at: String,
    ai_metadata: Option<MessageMetadataWire>,
}

#[derive(Debug, Deserialize)]
struct MessageMetadataWire {
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
}

// ============================================================================
// Stream Poller
// ============================================================================

/// Poller for one watch target
pub struct StreamPoller {
    http: reqwest::Client,
    base_url: String,
    token: String,
    config: PollerConfig,
}

impl StreamPoller {
    /// Create a new poller against a server base URL with a bearer token
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, config: PollerConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
            config,
        }
    }

    fn target_url(&self, target: &WatchTarget) -> String {
        let base = self.base_url.trim_end_matches('/');
        match target {
            WatchTarget::Request(request_id) => {
                format!("{base}/api/chat/streams/watch?request_id={request_id}")
            }
            WatchTarget::Message(message_id) => format!("{base}/api/chat/messages/{message_id}"),
        }
    }

    /// Fetch one snapshot of the target
    async fn fetch(&self, target: &WatchTarget) -> Result<Snapshot, FetchError> {
        let response = self
            .http
            .get(self.target_url(target))
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        match response.status().as_u16() {
            401 => return Err(FetchError::Unauthorized),
            404 => return Err(FetchError::NotFoundYet),
            s if s >= 400 => return Err(FetchError::Transport(format!("HTTP {s}"))),
            _ => {}
        }

        match target {
            WatchTarget::Request(_) => {
                let wire: WatchWire = response
                    .json()
                    .await
                    .map_err(|e| FetchError::Transport(e.to_string()))?;

                let terminal = match wire.status.as_str() {
                    "completed" => Some(Terminal::Completed { usage: wire.usage }),
                    "error" => Some(Terminal::Error {
                        error: wire.error.unwrap_or_else(|| "Generation failed".to_owned()),
                    }),
                    _ => None,
                };

                Ok(Snapshot {
                    content: wire.content,
                    updated_at: wire.updated_at,
                    terminal,
                })
            }
            WatchTarget::Message(_) => {
                let wire: MessageWire = response
                    .json()
                    .await
                    .map_err(|e| FetchError::Transport(e.to_string()))?;

                let terminal = if let Some(error) = wire.error {
                    Some(Terminal::Error { error })
                } else if wire.is_streaming {
                    None
                } else {
                    let usage = wire.ai_metadata.map(|m| TokenUsage {
                        prompt_tokens: u32::try_from(m.prompt_tokens).unwrap_or(0),
                        completion_tokens: u32::try_from(m.completion_tokens).unwrap_or(0),
                        total_tokens: u32::try_from(m.total_tokens).unwrap_or(0),
                    });
                    Some(Terminal::Completed { usage })
                };

                Ok(Snapshot {
                    content: wire.content,
                    updated_at: wire.updated_at,
                    terminal,
                })
            }
        }
    }

    /// Run the watch loop, emitting events until a terminal event fires
    ///
    /// The returned receiver yields zero or more `Update` events followed
    /// by exactly one terminal event.
    #[must_use]
    pub fn watch(
        self,
        target: WatchTarget,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<PollerEvent> {
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let event = self.poll_until_terminal(&target, &cancel, &tx).await;
            // Terminal event delivery is best-effort: the consumer may
            // have dropped the receiver already
            if tx.send(event).await.is_err() {
                debug!("Poller consumer dropped before terminal event");
            }
        });

        rx
    }

    /// Core loop: returns the terminal event
    async fn poll_until_terminal(
        &self,
        target: &WatchTarget,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<PollerEvent>,
    ) -> PollerEvent {
        let started = Instant::now();
        let deadline = started + self.config.timeout;
        let mut last_updated_at: Option<String> = None;
        let mut content = String::new();
        let mut consecutive_errors: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return PollerEvent::Cancelled {
                    content: append_notice(&content, CANCELLED_NOTICE),
                };
            }

            // Absolute wall-clock ceiling, independent of error history
            if Instant::now() >= deadline {
                return PollerEvent::TimedOut {
                    content: append_notice(&content, TIMEOUT_NOTICE),
                };
            }

            match self.fetch(target).await {
                Ok(snapshot) => {
                    consecutive_errors = 0;

                    // Change detection: only react when the freshness
                    // marker advanced; an unchanged fetch emits nothing
                    let advanced = last_updated_at.as_deref() != Some(&snapshot.updated_at);
                    if advanced {
                        last_updated_at = Some(snapshot.updated_at.clone());
                        content.clone_from(&snapshot.content);

                        if let Some(terminal) = snapshot.terminal {
                            return match terminal {
                                Terminal::Completed { usage } => {
                                    PollerEvent::Completed { content, usage }
                                }
                                Terminal::Error { error } => {
                                    let content = append_notice(&content, &error);
                                    PollerEvent::Failed { content, error }
                                }
                            };
                        }

                        let update = PollerEvent::Update {
                            content: content.clone(),
                            updated_at: snapshot.updated_at,
                        };
                        if tx.send(update).await.is_err() {
                            // Consumer went away; treat as cancellation
                            return PollerEvent::Cancelled {
                                content: append_notice(&content, CANCELLED_NOTICE),
                            };
                        }
                    }
                }
                // Not created yet: the server may still be setting up the
                // record. Keep waiting; does not count toward the cap.
                Err(FetchError::NotFoundYet) => {
                    debug!("Record not found yet; continuing to poll");
                }
                Err(FetchError::Unauthorized) => {
                    return PollerEvent::Unauthorized;
                }
                Err(FetchError::Transport(e)) => {
                    consecutive_errors += 1;
                    warn!(
                        consecutive_errors,
                        "Poll attempt failed (transport): {e}"
                    );
                    if consecutive_errors >= self.config.max_consecutive_errors {
                        // Stop before issuing attempt N+1
                        return PollerEvent::ConnectionLost {
                            content: append_notice(&content, CONNECTION_LOST_NOTICE),
                        };
                    }
                }
            }

            // Sleep the fixed interval, but wake immediately on cancel
            tokio::select! {
                () = tokio::time::sleep(self.config.interval) => {}
                () = cancel.cancelled() => {}
            }
        }
    }
}

/// Append an inline notice to displayed content with the error marker
fn append_notice(content: &str, notice: &str) -> String {
    if content.is_empty() {
        format!("{ERROR_MARKER}{notice}")
    } else {
        format!("{content}\n\n{ERROR_MARKER}{notice}")
    }
}

// ============================================================================
// Chat Stream Client
// ============================================================================

/// One client session: at most one active stream watch at a time
///
/// Starting a new stream while one is active is rejected, not queued.
/// Cancellation is propagated to the server's cancel endpoint so the
/// generation stops incurring upstream cost, then stops the local poller.
pub struct ChatStreamClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    config: PollerConfig,
    active: Arc<AtomicBool>,
    // Replaced with a fresh token on every start so an earlier cancel
    // cannot poison the next stream
    cancel: std::sync::Mutex<CancellationToken>,
    active_request_id: std::sync::Mutex<Option<String>>,
}

impl ChatStreamClient {
    /// Create a new client session
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, config: PollerConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
            config,
            active: Arc::new(AtomicBool::new(false)),
            cancel: std::sync::Mutex::new(CancellationToken::new()),
            active_request_id: std::sync::Mutex::new(None),
        }
    }

    /// Whether a stream watch is currently active
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Start watching a stream
    ///
    /// # Errors
    ///
    /// Returns `ResourceConflict` if a watch is already active for this
    /// session.
    pub fn start_stream(&self, target: WatchTarget) -> AppResult<mpsc::Receiver<PollerEvent>> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::new(
                crate::errors::ErrorCode::ResourceConflict,
                "A stream is already active for this session",
            ));
        }

        if let WatchTarget::Request(ref request_id) = target {
            if let Ok(mut slot) = self.active_request_id.lock() {
                *slot = Some(request_id.clone());
            }
        }

        let token = CancellationToken::new();
        if let Ok(mut slot) = self.cancel.lock() {
            *slot = token.clone();
        }

        let poller = StreamPoller::new(self.base_url.clone(), self.token.clone(), self.config);
        let inner = poller.watch(target, token);

        // Wrap the receiver so the active flag clears when the terminal
        // event has been observed
        let (tx, rx) = mpsc::channel(32);
        let active = Arc::clone(&self.active);
        let mut inner = inner;
        tokio::spawn(async move {
            while let Some(event) = inner.recv().await {
                let terminal = event.is_terminal();
                if tx.send(event).await.is_err() {
                    break;
                }
                if terminal {
                    break;
                }
            }
            active.store(false, Ordering::SeqCst);
        });

        Ok(rx)
    }

    /// Cancel the active watch and propagate the cancel to the server
    pub async fn cancel_stream(&self) {
        let request_id = self
            .active_request_id
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());

        // Server-side cooperative cancel, best-effort: the local stop must
        // not depend on the server being reachable
        if let Some(request_id) = request_id {
            let url = format!(
                "{}/api/chat/streams/{request_id}/cancel",
                self.base_url.trim_end_matches('/')
            );
            let result = self
                .http
                .post(url)
                .header("Authorization", format!("Bearer {}", self.token))
                .send()
                .await;
            if let Err(e) = result {
                warn!("Server-side cancel failed (ignored): {e}");
            }
        }

        if let Ok(slot) = self.cancel.lock() {
            slot.cancel();
        }
    }
}
