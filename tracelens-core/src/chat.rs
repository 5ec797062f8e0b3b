//! Chat module for Tracelens — streaming chat-completion client
//!
//! Drives one streaming POST against an OpenAI-style chat-completions
//! endpoint and decodes the newline-delimited `data:` frames incrementally:
//! - **DeltaDecoder** — pure state machine over a growing line buffer;
//!   tolerates frames split across deliveries and never re-consumes bytes
//! - **ChatClient** — issues the request and exposes the decoded content
//!   deltas as an ordered `DeltaStream`; dropping the stream aborts the
//!   underlying connection

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LlmConfig;

/// Role framing sent as the system message of every analysis request.
pub const SYSTEM_PROMPT: &str = "You are a professional systems architect and \
troubleshooting expert, skilled at analyzing distributed call-chain logs.";

/// Stream termination sentinel on the wire.
const DONE_SENTINEL: &str = "[DONE]";

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Missing LLM configuration: {0} — set it in [llm] or via TRACELENS_API_KEY")]
    MissingConfig(&'static str),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Chat API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Failed to decode stream frame: {source} (raw: {fragment:?})")]
    Decode {
        fragment: String,
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// Config
// ============================================================================

/// Chat client configuration, resolved from `[llm]` plus the environment.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub enable_thinking: bool,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub timeout_seconds: u64,
}

impl From<&LlmConfig> for ChatConfig {
    fn from(llm: &LlmConfig) -> Self {
        Self {
            api_key: llm.resolved_api_key(),
            endpoint: llm.endpoint.clone(),
            model: llm.model.clone(),
            enable_thinking: llm.enable_thinking,
            temperature: llm.temperature,
            top_p: llm.top_p,
            frequency_penalty: llm.frequency_penalty,
            timeout_seconds: llm.timeout_seconds,
        }
    }
}

// ============================================================================
// Wire shapes (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    top_p: f32,
    frequency_penalty: f32,
    stream: bool,
    chat_template_kwargs: ChatTemplateKwargs,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatTemplateKwargs {
    enable_thinking: bool,
}

#[derive(Debug, Deserialize)]
struct StreamFrame {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

// ============================================================================
// DeltaDecoder
// ============================================================================

/// Incremental decoder for the newline-delimited `data:` frame protocol.
///
/// Each delivered chunk is appended to an internal byte buffer exactly once;
/// complete lines are drained from the buffer front, so a frame split across
/// deliveries is reassembled and no byte is processed twice. The buffer holds
/// raw bytes because a delivery boundary may fall inside a UTF-8 sequence;
/// decoding happens per complete line. A frame that is neither the `[DONE]`
/// sentinel nor valid JSON is fatal: the decoder emits one
/// `ChatError::Decode` and ignores everything after it.
#[derive(Debug, Default)]
pub struct DeltaDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl DeltaDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the sentinel was seen or a fatal decode error occurred.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one incremental delivery. Returns the content deltas completed by
    /// this delivery, in arrival order; a fatal decode failure is the last
    /// element and terminates the decoder.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<String, ChatError>> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }

        self.buffer.extend_from_slice(chunk);

        while let Some(boundary) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=boundary).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim();

            let Some(payload) = line.strip_prefix("data: ") else {
                continue;
            };

            if payload == DONE_SENTINEL {
                self.done = true;
                return events;
            }

            match serde_json::from_str::<StreamFrame>(payload) {
                Ok(frame) => {
                    let content = frame
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|choice| choice.delta.content);
                    if let Some(content) = content {
                        if !content.is_empty() {
                            events.push(Ok(content));
                        }
                    }
                }
                Err(source) => {
                    self.done = true;
                    events.push(Err(ChatError::Decode {
                        fragment: payload.to_string(),
                        source,
                    }));
                    return events;
                }
            }
        }

        events
    }
}

// ============================================================================
// DeltaStream
// ============================================================================

type BodyStream = BoxStream<'static, reqwest::Result<Bytes>>;

struct DecodeState {
    body: BodyStream,
    decoder: DeltaDecoder,
    pending: VecDeque<Result<String, ChatError>>,
    finished: bool,
}

/// Ordered, finite, non-restartable sequence of content deltas. Dropping it
/// drops the transport, which aborts the in-flight request.
pub struct DeltaStream {
    inner: BoxStream<'static, Result<String, ChatError>>,
}

impl DeltaStream {
    fn from_body(body: BodyStream) -> Self {
        let state = DecodeState {
            body,
            decoder: DeltaDecoder::new(),
            pending: VecDeque::new(),
            finished: false,
        };

        let inner = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((event, state));
                }
                if state.finished {
                    return None;
                }
                match state.body.next().await {
                    Some(Ok(chunk)) => {
                        state.pending.extend(state.decoder.push(&chunk));
                        if state.decoder.is_done() {
                            state.finished = true;
                        }
                    }
                    Some(Err(e)) => {
                        state.finished = true;
                        state.pending.push_back(Err(ChatError::Http(e)));
                    }
                    // End-of-body without the sentinel is normal completion.
                    None => state.finished = true,
                }
            }
        })
        .boxed();

        Self { inner }
    }

    /// A pre-scripted stream, for exercising consumers without a transport.
    pub fn from_results(events: Vec<Result<String, ChatError>>) -> Self {
        Self {
            inner: futures::stream::iter(events).boxed(),
        }
    }
}

impl Stream for DeltaStream {
    type Item = Result<String, ChatError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

// ============================================================================
// ChatClient
// ============================================================================

/// Abstraction over the analysis model, so orchestration can be exercised
/// against a scripted backend.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    async fn stream_analysis(&self, prompt: &str) -> Result<DeltaStream, ChatError>;
}

/// Streaming chat-completions client.
#[derive(Debug, Clone)]
pub struct ChatClient {
    client: Client,
    config: ChatConfig,
}

impl ChatClient {
    /// Build a client. Fails with `MissingConfig` before any network call
    /// when api_key, endpoint, or model is absent.
    pub fn new(config: ChatConfig) -> Result<Self, ChatError> {
        if config.api_key.is_empty() {
            return Err(ChatError::MissingConfig("api_key"));
        }
        if config.endpoint.is_empty() {
            return Err(ChatError::MissingConfig("endpoint"));
        }
        if config.model.is_empty() {
            return Err(ChatError::MissingConfig("model"));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl AnalysisBackend for ChatClient {
    async fn stream_analysis(&self, prompt: &str) -> Result<DeltaStream, ChatError> {
        let url = format!("{}/v1/chat/completions", self.config.endpoint);

        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            frequency_penalty: self.config.frequency_penalty,
            stream: true,
            chat_template_kwargs: ChatTemplateKwargs {
                enable_thinking: self.config.enable_thinking,
            },
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), body = %body, "Chat API error");
            return Err(ChatError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(DeltaStream::from_body(response.bytes_stream().boxed()))
    }
}

// ============================================================================
// TESTS
// ============================================================================
