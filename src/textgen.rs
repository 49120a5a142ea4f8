//! Streaming text-model client for sub-agents
//!
//! Sub-agents (story, riddle, cultural) generate through a text model rather
//! than the live session; this module provides the [`TextModel`] seam plus a
//! concrete client for OpenAI-compatible streaming endpoints.
//!
//! The wire format is SSE: each event line is `data: {json}` carrying a delta
//! chunk, and the stream ends with `data: [DONE]`. Only the text deltas are
//! surfaced; the sub-agents do their own structure parsing on top.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Settings;
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::{Error, Result};

/// Stream of text deltas from the model.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Seam over the text-generation backend.
///
/// One concrete implementation talks HTTP; tests substitute scripted mocks.
#[async_trait]
pub trait TextModel: Send + Sync {
    /// Stream a generation for `prompt` under `system_instruction`.
    async fn stream_text(&self, prompt: &str, system_instruction: &str) -> Result<TextStream>;

    /// Convenience: run a generation to completion and return the full text.
    async fn generate(&self, prompt: &str, system_instruction: &str) -> Result<String> {
        let mut stream = self.stream_text(prompt, system_instruction).await?;
        let mut out = String::new();
        while let Some(delta) = stream.next().await {
            out.push_str(&delta?);
        }
        Ok(out)
    }
}

// ============================================================================
// WIRE TYPES (OpenAI-compatible chat completions)
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    delta: ChatDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Extract text deltas from one SSE transport chunk.
///
/// A transport chunk may contain zero, one, or several `data:` lines; the
/// `[DONE]` sentinel is skipped. Unparseable payloads surface as stream
/// errors rather than being silently eaten.
fn parse_sse_chunk(text: &str) -> Vec<Result<String>> {
    let mut out = Vec::new();
    for line in text.lines() {
        let Some(payload) = line.strip_prefix("data: ") else {
            continue;
        };
        if payload == "[DONE]" {
            continue;
        }
        match serde_json::from_str::<ChatChunk>(payload) {
            Ok(chunk) => {
                for choice in chunk.choices {
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            out.push(Ok(content));
                        }
                    }
                    if choice.finish_reason.is_some() {
                        debug!("text stream finished");
                    }
                }
            }
            Err(e) => out.push(Err(Error::stream(format!("failed to parse chunk: {}", e)))),
        }
    }
    out
}

// ============================================================================
// HTTP CLIENT
// ============================================================================

/// Streaming client for an OpenAI-compatible chat-completions endpoint.
pub struct HttpTextClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    retry: RetryConfig,
}

impl HttpTextClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            http,
            base_url: settings.text_model_url.clone(),
            model: settings.text_model.clone(),
            temperature: 0.8,
            max_tokens: Some(2048),
            retry: RetryConfig::default(),
        })
    }

    async fn open_stream(&self, prompt: &str, system_instruction: &str) -> Result<reqwest::Response> {
        let mut messages = Vec::new();
        if !system_instruction.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: system_instruction.to_string(),
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt.to_string(),
        });

        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            stream: true,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(Error::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::live_model(format!("{}: {}", status, body)));
        }

        Ok(response)
    }
}

#[async_trait]
impl TextModel for HttpTextClient {
    async fn stream_text(&self, prompt: &str, system_instruction: &str) -> Result<TextStream> {
        // Retry only the connection phase; once bytes flow, errors surface
        // in-stream and the upstream generator cannot be replayed anyway.
        let response = retry_with_backoff(self.retry.clone(), || {
            self.open_stream(prompt, system_instruction)
        })
        .await?;

        let stream = response
            .bytes_stream()
            .map(|result| match result.map_err(Error::Http) {
                Ok(bytes) => parse_sse_chunk(&String::from_utf8_lossy(&bytes)),
                Err(e) => vec![Err(e)],
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(stream))
    }
}

// ============================================================================
// CLIENT POOL
// ============================================================================

/// Round-robin pool of pre-warmed text clients.
///
/// `reqwest` clients keep their own connection pools; warming several spreads
/// concurrent sub-agent calls over distinct pools so one slow endpoint
/// connection does not serialize every agent in the process.
pub struct TextClientPool {
    clients: Vec<Arc<HttpTextClient>>,
    next: AtomicUsize,
}

impl TextClientPool {
    pub fn warm(settings: &Settings) -> Result<Self> {
        let size = settings.pool_size.max(1);
        let mut clients = Vec::with_capacity(size);
        for _ in 0..size {
            clients.push(Arc::new(HttpTextClient::new(settings)?));
        }
        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
        })
    }

    fn pick(&self) -> Arc<HttpTextClient> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        self.clients[idx].clone()
    }
}

#[async_trait]
impl TextModel for TextClientPool {
    async fn stream_text(&self, prompt: &str, system_instruction: &str) -> Result<TextStream> {
        self.pick().stream_text(prompt, system_instruction).await
    }
}
