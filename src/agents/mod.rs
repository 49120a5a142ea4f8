//! Sub-agents
//!
//! Each sub-agent is a specialized producer invoked as a tool by the
//! orchestrator. The uniform contract is schema-typed JSON in, schema-typed
//! JSON out — unary via [`Agent::execute`], streaming via
//! [`Agent::execute_streaming`] — plus a legacy channel of [`AgentResponse`]
//! chunks that feeds the cultural grounding pipeline directly.
//!
//! Agents own no session state; a producer lives for the duration of one
//! tool call.

pub mod cultural;
pub mod riddle;
pub mod story;
pub mod visual;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::ready;
use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use tracing::warn;

use crate::a2a::ChunkStream;
use crate::textgen::TextModel;
use crate::types::AgentResponse;
use crate::{Error, Result};

/// Legacy stream of response chunks for the grounding pipeline.
pub type ResponseStream = Pin<Box<dyn Stream<Item = AgentResponse> + Send>>;

/// Filler sent to the user when a generation collapses mid-stream.
pub(crate) const RECOVERY_LINE: &str =
    "I seem to have lost my train of thought... Let me try again.";

/// Uniform producer contract for sub-agents.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Short agent name used in logs, breakers, and outbound messages.
    fn name(&self) -> &'static str;

    /// Name of the schema this agent's outputs are validated against.
    fn output_schema(&self) -> Option<&'static str> {
        None
    }

    /// Unary schema-typed execution.
    async fn execute(&self, _input: Value) -> Result<Value> {
        Err(Error::agent(format!(
            "{} does not implement execute()",
            self.name()
        )))
    }

    /// Streaming schema-typed execution: a lazy, finite, non-restartable
    /// sequence of output chunks.
    async fn execute_streaming(&self, _input: Value) -> Result<ChunkStream> {
        Err(Error::agent(format!(
            "{} does not implement execute_streaming()",
            self.name()
        )))
    }
}

/// Shared helper: stream raw model text as [`AgentResponse`] chunks.
///
/// A mid-stream model failure degrades to a user-readable recovery line
/// rather than tearing the turn down; the stream always terminates with a
/// final marker.
pub(crate) async fn stream_from_model(
    model: Arc<dyn TextModel>,
    prompt: String,
    system_instruction: String,
    agent_name: &'static str,
) -> ResponseStream {
    let text_stream = match model.stream_text(&prompt, &system_instruction).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(agent = agent_name, %e, "text generation failed to start");
            return Box::pin(futures::stream::iter(vec![
                AgentResponse {
                    content: RECOVERY_LINE.to_string(),
                    is_final: true,
                    ..AgentResponse::new(agent_name, "")
                },
                AgentResponse::final_marker(agent_name),
            ]));
        }
    };

    let mapped = text_stream.scan(false, move |errored, delta| {
        if *errored {
            return ready(None);
        }
        let item = match delta {
            Ok(text) => AgentResponse::new(agent_name, text),
            Err(e) => {
                *errored = true;
                warn!(agent = agent_name, %e, "text generation failed mid-stream");
                AgentResponse {
                    content: RECOVERY_LINE.to_string(),
                    is_final: true,
                    ..AgentResponse::new(agent_name, "")
                }
            }
        };
        ready(Some(item))
    });

    Box::pin(mapped.chain(futures::stream::once(ready(AgentResponse::final_marker(
        agent_name,
    )))))
}

/// Strip markdown code fences from model output before JSON parsing.
pub(crate) fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    trimmed
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Find top-level `{...}` spans in free text.
///
/// Salvage path for models that wrap JSON in prose: each non-nested object
/// span is returned verbatim for the caller to try parsing.
pub(crate) fn find_json_objects(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        spans.push(&text[start..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::textgen::TextStream;

    struct ScriptedModel {
        deltas: Vec<Result<String>>,
    }

    #[async_trait]
    impl TextModel for ScriptedModel {
        async fn stream_text(&self, _: &str, _: &str) -> Result<TextStream> {
            let items: Vec<Result<String>> = self
                .deltas
                .iter()
                .map(|d| match d {
                    Ok(s) => Ok(s.clone()),
                    Err(_) => Err(Error::stream("scripted failure")),
                })
                .collect();
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    #[tokio::test]
    async fn test_stream_from_model_happy_path() {
        let model = Arc::new(ScriptedModel {
            deltas: vec![Ok("Alo ".to_string()), Ok("o!".to_string())],
        });
        let stream = stream_from_model(model, "p".into(), "s".into(), "story").await;
        let chunks: Vec<AgentResponse> = stream.collect().await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].content, "Alo ");
        assert_eq!(chunks[1].content, "o!");
        assert!(chunks[2].is_final);
        assert!(chunks[2].content.is_empty());
    }

    #[tokio::test]
    async fn test_stream_from_model_degrades_on_error() {
        let model = Arc::new(ScriptedModel {
            deltas: vec![Ok("Once".to_string()), Err(Error::stream("x"))],
        });
        let stream = stream_from_model(model, "p".into(), "s".into(), "story").await;
        let chunks: Vec<AgentResponse> = stream.collect().await;

        assert_eq!(chunks[0].content, "Once");
        assert_eq!(chunks[1].content, RECOVERY_LINE);
        assert!(chunks[1].is_final);
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  ```\n[1,2]\n```  "), "[1,2]");
    }

    #[test]
    fn test_find_json_objects() {
        let text = "noise {\"text\": \"a\"} more {\"text\": \"b}\"} tail";
        let spans = find_json_objects(text);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0], "{\"text\": \"a\"}");
        // A brace inside a string must not end the span early.
        assert_eq!(spans[1], "{\"text\": \"b}\"}");
    }

    #[test]
    fn test_find_json_objects_none() {
        assert!(find_json_objects("no braces here").is_empty());
    }
}
