//! Story agent
//!
//! Generates oral-tradition stories as a stream of `StoryChunk` objects.
//! Every cultural assertion the text makes must be declared in
//! `cultural_claims[]` so the grounding validator can check it.
//!
//! Two output paths:
//! - schema-typed: [`StoryAgent::execute_streaming`] yields validated
//!   `StoryChunk` dicts (invalid ones are minimally repaired)
//! - legacy: [`StoryAgent::stream_legacy`] buffers raw model text into
//!   natural chunk boundaries and extracts `[VISUAL: ...]` markers into the
//!   side field, stripping them from the user-visible text

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use super::{Agent, ResponseStream, find_json_objects, strip_code_fences};
use crate::a2a::ChunkStream;
use crate::schema::registry;
use crate::textgen::TextModel;
use crate::types::{AgentRequest, AgentResponse};
use crate::Result;

/// Yield a chunk once the buffer passes this many chars at a sentence end.
const SOFT_BOUNDARY_CHARS: usize = 80;
/// Hard chunk cap regardless of sentence structure.
const HARD_BOUNDARY_CHARS: usize = 300;

const SYSTEM_INSTRUCTION: &str = "\
You are a master storyteller in the oral tradition. Open with the \
traditional formula of the named culture, weave in a genuine proverb, \
include a call-and-response moment marked [CALL_RESPONSE], and close with \
the tradition's closing formula. Mark scene transitions with [SCENE_BREAK] \
and visually rich moments with [VISUAL: brief description]. Speak as if to \
a gathered audience; never attribute material to a culture it does not \
belong to, and prefix uncertain claims with 'In some tellings...'.";

const STRUCTURED_INSTRUCTION: &str = "\
Generate story chunks as JSON objects with fields: text, culture, \
cultural_claims (array of {claim, category} where category is one of \
proverb|custom|character|location|language|historical), optional \
scene_description, and is_final. Every cultural assertion in the text MUST \
appear in cultural_claims. Respond ONLY with valid JSON, no markdown.";

/// Streaming story producer.
pub struct StoryAgent {
    model: Arc<dyn TextModel>,
}

impl StoryAgent {
    pub fn new(model: Arc<dyn TextModel>) -> Self {
        Self { model }
    }

    /// Legacy path: raw model text chunked at natural boundaries, visual
    /// markers extracted, final marker at the end.
    pub async fn stream_legacy(&self, request: &AgentRequest) -> ResponseStream {
        let prompt = build_prompt(request);
        info!(
            culture = request.culture.as_deref().unwrap_or("unspecified"),
            theme = request.theme.as_deref().unwrap_or("unspecified"),
            "generating story"
        );

        let model = self.model.clone();
        let (tx, rx) = mpsc::channel::<AgentResponse>(16);

        tokio::spawn(async move {
            let mut upstream =
                super::stream_from_model(model, prompt, SYSTEM_INSTRUCTION.to_string(), "story")
                    .await;

            let mut buffer = String::new();
            use futures::StreamExt;
            while let Some(response) = upstream.next().await {
                if response.is_final {
                    if !buffer.trim().is_empty() {
                        let (clean, visual) = extract_visual_moment(&buffer);
                        let _ = tx
                            .send(AgentResponse {
                                visual_moment: visual,
                                ..AgentResponse::new("story", clean.trim().to_string())
                            })
                            .await;
                        buffer.clear();
                    }
                    if tx.send(response).await.is_err() {
                        return;
                    }
                    continue;
                }

                buffer.push_str(&response.content);

                let (clean, visual) = extract_visual_moment(&buffer);
                buffer = clean;

                if is_chunk_boundary(&buffer) {
                    let content = format!("{} ", buffer.trim());
                    buffer.clear();
                    let sent = tx
                        .send(AgentResponse {
                            visual_moment: visual,
                            ..AgentResponse::new("story", content)
                        })
                        .await;
                    if sent.is_err() {
                        return; // consumer cancelled
                    }
                } else if let Some(visual) = visual {
                    // Marker complete before a boundary: attach it to the
                    // next emitted chunk rather than losing it.
                    let content = format!("{} ", buffer.trim());
                    buffer.clear();
                    if tx
                        .send(AgentResponse {
                            visual_moment: Some(visual),
                            ..AgentResponse::new("story", content)
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

#[async_trait]
impl Agent for StoryAgent {
    fn name(&self) -> &'static str {
        "story"
    }

    fn output_schema(&self) -> Option<&'static str> {
        Some("StoryChunk")
    }

    /// Schema-typed streaming: parse the model's JSON into `StoryChunk`s,
    /// repair minimally where validation fails, mark the last chunk final.
    async fn execute_streaming(&self, input: Value) -> Result<ChunkStream> {
        let culture = input
            .get("culture")
            .and_then(Value::as_str)
            .unwrap_or("african")
            .to_string();
        let prompt = build_structured_prompt(&input);

        let raw = self.model.generate(&prompt, STRUCTURED_INSTRUCTION).await?;
        let mut chunks = parse_story_chunks(&raw, &culture);

        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.iter_mut().enumerate() {
            chunk["is_final"] = json!(i == last);

            let (ok, errors) = registry().validate("StoryChunk", chunk);
            if !ok {
                warn!(?errors, "story chunk failed validation, repairing");
                *chunk = json!({
                    "text": chunk.get("text").and_then(Value::as_str).unwrap_or("The story continues..."),
                    "culture": culture,
                    "cultural_claims": [],
                    "is_final": i == last,
                });
            }
        }

        Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
    }

    /// Unary: merge the streamed chunks into one full `StoryChunk`.
    async fn execute(&self, input: Value) -> Result<Value> {
        use futures::StreamExt;
        let culture = input
            .get("culture")
            .and_then(Value::as_str)
            .unwrap_or("african")
            .to_string();

        let mut stream = self.execute_streaming(input).await?;
        let mut texts = Vec::new();
        let mut claims = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if let Some(text) = chunk.get("text").and_then(Value::as_str) {
                texts.push(text.to_string());
            }
            if let Some(chunk_claims) = chunk.get("cultural_claims").and_then(Value::as_array) {
                claims.extend(chunk_claims.iter().cloned());
            }
        }

        if texts.is_empty() {
            return Ok(json!({
                "text": "The story awaits...",
                "culture": culture,
                "cultural_claims": [],
                "is_final": true,
            }));
        }

        Ok(json!({
            "text": texts.join(" "),
            "culture": culture,
            "cultural_claims": claims,
            "is_final": true,
        }))
    }
}

fn build_prompt(request: &AgentRequest) -> String {
    let culture = request.culture.as_deref().unwrap_or("a West African");
    let theme = request.theme.as_deref().unwrap_or("wisdom");

    let mut prompt = format!(
        "Tell an immersive oral-tradition story.\n\
         Culture: {culture}\nTheme: {theme}\nAudience: {}\n",
        request.age_group
    );
    if let Some(context) = &request.session_context {
        prompt.push_str(&format!(
            "\nConversation so far:\n{context}\n\
             If a story is already underway, continue it rather than starting over.\n"
        ));
    }
    prompt.push_str("\nBegin the story now:");
    prompt
}

fn build_structured_prompt(input: &Value) -> String {
    let culture = input.get("culture").and_then(Value::as_str).unwrap_or("african");
    let theme = input.get("theme").and_then(Value::as_str).unwrap_or("wisdom");
    let complexity = input.get("complexity").and_then(Value::as_str).unwrap_or("adult");

    let mut parts = vec![
        "Generate an oral-tradition story as structured JSON.".to_string(),
        format!("Culture: {culture}"),
        format!("Theme: {theme}"),
        format!("Audience: {complexity}"),
    ];
    if let Some(context) = input.get("session_context").and_then(Value::as_str) {
        parts.push(format!("Context: {context}"));
    }
    if let Some(correction) = input.get("_correction").and_then(Value::as_str) {
        parts.push(format!("CORRECTION: {correction}"));
    }
    parts.push(
        "Generate 3-5 JSON chunks, each a complete paragraph. Every cultural \
         reference MUST appear in cultural_claims[]."
            .to_string(),
    );
    parts.join("\n")
}

/// Parse model output into `StoryChunk` objects.
///
/// Tries a clean JSON array or object first, then salvages embedded objects
/// from prose, and finally wraps the raw text as a single chunk so the turn
/// always produces something.
fn parse_story_chunks(raw: &str, default_culture: &str) -> Vec<Value> {
    let cleaned = strip_code_fences(raw);
    let mut chunks: Vec<Value> = Vec::new();

    match serde_json::from_str::<Value>(&cleaned) {
        Ok(Value::Array(items)) => chunks = items,
        Ok(obj @ Value::Object(_)) => chunks = vec![obj],
        _ => {
            for span in find_json_objects(&cleaned) {
                if let Ok(obj @ Value::Object(_)) = serde_json::from_str::<Value>(span) {
                    if obj.get("text").is_some() {
                        chunks.push(obj);
                    }
                }
            }
        }
    }

    // Only object-shaped chunks survive; stray scalars in an array are noise.
    chunks.retain(Value::is_object);

    if chunks.is_empty() {
        let text = if cleaned.trim().is_empty() {
            "The story begins...".to_string()
        } else {
            cleaned.trim().to_string()
        };
        chunks.push(json!({ "text": text }));
    }

    for chunk in &mut chunks {
        if let Value::Object(map) = chunk {
            map.entry("culture".to_string())
                .or_insert_with(|| Value::String(default_culture.to_string()));
            map.entry("cultural_claims".to_string())
                .or_insert_with(|| json!([]));
        }
    }
    chunks
}

/// Pull a `[VISUAL: ...]` marker out of the text, if one has fully arrived.
fn extract_visual_moment(text: &str) -> (String, Option<String>) {
    let Some(start) = text.find("[VISUAL:") else {
        return (text.to_string(), None);
    };
    let Some(end_offset) = text[start..].find(']') else {
        return (text.to_string(), None);
    };
    let end = start + end_offset;

    let description = text[start + "[VISUAL:".len()..end].trim().to_string();
    let mut clean = String::with_capacity(text.len());
    clean.push_str(&text[..start]);
    clean.push_str(&text[end + 1..]);
    (clean, Some(description))
}

/// Natural boundary check for the legacy chunker.
fn is_chunk_boundary(text: &str) -> bool {
    let trimmed = text.trim_end();
    if trimmed.is_empty() {
        return false;
    }
    if text.ends_with("\n\n") {
        return true;
    }
    if text.contains("[SCENE_BREAK]") || text.contains("[CALL_RESPONSE]") {
        return true;
    }
    if trimmed.len() > SOFT_BOUNDARY_CHARS && trimmed.ends_with(['.', '!', '?']) {
        return true;
    }
    trimmed.len() > HARD_BOUNDARY_CHARS
}
