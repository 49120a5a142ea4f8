//! Riddle agent
//!
//! Produces one `RiddlePayload` per call: traditional opening,
//! riddle text, exactly three progressive hints, the answer, and a cultural
//! explanation. A fixer guarantees the payload shape even when the model
//! returns partial or unparseable JSON.
//!
//! The legacy streaming path reveals the riddle section by section as the
//! model emits `[OPENING] [RIDDLE] [HINTS] [ANSWER] [EXPLANATION]` markers.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use super::{Agent, ResponseStream, strip_code_fences};
use crate::schema::registry;
use crate::textgen::TextModel;
use crate::types::{AgentRequest, AgentResponse};
use crate::Result;

const SECTION_MARKERS: [&str; 5] = ["[OPENING]", "[RIDDLE]", "[HINTS]", "[ANSWER]", "[EXPLANATION]"];

const SYSTEM_INSTRUCTION: &str = "\
You are a riddle master in the oral tradition. Open with the culture's real \
riddling call-and-response, pose a grounded riddle, then give three \
progressively more revealing hints, the answer, and a short cultural \
explanation. Structure your response with the section markers [OPENING], \
[RIDDLE], [HINTS], [ANSWER], [EXPLANATION]. Never attribute a riddle to a \
culture it does not belong to; say when a riddle is newly inspired rather \
than traditional.";

const STRUCTURED_INSTRUCTION: &str = "\
Generate a riddle as a JSON object with fields: opening, riddle_text, \
answer, hints (exactly 3 strings), explanation, culture, is_traditional \
(true only for riddles you know are authentic). Respond ONLY with valid \
JSON, no markdown.";

/// Unary riddle producer with section-streaming legacy mode.
pub struct RiddleAgent {
    model: Arc<dyn TextModel>,
}

impl RiddleAgent {
    pub fn new(model: Arc<dyn TextModel>) -> Self {
        Self { model }
    }

    /// Legacy path: emit section-labeled chunks as markers arrive.
    pub async fn stream_legacy(&self, request: &AgentRequest) -> ResponseStream {
        let prompt = build_prompt(request);
        info!(
            culture = request.culture.as_deref().unwrap_or("unspecified"),
            "generating riddle"
        );

        let model = self.model.clone();
        let (tx, rx) = mpsc::channel::<AgentResponse>(16);

        tokio::spawn(async move {
            let mut upstream =
                super::stream_from_model(model, prompt, SYSTEM_INSTRUCTION.to_string(), "riddle")
                    .await;

            let mut buffer = String::new();
            let mut section = String::new();

            use futures::StreamExt;
            while let Some(response) = upstream.next().await {
                if response.is_final {
                    if !buffer.trim().is_empty() {
                        let _ = tx.send(section_chunk(buffer.trim(), &section)).await;
                        buffer.clear();
                    }
                    if tx.send(response).await.is_err() {
                        return;
                    }
                    continue;
                }

                buffer.push_str(&response.content);

                for marker in SECTION_MARKERS {
                    if let Some(idx) = buffer.find(marker) {
                        let before = buffer[..idx].trim().to_string();
                        if !before.is_empty()
                            && tx
                                .send(section_chunk(&format!("{before}\n\n"), &section))
                                .await
                                .is_err()
                        {
                            return;
                        }
                        section = marker
                            .trim_start_matches('[')
                            .trim_end_matches(']')
                            .to_lowercase();
                        buffer = buffer[idx + marker.len()..].to_string();
                    }
                }

                if buffer.len() > 100 && buffer.trim_end().ends_with(['.', '!', '?']) {
                    let content = format!("{} ", buffer.trim());
                    buffer.clear();
                    if tx.send(section_chunk(&content, &section)).await.is_err() {
                        return;
                    }
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

fn section_chunk(content: &str, section: &str) -> AgentResponse {
    let mut chunk = AgentResponse::new("riddle", content);
    chunk
        .metadata
        .insert("section".to_string(), Value::String(section.to_string()));
    chunk
}

#[async_trait]
impl Agent for RiddleAgent {
    fn name(&self) -> &'static str {
        "riddle"
    }

    fn output_schema(&self) -> Option<&'static str> {
        Some("RiddlePayload")
    }

    /// Unary: generate, parse, validate, and fix the payload shape.
    async fn execute(&self, input: Value) -> Result<Value> {
        let culture = input
            .get("culture")
            .and_then(Value::as_str)
            .unwrap_or("East African")
            .to_string();

        let prompt = build_structured_prompt(&input);
        let raw = self.model.generate(&prompt, STRUCTURED_INSTRUCTION).await?;

        let mut payload = parse_riddle_payload(&raw, &culture);

        let (ok, errors) = registry().validate("RiddlePayload", &payload);
        if !ok {
            warn!(?errors, "riddle payload failed validation, fixing");
            payload = fix_riddle_payload(payload, &culture);
        }

        Ok(payload)
    }
}

fn build_prompt(request: &AgentRequest) -> String {
    let culture = request.culture.as_deref().unwrap_or("East African");
    let difficulty = request
        .preferences
        .get("difficulty")
        .map(String::as_str)
        .unwrap_or("medium");

    let mut prompt = format!(
        "Pose an interactive riddle.\nCulture: {culture}\nDifficulty: {difficulty}\n"
    );
    if let Some(context) = &request.session_context {
        prompt.push_str(&format!(
            "\nConversation so far:\n{context}\n\
             If a riddle game is underway, continue it; avoid repeats.\n"
        ));
    }
    prompt.push_str("\nPresent the riddle dramatically, using the section markers.");
    prompt
}

fn build_structured_prompt(input: &Value) -> String {
    let culture = input
        .get("culture")
        .and_then(Value::as_str)
        .unwrap_or("East African");
    let difficulty = input
        .get("difficulty")
        .and_then(Value::as_str)
        .unwrap_or("medium");

    let mut parts = vec![
        "Generate a riddle as structured JSON.".to_string(),
        format!("Culture: {culture}"),
        format!("Difficulty: {difficulty}"),
    ];
    if let Some(context) = input.get("session_context").and_then(Value::as_str) {
        parts.push(format!("Context: {context}"));
    }
    if let Some(correction) = input.get("_correction").and_then(Value::as_str) {
        parts.push(format!("CORRECTION: {correction}"));
    }
    parts.join("\n")
}

/// Parse model output into a riddle payload, falling back to a generic
/// construction when the JSON is unusable.
fn parse_riddle_payload(raw: &str, default_culture: &str) -> Value {
    let cleaned = strip_code_fences(raw);

    if let Ok(Value::Object(mut map)) = serde_json::from_str::<Value>(&cleaned) {
        map.entry("culture".to_string())
            .or_insert_with(|| Value::String(default_culture.to_string()));
        return Value::Object(map);
    }

    let riddle_text = if cleaned.trim().is_empty() {
        "What travels without legs?".to_string()
    } else {
        cleaned.trim().chars().take(500).collect()
    };

    json!({
        "opening": "A riddle for you...",
        "riddle_text": riddle_text,
        "answer": "A story",
        "hints": [
            "It moves from mouth to ear.",
            "It can cross mountains and rivers.",
            "Everyone carries it differently."
        ],
        "explanation": format!("A riddle inspired by {default_culture} oral tradition."),
        "culture": default_culture,
        "is_traditional": false
    })
}

/// Repair a payload into schema shape: defaults for missing fields and
/// exactly three hints, always.
fn fix_riddle_payload(payload: Value, culture: &str) -> Value {
    let mut map = match payload {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };

    map.entry("opening".to_string())
        .or_insert_with(|| json!("A riddle for you..."));
    map.entry("riddle_text".to_string())
        .or_insert_with(|| json!("What has no beginning and no end?"));
    map.entry("answer".to_string()).or_insert_with(|| json!("A circle"));
    map.entry("culture".to_string())
        .or_insert_with(|| Value::String(culture.to_string()));
    map.entry("explanation".to_string())
        .or_insert_with(|| json!(format!("A riddle from {culture} tradition.")));
    map.entry("is_traditional".to_string()).or_insert(json!(false));

    let mut hints: Vec<Value> = map
        .get("hints")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter(|h| h.is_string())
        .collect();
    while hints.len() < 3 {
        hints.push(json!("Think carefully..."));
    }
    hints.truncate(3);
    map.insert("hints".to_string(), Value::Array(hints));

    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::textgen::TextStream;
    use futures::StreamExt;

    struct ScriptedModel {
        text: String,
    }

    #[async_trait]
    impl TextModel for ScriptedModel {
        async fn stream_text(&self, _: &str, _: &str) -> Result<TextStream> {
            let pieces: Vec<Result<String>> = self
                .text
                .as_bytes()
                .chunks(16)
                .map(|c| Ok(String::from_utf8_lossy(c).to_string()))
                .collect();
            Ok(Box::pin(futures::stream::iter(pieces)))
        }
    }

    #[tokio::test]
    async fn test_execute_valid_payload() {
        let model = Arc::new(ScriptedModel {
            text: r#"{"opening": "Kitendawili!", "riddle_text": "My house has no door.", "answer": "An egg", "hints": ["It is small.", "Birds make it.", "You eat it."], "explanation": "A classic Swahili vitendawili.", "culture": "swahili", "is_traditional": true}"#.to_string(),
        });
        let agent = RiddleAgent::new(model);

        let payload = agent.execute(json!({"culture": "swahili"})).await.unwrap();
        assert_eq!(payload["opening"], "Kitendawili!");
        assert_eq!(payload["is_traditional"], true);
        let (ok, errors) = registry().validate("RiddlePayload", &payload);
        assert!(ok, "invalid payload: {errors:?}");
    }

    #[tokio::test]
    async fn test_execute_unparseable_falls_back() {
        let model = Arc::new(ScriptedModel {
            text: "I would love to, but here is prose instead of JSON".to_string(),
        });
        let agent = RiddleAgent::new(model);

        let payload = agent.execute(json!({"culture": "yoruba"})).await.unwrap();
        let (ok, errors) = registry().validate("RiddlePayload", &payload);
        assert!(ok, "invalid payload: {errors:?}");
        assert_eq!(payload["culture"], "yoruba");
        assert_eq!(payload["is_traditional"], false);
    }

    #[tokio::test]
    async fn test_execute_partial_payload_fixed() {
        let model = Arc::new(ScriptedModel {
            // Missing answer and hints entirely.
            text: r#"{"opening": "Qagela!", "riddle_text": "I speak without a mouth."}"#.to_string(),
        });
        let agent = RiddleAgent::new(model);

        let payload = agent.execute(json!({"culture": "zulu"})).await.unwrap();
        let (ok, errors) = registry().validate("RiddlePayload", &payload);
        assert!(ok, "invalid payload: {errors:?}");
        assert_eq!(payload["opening"], "Qagela!");
        assert_eq!(payload["hints"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_fix_riddle_payload_hint_rules() {
        // Too few hints: padded to three.
        let fixed = fix_riddle_payload(json!({"hints": ["one"]}), "swahili");
        assert_eq!(fixed["hints"].as_array().unwrap().len(), 3);

        // Too many hints: truncated to three.
        let fixed = fix_riddle_payload(json!({"hints": ["a", "b", "c", "d", "e"]}), "swahili");
        assert_eq!(fixed["hints"].as_array().unwrap().len(), 3);
        assert_eq!(fixed["hints"][0], "a");

        // Non-string hints are discarded before padding.
        let fixed = fix_riddle_payload(json!({"hints": [1, 2, "real hint"]}), "swahili");
        let hints = fixed["hints"].as_array().unwrap();
        assert_eq!(hints.len(), 3);
        assert_eq!(hints[0], "real hint");

        // Entirely empty payload becomes a full valid one.
        let fixed = fix_riddle_payload(json!({}), "hausa");
        let (ok, _) = registry().validate("RiddlePayload", &fixed);
        assert!(ok);
        assert_eq!(fixed["culture"], "hausa");
    }

    #[tokio::test]
    async fn test_stream_legacy_sections() {
        let model = Arc::new(ScriptedModel {
            text: "[OPENING]\nKitendawili! Tega!\n[RIDDLE]\nMy house has no door.\n[ANSWER]\nAn egg"
                .to_string(),
        });
        let agent = RiddleAgent::new(model);

        let request = AgentRequest::new(crate::types::Intent::RequestRiddle, "a riddle");
        let chunks: Vec<AgentResponse> = agent.stream_legacy(&request).await.collect().await;

        let labeled: Vec<(String, String)> = chunks
            .iter()
            .filter(|c| !c.content.trim().is_empty())
            .map(|c| {
                (
                    c.metadata
                        .get("section")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    c.content.trim().to_string(),
                )
            })
            .collect();

        assert!(labeled.iter().any(|(s, c)| s == "opening" && c.contains("Kitendawili")));
        assert!(labeled.iter().any(|(s, c)| s == "riddle" && c.contains("no door")));
        assert!(labeled.iter().any(|(s, c)| s == "answer" && c.contains("egg")));
        assert!(chunks.last().unwrap().is_final);
    }
}
