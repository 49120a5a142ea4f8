//! Cultural grounding agent (hot path)
//!
//! Every chunk a producing sub-agent emits passes through
//! [`CulturalAgent::validate_chunk`] before it can reach the wire. The
//! pipeline is ordered from cheapest to most expensive:
//!
//! 1. knowledge-base check per declared claim (instant)
//! 2. whole-text pattern heuristics (overgeneralization, culture mixing)
//! 3. a single short model verdict — only when confidence has already fallen
//!    below the configured threshold, and any failure there is swallowed
//! 4. policy: hedge the text when confidence lands below the reject
//!    threshold
//!
//! Confidence composes multiplicatively across checks and stays within
//! [0, 1]. Steps 1-2 are deterministic; repeated validation of the same
//! chunk yields the same confidence as long as step 3 is not entered.
//!
//! The agent also serves the cold path: free-form cultural context
//! generation when the user explicitly asks about a tradition.

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde_json::{Value, json};
use tracing::debug;

use super::{Agent, ResponseStream, strip_code_fences};
use crate::knowledge::{CulturalKnowledge, KbOutcome};
use crate::textgen::TextModel;
use crate::types::{AgentRequest, AgentResponse};
use crate::Result;

/// Confidence multipliers per check outcome.
const CONTRADICTED_FACTOR: f64 = 0.3;
const UNKNOWN_FACTOR: f64 = 0.85;
const OVERGENERALIZATION_FACTOR: f64 = 0.6;
const CULTURE_MIXING_FACTOR: f64 = 0.7;

const OVERGENERALIZATION_MARKERS: [&str; 7] = [
    "all africans",
    "every african",
    "africans always",
    "in africa they always",
    "african culture is",
    "all of africa",
    "the african way",
];

const HEDGING_PHRASES: [&str; 3] = [
    "In some traditions, ",
    "It is often said that ",
    "According to some accounts, ",
];

const SYSTEM_INSTRUCTION: &str = "\
You validate and enrich content for cultural authenticity. Check that \
references, proverb attributions, character names, and geography fit the \
stated culture. When generating context, name the specific ethnic group, \
include local terms with pronunciation, and say plainly what you are \
uncertain about. When in doubt, flag it; never conflate different \
traditions.";

/// Hot-path cultural validator and cold-path context generator.
pub struct CulturalAgent {
    model: Option<Arc<dyn TextModel>>,
    knowledge: CulturalKnowledge,
    confidence_threshold: f64,
    reject_threshold: f64,
}

impl CulturalAgent {
    pub fn new(
        model: Option<Arc<dyn TextModel>>,
        knowledge: CulturalKnowledge,
        confidence_threshold: f64,
        reject_threshold: f64,
    ) -> Self {
        Self {
            model,
            knowledge,
            confidence_threshold,
            reject_threshold,
        }
    }

    /// Validate a `StoryChunk` object into a `ValidatedChunk` object.
    pub async fn validate_chunk(&self, chunk: &Value) -> Value {
        let mut text = chunk
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let culture = chunk.get("culture").and_then(Value::as_str).unwrap_or("");
        let claims = chunk
            .get("cultural_claims")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut confidence: f64 = 1.0;
        let mut corrections: Vec<String> = Vec::new();
        let mut rejected: Vec<String> = Vec::new();

        // Knowledge-base checks, one per declared claim.
        for claim_obj in &claims {
            let (claim_text, category) = match claim_obj {
                Value::Object(map) => (
                    map.get("claim").and_then(Value::as_str).unwrap_or(""),
                    map.get("category").and_then(Value::as_str).unwrap_or("custom"),
                ),
                other => (other.as_str().unwrap_or(""), "custom"),
            };

            match self.knowledge.check_claim(claim_text, culture, category) {
                KbOutcome::Confirmed => {}
                KbOutcome::Contradicted => {
                    confidence *= CONTRADICTED_FACTOR;
                    rejected.push(claim_text.to_string());
                }
                KbOutcome::Unknown => confidence *= UNKNOWN_FACTOR,
            }
        }

        // Whole-text heuristics.
        if has_overgeneralization(&text) {
            confidence *= OVERGENERALIZATION_FACTOR;
            corrections.push("Overly broad cultural claim detected".to_string());
        }
        if self.has_culture_mixing(&text, culture) {
            confidence *= CULTURE_MIXING_FACTOR;
            corrections.push("Possible culture mixing detected".to_string());
        }

        // Model-backed check, only for already-suspect chunks. Failures are
        // swallowed; the pattern-based confidence stands.
        if confidence < self.confidence_threshold {
            if let Some(model) = &self.model {
                if let Some(verdict) = quick_model_verdict(model.as_ref(), &text, culture).await {
                    confidence = confidence.min(verdict.confidence);
                    if let Some(corrected) = verdict.corrected_text {
                        text = corrected;
                    }
                    corrections.extend(verdict.corrections);
                }
            }
        }

        // Policy: hedge what we cannot stand behind.
        if confidence < self.reject_threshold {
            text = add_hedging(&text);
        }

        json!({
            "text": text,
            "confidence": confidence,
            "corrections": corrections,
            "rejected_claims": rejected,
            "is_final": chunk.get("is_final").and_then(Value::as_bool).unwrap_or(false),
        })
    }

    /// Legacy adapter: validate an [`AgentResponse`] chunk in place.
    pub async fn validate_response(&self, mut chunk: AgentResponse) -> AgentResponse {
        let story_chunk = json!({
            "text": chunk.content,
            "culture": chunk.metadata.get("culture").and_then(Value::as_str).unwrap_or(""),
            "cultural_claims": chunk.metadata.get("cultural_claims").cloned().unwrap_or(json!([])),
        });

        let validated = self.validate_chunk(&story_chunk).await;

        chunk.content = validated
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or(&chunk.content)
            .to_string();
        chunk.cultural_confidence = validated
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(1.0);
        chunk.metadata.insert(
            "corrections".to_string(),
            validated.get("corrections").cloned().unwrap_or(json!([])),
        );
        chunk.metadata.insert(
            "rejected_claims".to_string(),
            validated.get("rejected_claims").cloned().unwrap_or(json!([])),
        );
        chunk
    }

    /// Cold path: stream rich cultural context for an explicit question.
    pub async fn stream_context(&self, request: &AgentRequest) -> ResponseStream {
        let culture = request.culture.as_deref().unwrap_or("African");
        let prompt = format!(
            "Provide rich cultural context about: {}\n\
             Culture/Region: {culture}\n\n\
             Cover the historical background, the connection to oral \
             traditions, local language terms with pronunciation, related \
             proverbs, and how this shows up in daily life. Be specific to \
             the ethnic group. If you are unsure about details, say so \
             honestly.",
            request.user_input
        );

        match &self.model {
            Some(model) => {
                super::stream_from_model(
                    model.clone(),
                    prompt,
                    SYSTEM_INSTRUCTION.to_string(),
                    "cultural",
                )
                .await
            }
            None => Box::pin(futures::stream::iter(vec![
                AgentResponse {
                    content: format!(
                        "The {culture} tradition carries this knowledge in its \
                         stories and proverbs; let me share what I hold."
                    ),
                    is_final: true,
                    ..AgentResponse::new("cultural", "")
                },
                AgentResponse::final_marker("cultural"),
            ])),
        }
    }

    fn has_culture_mixing(&self, text: &str, target_culture: &str) -> bool {
        let text_lower = text.to_lowercase();
        let target_lower = target_culture.to_lowercase();

        let mentioned = self
            .knowledge
            .known_cultures()
            .into_iter()
            .filter(|culture| *culture != target_lower && text_lower.contains(*culture))
            .count();

        // One other tradition can be a deliberate contrast; more than one in
        // a single chunk reads as conflation.
        mentioned > 1
    }
}

#[async_trait]
impl Agent for CulturalAgent {
    fn name(&self) -> &'static str {
        "cultural"
    }

    fn output_schema(&self) -> Option<&'static str> {
        Some("ValidatedChunk")
    }

    async fn execute(&self, input: Value) -> Result<Value> {
        Ok(self.validate_chunk(&input).await)
    }
}

fn has_overgeneralization(text: &str) -> bool {
    let text_lower = text.to_lowercase();
    OVERGENERALIZATION_MARKERS
        .iter()
        .any(|marker| text_lower.contains(marker))
}

fn add_hedging(text: &str) -> String {
    let mut rng = rand::thread_rng();
    let phrase = HEDGING_PHRASES
        .choose(&mut rng)
        .copied()
        .unwrap_or(HEDGING_PHRASES[0]);

    let mut chars = text.chars();
    match chars.next() {
        Some(first) => format!("{phrase}{}{}", first.to_lowercase(), chars.as_str()),
        None => phrase.to_string(),
    }
}

struct ModelVerdict {
    confidence: f64,
    corrections: Vec<String>,
    corrected_text: Option<String>,
}

/// One short model call asking for a JSON verdict. Any failure — transport,
/// parse, shape — yields `None` and the caller keeps its own confidence.
async fn quick_model_verdict(
    model: &dyn TextModel,
    text: &str,
    culture: &str,
) -> Option<ModelVerdict> {
    let prompt = format!(
        "Quickly validate the cultural accuracy of this text:\n\n\
         \"{text}\"\n\nCulture context: {culture}\n\n\
         Respond in JSON: {{\"confidence\": 0.0-1.0, \"corrections\": \
         [\"issues\"], \"corrected_text\": null or \"corrected version\"}}\n\
         Only flag serious inaccuracies, not style preferences."
    );

    let raw = model
        .generate(&prompt, "You are a cultural accuracy validator. Respond only in JSON.")
        .await
        .ok()?;

    let parsed: Value = serde_json::from_str(&strip_code_fences(&raw)).ok()?;
    debug!("model verdict received");

    Some(ModelVerdict {
        confidence: parsed.get("confidence").and_then(Value::as_f64).unwrap_or(0.5),
        corrections: parsed
            .get("corrections")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        corrected_text: parsed
            .get("corrected_text")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}
