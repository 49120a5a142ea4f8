//! Per-session agent dispatcher
//!
//! Routes orchestrator requests to sub-agents and runs every producing
//! stream through the cultural grounding pipeline. Failure policy:
//!
//! - each agent has its own circuit breaker (cultural trips at 5 failures
//!   and heals in 30 s; the visual breaker heals slowest at 120 s)
//! - cultural validation gets a tight 2 s per-chunk ceiling; a timeout
//!   passes the chunk through with confidence forced to 0.5 and records a
//!   breaker failure — the stream is never blocked by its validator
//! - a stalled producer (no chunk within the dispatch ceiling) yields a
//!   user-visible filler line and ends the stream

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::a2a;
use crate::agents::cultural::CulturalAgent;
use crate::agents::riddle::RiddleAgent;
use crate::agents::story::StoryAgent;
use crate::agents::visual::VisualAgent;
use crate::agents::{Agent, ResponseStream};
use crate::breaker::CircuitBreaker;
use crate::types::{AgentRequest, AgentResponse, Intent};

/// Per-chunk ceiling for hot-path cultural validation.
const CULTURAL_TIMEOUT: Duration = Duration::from_secs(2);
/// Ceiling for one image generation.
const IMAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Filler lines for degraded turns.
const TIMEOUT_LINE: &str = "I need a moment to gather my thoughts...";
const IMAGE_ACK_LINE: &str = "Let me paint that scene for you...";

/// Routes requests to sub-agents with grounding, breakers, and timeouts.
pub struct AgentDispatcher {
    session_id: String,
    pub story: Arc<StoryAgent>,
    pub riddle: Arc<RiddleAgent>,
    pub cultural: Arc<CulturalAgent>,
    pub visual: Arc<VisualAgent>,
    breakers: HashMap<&'static str, Arc<CircuitBreaker>>,
    agent_timeout: Duration,
}

impl AgentDispatcher {
    pub fn new(
        session_id: impl Into<String>,
        story: Arc<StoryAgent>,
        riddle: Arc<RiddleAgent>,
        cultural: Arc<CulturalAgent>,
        visual: Arc<VisualAgent>,
        agent_timeout: Duration,
    ) -> Self {
        let mut breakers: HashMap<&'static str, Arc<CircuitBreaker>> = HashMap::new();
        breakers.insert(
            "story",
            Arc::new(CircuitBreaker::new("story", 3, Duration::from_secs(60))),
        );
        breakers.insert(
            "riddle",
            Arc::new(CircuitBreaker::new("riddle", 3, Duration::from_secs(60))),
        );
        breakers.insert(
            "cultural",
            Arc::new(CircuitBreaker::new("cultural", 5, Duration::from_secs(30))),
        );
        breakers.insert(
            "visual",
            Arc::new(CircuitBreaker::new("visual", 3, Duration::from_secs(120))),
        );

        Self {
            session_id: session_id.into(),
            story,
            riddle,
            cultural,
            visual,
            breakers,
            agent_timeout,
        }
    }

    /// The breaker guarding an agent.
    pub fn breaker(&self, agent: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .get(agent)
            .cloned()
            .expect("unknown agent breaker")
    }

    /// Map an intent to its agent name.
    pub fn agent_for(intent: Intent) -> &'static str {
        match intent {
            Intent::RequestStory => "story",
            Intent::RequestRiddle | Intent::AnswerRiddle => "riddle",
            Intent::AskCultural => "cultural",
            Intent::RequestImage => "visual",
            _ => "orchestrator",
        }
    }

    /// Legacy dispatch: route to the agent's streaming path and ground every
    /// chunk. This is the fallback when schema-typed dispatch fails.
    pub async fn dispatch(&self, request: AgentRequest) -> ResponseStream {
        let agent_name = Self::agent_for(request.intent);
        info!(
            session_id = %self.session_id,
            agent = agent_name,
            intent = ?request.intent,
            "dispatching"
        );

        match request.intent {
            Intent::RequestStory => {
                let upstream = self.story.stream_legacy(&request).await;
                self.grounded(self.supervised("story", upstream))
            }
            Intent::RequestRiddle | Intent::AnswerRiddle => {
                let upstream = self.riddle.stream_legacy(&request).await;
                self.grounded(self.supervised("riddle", upstream))
            }
            Intent::AskCultural => {
                self.supervised("cultural", self.cultural.stream_context(&request).await)
            }
            Intent::RequestImage => Box::pin(futures::stream::iter(vec![AgentResponse {
                is_final: true,
                visual_moment: Some(request.user_input.clone()),
                ..AgentResponse::new("visual", IMAGE_ACK_LINE)
            }])),
            _ => Box::pin(futures::stream::iter(vec![AgentResponse::final_marker(
                "orchestrator",
            )])),
        }
    }

    /// Apply the per-dispatch production ceiling: a producer that goes
    /// silent yields the filler line and the stream ends.
    fn supervised(&self, agent_name: &'static str, mut upstream: ResponseStream) -> ResponseStream {
        let breaker = self.breaker(agent_name);
        let ceiling = self.agent_timeout;
        let session_id = self.session_id.clone();
        let (tx, rx) = mpsc::channel::<AgentResponse>(16);

        tokio::spawn(async move {
            use futures::StreamExt;
            loop {
                match timeout(ceiling, upstream.next()).await {
                    Ok(Some(chunk)) => {
                        if tx.send(chunk).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(_) => {
                        breaker.record_failure();
                        warn!(session_id = %session_id, agent = agent_name, "agent timed out");
                        let _ = tx
                            .send(AgentResponse {
                                content: TIMEOUT_LINE.to_string(),
                                is_final: true,
                                ..AgentResponse::new(agent_name, "")
                            })
                            .await;
                        return;
                    }
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }

    /// Run a producing stream through cultural validation, chunk by chunk.
    fn grounded(&self, mut upstream: ResponseStream) -> ResponseStream {
        let cultural = self.cultural.clone();
        let breaker = self.breaker("cultural");
        let session_id = self.session_id.clone();
        let (tx, rx) = mpsc::channel::<AgentResponse>(16);

        tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(chunk) = upstream.next().await {
                // Bare final markers carry no content worth validating.
                if chunk.is_final && chunk.content.trim().is_empty() {
                    if tx.send(chunk).await.is_err() {
                        return;
                    }
                    continue;
                }

                let forwarded = if breaker.is_open() {
                    AgentResponse {
                        cultural_confidence: 0.5,
                        ..chunk
                    }
                } else {
                    match timeout(CULTURAL_TIMEOUT, cultural.validate_response(chunk.clone())).await
                    {
                        Ok(validated) => {
                            breaker.record_success();
                            validated
                        }
                        Err(_) => {
                            breaker.record_failure();
                            warn!(
                                session_id = %session_id,
                                "cultural validation timed out, passing chunk through"
                            );
                            AgentResponse {
                                cultural_confidence: 0.5,
                                ..chunk
                            }
                        }
                    }
                };

                if tx.send(forwarded).await.is_err() {
                    return;
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }

    /// Ground one schema-typed `StoryChunk` into a `ValidatedChunk`,
    /// honoring the cultural breaker and the 2 s ceiling.
    pub async fn ground_story_chunk(&self, chunk: &Value) -> Value {
        let breaker = self.breaker("cultural");
        if breaker.is_open() {
            return pass_through_chunk(chunk);
        }

        match timeout(CULTURAL_TIMEOUT, self.cultural.validate_chunk(chunk)).await {
            Ok(validated) => {
                breaker.record_success();
                validated
            }
            Err(_) => {
                breaker.record_failure();
                warn!(session_id = %self.session_id, "cultural validation timed out");
                pass_through_chunk(chunk)
            }
        }
    }

    /// Generate one image through schema-enforced dispatch. Returns the URL
    /// on success, `None` on any failure — image generation is best-effort
    /// and never propagates errors.
    pub async fn generate_image(&self, scene_description: &str, culture: Option<&str>) -> Option<String> {
        let breaker = self.breaker("visual");
        if breaker.is_open() {
            return None;
        }

        let input = json!({
            "scene_description": scene_description,
            "culture": culture.unwrap_or("African"),
        });

        let visual = self.visual.clone();
        let dispatched = timeout(
            IMAGE_TIMEOUT,
            a2a::dispatch_with_schema(
                move |payload| {
                    let visual = visual.clone();
                    async move { visual.execute(payload).await }
                },
                input,
                "ImageRequest",
                "ImageResult",
                "visual_agent",
                1,
            ),
        )
        .await;

        match dispatched {
            Ok(Ok(report)) => {
                if report.value.get("status").and_then(Value::as_str) == Some("success") {
                    breaker.record_success();
                    report
                        .value
                        .get("url")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                } else {
                    // "failed"/"skipped" are soft outcomes, not breaker food.
                    None
                }
            }
            Ok(Err(e)) => {
                breaker.record_failure();
                warn!(session_id = %self.session_id, %e, "image dispatch failed");
                None
            }
            Err(_) => {
                breaker.record_failure();
                warn!(session_id = %self.session_id, "image generation timed out");
                None
            }
        }
    }
}

/// ValidatedChunk-shaped pass-through with confidence forced to 0.5.
fn pass_through_chunk(chunk: &Value) -> Value {
    json!({
        "text": chunk.get("text").and_then(Value::as_str).unwrap_or(""),
        "confidence": 0.5,
        "corrections": [],
        "rejected_claims": [],
        "is_final": chunk.get("is_final").and_then(Value::as_bool).unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::CulturalKnowledge;
    use crate::textgen::{TextModel, TextStream};
    use crate::Result;
    use async_trait::async_trait;
    use futures::StreamExt;

    struct ScriptedModel {
        text: String,
    }

    #[async_trait]
    impl TextModel for ScriptedModel {
        async fn stream_text(&self, _: &str, _: &str) -> Result<TextStream> {
            Ok(Box::pin(futures::stream::iter(vec![Ok(self.text.clone())])))
        }
    }

    struct HangingModel;

    #[async_trait]
    impl TextModel for HangingModel {
        async fn stream_text(&self, _: &str, _: &str) -> Result<TextStream> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    fn dispatcher_with(model: Arc<dyn TextModel>, agent_timeout: Duration) -> AgentDispatcher {
        let cultural = Arc::new(CulturalAgent::new(
            None,
            CulturalKnowledge::seed(),
            0.7,
            0.4,
        ));
        AgentDispatcher::new(
            "sess-dispatch",
            Arc::new(StoryAgent::new(model.clone())),
            Arc::new(RiddleAgent::new(model)),
            cultural,
            Arc::new(VisualAgent::new(None, None)),
            agent_timeout,
        )
    }

    #[test]
    fn test_intent_to_agent_mapping() {
        assert_eq!(AgentDispatcher::agent_for(Intent::RequestStory), "story");
        assert_eq!(AgentDispatcher::agent_for(Intent::RequestRiddle), "riddle");
        assert_eq!(AgentDispatcher::agent_for(Intent::AskCultural), "cultural");
        assert_eq!(AgentDispatcher::agent_for(Intent::RequestImage), "visual");
        assert_eq!(AgentDispatcher::agent_for(Intent::Greeting), "orchestrator");
    }

    #[tokio::test]
    async fn test_story_dispatch_grounds_chunks() {
        let model = Arc::new(ScriptedModel {
            text: "The hare outran the lion across the dry valley floor once more!\n\n".to_string(),
        });
        let dispatcher = dispatcher_with(model, Duration::from_secs(5));

        let request = AgentRequest::new(Intent::RequestStory, "a story");
        let chunks: Vec<AgentResponse> = dispatcher.dispatch(request).await.collect().await;

        assert!(!chunks.is_empty());
        let content: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert!(content.contains("hare"));
        // A clean chunk keeps full confidence.
        assert!(chunks.iter().any(|c| c.cultural_confidence == 1.0));
        assert!(chunks.last().unwrap().is_final);
    }

    #[tokio::test]
    async fn test_stalled_agent_yields_filler_and_records_failure() {
        let dispatcher = dispatcher_with(Arc::new(HangingModel), Duration::from_millis(50));

        let request = AgentRequest::new(Intent::RequestStory, "a story");
        let chunks: Vec<AgentResponse> = dispatcher.dispatch(request).await.collect().await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, TIMEOUT_LINE);
        assert!(chunks[0].is_final);
        assert_eq!(dispatcher.breaker("story").status().failure_count, 1);
    }

    #[tokio::test]
    async fn test_image_request_yields_ack_with_visual_moment() {
        let model = Arc::new(ScriptedModel {
            text: "irrelevant".to_string(),
        });
        let dispatcher = dispatcher_with(model, Duration::from_secs(5));

        let mut request = AgentRequest::new(Intent::RequestImage, "a spider weaving a web");
        request.culture = Some("ashanti".to_string());
        let chunks: Vec<AgentResponse> = dispatcher.dispatch(request).await.collect().await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, IMAGE_ACK_LINE);
        assert_eq!(chunks[0].visual_moment.as_deref(), Some("a spider weaving a web"));
    }

    #[tokio::test]
    async fn test_unknown_intent_yields_empty_final() {
        let model = Arc::new(ScriptedModel {
            text: "irrelevant".to_string(),
        });
        let dispatcher = dispatcher_with(model, Duration::from_secs(5));

        let request = AgentRequest::new(Intent::Greeting, "hello");
        let chunks: Vec<AgentResponse> = dispatcher.dispatch(request).await.collect().await;

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_final);
        assert!(chunks[0].content.is_empty());
    }

    #[tokio::test]
    async fn test_open_cultural_breaker_passes_through_at_half_confidence() {
        let model = Arc::new(ScriptedModel {
            text: "A short tale of the clever hare and the proud lion ends well.\n\n".to_string(),
        });
        let dispatcher = dispatcher_with(model, Duration::from_secs(5));

        let breaker = dispatcher.breaker("cultural");
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert!(breaker.is_open());

        let request = AgentRequest::new(Intent::RequestStory, "a story");
        let chunks: Vec<AgentResponse> = dispatcher.dispatch(request).await.collect().await;

        let content_chunks: Vec<&AgentResponse> =
            chunks.iter().filter(|c| !c.content.trim().is_empty()).collect();
        assert!(!content_chunks.is_empty());
        for chunk in content_chunks {
            assert_eq!(chunk.cultural_confidence, 0.5);
        }
    }

    #[tokio::test]
    async fn test_ground_story_chunk_success_and_pass_through() {
        let model = Arc::new(ScriptedModel {
            text: "irrelevant".to_string(),
        });
        let dispatcher = dispatcher_with(model, Duration::from_secs(5));

        let chunk = json!({"text": "Anansi wove.", "culture": "ashanti", "cultural_claims": []});
        let validated = dispatcher.ground_story_chunk(&chunk).await;
        assert_eq!(validated["confidence"], 1.0);

        // With the breaker open the chunk passes through at 0.5.
        let breaker = dispatcher.breaker("cultural");
        for _ in 0..5 {
            breaker.record_failure();
        }
        let validated = dispatcher.ground_story_chunk(&chunk).await;
        assert_eq!(validated["confidence"], json!(0.5));
    }

    #[tokio::test]
    async fn test_generate_image_skipped_backend_returns_none() {
        let model = Arc::new(ScriptedModel {
            text: "irrelevant".to_string(),
        });
        let dispatcher = dispatcher_with(model, Duration::from_secs(5));

        // Visual backend is unconfigured: execute reports "skipped", which
        // maps to None without feeding the breaker.
        let url = dispatcher
            .generate_image("a spider weaving a great web", Some("ashanti"))
            .await;
        assert!(url.is_none());
        assert_eq!(dispatcher.breaker("visual").status().failure_count, 0);
    }

    #[tokio::test]
    async fn test_generate_image_short_scene_rejected() {
        let model = Arc::new(ScriptedModel {
            text: "irrelevant".to_string(),
        });
        let dispatcher = dispatcher_with(model, Duration::from_secs(5));

        // scene_description below the schema's minLength: input validation
        // fails and the dispatch counts against the breaker.
        let url = dispatcher.generate_image("tiny", None).await;
        assert!(url.is_none());
        assert_eq!(dispatcher.breaker("visual").status().failure_count, 1);
    }
}
