//! End-to-end session flows over a mock live backend.
//!
//! These tests drive the orchestrator exactly as the gateway does: a queue
//! is created, `session_created` is pushed first, and the test plays the
//! send loop by popping messages and stamping sequence numbers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

use griot_live::agents::visual::{ImageModel, MediaStore};
use griot_live::live::{LiveBackend, LiveConnector, LiveEvent, ToolDeclaration};
use griot_live::prelude::*;
use griot_live::{MemoryStore, OrchestratorState, OutputQueue};

// ─── Mock live backend ─────────────────────────────────────────────

struct MockBackend {
    inbound: tokio::sync::Mutex<mpsc::Receiver<LiveEvent>>,
    inject: mpsc::Sender<LiveEvent>,
    sent_texts: Mutex<Vec<String>>,
    function_responses: Mutex<Vec<(String, String, String)>>,
    /// When set, a function response makes the "model" speak and end the turn.
    speak_after_tool: bool,
}

impl MockBackend {
    fn new(speak_after_tool: bool) -> (Arc<Self>, mpsc::Sender<LiveEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let backend = Arc::new(Self {
            inbound: tokio::sync::Mutex::new(rx),
            inject: tx.clone(),
            sent_texts: Mutex::new(Vec::new()),
            function_responses: Mutex::new(Vec::new()),
            speak_after_tool,
        });
        (backend, tx)
    }
}

#[async_trait]
impl LiveBackend for MockBackend {
    async fn send_audio(&self, _audio_b64: &str) -> Result<()> {
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.sent_texts.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn send_video_frame(&self, _frame: &str, _w: u32, _h: u32) -> Result<()> {
        Ok(())
    }

    async fn send_function_response(&self, id: &str, name: &str, result: &str) -> Result<()> {
        self.function_responses
            .lock()
            .unwrap()
            .push((id.to_string(), name.to_string(), result.to_string()));
        if self.speak_after_tool {
            let _ = self
                .inject
                .send(LiveEvent::Text("And so the telling goes.".to_string()))
                .await;
            let _ = self.inject.send(LiveEvent::TurnComplete).await;
        }
        Ok(())
    }

    async fn next_native(&self) -> Result<Option<LiveEvent>> {
        Ok(self.inbound.lock().await.recv().await)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct FixedConnector(Arc<MockBackend>);

#[async_trait]
impl LiveConnector for FixedConnector {
    async fn connect(
        &self,
        _system_instruction: &str,
        _tools: &[ToolDeclaration],
    ) -> Result<Arc<dyn LiveBackend>> {
        Ok(self.0.clone())
    }
}

// ─── Scripted text model ───────────────────────────────────────────

struct ScriptedTextModel {
    scripts: Mutex<VecDeque<String>>,
}

impl ScriptedTextModel {
    fn new(scripts: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().map(str::to_string).collect()),
        })
    }
}

#[async_trait]
impl TextModel for ScriptedTextModel {
    async fn stream_text(&self, _: &str, _: &str) -> Result<griot_live::textgen::TextStream> {
        let next = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "The tale rests for now.".to_string());
        Ok(Box::pin(futures::stream::iter(vec![Ok(next)])))
    }
}

// ─── Mock image backend ────────────────────────────────────────────

struct SlowImageModel;

#[async_trait]
impl ImageModel for SlowImageModel {
    async fn generate_png(&self, _: &str, _: &str, _: &str) -> Result<Vec<u8>> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(vec![0x89, 0x50])
    }
}

struct FakeMediaStore;

#[async_trait]
impl MediaStore for FakeMediaStore {
    async fn upload_png(&self, object_name: &str, _bytes: Vec<u8>) -> Result<String> {
        Ok(format!("https://media.test/{object_name}"))
    }
}

// ─── Harness ───────────────────────────────────────────────────────

struct Session {
    orchestrator: Arc<Orchestrator>,
    queue: Arc<OutputQueue>,
    backend: Arc<MockBackend>,
    inject: mpsc::Sender<LiveEvent>,
    next_seq: u64,
}

impl Session {
    async fn start(model: Arc<ScriptedTextModel>, speak_after_tool: bool, with_images: bool) -> Self {
        let (backend, inject) = MockBackend::new(speak_after_tool);
        let connector = FixedConnector(backend.clone());
        let queue = Arc::new(OutputQueue::new(50));
        queue
            .try_push(ServerMessage::session_created("abc123def456"))
            .unwrap();

        let (image_model, media_store): (
            Option<Arc<dyn ImageModel>>,
            Option<Arc<dyn MediaStore>>,
        ) = if with_images {
            (Some(Arc::new(SlowImageModel)), Some(Arc::new(FakeMediaStore)))
        } else {
            (None, None)
        };

        let orchestrator = Orchestrator::connect(
            "abc123def456",
            &Settings::default(),
            Arc::new(MemoryStore::new()),
            model,
            image_model,
            media_store,
            &connector,
            queue.clone(),
        )
        .await
        .unwrap();

        Self {
            orchestrator,
            queue,
            backend,
            inject,
            next_seq: 0,
        }
    }

    /// Pop the next message and stamp it, as the send loop would.
    async fn next_message(&mut self, wait: Duration) -> Option<ServerMessage> {
        match timeout(wait, self.queue.pop()).await {
            Ok(Some(mut msg)) => {
                self.next_seq += 1;
                msg.seq = self.next_seq;
                Some(msg)
            }
            _ => None,
        }
    }

    /// Collect messages until (and including) the given kind.
    async fn collect_until(&mut self, kind: ServerMessageType, wait: Duration) -> Vec<ServerMessage> {
        let deadline = Instant::now() + wait;
        let mut out = Vec::new();
        while Instant::now() < deadline {
            let Some(msg) = self.next_message(Duration::from_millis(250)).await else {
                continue;
            };
            let done = msg.kind == kind;
            out.push(msg);
            if done {
                return out;
            }
        }
        out
    }
}

// ─── Scenario: happy-path story ────────────────────────────────────

#[tokio::test]
async fn story_tool_call_streams_validated_text_in_order() {
    let story_json = r#"[
        {"text": "Alo o! Ijapa the tortoise set out at dawn.", "culture": "yoruba", "cultural_claims": []},
        {"text": "And the village learned patience that day.", "culture": "yoruba", "cultural_claims": []}
    ]"#;
    let mut session = Session::start(ScriptedTextModel::new(vec![story_json]), true, false).await;

    session
        .inject
        .send(LiveEvent::FunctionCall {
            id: "call_1".to_string(),
            name: "tell_story".to_string(),
            args: json!({"culture": "yoruba", "theme": "trickster"}),
        })
        .await
        .unwrap();

    let messages = session
        .collect_until(ServerMessageType::TurnEnd, Duration::from_secs(5))
        .await;

    // Order: session_created, agent_state(story, running), story text, turn_end.
    assert_eq!(messages[0].kind, ServerMessageType::SessionCreated);

    let agent_state_idx = messages
        .iter()
        .position(|m| m.kind == ServerMessageType::AgentState)
        .expect("no agent_state message");
    assert_eq!(messages[agent_state_idx].agent.as_deref(), Some("story"));
    assert_eq!(messages[agent_state_idx].state.as_deref(), Some("running"));

    let first_text_idx = messages
        .iter()
        .position(|m| m.kind == ServerMessageType::TextChunk)
        .expect("no text chunk");
    assert!(agent_state_idx < first_text_idx);
    assert_eq!(messages[first_text_idx].agent.as_deref(), Some("story"));
    assert!(
        messages[first_text_idx]
            .data
            .as_deref()
            .unwrap()
            .contains("Ijapa")
    );

    assert_eq!(messages.last().unwrap().kind, ServerMessageType::TurnEnd);

    // Sequence numbers are strictly increasing.
    for pair in messages.windows(2) {
        assert!(pair[1].seq > pair[0].seq);
    }

    // The model received the concatenated tool result.
    let responses = session.backend.function_responses.lock().unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].1, "tell_story");
    assert!(responses[0].2.contains("Ijapa"));
    assert!(responses[0].2.contains("patience"));
}

// ─── Scenario: interrupt mid-stream ────────────────────────────────

#[tokio::test]
async fn interrupt_drains_queue_and_advances_turn() {
    let mut session = Session::start(ScriptedTextModel::new(vec![]), false, false).await;

    session.orchestrator.handle_text_input("tell me a story").await.unwrap();
    let turn_before = session.orchestrator.current_turn_id().unwrap();
    assert_eq!(
        session.backend.sent_texts.lock().unwrap().as_slice(),
        ["tell me a story"]
    );

    // Model text arrives while the client is not draining.
    session
        .inject
        .send(LiveEvent::Text("The hare ran far across the plain.".to_string()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.queue.len() >= 2); // session_created + buffered text

    let started = Instant::now();
    session.orchestrator.handle_interrupt().await;
    assert!(started.elapsed() < Duration::from_millis(100));

    // Everything produced before the interrupt is gone.
    assert!(session.queue.is_empty());

    // The gateway then confirms the interruption to the client.
    session
        .queue
        .push(ServerMessage::interrupted("abc123def456"))
        .await
        .unwrap();
    let msg = session.next_message(Duration::from_millis(250)).await.unwrap();
    assert_eq!(msg.kind, ServerMessageType::Interrupted);

    // No pre-interrupt text ever shows up afterwards.
    assert!(session.next_message(Duration::from_millis(200)).await.is_none());

    let turn_after = session.orchestrator.current_turn_id().unwrap();
    assert_ne!(turn_before, turn_after);
    assert_eq!(session.orchestrator.state(), OrchestratorState::Listening);
}

// ─── Scenario: image side channel ──────────────────────────────────

#[tokio::test]
async fn scene_description_spawns_detached_image_task() {
    let story_json = r#"[
        {"text": "Anansi climbed toward the sky god's court.", "culture": "ashanti",
         "cultural_claims": [], "scene_description": "a spider climbing a silk thread to the clouds"}
    ]"#;
    let mut session = Session::start(ScriptedTextModel::new(vec![story_json]), true, true).await;

    session
        .inject
        .send(LiveEvent::FunctionCall {
            id: "call_1".to_string(),
            name: "tell_story".to_string(),
            args: json!({"culture": "ashanti", "theme": "trickster"}),
        })
        .await
        .unwrap();

    let messages = session
        .collect_until(ServerMessageType::TurnEnd, Duration::from_secs(5))
        .await;

    // The primary stream completed without waiting for the image.
    let turn_end_seq = messages.last().unwrap().seq;
    assert!(messages.iter().all(|m| m.kind != ServerMessageType::ImageReady));

    // The image arrives afterwards, with a later sequence number.
    let mut image_msg = None;
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Some(msg) = session.next_message(Duration::from_millis(250)).await {
            if msg.kind == ServerMessageType::ImageReady {
                image_msg = Some(msg);
                break;
            }
        }
    }
    let image_msg = image_msg.expect("image_ready never arrived");
    assert!(image_msg.seq > turn_end_seq);
    assert!(
        image_msg
            .url
            .as_deref()
            .unwrap()
            .starts_with("https://media.test/generated/")
    );
}

// ─── Scenario: riddle fallback ─────────────────────────────────────

#[tokio::test]
async fn malformed_riddle_output_still_yields_complete_riddle_turn() {
    // The model never manages valid JSON; the agent's fixer takes over.
    let model = ScriptedTextModel::new(vec![
        "no json today",
        "still no json",
        "absolutely not json",
    ]);
    let mut session = Session::start(model, true, false).await;

    session
        .inject
        .send(LiveEvent::FunctionCall {
            id: "call_2".to_string(),
            name: "pose_riddle".to_string(),
            args: json!({"culture": "swahili"}),
        })
        .await
        .unwrap();

    let messages = session
        .collect_until(ServerMessageType::TurnEnd, Duration::from_secs(5))
        .await;

    // The client sees a complete riddle turn and no error message.
    assert!(messages.iter().all(|m| m.kind != ServerMessageType::Error));
    let riddle_text: String = messages
        .iter()
        .filter(|m| m.kind == ServerMessageType::TextChunk && m.agent.as_deref() == Some("riddle"))
        .filter_map(|m| m.data.clone())
        .collect();
    assert!(riddle_text.contains("Hint 1:"));
    assert!(riddle_text.contains("Hint 3:"));
    assert!(riddle_text.contains("The answer is:"));
    assert_eq!(messages.last().unwrap().kind, ServerMessageType::TurnEnd);

    // The function response carried the riddle back to the model.
    let responses = session.backend.function_responses.lock().unwrap();
    assert_eq!(responses.len(), 1);
    assert!(responses[0].2.contains("riddle"));
}

// ─── Control and lifecycle ─────────────────────────────────────────

#[tokio::test]
async fn control_messages_update_preferences_silently() {
    let mut session = Session::start(ScriptedTextModel::new(vec![]), false, false).await;

    session
        .orchestrator
        .handle_control("set_language", &Value::String("sw".to_string()));
    session
        .orchestrator
        .handle_control("set_age_group", &Value::String("child".to_string()));
    // Unknown actions are accepted and ignored.
    session
        .orchestrator
        .handle_control("set_mood", &Value::String("stormy".to_string()));

    // No server messages result from control handling.
    let first = session.next_message(Duration::from_millis(100)).await.unwrap();
    assert_eq!(first.kind, ServerMessageType::SessionCreated);
    assert!(session.next_message(Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn model_error_is_reported_and_session_rearms() {
    let mut session = Session::start(ScriptedTextModel::new(vec![]), false, false).await;

    session
        .inject
        .send(LiveEvent::Error("backend hiccup".to_string()))
        .await
        .unwrap();

    let messages = session
        .collect_until(ServerMessageType::Error, Duration::from_secs(2))
        .await;
    let error = messages.last().unwrap();
    assert_eq!(error.kind, ServerMessageType::Error);
    assert_eq!(error.error.as_deref(), Some("AI processing error"));

    // The session is still usable afterwards.
    assert_eq!(session.orchestrator.state(), OrchestratorState::Idle);
    session.orchestrator.handle_text_input("hello again").await.unwrap();
    assert_eq!(session.orchestrator.state(), OrchestratorState::Processing);
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let session = Session::start(ScriptedTextModel::new(vec![]), false, false).await;

    session.orchestrator.shutdown().await;
    session.orchestrator.shutdown().await; // second call is a no-op

    // Sends after shutdown are silently dropped by the closed live session.
    session.orchestrator.handle_audio_chunk("AAAA").await.unwrap();
}

#[tokio::test]
async fn audio_moves_idle_session_to_listening() {
    let session = Session::start(ScriptedTextModel::new(vec![]), false, false).await;

    assert_eq!(session.orchestrator.state(), OrchestratorState::Idle);
    session.orchestrator.handle_audio_chunk("AAAA").await.unwrap();
    assert_eq!(session.orchestrator.state(), OrchestratorState::Listening);
    assert!(session.orchestrator.current_turn_id().is_some());
}
