//! Primary orchestrator
//!
//! One orchestrator per connection. It owns the session state machine,
//! pipes client media into the live-model session, turns the model's
//! `function_call` events into schema-enforced sub-agent dispatches, and
//! controls the outbound stream.
//!
//! ```text
//! client media ──▶ LiveSession ──▶ events ──▶ consumer task
//!                                              │ text/audio → controller
//!                                              │ function_call → tool task
//!                                              │     └─▶ A2A → agent → cultural → controller
//!                                              │         └─▶ send_function_response
//!                                              └ turn_complete → turn_end
//! ```
//!
//! State is mutated only through the orchestrator's methods; the gateway
//! loops and the event consumer call in, nothing reaches inside. Detached
//! image tasks are the one kind of work an interrupt does not cancel — they
//! carry their own sequencing and may resolve after `turn_end`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::a2a;
use crate::agents::Agent;
use crate::agents::cultural::CulturalAgent;
use crate::agents::riddle::RiddleAgent;
use crate::agents::story::StoryAgent;
use crate::agents::visual::{ImageModel, MediaStore, VisualAgent};
use crate::config::Settings;
use crate::dispatch::AgentDispatcher;
use crate::knowledge::CulturalKnowledge;
use crate::live::{LiveConnector, LiveEvent, LiveSession, ToolDeclaration};
use crate::memory::MemoryManager;
use crate::store::SessionStore;
use crate::stream::{OutputQueue, StreamingController};
use crate::textgen::TextModel;
use crate::types::{
    AgentRequest, A2aTaskState, ConversationTurn, Intent, OrchestratorState, ServerMessage,
};
use crate::Result;

/// Persona and tool-use guidance for the live model.
const SYSTEM_INSTRUCTION: &str = "\
You are Griot, a warm storyteller in the oral tradition. Ground every story \
and riddle in a specific named culture, use its traditional openings and \
closings, weave in proverbs, and invite the listener to respond. When the \
listener asks for a story call tell_story; for a riddle or word game call \
pose_riddle; to illustrate a scene call generate_scene_image; when you need \
cultural facts call get_cultural_context rather than guessing. Never \
fabricate cultural facts and never mix traditions. Keep the register \
conversational and spoken, not academic.";

/// Tool declarations advertised to the live model.
pub fn tool_declarations() -> Vec<ToolDeclaration> {
    vec![
        ToolDeclaration {
            name: "tell_story".to_string(),
            description: "Generate an oral-tradition story. Call when the user wants a story, \
                          tale, or narrative."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "culture": { "type": "string", "description": "Culture or tradition to draw from" },
                    "theme": { "type": "string", "description": "Story theme, e.g. trickster, creation, wisdom" },
                    "complexity": { "type": "string", "enum": ["child", "teen", "adult"] }
                },
                "required": ["culture", "theme"]
            }),
        },
        ToolDeclaration {
            name: "pose_riddle".to_string(),
            description: "Generate an interactive riddle. Call when the user wants a riddle, \
                          puzzle, or word game."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "culture": { "type": "string", "description": "Culture to draw the riddle from" },
                    "difficulty": { "type": "string", "enum": ["easy", "medium", "hard"] }
                },
                "required": ["culture"]
            }),
        },
        ToolDeclaration {
            name: "generate_scene_image".to_string(),
            description: "Create a visual illustration of the current scene. Call when the user \
                          wants to see or visualize something."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "scene_description": { "type": "string", "description": "Detailed scene to illustrate" },
                    "culture": { "type": "string", "description": "Cultural context for art style" }
                },
                "required": ["scene_description"]
            }),
        },
        ToolDeclaration {
            name: "get_cultural_context".to_string(),
            description: "Retrieve cultural background information instead of guessing facts."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "topic": { "type": "string", "description": "The cultural topic to look up" },
                    "culture": { "type": "string", "description": "The specific culture" }
                },
                "required": ["topic"]
            }),
        },
    ]
}

fn new_turn_id() -> String {
    format!("turn_{}", &Uuid::new_v4().simple().to_string()[..8])
}

/// Per-session orchestration state machine.
pub struct Orchestrator {
    session_id: String,
    memory: Arc<MemoryManager>,
    dispatcher: Arc<AgentDispatcher>,
    controller: Arc<StreamingController>,
    queue: Arc<OutputQueue>,
    live: Arc<LiveSession>,

    state: Mutex<OrchestratorState>,
    current_turn_id: Mutex<Option<String>>,
    agent_turn_buffer: Mutex<String>,
    active_tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Orchestrator {
    /// Build the per-session machinery and open the live-model session.
    #[allow(clippy::too_many_arguments)]
    pub async fn connect(
        session_id: &str,
        settings: &Settings,
        store: Arc<dyn SessionStore>,
        text_model: Arc<dyn TextModel>,
        image_model: Option<Arc<dyn ImageModel>>,
        media_store: Option<Arc<dyn MediaStore>>,
        connector: &dyn LiveConnector,
        queue: Arc<OutputQueue>,
    ) -> Result<Arc<Self>> {
        let started = std::time::Instant::now();

        let memory = Arc::new(MemoryManager::new(
            session_id,
            store,
            Some(text_model.clone()),
        ));
        memory.create_session();

        let cultural = Arc::new(CulturalAgent::new(
            Some(text_model.clone()),
            CulturalKnowledge::seed(),
            settings.cultural_confidence_threshold,
            settings.cultural_reject_threshold,
        ));
        let dispatcher = Arc::new(AgentDispatcher::new(
            session_id,
            Arc::new(StoryAgent::new(text_model.clone())),
            Arc::new(RiddleAgent::new(text_model)),
            cultural,
            Arc::new(VisualAgent::new(image_model, media_store)),
            std::time::Duration::from_secs_f64(settings.agent_timeout_seconds),
        ));
        let controller = Arc::new(StreamingController::new(queue.clone(), session_id));

        let backend = connector
            .connect(SYSTEM_INSTRUCTION, &tool_declarations())
            .await?;
        let live = LiveSession::start(session_id, backend);

        let orchestrator = Arc::new(Self {
            session_id: session_id.to_string(),
            memory,
            dispatcher,
            controller,
            queue,
            live,
            state: Mutex::new(OrchestratorState::Idle),
            current_turn_id: Mutex::new(None),
            agent_turn_buffer: Mutex::new(String::new()),
            active_tasks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        });

        orchestrator.spawn_event_consumer();

        info!(
            session_id,
            latency_ms = started.elapsed().as_millis() as u64,
            "orchestrator initialized"
        );
        Ok(orchestrator)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, state: OrchestratorState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    pub fn current_turn_id(&self) -> Option<String> {
        self.current_turn_id
            .lock()
            .expect("turn id lock poisoned")
            .clone()
    }

    fn ensure_turn_id(&self) -> String {
        let mut guard = self.current_turn_id.lock().expect("turn id lock poisoned");
        guard.get_or_insert_with(new_turn_id).clone()
    }

    fn replace_turn_id(&self) -> String {
        let turn_id = new_turn_id();
        *self.current_turn_id.lock().expect("turn id lock poisoned") = Some(turn_id.clone());
        turn_id
    }

    // ------------------------------------------------------------------
    // Client-message entry points (called by the gateway receive loop)
    // ------------------------------------------------------------------

    /// Forward one audio frame to the live model.
    pub async fn handle_audio_chunk(&self, audio_b64: &str) -> Result<()> {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if matches!(
                *state,
                OrchestratorState::Idle | OrchestratorState::Listening
            ) {
                *state = OrchestratorState::Listening;
            }
        }
        self.ensure_turn_id();
        self.live.send_audio(audio_b64).await
    }

    /// Forward one video frame so the model can see what the user shows.
    pub async fn handle_video_frame(&self, frame_b64: &str, width: u32, height: u32) -> Result<()> {
        self.live.send_video_frame(frame_b64, width, height).await
    }

    /// Handle a typed utterance: save the user turn and hand it to the model.
    pub async fn handle_text_input(&self, text: &str) -> Result<()> {
        let turn_id = self.replace_turn_id();
        self.set_state(OrchestratorState::Processing);

        let preview: String = text.chars().take(100).collect();
        info!(
            session_id = %self.session_id,
            turn_id = %turn_id,
            preview = %preview,
            "text input"
        );

        self.memory
            .save_turn(ConversationTurn::user(turn_id, text));
        self.live.send_text(text).await
    }

    /// Barge-in: stop generation, cancel tool tasks, drain the queue.
    pub async fn handle_interrupt(&self) {
        info!(
            session_id = %self.session_id,
            turn_id = ?self.current_turn_id(),
            "user interrupted"
        );
        self.set_state(OrchestratorState::Interrupted);

        self.cancel_active_tasks();

        if let Err(e) = self.live.send_interrupt().await {
            warn!(session_id = %self.session_id, %e, "interrupt signal failed");
        }

        let dropped = self.queue.drain();
        if dropped > 0 {
            info!(session_id = %self.session_id, dropped, "drained output queue");
        }
        self.agent_turn_buffer
            .lock()
            .expect("agent turn buffer lock poisoned")
            .clear();

        self.set_state(OrchestratorState::Listening);
        self.replace_turn_id();
    }

    /// Session-scoped control actions; unknown actions are ignored.
    pub fn handle_control(&self, action: &str, value: &Value) {
        info!(session_id = %self.session_id, action, "control");
        let value_str = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        let key = match action {
            "set_language" => "language_pref",
            "set_age_group" => "age_group",
            "set_region" => "region_pref",
            _ => return,
        };

        let mut updates = HashMap::new();
        updates.insert(key.to_string(), value_str);
        self.memory.update_preferences(updates);
    }

    /// Restore a previous session for continuity.
    pub async fn restore_session(&self, session_id: &str) {
        if self.memory.load_session(session_id).await {
            info!(session_id, "session restored");
        }
    }

    /// Clean shutdown: cancel tool tasks, release the live session,
    /// finalize memory. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session_id = %self.session_id, "orchestrator shutting down");

        self.cancel_active_tasks();
        self.live.close().await;
        self.memory.finalize_session().await;
    }

    fn cancel_active_tasks(&self) {
        let mut tasks = self.active_tasks.lock().expect("task list lock poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    // ------------------------------------------------------------------
    // Live-model event consumption
    // ------------------------------------------------------------------

    fn spawn_event_consumer(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = this.live.next_event().await {
                this.handle_live_event(event).await;
            }
            info!(session_id = %this.session_id, "live event stream ended");
        });
    }

    async fn handle_live_event(self: &Arc<Self>, event: LiveEvent) {
        match event {
            LiveEvent::Text(text) => {
                self.set_state(OrchestratorState::Streaming);
                self.agent_turn_buffer
                    .lock()
                    .expect("agent turn buffer lock poisoned")
                    .push_str(&text);
                if let Err(e) = self.controller.send_text_chunk(&text, "orchestrator").await {
                    warn!(session_id = %self.session_id, %e, "text chunk enqueue failed");
                }
            }
            LiveEvent::Audio(audio_b64) => {
                self.set_state(OrchestratorState::Streaming);
                if let Err(e) = self.controller.send_audio_chunk(&audio_b64).await {
                    warn!(session_id = %self.session_id, %e, "audio chunk enqueue failed");
                }
            }
            LiveEvent::FunctionCall { id, name, args } => {
                self.set_state(OrchestratorState::Processing);
                let this = self.clone();
                let task = tokio::spawn(async move {
                    this.handle_function_call(id, name, args).await;
                });
                let mut tasks = self.active_tasks.lock().expect("task list lock poisoned");
                tasks.retain(|t| !t.is_finished());
                tasks.push(task);
            }
            LiveEvent::Interrupted => {
                self.handle_interrupt().await;
                let _ = self
                    .queue
                    .push(ServerMessage::interrupted(&self.session_id))
                    .await;
            }
            LiveEvent::TurnComplete => {
                self.set_state(OrchestratorState::Idle);
                if let Err(e) = self.controller.send_turn_end().await {
                    warn!(session_id = %self.session_id, %e, "turn end enqueue failed");
                }

                let content = std::mem::take(
                    &mut *self
                        .agent_turn_buffer
                        .lock()
                        .expect("agent turn buffer lock poisoned"),
                );
                let turn_id = self
                    .current_turn_id
                    .lock()
                    .expect("turn id lock poisoned")
                    .take();
                if let (Some(turn_id), false) = (turn_id, content.trim().is_empty()) {
                    self.memory
                        .save_turn(ConversationTurn::agent(turn_id, "orchestrator", content));
                }
            }
            LiveEvent::Error(message) => {
                error!(session_id = %self.session_id, %message, "live model error");
                self.set_state(OrchestratorState::Error);
                if let Err(e) = self.controller.send_error("AI processing error").await {
                    warn!(session_id = %self.session_id, %e, "error enqueue failed");
                }
                // The session stays usable; re-arm on next input.
                self.set_state(OrchestratorState::Idle);
            }
        }
    }

    // ------------------------------------------------------------------
    // Tool-call handling
    // ------------------------------------------------------------------

    /// Resolve one `function_call` event end to end. The function response
    /// is always sent, even when every layer of dispatch failed — the model
    /// must never hang waiting on a missing tool result.
    async fn handle_function_call(self: &Arc<Self>, id: String, name: String, args: Value) {
        let started = std::time::Instant::now();
        info!(
            session_id = %self.session_id,
            tool = %name,
            "function call"
        );

        let intent = match name.as_str() {
            "tell_story" => Intent::RequestStory,
            "pose_riddle" => Intent::RequestRiddle,
            "generate_scene_image" => Intent::RequestImage,
            "get_cultural_context" => Intent::AskCultural,
            _ => Intent::Unknown,
        };
        let agent_label = AgentDispatcher::agent_for(intent);

        if agent_label != "orchestrator" {
            let _ = self.controller.send_agent_state(agent_label, "running").await;
        }

        let result_text = match self.dispatch_tool(intent, &name, &args).await {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    tool = %name,
                    %e,
                    "schema-typed dispatch failed, falling back to legacy path"
                );
                self.legacy_dispatch(intent, &args).await
            }
        };

        if let Err(e) = self
            .live
            .send_function_response(&id, &name, &result_text)
            .await
        {
            warn!(session_id = %self.session_id, %e, "function response send failed");
        }

        info!(
            session_id = %self.session_id,
            tool = %name,
            latency_ms = started.elapsed().as_millis() as u64,
            "function call complete"
        );
    }

    /// Schema-typed (canonical) tool dispatch.
    async fn dispatch_tool(self: &Arc<Self>, intent: Intent, name: &str, args: &Value) -> Result<String> {
        match name {
            "tell_story" => self.run_story(args).await,
            "pose_riddle" => self.run_riddle(args).await,
            "generate_scene_image" => Ok(self.run_scene_image(args)),
            "get_cultural_context" => Ok(self.legacy_dispatch(intent, args).await),
            _ => Ok(String::new()),
        }
    }

    /// tell_story: stream schema-valid chunks through cultural grounding,
    /// forwarding text to the client and spawning image tasks for scenes.
    async fn run_story(self: &Arc<Self>, args: &Value) -> Result<String> {
        let input = self.a2a_input(args);
        let mut task = a2a::create_task("StoryRequest", input.clone(), "orchestrator", "story_agent")?;
        task.state = A2aTaskState::InProgress;

        let raw_stream = self.dispatcher.story.execute_streaming(input.clone()).await?;
        let mut validated = a2a::dispatch_streaming_with_schema(
            raw_stream,
            &input,
            "StoryRequest",
            "StoryChunk",
            "story_agent",
        )?;

        let culture = args.get("culture").and_then(Value::as_str).map(str::to_string);
        let mut result = String::new();

        while let Some(chunk) = validated.next().await {
            let chunk = chunk?;

            if let Some(scene) = chunk.get("scene_description").and_then(Value::as_str) {
                self.spawn_image_task(scene.to_string(), culture.clone());
            }

            let grounded = self.dispatcher.ground_story_chunk(&chunk).await;
            if let Some(text) = grounded.get("text").and_then(Value::as_str) {
                if !text.is_empty() {
                    self.set_state(OrchestratorState::Streaming);
                    let _ = self
                        .controller
                        .send_text_chunk(&format!("{text} "), "story")
                        .await;
                    result.push_str(text);
                    result.push(' ');
                }
            }
        }

        task.state = A2aTaskState::Completed;
        info!(
            session_id = %self.session_id,
            task_id = %task.task_id,
            "story task completed"
        );
        Ok(result.trim_end().to_string())
    }

    /// pose_riddle: unary schema-enforced dispatch, then stream the
    /// presentation text.
    async fn run_riddle(self: &Arc<Self>, args: &Value) -> Result<String> {
        let input = self.a2a_input(args);
        let mut task =
            a2a::create_task("RiddleRequest", input.clone(), "orchestrator", "riddle_agent")?;
        task.state = A2aTaskState::InProgress;

        let riddle = self.dispatcher.riddle.clone();
        let report = a2a::dispatch_with_schema(
            move |payload| {
                let riddle = riddle.clone();
                async move { riddle.execute(payload).await }
            },
            input,
            "RiddleRequest",
            "RiddlePayload",
            "riddle_agent",
            2,
        )
        .await?;

        task.state = A2aTaskState::Completed;
        let text = format_riddle(&report.value);

        self.set_state(OrchestratorState::Streaming);
        let _ = self.controller.send_text_chunk(&text, "riddle").await;
        Ok(text)
    }

    /// generate_scene_image: acknowledge immediately, render off-path.
    fn run_scene_image(self: &Arc<Self>, args: &Value) -> String {
        let scene = args
            .get("scene_description")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let culture = args.get("culture").and_then(Value::as_str).map(str::to_string);
        self.spawn_image_task(scene, culture);
        "Let me paint that scene for you...".to_string()
    }

    /// Compatibility path: grounded legacy streaming, collected into one
    /// result string. Never fails; degraded agents emit filler chunks.
    async fn legacy_dispatch(self: &Arc<Self>, intent: Intent, args: &Value) -> String {
        let request = self.build_request(intent, args);
        let agent_label = AgentDispatcher::agent_for(intent);
        let mut stream = self.dispatcher.dispatch(request).await;

        let mut result = String::new();
        while let Some(chunk) = stream.next().await {
            if let Some(visual) = &chunk.visual_moment {
                self.spawn_image_task(
                    visual.clone(),
                    args.get("culture").and_then(Value::as_str).map(str::to_string),
                );
            }
            if chunk.content.is_empty() {
                continue;
            }
            self.set_state(OrchestratorState::Streaming);
            let _ = self
                .controller
                .send_text_chunk(&chunk.content, agent_label)
                .await;
            result.push_str(&chunk.content);
        }
        result
    }

    /// Detached image side-channel. Interrupts do not cancel these; their
    /// results deliver whenever they resolve, sequenced at send time.
    fn spawn_image_task(self: &Arc<Self>, scene: String, culture: Option<String>) {
        if scene.trim().is_empty() {
            return;
        }
        let dispatcher = self.dispatcher.clone();
        let controller = self.controller.clone();
        let session_id = self.session_id.clone();

        tokio::spawn(async move {
            match dispatcher.generate_image(&scene, culture.as_deref()).await {
                Some(url) => {
                    if let Err(e) = controller.send_image_ready(&url).await {
                        warn!(session_id = %session_id, %e, "image_ready enqueue failed");
                    }
                }
                None => info!(session_id = %session_id, "image generation skipped"),
            }
        });
    }

    /// A2A payload: tool args plus the session context from memory.
    fn a2a_input(&self, args: &Value) -> Value {
        let mut input = match args {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        let context = self.memory.context_summary();
        if !context.is_empty() {
            input.insert("session_context".to_string(), Value::String(context));
        }
        Value::Object(input)
    }

    /// Legacy request from tool args.
    fn build_request(&self, intent: Intent, args: &Value) -> AgentRequest {
        let mut request = AgentRequest::new(intent, args.to_string());
        if let Some(topic) = args.get("topic").and_then(Value::as_str) {
            request.user_input = topic.to_string();
        }
        if let Some(scene) = args.get("scene_description").and_then(Value::as_str) {
            request.user_input = scene.to_string();
        }
        request.culture = args.get("culture").and_then(Value::as_str).map(str::to_string);
        request.theme = args.get("theme").and_then(Value::as_str).map(str::to_string);
        if let Some(complexity) = args.get("complexity").and_then(Value::as_str) {
            request.age_group = complexity.to_string();
        }
        request.session_context = Some(self.memory.context_summary());
        request.preferences = self.memory.preferences();
        request.turn_id = self.current_turn_id().unwrap_or_default();
        request.session_id = self.session_id.clone();
        request
    }
}

/// Present a riddle payload as spoken text.
fn format_riddle(payload: &Value) -> String {
    let field = |name: &str| payload.get(name).and_then(Value::as_str).unwrap_or("");

    let mut text = format!("{}\n\n{}\n", field("opening"), field("riddle_text"));
    if let Some(hints) = payload.get("hints").and_then(Value::as_array) {
        for (i, hint) in hints.iter().filter_map(|h| h.as_str()).enumerate() {
            text.push_str(&format!("Hint {}: {}\n", i + 1, hint));
        }
    }
    text.push_str(&format!(
        "The answer is: {}. {}\n",
        field("answer"),
        field("explanation")
    ));
    text
}
