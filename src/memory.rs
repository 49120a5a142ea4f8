//! Session memory manager
//!
//! The orchestrator's view of conversation memory: a ring of the most recent
//! turns for fast context assembly, a rolling summary of everything
//! summarized out, and the user's learned preferences. Durable writes go
//! through the [`SessionStore`] seam and are always fire-and-forget — a
//! persistence failure is logged and swallowed, never surfaced to the
//! conversation.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{info, warn};

use crate::store::SessionStore;
use crate::textgen::TextModel;
use crate::types::{ConversationTurn, SessionMetadata, now_ts};
use crate::Result;

/// Turns kept in active memory.
const MAX_MEMORY_TURNS: usize = 20;
/// Oldest-window size handed to summarization when the ring is full.
const SUMMARIZE_WINDOW: usize = 15;
/// Turns included verbatim in the context summary.
const CONTEXT_RECENT_TURNS: usize = 10;
/// Per-turn preview length in the context summary.
const CONTEXT_PREVIEW_CHARS: usize = 150;

/// Keywords scanned by the model-less summarizer.
const SUMMARY_KEYWORDS: &[&str] = &[
    "story", "riddle", "yoruba", "zulu", "swahili", "kikuyu", "ashanti", "maasai", "anansi",
    "trickster", "proverb", "wisdom", "creation", "ancestors", "animals",
];

#[derive(Default)]
struct MemoryInner {
    turns: VecDeque<ConversationTurn>,
    metadata: Option<SessionMetadata>,
    context_summary: String,
    preferences: HashMap<String, String>,
}

/// Conversation memory for one session.
pub struct MemoryManager {
    session_id: String,
    store: Arc<dyn SessionStore>,
    model: Option<Arc<dyn TextModel>>,
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryManager {
    pub fn new(
        session_id: impl Into<String>,
        store: Arc<dyn SessionStore>,
        model: Option<Arc<dyn TextModel>>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            store,
            model,
            inner: Arc::new(Mutex::new(MemoryInner::default())),
        }
    }

    /// Initialize in-memory state and schedule the session document write.
    pub fn create_session(&self) {
        let metadata = SessionMetadata::new(&self.session_id);
        {
            let mut inner = self.inner.lock().expect("memory lock poisoned");
            inner.metadata = Some(metadata.clone());
            inner.turns.clear();
            inner.context_summary.clear();
            inner.preferences.clear();
        }

        let store = self.store.clone();
        let session_id = self.session_id.clone();
        spawn_write("create_session", async move {
            store.create_session(&session_id, &metadata).await
        });

        info!(session_id = %self.session_id, "session created");
    }

    /// Restore a previous session's metadata and recent turns.
    pub async fn load_session(&self, session_id: &str) -> bool {
        let metadata = match self.store.get_session(session_id).await {
            Ok(Some(metadata)) => metadata,
            Ok(None) => return false,
            Err(e) => {
                warn!(%e, "session load failed");
                return false;
            }
        };

        let turns = self
            .store
            .recent_turns(session_id, MAX_MEMORY_TURNS)
            .await
            .unwrap_or_default();

        let restored = turns.len();
        {
            let mut inner = self.inner.lock().expect("memory lock poisoned");
            inner.metadata = Some(metadata);
            inner.turns = turns.into();
        }

        info!(session_id, turns = restored, "session restored");
        true
    }

    /// Append a turn, trimming and summarizing when the ring is full.
    pub fn save_turn(&self, turn: ConversationTurn) {
        let summarize_window = {
            let mut inner = self.inner.lock().expect("memory lock poisoned");
            inner.turns.push_back(turn.clone());

            if inner.turns.len() > MAX_MEMORY_TURNS {
                let window: Vec<ConversationTurn> = inner
                    .turns
                    .iter()
                    .take(SUMMARIZE_WINDOW)
                    .cloned()
                    .collect();
                while inner.turns.len() > MAX_MEMORY_TURNS {
                    inner.turns.pop_front();
                }
                Some(window)
            } else {
                None
            }
        };

        if let Some(window) = summarize_window {
            self.spawn_summarize(window);
        }

        let store = self.store.clone();
        let session_id = self.session_id.clone();
        spawn_write("save_turn", async move { store.save_turn(&session_id, &turn).await });
    }

    /// Compact textual context for sub-agents: rolling summary, recent turn
    /// previews, and current preferences.
    pub fn context_summary(&self) -> String {
        let inner = self.inner.lock().expect("memory lock poisoned");
        let mut parts = Vec::new();

        if !inner.context_summary.is_empty() {
            parts.push(format!(
                "Earlier conversation summary: {}",
                inner.context_summary
            ));
        }

        let recent: Vec<&ConversationTurn> = inner
            .turns
            .iter()
            .rev()
            .take(CONTEXT_RECENT_TURNS)
            .collect();
        if !recent.is_empty() {
            parts.push("Recent conversation:".to_string());
            for turn in recent.into_iter().rev() {
                let label = if turn.role == "user" { "User" } else { "Griot" };
                let preview: String = turn.content.chars().take(CONTEXT_PREVIEW_CHARS).collect();
                parts.push(format!("  {}: {}", label, preview));
            }
        }

        if !inner.preferences.is_empty() {
            let mut prefs: Vec<String> = inner
                .preferences
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            prefs.sort();
            parts.push(format!("User preferences: {}", prefs.join(", ")));
        }

        if parts.is_empty() {
            "New conversation, no history yet.".to_string()
        } else {
            parts.join("\n")
        }
    }

    /// Merge preference updates and schedule the metadata write.
    pub fn update_preferences(&self, updates: HashMap<String, String>) {
        let doc_updates: HashMap<String, Value> = {
            let mut inner = self.inner.lock().expect("memory lock poisoned");
            for (key, value) in &updates {
                inner.preferences.insert(key.clone(), value.clone());
                if let Some(metadata) = &mut inner.metadata {
                    match key.as_str() {
                        "language_pref" => metadata.language_pref = value.clone(),
                        "age_group" => metadata.age_group = value.clone(),
                        "region_pref" => metadata.region_pref = Some(value.clone()),
                        _ => {}
                    }
                }
            }
            updates
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect()
        };

        let store = self.store.clone();
        let session_id = self.session_id.clone();
        spawn_write("update_preferences", async move {
            store.update_session(&session_id, doc_updates).await
        });
    }

    /// Final metadata write on disconnect. This one is awaited: teardown is
    /// the only caller and has nothing better to do.
    pub async fn finalize_session(&self) {
        let (turn_count, summary) = {
            let inner = self.inner.lock().expect("memory lock poisoned");
            (inner.turns.len(), inner.context_summary.clone())
        };

        let mut updates = HashMap::new();
        updates.insert("last_active".to_string(), serde_json::json!(now_ts()));
        updates.insert("turn_count".to_string(), serde_json::json!(turn_count));
        updates.insert("final_summary".to_string(), Value::String(summary));

        if let Err(e) = self.store.update_session(&self.session_id, updates).await {
            warn!(%e, session_id = %self.session_id, "session finalize write failed");
        }
        info!(session_id = %self.session_id, turns = turn_count, "session finalized");
    }

    /// Current preferences snapshot.
    pub fn preferences(&self) -> HashMap<String, String> {
        self.inner
            .lock()
            .expect("memory lock poisoned")
            .preferences
            .clone()
    }

    fn spawn_summarize(&self, window: Vec<ConversationTurn>) {
        let inner = self.inner.clone();
        let model = self.model.clone();
        let session_id = self.session_id.clone();

        tokio::spawn(async move {
            let summary = match &model {
                Some(model) => match summarize_with_model(model.as_ref(), &window).await {
                    Ok(summary) => summary,
                    Err(e) => {
                        warn!(%e, session_id, "model summarization failed, using keywords");
                        keyword_summary(&window)
                    }
                },
                None => keyword_summary(&window),
            };

            let mut inner = inner.lock().expect("memory lock poisoned");
            inner.context_summary = summary;
            info!(session_id, turns = window.len(), "summarized old turns");
        });
    }
}

/// Keyword-extraction summary used when no model is available.
fn keyword_summary(turns: &[ConversationTurn]) -> String {
    let all_text: String = turns
        .iter()
        .map(|t| t.content.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");

    let topics: Vec<&str> = SUMMARY_KEYWORDS
        .iter()
        .filter(|kw| all_text.contains(**kw))
        .take(5)
        .copied()
        .collect();

    let topic_line = if topics.is_empty() {
        "general conversation".to_string()
    } else {
        topics.join(", ")
    };

    format!(
        "The conversation covered {} turns. Key topics: {}",
        turns.len(),
        topic_line
    )
}

async fn summarize_with_model(
    model: &dyn TextModel,
    turns: &[ConversationTurn],
) -> Result<String> {
    let transcript: String = turns
        .iter()
        .map(|t| {
            let label = if t.role == "user" { "User" } else { "Agent" };
            let preview: String = t.content.chars().take(200).collect();
            format!("{}: {}", label, preview)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        "Compress this conversation excerpt into two sentences, keeping the \
         cultures, stories, and riddles that were discussed:\n\n{}",
        transcript
    );

    model
        .generate(&prompt, "You summarize conversations concisely.")
        .await
}

fn spawn_write<F>(label: &'static str, fut: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            warn!(op = label, %e, "persistence write failed");
        }
    });
}
