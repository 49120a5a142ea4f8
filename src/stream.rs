//! Streaming controller and output queue
//!
//! Everything headed for the client funnels through a bounded
//! [`OutputQueue`] shared between the per-session controller (producer side)
//! and the gateway's send loop (consumer side). The queue is a hand-rolled
//! notify-based ring rather than an mpsc channel because the orchestrator
//! must be able to *drain* it on interrupt — an operation channel senders
//! cannot perform.
//!
//! The [`StreamingController`] shapes the stream:
//!
//! - text fragments buffer until a sentence boundary (`. ! ? …` or newline)
//!   or 200 characters, then flush as one `text_chunk`
//! - audio passes through one message per frame
//! - `turn_end` flushes any remaining text first, so turn boundaries are
//!   total per connection
//! - enqueueing is non-blocking first, then waits up to 5 s; on timeout,
//!   droppable messages are shed with an error log while `turn_end` and
//!   `error` retry until delivered or the connection dies

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::types::ServerMessage;
use crate::{Error, Result};

/// Flush threshold for the text buffer.
const TEXT_BUFFER_MAX: usize = 200;
/// Bounded wait before a full queue sheds a droppable message.
const BACKPRESSURE_WAIT: Duration = Duration::from_secs(5);

/// Bounded, drainable queue of outbound messages.
pub struct OutputQueue {
    inner: Mutex<VecDeque<ServerMessage>>,
    capacity: usize,
    items: Notify,
    space: Notify,
    closed: AtomicBool,
}

impl OutputQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            items: Notify::new(),
            space: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Non-blocking enqueue.
    pub fn try_push(&self, msg: ServerMessage) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let mut queue = self.inner.lock().expect("output queue lock poisoned");
        if queue.len() >= self.capacity {
            return Err(Error::Backpressure);
        }
        queue.push_back(msg);
        drop(queue);
        self.items.notify_one();
        Ok(())
    }

    /// Enqueue, waiting for space as long as the queue stays open.
    pub async fn push(&self, msg: ServerMessage) -> Result<()> {
        let mut msg = Some(msg);
        loop {
            if self.is_closed() {
                return Err(Error::ConnectionClosed);
            }

            let notified = self.space.notified();
            {
                let mut queue = self.inner.lock().expect("output queue lock poisoned");
                if queue.len() < self.capacity {
                    queue.push_back(msg.take().expect("message consumed twice"));
                    drop(queue);
                    self.items.notify_one();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Dequeue the next message; `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<ServerMessage> {
        loop {
            let notified = self.items.notified();
            {
                let mut queue = self.inner.lock().expect("output queue lock poisoned");
                if let Some(msg) = queue.pop_front() {
                    drop(queue);
                    self.space.notify_one();
                    return Some(msg);
                }
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Discard everything queued; returns how many messages were dropped.
    pub fn drain(&self) -> usize {
        let mut queue = self.inner.lock().expect("output queue lock poisoned");
        let dropped = queue.len();
        queue.clear();
        drop(queue);
        self.space.notify_waiters();
        dropped
    }

    /// Close the queue, waking all waiters. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.items.notify_waiters();
        self.space.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("output queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shapes the per-session output stream.
pub struct StreamingController {
    queue: std::sync::Arc<OutputQueue>,
    session_id: String,
    text_buffer: Mutex<String>,
    chunks_sent: AtomicU64,
    stream_started: Mutex<Option<Instant>>,
}

impl StreamingController {
    pub fn new(queue: std::sync::Arc<OutputQueue>, session_id: impl Into<String>) -> Self {
        Self {
            queue,
            session_id: session_id.into(),
            text_buffer: Mutex::new(String::new()),
            chunks_sent: AtomicU64::new(0),
            stream_started: Mutex::new(None),
        }
    }

    /// Buffer a text fragment; flush on sentence boundary or overflow.
    pub async fn send_text_chunk(&self, text: &str, agent: &str) -> Result<()> {
        let flushable = {
            let mut buffer = self.text_buffer.lock().expect("text buffer lock poisoned");
            buffer.push_str(text);
            if at_sentence_boundary(&buffer) || buffer.len() > TEXT_BUFFER_MAX {
                Some(std::mem::take(&mut *buffer))
            } else {
                None
            }
        };

        if let Some(text) = flushable {
            self.flush_text(text, agent).await?;
        }
        Ok(())
    }

    async fn flush_text(&self, text: String, agent: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }

        if self.chunks_sent.load(Ordering::SeqCst) == 0 {
            *self.stream_started.lock().expect("stream start lock poisoned") =
                Some(Instant::now());
        }

        self.enqueue(ServerMessage::text_chunk(text, agent)).await?;
        self.chunks_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Pass one audio frame through.
    pub async fn send_audio_chunk(&self, audio_b64: &str) -> Result<()> {
        self.enqueue(ServerMessage::audio_chunk(audio_b64)).await
    }

    /// Announce a completed async image.
    pub async fn send_image_ready(&self, url: &str) -> Result<()> {
        self.enqueue(ServerMessage::image_ready(url)).await?;
        info!(session_id = %self.session_id, "image sent to client");
        Ok(())
    }

    /// Advisory agent-state hint for the client UX.
    pub async fn send_agent_state(&self, agent: &str, state: &str) -> Result<()> {
        self.enqueue(ServerMessage::agent_state(agent, state)).await
    }

    /// Flush the remaining buffer, then mark the end of the turn.
    pub async fn send_turn_end(&self) -> Result<()> {
        let remaining =
            std::mem::take(&mut *self.text_buffer.lock().expect("text buffer lock poisoned"));
        if !remaining.trim().is_empty() {
            self.flush_text(remaining, "orchestrator").await?;
        }

        self.enqueue(ServerMessage::turn_end()).await?;

        let started = self
            .stream_started
            .lock()
            .expect("stream start lock poisoned")
            .take();
        if let Some(started) = started {
            info!(
                session_id = %self.session_id,
                chunks_sent = self.chunks_sent.load(Ordering::SeqCst),
                latency_ms = started.elapsed().as_millis() as u64,
                "turn complete"
            );
        }
        self.chunks_sent.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Send a user-visible error.
    pub async fn send_error(&self, message: &str) -> Result<()> {
        self.enqueue(ServerMessage::error(message)).await
    }

    /// Enqueue with the backpressure policy.
    async fn enqueue(&self, msg: ServerMessage) -> Result<()> {
        match self.queue.try_push(msg.clone()) {
            Ok(()) => return Ok(()),
            Err(Error::ConnectionClosed) => return Err(Error::ConnectionClosed),
            Err(_) => {
                warn!(session_id = %self.session_id, "output queue full, applying backpressure");
            }
        }

        if msg.is_droppable() {
            match timeout(BACKPRESSURE_WAIT, self.queue.push(msg)).await {
                Ok(result) => result,
                Err(_) => {
                    error!(
                        session_id = %self.session_id,
                        "output queue timeout, dropping message"
                    );
                    Ok(())
                }
            }
        } else {
            // turn_end and error must reach the client; keep trying until
            // the message lands or the connection is gone.
            loop {
                match timeout(BACKPRESSURE_WAIT, self.queue.push(msg.clone())).await {
                    Ok(Ok(())) => return Ok(()),
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        error!(
                            session_id = %self.session_id,
                            kind = ?msg.kind,
                            "output queue timeout on non-droppable message, retrying"
                        );
                    }
                }
            }
        }
    }
}

/// True when the buffered text should flush at a sentence boundary.
fn at_sentence_boundary(buffer: &str) -> bool {
    let trimmed = buffer.trim_end_matches([' ', '\t']);
    trimmed.ends_with(['.', '!', '?', '…', '\n'])
}
