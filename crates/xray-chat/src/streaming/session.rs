//! Streaming session: turns control calls into an ordered event stream.
//!
//! ```text
//! orchestrator ──emit_*──▶ StreamingSession ──Frame──▶ EventSink ══mpsc══▶ EventStream ──▶ transport
//!                               │                         ▲
//!                               └── heartbeat task ─ping──┘
//! ```
//!
//! Content events and pings go through the same bounded queue, so the
//! consumer sees them in push order. A full queue blocks the producer.
//! `stop` ends the heartbeat and pushes [`Frame::End`]; the consumer
//! receives everything queued before it.
//!
//! The consumer side owns the timeout: if no non-ping event arrives within
//! the session timeout, [`EventStream::next`] yields an `error` event with
//! code `timeout`, cancels the session and ends.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::event::{ContentKind, DeltaKind, StreamEvent, StreamEventType};
use crate::config::StreamConfig;

/// Error code carried by the event emitted on session timeout.
pub const TIMEOUT_CODE: &str = "timeout";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The consumer is gone or the session was stopped.
    #[error("stream closed")]
    Closed,

    #[error("content block order violated: {0}")]
    BlockOrder(String),

    #[error("session not started")]
    NotStarted,
}

pub type StreamResult<T> = Result<T, StreamError>;

/// Unit of the session queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(StreamEvent),
    /// End-of-stream sentinel pushed by [`StreamingSession::stop`].
    End,
}

/// Destination of a session's frames.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one frame, waiting while the destination is full.
    async fn push(&self, frame: Frame) -> StreamResult<()>;
}

/// Bounded-queue sink paired with an [`EventStream`].
#[derive(Debug, Clone)]
pub struct QueueSink {
    tx: mpsc::Sender<Frame>,
}

#[async_trait]
impl EventSink for QueueSink {
    async fn push(&self, frame: Frame) -> StreamResult<()> {
        self.tx.send(frame).await.map_err(|_| StreamError::Closed)
    }
}

/// Token usage reported in `message_delta`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    active: bool,
    stopped: bool,
    started_at: Option<Instant>,
    open_block: Option<usize>,
    last_block: Option<usize>,
    total_tokens: u64,
}

impl SessionState {
    fn ensure_active(&self) -> StreamResult<()> {
        if self.stopped {
            Err(StreamError::Closed)
        } else if !self.active {
            Err(StreamError::NotStarted)
        } else {
            Ok(())
        }
    }

    fn open(&mut self, index: usize) -> StreamResult<()> {
        if let Some(open) = self.open_block {
            return Err(StreamError::BlockOrder(format!(
                "block {index} started while block {open} is open"
            )));
        }
        if let Some(last) = self.last_block {
            if index <= last {
                return Err(StreamError::BlockOrder(format!(
                    "block {index} does not follow block {last}"
                )));
            }
        }
        self.open_block = Some(index);
        self.last_block = Some(index);
        Ok(())
    }

    fn require_open(&self, index: usize) -> StreamResult<()> {
        match self.open_block {
            Some(open) if open == index => Ok(()),
            Some(open) => Err(StreamError::BlockOrder(format!(
                "block {index} used while block {open} is open"
            ))),
            None => Err(StreamError::BlockOrder(format!("block {index} is not open"))),
        }
    }
}

/// One turn's outgoing stream. Never reused across turns.
pub struct StreamingSession {
    session_id: String,
    message_id: String,
    heartbeat_interval: Duration,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    heartbeat_cancel: CancellationToken,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<SessionState>,
}

impl StreamingSession {
    /// Session writing to a bounded queue, plus the consumer end of it.
    pub fn new(session_id: impl Into<String>, config: &StreamConfig) -> (Self, EventStream) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let session = Self::with_sink(
            session_id,
            config.heartbeat_interval,
            Arc::new(QueueSink { tx }),
            cancel.clone(),
        );
        let stream = EventStream {
            rx,
            cancel,
            timeout: config.timeout,
            last_progress: Instant::now(),
            finished: false,
            session_id: session.session_id.clone(),
        };
        (session, stream)
    }

    /// Session writing to an arbitrary sink.
    pub fn with_sink(
        session_id: impl Into<String>,
        heartbeat_interval: Duration,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        let heartbeat_cancel = cancel.child_token();
        Self {
            session_id: session_id.into(),
            message_id: uuid::Uuid::new_v4().to_string(),
            heartbeat_interval,
            sink,
            cancel,
            heartbeat_cancel,
            heartbeat: Mutex::new(None),
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        let state = self.state();
        state.active && !state.stopped
    }

    /// Cancelled on disconnect, timeout, or stop.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn total_tokens(&self) -> u64 {
        self.state().total_tokens
    }

    /// Time since `start`, zero before it.
    pub fn elapsed(&self) -> Duration {
        self.state()
            .started_at
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    /// Activate the session and start the heartbeat. Idempotent.
    pub fn start(&self) -> StreamResult<()> {
        {
            let mut state = self.state();
            if state.stopped {
                return Err(StreamError::Closed);
            }
            if state.active {
                return Ok(());
            }
            state.active = true;
            state.started_at = Some(Instant::now());
        }

        let sink = Arc::clone(&self.sink);
        let cancel = self.heartbeat_cancel.clone();
        let period = self.heartbeat_interval;
        let session_id = self.session_id.clone();
        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticks.tick() => {
                        let ping = StreamEvent::new(
                            StreamEventType::Ping,
                            json!({ "timestamp": Utc::now().to_rfc3339() }),
                        );
                        trace!(session_id = %session_id, "heartbeat");
                        let pushed = tokio::select! {
                            _ = cancel.cancelled() => break,
                            pushed = sink.push(Frame::Event(ping)) => pushed,
                        };
                        if pushed.is_err() {
                            debug!(session_id = %session_id, "heartbeat stopped, consumer gone");
                            break;
                        }
                    }
                }
            }
        });
        *self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(session_id = %self.session_id, message_id = %self.message_id, "streaming session started");
        Ok(())
    }

    async fn push(&self, event_type: StreamEventType, data: Value) -> StreamResult<()> {
        if self.cancel.is_cancelled() {
            return Err(StreamError::Closed);
        }
        self.sink
            .push(Frame::Event(StreamEvent::new(event_type, data)))
            .await
    }

    pub async fn emit_message_start(&self, metadata: Value) -> StreamResult<()> {
        self.state().ensure_active()?;
        self.push(
            StreamEventType::MessageStart,
            json!({
                "message_id": self.message_id,
                "session_id": self.session_id,
                "metadata": metadata,
            }),
        )
        .await
    }

    pub async fn emit_content_start(
        &self,
        index: usize,
        kind: ContentKind,
        metadata: Option<Value>,
    ) -> StreamResult<()> {
        {
            let mut state = self.state();
            state.ensure_active()?;
            state.open(index)?;
        }
        self.push(
            StreamEventType::ContentBlockStart,
            json!({
                "index": index,
                "content_type": kind.as_str(),
                "metadata": metadata.unwrap_or_else(|| json!({})),
            }),
        )
        .await
    }

    pub async fn emit_content_delta(&self, index: usize, text: &str, kind: DeltaKind) -> StreamResult<()> {
        {
            let state = self.state();
            state.ensure_active()?;
            state.require_open(index)?;
        }
        self.push(
            StreamEventType::ContentBlockDelta,
            json!({
                "index": index,
                "delta": { "type": kind.as_str(), "text": text },
            }),
        )
        .await
    }

    pub async fn emit_content_stop(&self, index: usize) -> StreamResult<()> {
        {
            let mut state = self.state();
            state.ensure_active()?;
            state.require_open(index)?;
            state.open_block = None;
        }
        self.push(StreamEventType::ContentBlockStop, json!({ "index": index }))
            .await
    }

    pub async fn emit_message_delta(&self, usage: Usage) -> StreamResult<()> {
        {
            let mut state = self.state();
            state.ensure_active()?;
            state.total_tokens = usage.total_tokens;
        }
        self.push(StreamEventType::MessageDelta, json!({ "usage": usage }))
            .await
    }

    /// Final event of a message. `extra` fields are merged last and win.
    pub async fn emit_message_stop(&self, extra: Map<String, Value>) -> StreamResult<()> {
        let (total_tokens, elapsed) = {
            let state = self.state();
            state.ensure_active()?;
            if let Some(open) = state.open_block {
                return Err(StreamError::BlockOrder(format!(
                    "message stopped while block {open} is open"
                )));
            }
            let elapsed = state.started_at.map(|t| t.elapsed()).unwrap_or_default();
            (state.total_tokens, elapsed)
        };

        let mut data = Map::new();
        data.insert("message_id".into(), json!(self.message_id));
        data.insert("stop_reason".into(), json!("end_turn"));
        data.insert(
            "usage".into(),
            json!({
                "total_tokens": total_tokens,
                "processing_time_ms": elapsed.as_millis() as u64,
            }),
        );
        data.extend(extra);
        self.push(StreamEventType::MessageStop, Value::Object(data))
            .await
    }

    /// Allowed before `start`; the consumer must hear about early failures.
    pub async fn emit_error(&self, message: &str, code: &str) -> StreamResult<()> {
        if self.state().stopped {
            return Err(StreamError::Closed);
        }
        warn!(session_id = %self.session_id, code, "streaming error event");
        self.push(
            StreamEventType::Error,
            json!({ "error": { "type": code, "message": message } }),
        )
        .await
    }

    /// Stop the heartbeat and push the end-of-stream sentinel. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.active = false;
        }

        self.heartbeat_cancel.cancel();
        let handle = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        if !self.cancel.is_cancelled() && self.sink.push(Frame::End).await.is_err() {
            debug!(session_id = %self.session_id, "consumer gone before end of stream");
        }
        self.cancel.cancel();
        info!(session_id = %self.session_id, elapsed_ms = self.elapsed_ms(), "streaming session stopped");
    }

    fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        self.heartbeat_cancel.cancel();
    }
}

/// Consumer end of a [`StreamingSession`].
///
/// Dropping it counts as a client disconnect.
pub struct EventStream {
    rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    timeout: Duration,
    last_progress: Instant,
    finished: bool,
    session_id: String,
}

impl EventStream {
    /// Next event, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let deadline = self.last_progress + self.timeout;
        match tokio::time::timeout_at(deadline, self.rx.recv()).await {
            Ok(Some(Frame::Event(event))) => {
                if !event.is_ping() {
                    self.last_progress = Instant::now();
                }
                Some(event)
            }
            Ok(Some(Frame::End)) | Ok(None) => {
                self.finished = true;
                None
            }
            Err(_) => {
                warn!(
                    session_id = %self.session_id,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "streaming session timed out"
                );
                self.finish();
                Some(StreamEvent::new(
                    StreamEventType::Error,
                    json!({
                        "error": {
                            "type": TIMEOUT_CODE,
                            "message": "The response took too long and was stopped.",
                        }
                    }),
                ))
            }
        }
    }

    /// Client went away: stop draining and cancel the producer side.
    pub fn disconnect(&mut self) {
        if !self.finished {
            info!(session_id = %self.session_id, "client disconnected");
        }
        self.finish();
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn finish(&mut self) {
        self.finished = true;
        self.cancel.cancel();
        self.rx.close();
    }

    /// Drain every remaining event.
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }

    /// SSE frames, one per event.
    pub fn into_sse(self) -> impl Stream<Item = String> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            let event = stream.next().await?;
            Some((event.to_sse(), stream))
        })
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
