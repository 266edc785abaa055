//! Two-phase, tool-aware turn orchestration.
//!
//! ```text
//! phase 1 (decide)   generate_stream(tools offered, short budget)
//!                      │ chunks
//!                      ▼
//!                  StreamClassifier ──text-shaped──▶ text deltas, forwarded live
//!                      │ json-shaped, buffered to the end
//!                      ▼
//!                  ToolCallParser ──none──▶ buffered text emitted verbatim
//!                      │ ToolCall
//! phase 2 (execute)    ▼
//!                  thinking ▸ tool_use block (status, detections) ▸ follow-up text stream
//! ```
//!
//! Each turn runs on its own task and talks to the client only through its
//! [`StreamingSession`]. Backend calls go through [`Services`], which wraps
//! them in the breaker and retry policy of their backend. The session's
//! cancellation token is handed to the generation worker; once the client
//! disconnects, inference stops at the next chunk and no tool runs.

pub mod classifier;
pub mod prompts;

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use xray_core::detection::Detection;
use xray_core::error::{ServiceError, ServiceResult};
use xray_core::fusion::{fuse, FusionMode, FusionOutcome};
use xray_core::tool_call::{ToolCall, ToolCallParser, ToolName};

use crate::config::ChatConfig;
use crate::services::{
    ChatMessage, ChunkSink, GenerationRequest, SharedServices, XrayImage, CHUNK_CHANNEL_CAPACITY,
};
use crate::streaming::{
    ContentKind, DeltaKind, EventStream, StreamError, StreamingSession, Usage,
};
use classifier::{Classified, StreamClassifier};

// ── Request / outcome ────────────────────────────────────────────────────────

/// One conversational turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub message: String,
    pub image: Option<XrayImage>,
    /// Earlier messages, oldest first, without the current one.
    pub history: Vec<ChatMessage>,
    /// Detections already recorded for this study.
    pub existing_detections: Vec<Detection>,
    pub user_id: Option<String>,
}

impl TurnRequest {
    pub fn new(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message: message.into(),
            image: None,
            history: Vec::new(),
            existing_detections: Vec::new(),
            user_id: None,
        }
    }

    pub fn with_image(mut self, image: XrayImage) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_detections(mut self, detections: Vec<Detection>) -> Self {
        self.existing_detections = detections;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed,
    /// Surfaced to the client as an `error` event with this correlation id.
    Failed { error_id: String, code: String },
    /// Client went away or the session timed out.
    Cancelled,
}

/// What a turn produced, for persistence by the caller.
#[derive(Debug, Clone)]
pub struct TurnSummary {
    pub text: String,
    pub detections: Vec<Detection>,
    pub tool: Option<ToolName>,
    pub fusion_mode: Option<FusionMode>,
    pub usage: Usage,
    pub outcome: TurnOutcome,
}

/// Results gathered while a turn runs.
#[derive(Debug, Default)]
struct TurnState {
    detections: Vec<Detection>,
    tool: Option<ToolName>,
    fusion_mode: Option<FusionMode>,
}

#[derive(Debug, thiserror::Error)]
enum TurnError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

type TurnResult<T> = Result<T, TurnError>;

const NO_IMAGE_REPLY: &str =
    "Chưa có ảnh X-quang nào trong phiên này để phân tích. Vui lòng tải ảnh lên trước.";

// ── Block emitter ────────────────────────────────────────────────────────────

/// Maps turn progress onto content blocks with increasing indices.
struct TurnEmitter<'a> {
    session: &'a StreamingSession,
    next_index: usize,
    open: Option<ContentKind>,
    text: String,
    output_tokens: u64,
}

impl<'a> TurnEmitter<'a> {
    fn new(session: &'a StreamingSession) -> Self {
        Self {
            session,
            next_index: 0,
            open: None,
            text: String::new(),
            output_tokens: 0,
        }
    }

    async fn close(&mut self) -> TurnResult<()> {
        if self.open.take().is_some() {
            self.session.emit_content_stop(self.next_index).await?;
            self.next_index += 1;
        }
        Ok(())
    }

    async fn open(&mut self, kind: ContentKind, metadata: Option<Value>) -> TurnResult<()> {
        self.close().await?;
        self.session
            .emit_content_start(self.next_index, kind, metadata)
            .await?;
        self.open = Some(kind);
        Ok(())
    }

    async fn thinking(&mut self, note: &str) -> TurnResult<()> {
        self.open(ContentKind::Thinking, None).await?;
        self.session
            .emit_content_delta(self.next_index, note, DeltaKind::ThinkingDelta)
            .await?;
        self.close().await
    }

    async fn tool_start(&mut self, tool: ToolName, status: &str) -> TurnResult<()> {
        self.open(
            ContentKind::ToolUse,
            Some(json!({ "status": "running", "tool": tool.as_str() })),
        )
        .await?;
        self.session
            .emit_content_delta(self.next_index, status, DeltaKind::ToolStatus)
            .await?;
        Ok(())
    }

    /// Close the tool block, attaching detections, and open the text block
    /// for the follow-up answer.
    async fn tool_result(&mut self, detections: &[Detection]) -> TurnResult<()> {
        if !detections.is_empty() {
            let payload = serde_json::to_string(detections)
                .map_err(|e| ServiceError::tool("detections", e.to_string()))?;
            self.session
                .emit_content_delta(self.next_index, &payload, DeltaKind::DetectionsDelta)
                .await?;
        }
        self.open(ContentKind::Text, None).await
    }

    async fn text(&mut self, chunk: &str) -> TurnResult<()> {
        if self.open != Some(ContentKind::Text) {
            self.open(ContentKind::Text, None).await?;
        }
        self.text.push_str(chunk);
        self.output_tokens += prompts::estimate_tokens(chunk);
        self.session
            .emit_content_delta(self.next_index, chunk, DeltaKind::TextDelta)
            .await?;
        Ok(())
    }
}

// ── Generation worker ────────────────────────────────────────────────────────

/// A streamed generation running on its own task.
struct Generation {
    rx: mpsc::Receiver<String>,
    task: JoinHandle<ServiceResult<()>>,
}

impl Generation {
    fn spawn(services: &SharedServices, request: GenerationRequest, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let sink = ChunkSink::new(tx, cancel);
        let services = Arc::clone(services);
        let task = tokio::spawn(
            async move { services.generate_stream(&request, &sink).await }.in_current_span(),
        );
        Self { rx, task }
    }

    /// Next chunk; `None` when the generation ended or the turn was cancelled.
    async fn next_chunk(&mut self, cancel: &CancellationToken) -> Option<String> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            chunk = self.rx.recv() => chunk,
        }
    }

    async fn finish(self, cancel: &CancellationToken) -> ServiceResult<()> {
        let Self { rx, task } = self;
        // Dropping the receiver fails the worker's next send.
        drop(rx);
        if cancel.is_cancelled() {
            return Err(ServiceError::Cancelled("client disconnected".into()));
        }
        match task.await {
            Ok(result) => result,
            Err(e) => Err(ServiceError::inference(format!("generation task failed: {e}"))),
        }
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────────────

/// Runs turns against a shared [`Services`](crate::services::Services).
#[derive(Clone)]
pub struct Orchestrator {
    services: SharedServices,
    config: Arc<ChatConfig>,
}

impl Orchestrator {
    pub fn new(services: SharedServices, config: ChatConfig) -> Self {
        Self {
            services,
            config: Arc::new(config),
        }
    }

    pub fn services(&self) -> &SharedServices {
        &self.services
    }

    /// Start a turn on its own task and return the client's end of the
    /// stream. Dropping or disconnecting the stream cancels the turn.
    pub fn stream_turn(&self, request: TurnRequest) -> (EventStream, JoinHandle<TurnSummary>) {
        let (session, stream) = StreamingSession::new(request.session_id.clone(), &self.config.stream);
        let orchestrator = self.clone();
        let span = tracing::info_span!("turn", session_id = %request.session_id);
        let handle = tokio::spawn(
            async move { orchestrator.run_turn(&session, request).await }.instrument(span),
        );
        (stream, handle)
    }

    /// Run one turn against `session`, then stop it.
    pub async fn run_turn(&self, session: &StreamingSession, request: TurnRequest) -> TurnSummary {
        let input_tokens = prompts::estimate_tokens(&request.message);
        let mut emitter = TurnEmitter::new(session);
        let mut state = TurnState::default();

        let result = self.drive(session, &request, &mut emitter, &mut state).await;
        let usage = Usage::new(input_tokens, emitter.output_tokens);

        let outcome = match result {
            Ok(()) => match self.finish_message(session, &mut emitter, usage, &state).await {
                Ok(()) => TurnOutcome::Completed,
                Err(err) => self.fail(session, &mut emitter, err).await,
            },
            Err(err) => self.fail(session, &mut emitter, err).await,
        };

        session.stop().await;
        TurnSummary {
            text: emitter.text,
            detections: state.detections,
            tool: state.tool,
            fusion_mode: state.fusion_mode,
            usage,
            outcome,
        }
    }

    async fn drive(
        &self,
        session: &StreamingSession,
        request: &TurnRequest,
        emitter: &mut TurnEmitter<'_>,
        state: &mut TurnState,
    ) -> TurnResult<()> {
        session.start()?;
        let mut metadata = Map::new();
        metadata.insert("model".into(), json!(self.config.model_label));
        if let Some(user) = &request.user_id {
            metadata.insert("user_id".into(), json!(user));
        }
        session.emit_message_start(Value::Object(metadata)).await?;

        let cancel = session.cancellation_token();
        let Some(call) = self.decide(request, emitter, &cancel).await? else {
            return emitter.close().await;
        };

        if cancel.is_cancelled() {
            return Err(ServiceError::Cancelled("client disconnected before tool execution".into()).into());
        }
        info!(tool = %call.name, args = ?call.args, "executing tool call");
        state.tool = Some(call.name);
        emitter
            .thinking(&format!("Sử dụng công cụ {} để trả lời yêu cầu.", call.name))
            .await?;

        let follow_up = match call.name {
            ToolName::AnalyzeXray => {
                emitter.tool_start(call.name, "Đang phân tích ảnh X-quang...").await?;
                let Some(image) = &request.image else {
                    warn!("analyze_xray requested without an image");
                    emitter.tool_result(&[]).await?;
                    emitter.text(NO_IMAGE_REPLY).await?;
                    return emitter.close().await;
                };
                let outcome = self.analyze(image, &cancel).await?;
                emitter.tool_result(&outcome.detections).await?;
                let instruction = prompts::analysis_instruction(
                    &request.message,
                    call.arg_str("detail_level").unwrap_or("detailed"),
                    &outcome.detections,
                );
                state.fusion_mode = Some(outcome.mode);
                state.detections = outcome.detections;
                self.response_request(request, instruction, &state.detections)
            }
            ToolName::ExplainFinding => {
                let finding = call.arg_str("finding_name");
                emitter
                    .tool_start(call.name, &format!("Đang tra cứu {}...", finding.unwrap_or("bất thường")))
                    .await?;
                emitter.tool_result(&[]).await?;
                let instruction = prompts::explain_instruction(
                    finding,
                    call.arg_bool("include_treatment").unwrap_or(false),
                    &request.message,
                );
                self.response_request(request, instruction, &request.existing_detections)
            }
            ToolName::GenerateReport => {
                emitter.tool_start(call.name, "Đang tạo báo cáo...").await?;
                emitter.tool_result(&[]).await?;
                let instruction = prompts::report_instruction(
                    call.arg_str("format").unwrap_or("standard"),
                    call.arg_bool("include_recommendations").unwrap_or(true),
                    &request.existing_detections,
                );
                self.response_request(request, instruction, &request.existing_detections)
            }
        };

        if cancel.is_cancelled() {
            return Err(ServiceError::Cancelled("client disconnected before follow-up".into()).into());
        }
        let mut generation = Generation::spawn(&self.services, follow_up, cancel.clone());
        while let Some(chunk) = generation.next_chunk(&cancel).await {
            emitter.text(&chunk).await?;
        }
        generation.finish(&cancel).await?;
        emitter.close().await
    }

    /// Phase 1. Streams prose straight through; returns the tool call if
    /// the model asked for one.
    async fn decide(
        &self,
        request: &TurnRequest,
        emitter: &mut TurnEmitter<'_>,
        cancel: &CancellationToken,
    ) -> TurnResult<Option<ToolCall>> {
        let budget = &self.config.generation;
        let decision = GenerationRequest {
            messages: prompts::build_messages(
                prompts::decision_system_prompt(),
                prompts::detection_context(&request.existing_detections),
                &request.history,
                &request.message,
                budget.context_max_tokens,
            ),
            image: request.image.clone(),
            max_tokens: budget.decision_max_tokens,
            tools_enabled: true,
        };

        let mut classifier = StreamClassifier::new(budget.decision_window_chars);
        let mut generation = Generation::spawn(&self.services, decision, cancel.clone());
        while let Some(chunk) = generation.next_chunk(cancel).await {
            for piece in classifier.push(&chunk) {
                emitter.text(&piece).await?;
            }
        }
        generation.finish(cancel).await?;

        match classifier.finish() {
            Classified::Empty => Ok(None),
            Classified::Text(held) => {
                for piece in held {
                    emitter.text(&piece).await?;
                }
                Ok(None)
            }
            Classified::Json(buffered) => match ToolCallParser::parse(&buffered) {
                Some(call) => Ok(Some(call)),
                None => {
                    debug!(len = buffered.len(), "json-shaped response is not a tool call, emitting as text");
                    emitter.text(&buffered).await?;
                    Ok(None)
                }
            },
        }
    }

    /// Detector plus vision-model proposals, fused with the true image size.
    async fn analyze(&self, image: &XrayImage, cancel: &CancellationToken) -> ServiceResult<FusionOutcome> {
        let detected = self.services.detect(image).await?;
        if cancel.is_cancelled() {
            return Err(ServiceError::Cancelled("client disconnected during detection".into()));
        }
        let proposed = match self.services.propose_detections(image).await {
            Ok(proposed) => proposed,
            Err(err) => {
                warn!(error = %err, "vision-model proposals unavailable, using detector output only");
                Vec::new()
            }
        };

        let outcome = fuse(&[detected, proposed], Some(image.dims), self.services.fusion_params());
        if outcome.is_degraded() {
            warn!(mode = ?outcome.mode, "detections not fully fused");
        }
        debug!(mode = ?outcome.mode, count = outcome.detections.len(), "analysis complete");
        Ok(outcome)
    }

    fn response_request(&self, request: &TurnRequest, instruction: String, detections: &[Detection]) -> GenerationRequest {
        let budget = &self.config.generation;
        GenerationRequest {
            messages: prompts::build_messages(
                prompts::system_prompt().to_string(),
                prompts::detection_context(detections),
                &request.history,
                &instruction,
                budget.context_max_tokens,
            ),
            image: request.image.clone(),
            max_tokens: budget.response_max_tokens,
            tools_enabled: false,
        }
    }

    async fn finish_message(
        &self,
        session: &StreamingSession,
        emitter: &mut TurnEmitter<'_>,
        usage: Usage,
        state: &TurnState,
    ) -> TurnResult<()> {
        emitter.close().await?;
        session.emit_message_delta(usage).await?;

        let mut extra = Map::new();
        extra.insert("detections_count".into(), json!(state.detections.len()));
        extra.insert("tool_used".into(), json!(state.tool.is_some()));
        if let Some(tool) = state.tool {
            extra.insert("tool_name".into(), json!(tool.as_str()));
        }
        if let Some(mode) = state.fusion_mode {
            extra.insert("fusion_mode".into(), json!(mode));
        }
        session.emit_message_stop(extra).await?;
        Ok(())
    }

    async fn fail(&self, session: &StreamingSession, emitter: &mut TurnEmitter<'_>, err: TurnError) -> TurnOutcome {
        let service_err = match err {
            TurnError::Service(ServiceError::Cancelled(reason)) => {
                info!(%reason, "turn abandoned");
                return TurnOutcome::Cancelled;
            }
            TurnError::Stream(StreamError::Closed) => {
                info!("turn abandoned, stream closed");
                return TurnOutcome::Cancelled;
            }
            TurnError::Stream(other) => ServiceError::validation("stream", other.to_string()),
            TurnError::Service(err) => err,
        };

        let report = service_err.report();
        error!(
            error_id = %report.error_id,
            code = %report.code,
            error = %service_err,
            "turn failed"
        );
        if emitter.close().await.is_err() {
            debug!("could not close open block after failure");
        }
        if session
            .emit_error(&report.public_message(), &report.code)
            .await
            .is_err()
        {
            return TurnOutcome::Cancelled;
        }
        TurnOutcome::Failed {
            error_id: report.error_id,
            code: report.code,
        }
    }
}
