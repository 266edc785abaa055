//! Collaborator seams and the service container.
//!
//! The detector and the vision-language model are black boxes behind two
//! synchronous traits. Their calls take seconds and block, so [`Services`]
//! runs every one of them on tokio's blocking pool, inside the breaker and
//! retry policy of its backend:
//!
//! ```text
//! Services::detect ──▶ breaker("detector") ──▶ retry ──▶ spawn_blocking(Detector::detect)
//! Services::generate* ──▶ breaker("vision_model") ──▶ retry ──▶ spawn_blocking(LanguageModel::*)
//! ```
//!
//! One `Services` is built at process start and shared by every turn.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use xray_core::detection::{Detection, ImageDims};
use xray_core::error::{ServiceError, ServiceResult};
use xray_core::fusion::FusionParams;
use xray_core::resilience::{
    guarded, BreakerRegistry, CircuitBreaker, RetryPolicy, SharedBreakerRegistry, DETECTOR,
    VISION_MODEL,
};

use crate::config::ChatConfig;

/// Capacity of the chunk channel between a generation worker and its turn.
pub const CHUNK_CHANNEL_CAPACITY: usize = 64;

// ── Inputs ───────────────────────────────────────────────────────────────────

/// A decoded X-ray image handed to the models.
#[derive(Debug, Clone)]
pub struct XrayImage {
    pub dims: ImageDims,
    pub pixels: Arc<[u8]>,
}

impl XrayImage {
    pub fn new(dims: ImageDims, pixels: impl Into<Arc<[u8]>>) -> Self {
        Self {
            dims,
            pixels: pixels.into(),
        }
    }

    /// Image with known dimensions and no pixel data, for fakes and the CLI.
    pub fn blank(width: u32, height: u32) -> Self {
        Self::new(ImageDims::new(width, height), Vec::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One call into the language model.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
    pub image: Option<XrayImage>,
    pub max_tokens: u32,
    /// Phase-1 call: the tool catalogue is in the system prompt and the
    /// model may answer with a tool call.
    pub tools_enabled: bool,
}

impl GenerationRequest {
    /// The most recent user message, if any.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

// ── Chunk sink ───────────────────────────────────────────────────────────────

/// Where a streaming generator pushes text chunks.
///
/// Used from the blocking worker thread. Once the turn is cancelled every
/// send fails with [`ServiceError::Cancelled`], which is the generator's cue
/// to abandon inference.
#[derive(Debug, Clone)]
pub struct ChunkSink {
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    forwarded: Arc<AtomicUsize>,
}

impl ChunkSink {
    pub fn new(tx: mpsc::Sender<String>, cancel: CancellationToken) -> Self {
        Self {
            tx,
            cancel,
            forwarded: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Block until the chunk is queued. Must not be called from async code.
    pub fn send(&self, chunk: impl Into<String>) -> ServiceResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ServiceError::Cancelled("turn cancelled during generation".into()));
        }
        let chunk = chunk.into();
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx
            .blocking_send(chunk)
            .map_err(|_| ServiceError::Cancelled("chunk receiver dropped".into()))?;
        self.forwarded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Chunks successfully handed to the receiver so far.
    pub fn forwarded(&self) -> usize {
        self.forwarded.load(Ordering::SeqCst)
    }
}

// ── Collaborator traits ──────────────────────────────────────────────────────

/// Bounding-box detector. Blocking.
#[cfg_attr(test, mockall::automock)]
pub trait Detector: Send + Sync {
    fn detect(&self, image: &XrayImage) -> ServiceResult<Vec<Detection>>;
}

/// Vision-language model. Blocking.
pub trait LanguageModel: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> ServiceResult<String>;

    /// Push the response through `sink` chunk by chunk.
    fn generate_stream(&self, request: &GenerationRequest, sink: &ChunkSink) -> ServiceResult<()>;

    /// Box proposals from the model itself. Models without box output
    /// return nothing.
    fn propose_detections(&self, _image: &XrayImage) -> ServiceResult<Vec<Detection>> {
        Ok(Vec::new())
    }
}

// ── Service container ────────────────────────────────────────────────────────

/// Process-wide collaborators with their breakers and retry policy.
pub struct Services {
    detector: Arc<dyn Detector>,
    model: Arc<dyn LanguageModel>,
    breakers: SharedBreakerRegistry,
    detector_breaker: Arc<CircuitBreaker>,
    vision_breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    fusion: FusionParams,
}

/// Shared reference to the service container.
pub type SharedServices = Arc<Services>;

impl Services {
    pub fn new(config: &ChatConfig, detector: Arc<dyn Detector>, model: Arc<dyn LanguageModel>) -> Self {
        let breakers = BreakerRegistry::new().shared();
        let detector_breaker = breakers.register(DETECTOR, config.detector_breaker);
        let vision_breaker = breakers.register(VISION_MODEL, config.vision_breaker);
        Self {
            detector,
            model,
            breakers,
            detector_breaker,
            vision_breaker,
            retry: config.retry.clone(),
            fusion: config.fusion,
        }
    }

    pub fn shared(self) -> SharedServices {
        Arc::new(self)
    }

    pub fn breakers(&self) -> &SharedBreakerRegistry {
        &self.breakers
    }

    pub fn fusion_params(&self) -> &FusionParams {
        &self.fusion
    }

    pub async fn detect(&self, image: &XrayImage) -> ServiceResult<Vec<Detection>> {
        let detector = Arc::clone(&self.detector);
        guarded(&self.detector_breaker, &self.retry, || {
            let detector = Arc::clone(&detector);
            let image = image.clone();
            blocking(move || detector.detect(&image))
        })
        .await
    }

    pub async fn propose_detections(&self, image: &XrayImage) -> ServiceResult<Vec<Detection>> {
        let model = Arc::clone(&self.model);
        guarded(&self.vision_breaker, &self.retry, || {
            let model = Arc::clone(&model);
            let image = image.clone();
            blocking(move || model.propose_detections(&image))
        })
        .await
    }

    pub async fn generate(&self, request: &GenerationRequest) -> ServiceResult<String> {
        let model = Arc::clone(&self.model);
        guarded(&self.vision_breaker, &self.retry, || {
            let model = Arc::clone(&model);
            let request = request.clone();
            blocking(move || model.generate(&request))
        })
        .await
    }

    /// Stream a generation into `sink`.
    ///
    /// A failed attempt is retried only while nothing has been forwarded,
    /// so a retry never repeats text the client already has.
    pub async fn generate_stream(&self, request: &GenerationRequest, sink: &ChunkSink) -> ServiceResult<()> {
        let model = Arc::clone(&self.model);
        self.vision_breaker
            .call(|| {
                self.retry.run_if(
                    "vision_model.stream",
                    || {
                        let model = Arc::clone(&model);
                        let request = request.clone();
                        let sink = sink.clone();
                        blocking(move || model.generate_stream(&request, &sink))
                    },
                    |err| {
                        let fresh = sink.forwarded() == 0;
                        if !fresh {
                            warn!(error = %err, forwarded = sink.forwarded(), "not retrying a partially streamed generation");
                        }
                        fresh && !sink.is_cancelled()
                    },
                )
            })
            .await
    }
}

async fn blocking<T, F>(f: F) -> ServiceResult<T>
where
    F: FnOnce() -> ServiceResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(join_err) => {
            debug!(error = %join_err, "blocking worker did not complete");
            Err(ServiceError::inference(format!("worker task failed: {join_err}")))
        }
    }
}
