//! End-to-end turn tests: orchestrator, services and streaming session
//! together, with in-process fake collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use xray_chat::config::ChatConfig;
use xray_chat::mock::{MockDetector, MockLanguageModel};
use xray_chat::orchestrator::{Orchestrator, TurnOutcome, TurnRequest};
use xray_chat::services::{
    ChunkSink, Detector, GenerationRequest, LanguageModel, Services, XrayImage,
};
use xray_chat::streaming::{StreamEvent, StreamEventType};
use xray_core::detection::{BoundingBox, Detection, DetectionSource};
use xray_core::error::{ServiceError, ServiceResult};
use xray_core::resilience::{CircuitState, RetryPolicy, VISION_MODEL};
use xray_core::tool_call::ToolName;

// ── Fakes ────────────────────────────────────────────────────────────────────

/// Streams fixed chunks: `decision` when tools are offered, `answer` otherwise.
struct ScriptedModel {
    decision: Vec<&'static str>,
    answer: Vec<&'static str>,
    chunk_delay: Duration,
    calls: AtomicUsize,
    proposals: AtomicUsize,
    sent: Arc<AtomicUsize>,
}

impl ScriptedModel {
    fn new(decision: Vec<&'static str>, answer: Vec<&'static str>) -> Self {
        Self {
            decision,
            answer,
            chunk_delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            proposals: AtomicUsize::new(0),
            sent: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }
}

impl LanguageModel for ScriptedModel {
    fn generate(&self, request: &GenerationRequest) -> ServiceResult<String> {
        let chunks = if request.tools_enabled { &self.decision } else { &self.answer };
        Ok(chunks.concat())
    }

    fn generate_stream(&self, request: &GenerationRequest, sink: &ChunkSink) -> ServiceResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let chunks = if request.tools_enabled { &self.decision } else { &self.answer };
        for chunk in chunks {
            if !self.chunk_delay.is_zero() {
                std::thread::sleep(self.chunk_delay);
            }
            sink.send(*chunk)?;
            self.sent.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn propose_detections(&self, _image: &XrayImage) -> ServiceResult<Vec<Detection>> {
        self.proposals.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

/// Every call fails with a retriable inference error.
#[derive(Default)]
struct FailingModel {
    calls: AtomicUsize,
}

impl LanguageModel for FailingModel {
    fn generate(&self, _request: &GenerationRequest) -> ServiceResult<String> {
        Err(ServiceError::inference_in("qwen-vl", "CUDA error: device-side assert"))
    }

    fn generate_stream(&self, _request: &GenerationRequest, _sink: &ChunkSink) -> ServiceResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ServiceError::inference_in("qwen-vl", "CUDA error: device-side assert"))
    }
}

/// Counts calls and finds nothing, after an optional delay.
#[derive(Default)]
struct CountingDetector {
    calls: AtomicUsize,
    delay: Duration,
}

impl CountingDetector {
    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

impl Detector for CountingDetector {
    fn detect(&self, _image: &XrayImage) -> ServiceResult<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        Ok(Vec::new())
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn test_config() -> ChatConfig {
    let mut config = ChatConfig::default();
    config.retry = RetryPolicy::none();
    config
}

fn orchestrator(config: ChatConfig, detector: Arc<dyn Detector>, model: Arc<dyn LanguageModel>) -> Orchestrator {
    let services = Services::new(&config, detector, model).shared();
    Orchestrator::new(services, config)
}

fn text_deltas(events: &[StreamEvent]) -> Vec<String> {
    deltas_of(events, "text_delta")
}

fn deltas_of(events: &[StreamEvent], kind: &str) -> Vec<String> {
    events
        .iter()
        .map(StreamEvent::to_json)
        .filter(|e| e["type"] == "content_block_delta" && e["delta"]["type"] == kind)
        .map(|e| e["delta"]["text"].as_str().unwrap_or_default().to_string())
        .collect()
}

fn content_types(events: &[StreamEvent]) -> Vec<String> {
    events
        .iter()
        .map(StreamEvent::to_json)
        .filter(|e| e["type"] == "content_block_start")
        .map(|e| e["content_type"].as_str().unwrap_or_default().to_string())
        .collect()
}

fn last_of(events: &[StreamEvent], kind: StreamEventType) -> Value {
    events
        .iter()
        .rev()
        .find(|e| e.event_type == kind)
        .map(StreamEvent::to_json)
        .unwrap_or(Value::Null)
}

fn non_ping(events: Vec<StreamEvent>) -> Vec<StreamEvent> {
    events.into_iter().filter(|e| !e.is_ping()).collect()
}

// ── Phase-1 classification ───────────────────────────────────────────────────

#[tokio::test]
async fn prose_reply_streams_each_chunk_as_text() {
    let detector = Arc::new(CountingDetector::default());
    let model = Arc::new(ScriptedModel::new(vec!["Xin", " chào"], vec![]));
    let orch = orchestrator(test_config(), detector.clone(), model);

    let (stream, turn) = orch.stream_turn(TurnRequest::new("s1", "chào bác sĩ"));
    let events = non_ping(stream.collect().await);
    let summary = turn.await.unwrap();

    assert_eq!(text_deltas(&events), vec!["Xin", " chào"]);
    assert_eq!(content_types(&events), vec!["text"]);
    assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
    assert_eq!(summary.outcome, TurnOutcome::Completed);
    assert_eq!(summary.text, "Xin chào");
    assert!(summary.tool.is_none());

    let stop = last_of(&events, StreamEventType::MessageStop);
    assert_eq!(stop["tool_used"], false);
    assert_eq!(stop["detections_count"], 0);
    assert_eq!(events.first().unwrap().event_type, StreamEventType::MessageStart);
    assert_eq!(events.last().unwrap().event_type, StreamEventType::MessageStop);
}

#[tokio::test]
async fn long_prose_is_forwarded_before_generation_ends() {
    let model = Arc::new(ScriptedModel::new(
        vec!["Tim to ", "là tình trạng ", "bóng tim ", "lớn hơn bình thường."],
        vec![],
    ));
    let orch = orchestrator(test_config(), Arc::new(CountingDetector::default()), model);

    let (stream, turn) = orch.stream_turn(TurnRequest::new("s1", "Tim to là gì?"));
    let events = non_ping(stream.collect().await);
    turn.await.unwrap();

    assert_eq!(
        text_deltas(&events),
        vec!["Tim to ", "là tình trạng ", "bóng tim ", "lớn hơn bình thường."]
    );
}

#[tokio::test]
async fn tool_call_json_never_leaks_as_text() {
    let model = Arc::new(ScriptedModel::new(
        vec![r#"{"tool_call""#, r#": {"name": "generate_report", "args": {"format": "summary"}}}"#],
        vec!["KẾT LUẬN: ", "không thấy bất thường."],
    ));
    let orch = orchestrator(test_config(), Arc::new(CountingDetector::default()), model);

    let (stream, turn) = orch.stream_turn(TurnRequest::new("s1", "Tạo báo cáo"));
    let events = non_ping(stream.collect().await);
    let summary = turn.await.unwrap();

    let texts = text_deltas(&events);
    assert!(texts.iter().all(|t| !t.contains("tool_call")));
    assert_eq!(texts, vec!["KẾT LUẬN: ", "không thấy bất thường."]);
    assert_eq!(content_types(&events), vec!["thinking", "tool_use", "text"]);
    assert_eq!(summary.tool, Some(ToolName::GenerateReport));

    let tool_start = events
        .iter()
        .map(StreamEvent::to_json)
        .find(|e| e["content_type"] == "tool_use")
        .unwrap();
    assert_eq!(tool_start["metadata"]["tool"], "generate_report");
    assert_eq!(tool_start["metadata"]["status"], "running");

    let stop = last_of(&events, StreamEventType::MessageStop);
    assert_eq!(stop["tool_used"], true);
    assert_eq!(stop["tool_name"], "generate_report");
}

#[tokio::test]
async fn json_that_is_not_a_tool_call_is_emitted_verbatim() {
    let model = Arc::new(ScriptedModel::new(vec![r#"{"note": "#, r#""khong ro"}"#], vec![]));
    let orch = orchestrator(test_config(), Arc::new(CountingDetector::default()), model);

    let (stream, turn) = orch.stream_turn(TurnRequest::new("s1", "??"));
    let events = non_ping(stream.collect().await);
    let summary = turn.await.unwrap();

    assert_eq!(text_deltas(&events), vec![r#"{"note": "khong ro"}"#]);
    assert!(summary.tool.is_none());
}

#[tokio::test]
async fn block_indices_increase_and_never_overlap() {
    let orch = orchestrator(
        test_config(),
        Arc::new(MockDetector::new()),
        Arc::new(MockLanguageModel::new()),
    );
    let request = TurnRequest::new("s1", "Phân tích ảnh này").with_image(XrayImage::blank(1024, 1024));
    let (stream, turn) = orch.stream_turn(request);
    let events = non_ping(stream.collect().await);
    turn.await.unwrap();

    let mut open: Option<u64> = None;
    let mut last: Option<u64> = None;
    for event in events.iter().map(StreamEvent::to_json) {
        let index = event["index"].as_u64();
        match event["type"].as_str().unwrap() {
            "content_block_start" => {
                assert!(open.is_none());
                assert!(last.map_or(true, |l| index.unwrap() > l));
                open = index;
                last = index;
            }
            "content_block_delta" => assert_eq!(open, index),
            "content_block_stop" => {
                assert_eq!(open, index);
                open = None;
            }
            _ => {}
        }
    }
    assert!(open.is_none());
}

// ── Tool execution ───────────────────────────────────────────────────────────

#[tokio::test]
async fn analyze_fuses_detector_and_model_boxes() {
    let detector = Arc::new(MockDetector::new());
    let orch = orchestrator(test_config(), detector.clone(), Arc::new(MockLanguageModel::new()));

    let request = TurnRequest::new("s1", "Phân tích ảnh X-quang này giúp tôi")
        .with_image(XrayImage::blank(2048, 2048))
        .with_user("dr-an");
    let (stream, turn) = orch.stream_turn(request);
    let events = non_ping(stream.collect().await);
    let summary = turn.await.unwrap();

    assert_eq!(detector.calls(), 1);
    assert_eq!(summary.tool, Some(ToolName::AnalyzeXray));
    let cardio = summary
        .detections
        .iter()
        .find(|d| d.class_name == "Cardiomegaly")
        .unwrap();
    assert_eq!(cardio.source, DetectionSource::Fused);
    assert!((cardio.confidence - 0.805).abs() < 1e-6);

    let payload = deltas_of(&events, "detections_delta");
    assert_eq!(payload.len(), 1);
    let streamed: Vec<Detection> = serde_json::from_str(&payload[0]).unwrap();
    let names = |dets: &[Detection]| dets.iter().map(|d| d.class_name.clone()).collect::<Vec<_>>();
    assert_eq!(names(&streamed), names(&summary.detections));

    let start = events.first().unwrap().to_json();
    assert_eq!(start["metadata"]["user_id"], "dr-an");
    assert_eq!(start["metadata"]["model"], "qwen-vl-tools");

    let stop = last_of(&events, StreamEventType::MessageStop);
    assert_eq!(stop["fusion_mode"], "weighted");
    assert_eq!(stop["detections_count"], summary.detections.len());
    assert!(summary.text.contains("Cardiomegaly"));
}

#[tokio::test]
async fn analyze_without_image_explains_instead() {
    let detector = Arc::new(MockDetector::new());
    let orch = orchestrator(test_config(), detector.clone(), Arc::new(MockLanguageModel::new()));

    let (stream, turn) = orch.stream_turn(TurnRequest::new("s1", "Phân tích ảnh này"));
    let events = non_ping(stream.collect().await);
    let summary = turn.await.unwrap();

    assert_eq!(detector.calls(), 0);
    assert_eq!(summary.outcome, TurnOutcome::Completed);
    assert!(summary.text.contains("Vui lòng tải ảnh lên"));
    assert!(deltas_of(&events, "detections_delta").is_empty());
}

#[tokio::test]
async fn explain_uses_existing_detections_as_context() {
    let existing = vec![Detection::new(
        16,
        0.71,
        BoundingBox::new(10.0, 10.0, 90.0, 90.0),
        DetectionSource::Detector,
    )];
    let detector = Arc::new(MockDetector::new());
    let orch = orchestrator(test_config(), detector.clone(), Arc::new(MockLanguageModel::new()));

    let request = TurnRequest::new("s1", "Giải thích tràn dịch màng phổi").with_detections(existing);
    let (stream, turn) = orch.stream_turn(request);
    let events = non_ping(stream.collect().await);
    let summary = turn.await.unwrap();

    assert_eq!(summary.tool, Some(ToolName::ExplainFinding));
    assert_eq!(detector.calls(), 0);
    assert!(!deltas_of(&events, "tool_status").is_empty());
    assert!(!summary.text.is_empty());
}

// ── Failures ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn backend_failure_becomes_error_event_then_breaker_opens() {
    let mut config = test_config();
    config.vision_breaker.failure_threshold = 1;
    let model = Arc::new(FailingModel::default());
    let orch = orchestrator(config, Arc::new(CountingDetector::default()), model.clone());

    let (stream, turn) = orch.stream_turn(TurnRequest::new("s1", "chào"));
    let events = non_ping(stream.collect().await);
    let summary = turn.await.unwrap();

    let error = last_of(&events, StreamEventType::Error);
    assert_eq!(error["error"]["type"], "INFERENCE_FAILED");
    let message = error["error"]["message"].as_str().unwrap();
    assert!(!message.contains("CUDA"));
    let (error_id, code) = match &summary.outcome {
        TurnOutcome::Failed { error_id, code } => (error_id.clone(), code.clone()),
        other => panic!("expected a failed turn, got {other:?}"),
    };
    assert_eq!(code, "INFERENCE_FAILED");
    assert!(message.ends_with(&format!("(ref: {error_id})")));
    assert!(events.iter().all(|e| e.event_type != StreamEventType::MessageStop));

    let breaker = orch.services().breakers().get(VISION_MODEL).unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);

    let (stream, turn) = orch.stream_turn(TurnRequest::new("s2", "chào"));
    let events = non_ping(stream.collect().await);
    turn.await.unwrap();
    assert_eq!(last_of(&events, StreamEventType::Error)["error"]["type"], "SERVICE_UNAVAILABLE");
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disconnect_stops_generation_early() {
    let chunks: Vec<&'static str> = std::iter::repeat("từ ").take(200).collect();
    let model = Arc::new(ScriptedModel::new(chunks, vec![]).with_chunk_delay(Duration::from_millis(5)));
    let sent = Arc::clone(&model.sent);
    let orch = orchestrator(test_config(), Arc::new(CountingDetector::default()), model);

    let (mut stream, turn) = orch.stream_turn(TurnRequest::new("s1", "kể dài"));
    loop {
        let event = stream.next().await.unwrap();
        if event.event_type == StreamEventType::ContentBlockDelta {
            break;
        }
    }
    stream.disconnect();

    let summary = turn.await.unwrap();
    assert_eq!(summary.outcome, TurnOutcome::Cancelled);
    // give the blocking worker time to notice the cancellation
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sent.load(Ordering::SeqCst) < 200);
}

#[tokio::test]
async fn disconnect_during_detection_skips_model_proposals() {
    let detector = Arc::new(CountingDetector::slow(Duration::from_millis(100)));
    let model = Arc::new(ScriptedModel::new(
        vec![r#"{"tool_call": {"name": "analyze_xray", "args": {}}}"#],
        vec!["Không nên tới đây."],
    ));
    let orch = orchestrator(test_config(), detector.clone(), model.clone());

    let request = TurnRequest::new("s1", "Phân tích ảnh này").with_image(XrayImage::blank(512, 512));
    let (mut stream, turn) = orch.stream_turn(request);
    loop {
        let event = stream.next().await.unwrap().to_json();
        if event["type"] == "content_block_start" && event["content_type"] == "tool_use" {
            break;
        }
    }
    stream.disconnect();

    let summary = turn.await.unwrap();
    assert_eq!(summary.outcome, TurnOutcome::Cancelled);
    assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
    assert_eq!(model.proposals.load(Ordering::SeqCst), 0);
    // decision only, no follow-up generation
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sse_frames_name_each_event() {
    let model = Arc::new(ScriptedModel::new(vec!["Xin", " chào"], vec![]));
    let orch = orchestrator(test_config(), Arc::new(CountingDetector::default()), model);

    let (stream, turn) = orch.stream_turn(TurnRequest::new("s1", "chào"));
    let frames: Vec<String> = futures::StreamExt::collect(stream.into_sse()).await;
    turn.await.unwrap();

    assert!(frames[0].starts_with("event: message_start\ndata: {"));
    assert!(frames.iter().all(|f| f.ends_with("\n\n")));
    assert!(frames.last().unwrap().starts_with("event: message_stop"));
}
