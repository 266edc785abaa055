//! Simulated collaborators for the CLI and tests.
//!
//! [`MockLanguageModel`] decides on tools the way a compliant model would:
//! when tools are offered and the doctor's message asks for an action, it
//! answers with a tool-call JSON payload; otherwise it streams a canned
//! Vietnamese answer a few words at a time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use xray_core::detection::{BoundingBox, Detection, DetectionSource};
use xray_core::error::ServiceResult;
use xray_core::tool_call::{ToolCall, ToolCallParser};

use crate::services::{ChunkSink, Detector, GenerationRequest, LanguageModel, XrayImage};

/// Detector returning a fixed set of findings scaled to the image.
#[derive(Debug, Default)]
pub struct MockDetector {
    calls: AtomicUsize,
}

impl MockDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Detector for MockDetector {
    fn detect(&self, image: &XrayImage) -> ServiceResult<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (w, h) = (f64::from(image.dims.width), f64::from(image.dims.height));
        Ok(vec![
            Detection::new(
                3,
                0.87,
                BoundingBox::new(0.30 * w, 0.45 * h, 0.72 * w, 0.80 * h),
                DetectionSource::Detector,
            ),
            Detection::new(
                16,
                0.64,
                BoundingBox::new(0.08 * w, 0.62 * h, 0.32 * w, 0.86 * h),
                DetectionSource::Detector,
            ),
        ])
    }
}

/// Language model with keyword-driven tool decisions and canned answers.
#[derive(Debug, Default)]
pub struct MockLanguageModel {
    chunk_delay: Duration,
}

impl MockLanguageModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep between chunks to mimic generation speed.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    fn respond(&self, request: &GenerationRequest) -> String {
        let question = request.last_user_message().unwrap_or_default();
        if request.tools_enabled {
            if let Some(call) = ToolCallParser::parse(question) {
                return tool_call_json(&call);
            }
            return greeting_or_answer(question);
        }
        let context = request
            .messages
            .first()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        if question.contains("Kết quả phát hiện tự động") || context.contains("Kết quả phân tích hiện có")
        {
            return analysis_answer(question);
        }
        format!(
            "Dựa trên yêu cầu của bác sĩ: {}\n\n⚠️ Đây chỉ là gợi ý của AI, quyết định cuối cùng thuộc về bác sĩ.",
            first_line(question)
        )
    }
}

impl LanguageModel for MockLanguageModel {
    fn generate(&self, request: &GenerationRequest) -> ServiceResult<String> {
        Ok(self.respond(request))
    }

    fn generate_stream(&self, request: &GenerationRequest, sink: &ChunkSink) -> ServiceResult<()> {
        let text = self.respond(request);
        for chunk in text.split_inclusive(' ') {
            if !self.chunk_delay.is_zero() {
                std::thread::sleep(self.chunk_delay);
            }
            sink.send(chunk)?;
        }
        Ok(())
    }

    fn propose_detections(&self, image: &XrayImage) -> ServiceResult<Vec<Detection>> {
        let (w, h) = (f64::from(image.dims.width), f64::from(image.dims.height));
        Ok(vec![Detection::new(
            3,
            0.74,
            BoundingBox::new(0.32 * w, 0.44 * h, 0.73 * w, 0.82 * h),
            DetectionSource::VisionModel,
        )])
    }
}

fn tool_call_json(call: &ToolCall) -> String {
    serde_json::json!({
        "tool_call": { "name": call.name.as_str(), "args": call.args }
    })
    .to_string()
}

fn greeting_or_answer(question: &str) -> String {
    let lower = question.to_lowercase();
    if lower.contains("chào") || lower.contains("hello") {
        "Xin chào! Tôi là trợ lý AI hỗ trợ phân tích ảnh X-quang ngực. Bác sĩ cần tôi giúp gì?"
            .to_string()
    } else {
        format!(
            "Về câu hỏi \"{}\": tôi cần thêm thông tin lâm sàng để trả lời chính xác hơn.",
            first_line(question)
        )
    }
}

fn analysis_answer(question: &str) -> String {
    format!(
        "**Kết quả phân tích ảnh X-quang ngực:**\n\n{}\n\n💡 Cần đối chiếu với lâm sàng và tiền sử bệnh nhân.\n\n⚠️ *Đây là kết quả phân tích AI hỗ trợ. Quyết định cuối cùng thuộc về bác sĩ.*",
        question
            .lines()
            .filter(|l| l.starts_with("- "))
            .collect::<Vec<_>>()
            .join("\n")
    )
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default().trim()
}
