//! Prompt assembly for both phases of a turn.

use xray_core::detection::Detection;
use xray_core::tool_call::{tool_call_instruction, tools_description};

use crate::services::ChatMessage;

/// Rough token estimate used everywhere in this crate.
pub const CHARS_PER_TOKEN: u64 = 4;
/// Tokens kept free for the model's answer when truncating history.
pub const RESPONSE_RESERVE_TOKENS: u32 = 512;

const SYSTEM_PROMPT: &str = "Bạn là một trợ lý AI chuyên về phân tích hình ảnh X-quang lồng ngực.
Bạn được thiết kế để hỗ trợ bác sĩ chẩn đoán hình ảnh.

Nhiệm vụ của bạn:
1. Phân tích ảnh X-quang phổi và mô tả các bất thường nếu có
2. Trả lời câu hỏi của bác sĩ về ảnh X-quang
3. Đề xuất vị trí các tổn thương dưới dạng bounding box khi cần

Các bất thường có thể phát hiện:
- Aortic enlargement (Phình động mạch chủ)
- Atelectasis (Xẹp phổi)
- Calcification (Vôi hóa)
- Cardiomegaly (Tim to)
- Clavicle fracture (Gãy xương đòn)
- Consolidation (Đông đặc phổi)
- Edema (Phù phổi)
- Emphysema (Khí phế thũng)
- Enlarged PA (Động mạch phổi giãn)
- ILD (Bệnh phổi kẽ)
- Infiltration (Thâm nhiễm)
- Lung Opacity (Mờ phổi)
- Lung cavity (Hang phổi)
- Lung cyst (Nang phổi)
- Mediastinal shift (Di lệch trung thất)
- Nodule/Mass (Nốt/Khối u)
- Pleural effusion (Tràn dịch màng phổi)
- Pleural thickening (Dày màng phổi)
- Pneumothorax (Tràn khí màng phổi)
- Pulmonary fibrosis (Xơ phổi)
- Rib fracture (Gãy xương sườn)
- Other lesion (Tổn thương khác)

Khi trả lời, hãy:
- Sử dụng tiếng Việt
- Mô tả chi tiết vị trí và đặc điểm tổn thương
- Đề xuất chẩn đoán phân biệt nếu phù hợp
- Luôn nhắc rằng đây chỉ là gợi ý, quyết định cuối cùng thuộc về bác sĩ";

pub fn estimate_tokens(text: &str) -> u64 {
    text.chars().count() as u64 / CHARS_PER_TOKEN
}

/// Base system prompt used for answers.
pub fn system_prompt() -> &'static str {
    SYSTEM_PROMPT
}

/// Phase-1 system prompt: base prompt, tool catalogue and the exact
/// tool-call format.
pub fn decision_system_prompt() -> String {
    format!(
        "{SYSTEM_PROMPT}\n\n## Available Tools\n{}\n\n{}",
        tools_description(),
        tool_call_instruction()
    )
}

/// `- <class>: <confidence%>` lines for detections already on record.
pub fn detection_context(detections: &[Detection]) -> Option<String> {
    if detections.is_empty() {
        return None;
    }
    let mut block = String::from("## Kết quả phân tích hiện có");
    for det in detections {
        block.push_str(&format!(
            "\n- {}: {:.0}%",
            det.class_name,
            det.confidence * 100.0
        ));
    }
    Some(block)
}

/// Drop the oldest history messages until the rest fits in `max_tokens`
/// next to the system prompt and the response reserve. The newest message
/// is always kept.
pub fn truncate_history<'a>(
    history: &'a [ChatMessage],
    system: &str,
    max_tokens: u32,
) -> &'a [ChatMessage] {
    if history.is_empty() {
        return history;
    }
    let available = i64::from(max_tokens)
        - estimate_tokens(system) as i64
        - i64::from(RESPONSE_RESERVE_TOKENS);
    let sizes: Vec<i64> = history
        .iter()
        .map(|m| estimate_tokens(&m.content) as i64)
        .collect();

    let mut total: i64 = sizes.iter().sum();
    let mut start = 0;
    while total > available && start < history.len() - 1 {
        total -= sizes[start];
        start += 1;
    }
    if start > 0 {
        tracing::debug!(dropped = start, kept = history.len() - start, "history truncated");
    }
    &history[start..]
}

/// System prompt (with optional context block), truncated history, then
/// the user message.
pub fn build_messages(
    system: String,
    context: Option<String>,
    history: &[ChatMessage],
    user_message: &str,
    max_tokens: u32,
) -> Vec<ChatMessage> {
    let system = match context {
        Some(ctx) => format!("{system}\n\n{ctx}"),
        None => system,
    };
    let kept = truncate_history(history, &system, max_tokens);
    let mut messages = Vec::with_capacity(kept.len() + 2);
    messages.push(ChatMessage::system(system));
    messages.extend(kept.iter().cloned());
    messages.push(ChatMessage::user(user_message));
    messages
}

// ── Phase-2 instructions ─────────────────────────────────────────────────────

pub fn analysis_instruction(question: &str, detail_level: &str, detections: &[Detection]) -> String {
    let findings = if detections.is_empty() {
        "Không phát hiện bất thường rõ rệt.".to_string()
    } else {
        detection_context(detections).unwrap_or_default()
    };
    let depth = if detail_level == "quick" {
        "Trả lời ngắn gọn trong vài câu."
    } else {
        "Mô tả chi tiết từng phát hiện, vị trí và ý nghĩa lâm sàng."
    };
    format!(
        "Kết quả phát hiện tự động trên ảnh:\n{findings}\n\n{depth}\n\nCâu hỏi của bác sĩ: {question}"
    )
}

pub fn explain_instruction(finding: Option<&str>, include_treatment: bool, question: &str) -> String {
    let subject = finding.unwrap_or("bất thường được hỏi");
    let treatment = if include_treatment {
        " Bao gồm cả các hướng điều trị thường gặp."
    } else {
        ""
    };
    format!(
        "Giải thích chi tiết về {subject} trên X-quang ngực: định nghĩa, dấu hiệu hình ảnh, nguyên nhân thường gặp.{treatment}\n\nCâu hỏi của bác sĩ: {question}"
    )
}

pub fn report_instruction(format: &str, include_recommendations: bool, detections: &[Detection]) -> String {
    let findings = detection_context(detections)
        .unwrap_or_else(|| "Chưa có kết quả phát hiện tự động.".to_string());
    let layout = match format {
        "summary" => "Viết báo cáo tóm tắt, tối đa 5 dòng.",
        "detailed" => "Viết báo cáo chi tiết gồm: kỹ thuật, mô tả, kết luận.",
        _ => "Viết báo cáo theo mẫu chuẩn gồm: mô tả và kết luận.",
    };
    let recommendations = if include_recommendations {
        "\nKết thúc bằng phần khuyến nghị theo dõi/điều trị."
    } else {
        ""
    };
    format!("{findings}\n\n{layout}{recommendations}")
}
