//! Tool vocabulary and a tolerant parser for tool calls in model output.
//!
//! The generating model is asked to answer either in prose or with exactly
//! one JSON object:
//!
//! ```text
//! {"tool_call": {"name": "analyze_xray", "args": {"detail_level": "quick"}}}
//! ```
//!
//! It does not always comply, so [`ToolCallParser::parse`] tries four
//! strategies in order and returns the first valid call:
//!
//! 1. the whole trimmed text as JSON
//! 2. fenced code blocks (```` ```json ```` and plain ```` ``` ````)
//! 3. a balanced-brace scan over the text, skipping failed candidates
//! 4. keyword triggers per tool, in the assistant's working language
//!
//! Every JSON candidate goes through the same validation: an optional
//! `tool_call` envelope is unwrapped, `name` must be one of [`ToolName`],
//! `args` defaults to an empty object. Invalid candidates yield `None`,
//! never an error.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

/// Tools the assistant may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    AnalyzeXray,
    ExplainFinding,
    GenerateReport,
}

impl ToolName {
    /// All tools, in keyword-matching priority order.
    pub const ALL: [ToolName; 3] = [
        ToolName::AnalyzeXray,
        ToolName::ExplainFinding,
        ToolName::GenerateReport,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AnalyzeXray => "analyze_xray",
            Self::ExplainFinding => "explain_finding",
            Self::GenerateReport => "generate_report",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.as_str() == name)
    }

    /// Lower-case substrings that select this tool in the keyword fallback.
    pub fn triggers(self) -> &'static [&'static str] {
        match self {
            Self::AnalyzeXray => &[
                "analyze_xray",
                "phân tích",
                "detect",
                "kiểm tra ảnh",
                "xem ảnh",
                "bất thường",
                "chẩn đoán",
                "phát hiện",
            ],
            Self::ExplainFinding => &[
                "explain_finding",
                "giải thích",
                "là gì",
                "nguyên nhân",
                "explain",
                "what is",
            ],
            Self::GenerateReport => &[
                "generate_report",
                "báo cáo",
                "report",
                "tạo báo cáo",
                "xuất report",
                "viết kết luận",
            ],
        }
    }

    /// First line is the summary; following lines are usage hints.
    pub fn description(self) -> &'static str {
        match self {
            Self::AnalyzeXray => {
                "Phân tích ảnh X-quang để phát hiện các bất thường bằng AI (YOLO detection).\n\
                 Sử dụng khi user yêu cầu: phân tích, detect, tìm bất thường, chẩn đoán, xem có gì bất thường không, kiểm tra ảnh.\n\
                 KHÔNG sử dụng khi: user chào hỏi, hỏi thông tin chung, hỏi về kết quả đã có trong context."
            }
            Self::ExplainFinding => {
                "Giải thích chi tiết về một bất thường/bệnh lý cụ thể trên X-quang.\n\
                 Sử dụng khi user hỏi: 'X là gì?', 'giải thích về Y', 'nguyên nhân của Z', 'Y có nguy hiểm không?'."
            }
            Self::GenerateReport => {
                "Tạo báo cáo chẩn đoán chuyên nghiệp từ kết quả phân tích.\n\
                 Sử dụng khi user yêu cầu: tạo báo cáo, xuất report, viết kết luận, tổng hợp kết quả."
            }
        }
    }

    /// JSON-schema style parameter description.
    pub fn parameters(self) -> Value {
        match self {
            Self::AnalyzeXray => json!({
                "type": "object",
                "properties": {
                    "detail_level": {
                        "type": "string",
                        "enum": ["quick", "detailed"],
                        "default": "detailed",
                        "description": "Mức độ chi tiết phân tích"
                    }
                },
                "required": []
            }),
            Self::ExplainFinding => json!({
                "type": "object",
                "properties": {
                    "finding_name": {
                        "type": "string",
                        "description": "Tên bất thường cần giải thích (VD: Cardiomegaly, Pleural effusion, Pneumothorax)"
                    },
                    "include_treatment": {
                        "type": "boolean",
                        "default": false,
                        "description": "Có bao gồm thông tin điều trị không"
                    }
                },
                "required": ["finding_name"]
            }),
            Self::GenerateReport => json!({
                "type": "object",
                "properties": {
                    "format": {
                        "type": "string",
                        "enum": ["standard", "detailed", "summary"],
                        "default": "standard",
                        "description": "Định dạng báo cáo: standard (chuẩn), detailed (chi tiết), summary (tóm tắt)"
                    },
                    "include_recommendations": {
                        "type": "boolean",
                        "default": true,
                        "description": "Có bao gồm khuyến nghị theo dõi/điều trị không"
                    }
                },
                "required": []
            }),
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recognised tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: ToolName,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: ToolName) -> Self {
        Self {
            name,
            args: Map::new(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }

    pub fn arg_bool(&self, key: &str) -> Option<bool> {
        self.args.get(key).and_then(Value::as_bool)
    }
}

/// Which strategy produced a parse result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    WholeText,
    FencedBlock,
    BraceScan,
    Keyword,
}

/// Findings recognised by name when the keyword fallback picks
/// `explain_finding`.
const KNOWN_FINDINGS: [&str; 14] = [
    "Cardiomegaly",
    "Pleural effusion",
    "Pneumothorax",
    "Atelectasis",
    "Consolidation",
    "Edema",
    "Emphysema",
    "Nodule",
    "Mass",
    "Infiltration",
    "Pneumonia",
    "Aortic enlargement",
    "Calcification",
    "Fibrosis",
];

static JSON_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("JSON_FENCE regex should compile")
});

static PLAIN_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```\s*(\{.*?\})\s*```").expect("PLAIN_FENCE regex should compile")
});

/// Multi-strategy tool-call extractor. Stateless.
pub struct ToolCallParser;

impl ToolCallParser {
    /// Extract a tool call from raw model output, if there is one.
    pub fn parse(text: &str) -> Option<ToolCall> {
        Self::parse_with_strategy(text).map(|(call, _)| call)
    }

    /// Like [`ToolCallParser::parse`], also reporting which strategy matched.
    pub fn parse_with_strategy(text: &str) -> Option<(ToolCall, ParseStrategy)> {
        if text.trim().is_empty() {
            return None;
        }

        let found = Self::whole_text(text)
            .map(|c| (c, ParseStrategy::WholeText))
            .or_else(|| Self::fenced_block(text).map(|c| (c, ParseStrategy::FencedBlock)))
            .or_else(|| Self::brace_scan(text).map(|c| (c, ParseStrategy::BraceScan)))
            .or_else(|| Self::keyword(text).map(|c| (c, ParseStrategy::Keyword)));

        if let Some((call, strategy)) = &found {
            debug!(tool = %call.name, ?strategy, "tool call parsed");
        }
        found
    }

    /// Parse only the JSON strategies, without the keyword fallback.
    pub fn parse_json(text: &str) -> Option<ToolCall> {
        Self::whole_text(text)
            .or_else(|| Self::fenced_block(text))
            .or_else(|| Self::brace_scan(text))
    }

    fn whole_text(text: &str) -> Option<ToolCall> {
        Self::from_json_str(text.trim())
    }

    fn fenced_block(text: &str) -> Option<ToolCall> {
        [&*JSON_FENCE, &*PLAIN_FENCE].into_iter().find_map(|re| {
            re.captures_iter(text)
                .filter_map(|caps| caps.get(1))
                .find_map(|m| Self::from_json_str(m.as_str()))
        })
    }

    /// Try every `{` as the start of a balanced `{ ... }` span, in order.
    /// A failed candidate never hides the ones after it.
    fn brace_scan(text: &str) -> Option<ToolCall> {
        text.char_indices()
            .filter(|&(_, ch)| ch == '{')
            .find_map(|(start, _)| {
                let end = Self::balanced_end(&text[start..])?;
                Self::from_json_str(&text[start..start + end])
            })
    }

    /// Byte length of the balanced object that opens at the start of
    /// `text`, ignoring braces inside JSON strings.
    fn balanced_end(text: &str) -> Option<usize> {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for (i, ch) in text.char_indices() {
            if in_string {
                match ch {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match ch {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => {
                    depth = depth.checked_sub(1)?;
                    if depth == 0 {
                        return Some(i + 1);
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn keyword(text: &str) -> Option<ToolCall> {
        let lower = text.to_lowercase();
        for tool in ToolName::ALL {
            if let Some(trigger) = tool.triggers().iter().find(|t| lower.contains(*t)) {
                debug!(tool = %tool, trigger, "tool call keyword match");
                let mut call = ToolCall::new(tool);
                if tool == ToolName::ExplainFinding {
                    if let Some(finding) = Self::finding_in(&lower) {
                        call = call.with_arg("finding_name", finding);
                    }
                }
                return Some(call);
            }
        }
        None
    }

    fn finding_in(lower: &str) -> Option<&'static str> {
        KNOWN_FINDINGS
            .into_iter()
            .find(|finding| lower.contains(&finding.to_lowercase()))
    }

    fn from_json_str(candidate: &str) -> Option<ToolCall> {
        let value: Value = serde_json::from_str(candidate).ok()?;
        Self::validate(value)
    }

    /// Shared validation for every JSON candidate.
    pub fn validate(value: Value) -> Option<ToolCall> {
        let Value::Object(mut obj) = value else {
            return None;
        };
        if let Some(inner) = obj.remove("tool_call") {
            let Value::Object(inner) = inner else {
                return None;
            };
            obj = inner;
        }

        let name = obj.get("name").and_then(Value::as_str)?;
        let Some(tool) = ToolName::from_name(name) else {
            debug!(name, "unknown tool name");
            return None;
        };

        let args = match obj.remove("args") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(args)) => args,
            Some(_) => return None,
        };
        Some(ToolCall { name: tool, args })
    }
}

/// Numbered tool list for the system prompt.
pub fn tools_description() -> String {
    let mut lines = Vec::new();
    for (i, tool) in ToolName::ALL.into_iter().enumerate() {
        let mut desc = tool.description().lines();
        let summary = desc.next().unwrap_or_default();
        lines.push(format!("{}. **{}**: {}", i + 1, tool, summary));
        for hint in desc.map(str::trim).filter(|l| !l.is_empty()) {
            lines.push(format!("   {hint}"));
        }
    }
    lines.join("\n")
}

/// Instruction telling the model how to format a tool call.
pub fn tool_call_instruction() -> &'static str {
    r#"## Response Format
Nếu CẦN sử dụng tool, trả về CHÍNH XÁC format JSON (không có text khác):
{"tool_call": {"name": "tool_name", "args": {"param": "value"}}}

Nếu KHÔNG cần tool, trả lời bình thường bằng text tiếng Việt.

## Important Rules
- CHỈ gọi tool khi user THỰC SỰ yêu cầu hành động đó
- Nếu đã có kết quả phân tích trong context, THAM KHẢO kết quả đó thay vì gọi analyze_xray lại
- Với câu hỏi đơn giản, chào hỏi, hoặc hỏi thông tin chung → trả lời trực tiếp, KHÔNG gọi tool
- Khi không chắc chắn → trả lời trực tiếp, KHÔNG gọi tool"#
}
