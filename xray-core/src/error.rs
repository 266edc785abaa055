//! Backend error taxonomy with structural retry classification.
//!
//! Every failure that can come out of a protected backend call is a
//! [`ServiceError`]. Callers never match on messages: the retry policy asks
//! [`ErrorKind::is_retriable`], the circuit breaker asks
//! [`ErrorKind::counts_against_breaker`].
//!
//! | Kind               | Code                | Retriable | Breaker failure |
//! |--------------------|---------------------|-----------|-----------------|
//! | ModelUnavailable   | MODEL_NOT_LOADED    | no        | yes             |
//! | Inference          | INFERENCE_FAILED    | yes       | yes             |
//! | ResourceExhausted  | GPU_OOM             | yes       | yes             |
//! | CircuitOpen        | SERVICE_UNAVAILABLE | no        | no              |
//! | ToolCall           | TOOL_CALL_ERROR     | no        | no              |
//! | Validation         | VALIDATION_ERROR    | no        | no              |
//! | Cancelled          | CANCELLED           | no        | no              |

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias for backend operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Flat classification of a [`ServiceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ModelUnavailable,
    Inference,
    ResourceExhausted,
    CircuitOpen,
    ToolCall,
    Validation,
    Cancelled,
}

impl ErrorKind {
    /// Transient backend failures that may succeed on a later attempt.
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Inference | Self::ResourceExhausted)
    }

    /// Whether a failure of this kind says something about backend health.
    pub fn counts_against_breaker(self) -> bool {
        matches!(
            self,
            Self::ModelUnavailable | Self::Inference | Self::ResourceExhausted
        )
    }

    /// Stable machine-readable code surfaced to clients.
    pub fn code(self) -> &'static str {
        match self {
            Self::ModelUnavailable => "MODEL_NOT_LOADED",
            Self::Inference => "INFERENCE_FAILED",
            Self::ResourceExhausted => "GPU_OOM",
            Self::CircuitOpen => "SERVICE_UNAVAILABLE",
            Self::ToolCall => "TOOL_CALL_ERROR",
            Self::Validation => "VALIDATION_ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModelUnavailable => write!(f, "model_unavailable"),
            Self::Inference => write!(f, "inference"),
            Self::ResourceExhausted => write!(f, "resource_exhausted"),
            Self::CircuitOpen => write!(f, "circuit_open"),
            Self::ToolCall => write!(f, "tool_call"),
            Self::Validation => write!(f, "validation"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Unified error type for calls into the detector and the vision model.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// Backend weights are not loaded or the backend is not reachable.
    #[error("Model '{model}' is not loaded or unavailable")]
    ModelUnavailable { model: String },

    /// Transient inference failure (timeout, runtime error, backend crash).
    #[error("Inference failed{}: {message}", tag(.model))]
    Inference {
        message: String,
        model: Option<String>,
    },

    /// Accelerator memory or a similar resource ran out.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The breaker guarding `service` is open; the call was not attempted.
    #[error("Service '{service}' is temporarily unavailable")]
    CircuitOpen { service: String },

    /// A recognised tool call could not be executed.
    #[error("Tool call failed{}: {message}", tag(.tool))]
    ToolCall {
        message: String,
        tool: Option<String>,
    },

    /// Caller supplied unusable input.
    #[error("Validation failed{}: {message}", tag(.field))]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// The turn was abandoned, usually because the client went away.
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ModelUnavailable { .. } => ErrorKind::ModelUnavailable,
            Self::Inference { .. } => ErrorKind::Inference,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::ToolCall { .. } => ErrorKind::ToolCall,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }

    pub fn inference(message: impl Into<String>) -> Self {
        Self::Inference {
            message: message.into(),
            model: None,
        }
    }

    pub fn inference_in(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Inference {
            message: message.into(),
            model: Some(model.into()),
        }
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolCall {
            message: message.into(),
            tool: Some(tool.into()),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Attach a correlation id so the failure can be surfaced to a client.
    pub fn report(&self) -> ErrorReport {
        ErrorReport::new(self)
    }
}

/// Client-safe view of a failure.
///
/// `message` is generic; the detailed error only goes to the server log,
/// keyed by `error_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub error_id: String,
    pub code: String,
    pub message: String,
}

impl ErrorReport {
    pub fn new(error: &ServiceError) -> Self {
        let message = match error.kind() {
            ErrorKind::CircuitOpen | ErrorKind::ModelUnavailable => {
                "The analysis service is temporarily unavailable. Please try again later."
            }
            ErrorKind::ResourceExhausted => {
                "The analysis service is busy. Please try again shortly."
            }
            _ => "An internal error occurred while generating the response.",
        };
        Self {
            error_id: correlation_id(),
            code: error.code().to_string(),
            message: message.to_string(),
        }
    }

    /// Message shown to the end user, carrying the correlation id.
    pub fn public_message(&self) -> String {
        format!("{} (ref: {})", self.message, self.error_id)
    }
}

fn tag(value: &Option<String>) -> String {
    value.as_deref().map(|v| format!(" [{v}]")).unwrap_or_default()
}

/// Short correlation identifier: the first 8 hex characters of a v4 UUID.
pub fn correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
