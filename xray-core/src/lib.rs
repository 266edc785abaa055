//! Building blocks for the chest X-ray chat backend.
//!
//! Everything in this crate is independent of the streaming and
//! orchestration layer:
//!
//! - [`detection`]: detection data model and the VinDr-CXR class vocabulary
//! - [`fusion`]: weighted box fusion of several detection sets
//! - [`resilience`]: circuit breakers, breaker registry, retry policy
//! - [`tool_call`]: tool vocabulary and the multi-strategy tool-call parser
//! - [`error`]: backend error taxonomy shared by all of the above

pub mod detection;
pub mod error;
pub mod fusion;
pub mod resilience;
pub mod tool_call;

pub use detection::{BoundingBox, Detection, DetectionSource, ImageDims};
pub use error::{ErrorKind, ErrorReport, ServiceError, ServiceResult};
pub use fusion::{fuse, FusionMode, FusionOutcome, FusionParams};
pub use resilience::{
    BreakerRegistry, BreakerStatus, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    RetryPolicy,
};
pub use tool_call::{ToolCall, ToolCallParser, ToolName};
