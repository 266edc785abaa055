//! Streaming, tool-aware chat for chest X-ray assistance.
//!
//! - [`config`]: environment-driven settings
//! - [`services`]: detector / language-model seams behind breakers and retry
//! - [`streaming`]: event protocol, session lifecycle, heartbeat, timeout
//! - [`orchestrator`]: two-phase turns (decide, then execute a tool)
//! - [`mock`]: simulated collaborators for the CLI and tests

pub mod config;
pub mod mock;
pub mod orchestrator;
pub mod services;
pub mod streaming;

pub use config::ChatConfig;
pub use orchestrator::{Orchestrator, TurnOutcome, TurnRequest, TurnSummary};
pub use services::{
    ChatMessage, ChunkSink, Detector, GenerationRequest, LanguageModel, Services, SharedServices,
    XrayImage,
};
pub use streaming::{EventStream, StreamEvent, StreamEventType, StreamingSession};
