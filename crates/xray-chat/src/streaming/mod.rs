//! Streaming event protocol.

pub mod event;
pub mod session;

pub use event::{ContentKind, DeltaKind, StreamEvent, StreamEventType};
pub use session::{
    EventSink, EventStream, Frame, QueueSink, StreamError, StreamResult, StreamingSession, Usage,
    TIMEOUT_CODE,
};
