//! Service client adapters.
//!
//! # Data Flow
//! ```text
//! orchestrator
//!     → workflow.rs (WebSocket stream + HTTP webhook fallback)
//!     → transcription.rs (audio out, transcription events in)
//!     → tts.rs (one-shot HTTP synthesis)
//!     → broker.rs (optional event publishing)
//!
//! Every adapter sits on the resilience core: its own circuit breaker,
//! the shared retry queue for deferrable calls, and a connection manager
//! where the service speaks the frame protocol.
//! ```

pub mod broker;
pub mod transcription;
pub mod tts;
pub mod workflow;

pub use broker::{BrokerClient, EventPriority};
pub use transcription::{Transcription, TranscriptionClient, TranscriptionKind};
pub use tts::TtsClient;
pub use workflow::WorkflowClient;
