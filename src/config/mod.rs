//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → BridgeConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults so a minimal config works
//! - Validation separates syntactic (serde) from semantic checks and
//!   reports every error, not just the first

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    BridgeConfig, BrokerConfig, ObservabilityConfig, OrchestratorConfig, QueueConfig,
    ResilienceConfig, TranscriptionConfig, TtsConfig, WorkflowConfig,
};
