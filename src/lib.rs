//! voice-bridge — resilient integration service for a voice pipeline.
//!
//! Bridges a local voice pipeline to a set of independent, unreliable
//! network services: a workflow endpoint (webhook + optional stream), a
//! streaming speech-to-text service, a text-to-speech API, and an optional
//! event broker.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌────────────────────────────────────────────────────┐
//!                 │                    VOICE BRIDGE                     │
//!                 │                                                     │
//!  audio in ──────┼─▶ clients::transcription ──▶ orchestrator           │
//!                 │                                   │                 │
//!                 │                                   ▼                 │
//!                 │                          clients::workflow          │
//!                 │                                   │                 │
//!                 │                                   ▼                 │
//!  audio out ◀────┼── AudioSink ◀── clients::tts ◀── reply text         │
//!                 │                                                     │
//!                 │  ┌───────────────────────────────────────────────┐  │
//!                 │  │              Resilience Core                   │  │
//!                 │  │  ┌────────────┐ ┌───────────┐ ┌─────────────┐ │  │
//!                 │  │  │ resilience │ │ connection│ │    queue    │ │  │
//!                 │  │  │  (breaker) │ │ (ws mux)  │ │ (durable)   │ │  │
//!                 │  │  └────────────┘ └───────────┘ └─────────────┘ │  │
//!                 │  └───────────────────────────────────────────────┘  │
//!                 │  ┌───────────────────────────────────────────────┐  │
//!                 │  │  config │ lifecycle │ observability            │  │
//!                 │  └───────────────────────────────────────────────┘  │
//!                 └────────────────────────────────────────────────────┘
//! ```
//!
//! Every external dependency sits behind the same core: a circuit breaker
//! gating calls, a reconnecting WebSocket multiplexer where the service
//! speaks the frame protocol, and a durable retry queue that survives
//! process restarts.

// Resilience core
pub mod connection;
pub mod queue;
pub mod resilience;

// Service surface
pub mod clients;
pub mod orchestrator;

// Cross-cutting concerns
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod observability;

pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use lifecycle::Shutdown;
pub use orchestrator::Orchestrator;
