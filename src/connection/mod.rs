//! Connection management subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound call:
//!     dispatch()
//!         → live WebSocket: request frame, await response by correlation id
//!         → connection absent: one-shot out-of-band call (HTTP webhook)
//!         → neither deliverable: persist to the retry queue, fail Deferred
//!
//! Inbound (per connection):
//!     inbound loop reads frames in arrival order
//!         → response frames resolve pending requests
//!         → event frames dispatch to registered handlers
//!         → error frames are logged
//!
//! Liveness:
//!     probe loop pings on a fixed interval; missed pongs or transport
//!     errors trigger disconnect handling and linear-backoff reconnection
//! ```
//!
//! # Design Decisions
//! - One probe loop, one inbound loop per connection instance; both are torn
//!   down before a new connect starts
//! - Reconnect scheduling is idempotent; never two timers
//! - On disconnect every pending request resolves with `ConnectionLost`;
//!   nothing dangles

pub mod frame;
pub mod manager;

pub use frame::{Frame, FrameType};
pub use manager::{
    event_handler, ConnectionConfig, ConnectionManager, ConnectionSnapshot, ConnectionState,
    EventHandler, OutOfBand,
};
