//! Live event stream client for the automation platform
//!
//! Maintains a persistent, self-healing WebSocket connection and exposes
//! it as a stream of [`StreamEvent`]s plus a small request/response
//! surface for registry and state dumps.

mod connection;
mod wire;

pub use connection::{ConnectionState, StreamError, StreamEvent, StreamHandle, StreamManager};
pub use wire::{RegistryDump, RegistryKind, StateChangedData};
