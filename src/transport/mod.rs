//! Transport layer for upstream MCP servers.
//!
//! One correlated JSON-RPC channel per upstream over the asymmetric
//! SSE-downstream + HTTP-POST-upstream protocol, plus the registry that
//! owns and serializes access to them.

pub mod events;
pub mod registry;
pub mod sse;

pub use registry::{TransportRegistry, TransportStatusEvent};
pub use sse::{SseTransport, Transport, TransportConfig, TransportObserver};
