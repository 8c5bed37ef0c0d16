//! Mesh Relay - multi-transport relay engine for short-range messaging
//!
//! Text messages travel over two unreliable transports at once: a flood of
//! tiny broadcast advertisements, fragmented and relayed hop by hop with a
//! TTL, and a star of point-to-point stream connections around one host.
//! The [`MessageRouter`] gives every message one identity, delivers it once
//! and carries it across to the other transport.

pub mod config;
pub mod error;
pub mod events;
pub mod mesh;
pub mod message;
pub mod peer_manager;
pub mod star;
pub mod tasks;

pub use config::{JitterWindow, MeshConfig, DEFAULT_TTL};
pub use error::{MeshError, Result};
pub use events::RelayEvent;
pub use mesh::{BroadcastRadio, FloodRelay, MeshPacket, MeshProtocol, SimulatedAir};
pub use message::{MessageRouter, RouterStatus, TransportKind, UnifiedMessage};
pub use star::{MemoryNetwork, StarRelay, StreamTransport, TcpTransport};
