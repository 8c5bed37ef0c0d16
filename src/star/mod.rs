//! Star Transport
//!
//! Whole-message relay over point-to-point streams: one host, many clients.

pub mod relay;
pub mod transport;
pub mod wire;

pub use relay::{ConnectionState, StarRelay, StarRole};
pub use transport::{ByteStream, Link, MemoryNetwork, MemoryTransport, StreamListener, StreamTransport, TcpTransport};
pub use wire::{encode_line, parse_line, WireRecord, MAX_RECORD_BYTES};
