//! Message Handling Module
//!
//! Identity, history and cross-transport routing of delivered messages.

pub mod message_types;
pub mod router;
pub mod storage;

pub use message_types::{derive_message_id, TransportKind, UnifiedMessage};
pub use router::{MessageRouter, RouterStatus};
pub use storage::MessageHistory;
