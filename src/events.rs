//! Relay Events
//!
//! What the transports hand to the message router. Both relays push into
//! one unbounded channel, the router drains it on a single task.

use uuid::Uuid;

use crate::mesh::MeshPacket;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A fragment heard on the broadcast transport for the first time
    MeshPacket(MeshPacket),

    /// A whole message read from a star connection
    StarMessage {
        from: String,
        text: String,
        /// Explicit identity when the sender included one
        message_id: Option<Uuid>,
    },
}
