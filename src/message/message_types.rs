//! Message Type Definitions
//!
//! The transport-agnostic record every delivered message becomes, and the
//! identity rules that let the two transports deduplicate each other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Namespace for identities derived from star-transport content
pub const MESSAGE_ID_NAMESPACE: Uuid = Uuid::from_u128(0x9c4e_51a7_0b3d_4f12_8a66_d1e2_7f30_c845);

/// Where a message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Star,
    Mesh,
    Local,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            TransportKind::Star => "star",
            TransportKind::Mesh => "mesh",
            TransportKind::Local => "local",
        };
        f.write_str(tag)
    }
}

/// A delivered message as shown to the user. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedMessage {
    pub id: Uuid,
    pub text: String,
    pub sender_id: String,
    pub nickname: String,
    pub source: TransportKind,
    pub received_at: DateTime<Utc>,
}

impl UnifiedMessage {
    pub fn new(id: Uuid, text: String, sender_id: String, nickname: String, source: TransportKind) -> Self {
        Self {
            id,
            text,
            sender_id,
            nickname,
            source,
            received_at: Utc::now(),
        }
    }

    pub fn local(id: Uuid, text: String, local_id: &str, nickname: &str) -> Self {
        Self::new(id, text, local_id.to_string(), nickname.to_string(), TransportKind::Local)
    }

    pub fn from_star(id: Uuid, from: String, text: String) -> Self {
        Self::new(id, text, from.clone(), from, TransportKind::Star)
    }

    /// Mesh frames carry no display name, so the origin address doubles as one
    pub fn from_mesh(id: Uuid, origin: String, text: String) -> Self {
        Self::new(id, text, origin.clone(), origin, TransportKind::Mesh)
    }

    pub fn is_local(&self) -> bool {
        self.source == TransportKind::Local
    }
}

impl fmt::Display for UnifiedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] <{}> {} ({})",
            self.received_at.format("%H:%M:%S"),
            self.nickname,
            self.text,
            self.source
        )
    }
}

/// Stable identity for a message that arrived without one: the same sender
/// and text always map to the same id, on every device.
pub fn derive_message_id(from: &str, text: &str) -> Uuid {
    let name = format!("{}::{}", from, text);
    Uuid::new_v5(&MESSAGE_ID_NAMESPACE, name.as_bytes())
}
