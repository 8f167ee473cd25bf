//! Core identifier and wire types shared by every layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identity of a peer endpoint.
///
/// # Structure
///
/// An opaque string assigned by the transport layer when an endpoint is bound
/// anonymously, or chosen by the caller when binding a rendezvous name.
///
/// # Ordering
///
/// Peer ids are totally ordered by their string value. Host succession picks
/// the lowest surviving member id, so the ordering is part of the protocol.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a PeerId from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random anonymous id (`peer-` followed by 16 hex digits).
    pub fn random() -> Self {
        Self(format!("peer-{:016x}", rand::random::<u64>()))
    }

    /// Get the raw id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier matching an acknowledgment frame to the send that is waiting on it.
///
/// # Invariants
///
/// - Drawn at random for every send, never reused by the sender while pending
/// - An acknowledgment carries the id of the frame it acknowledges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    /// Create a new CorrelationId.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Draw a fresh random id.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Package tag, routing an inbound package to its handler.
///
/// The protocol tags form a closed set; applications layer their own traffic
/// on top with [`Tag::App`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tag {
    /// New member announces its display name to the host.
    Join,
    /// Host relays a member's display name to everyone.
    NewJoin,
    /// Member changes its display name.
    Rename,
    /// Newly promoted host announces itself.
    ChangeHost,
    /// Host broadcasts the authoritative member list.
    MemberChange,
    /// Host sends the committed state to a joiner.
    SetState,
    /// Phase 1 of a dispatch round: stage this action.
    Dispatch,
    /// Phase 2 (abort): drop the staged state.
    Cancel,
    /// Phase 2 (commit): promote the staged state.
    Promote,
    /// Acknowledgment carrying inline reply data.
    Ack,
    /// Application-defined tag.
    App(String),
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Join => f.write_str("JOIN"),
            Tag::NewJoin => f.write_str("NEW_JOIN"),
            Tag::Rename => f.write_str("RENAME"),
            Tag::ChangeHost => f.write_str("CHANGE_HOST"),
            Tag::MemberChange => f.write_str("MEMBER_CHANGE"),
            Tag::SetState => f.write_str("SET_STATE"),
            Tag::Dispatch => f.write_str("DISPATCH"),
            Tag::Cancel => f.write_str("CANCEL"),
            Tag::Promote => f.write_str("PROMOTE"),
            Tag::Ack => f.write_str("ACK"),
            Tag::App(name) => write!(f, "APP:{name}"),
        }
    }
}

/// Tagged payload carried inside a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub tag: Tag,
    #[serde(default)]
    pub data: Value,
}

impl Package {
    pub fn new(tag: Tag, data: Value) -> Self {
        Self { tag, data }
    }

    /// A package whose data is `null`.
    pub fn bare(tag: Tag) -> Self {
        Self {
            tag,
            data: Value::Null,
        }
    }

    /// Acknowledgment package carrying reply data.
    pub fn ack(data: Value) -> Self {
        Self {
            tag: Tag::Ack,
            data,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.tag == Tag::Ack
    }
}

/// Unit of transmission on a link: `(correlation id, payload)`.
///
/// A frame without payload is a bare acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: CorrelationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Package>,
}

impl Frame {
    pub fn request(id: CorrelationId, payload: Package) -> Self {
        Self {
            id,
            payload: Some(payload),
        }
    }

    /// Acknowledge `id`, optionally with reply data.
    pub fn ack(id: CorrelationId, reply: Option<Value>) -> Self {
        Self {
            id,
            payload: reply.map(Package::ack),
        }
    }

    /// Whether this frame answers a pending send instead of carrying new data.
    pub fn is_ack(&self) -> bool {
        self.payload.as_ref().map_or(true, Package::is_ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_peer_id_ordering() {
        let mut ids = vec![PeerId::new("b"), PeerId::new("c"), PeerId::new("a")];
        ids.sort();
        assert_eq!(ids, vec![PeerId::new("a"), PeerId::new("b"), PeerId::new("c")]);
    }

    #[test]
    fn test_random_peer_ids_differ() {
        let a = PeerId::random();
        let b = PeerId::random();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("peer-"));
    }

    #[test]
    fn test_tag_wire_names() {
        assert_eq!(serde_json::to_value(Tag::MemberChange).unwrap(), json!("MEMBER_CHANGE"));
        assert_eq!(serde_json::to_value(Tag::Ack).unwrap(), json!("ACK"));
        assert_eq!(
            serde_json::to_value(Tag::App("chat".into())).unwrap(),
            json!({"APP": "chat"})
        );
    }

    #[test]
    fn test_frame_ack_detection() {
        let id = CorrelationId::new(7);
        assert!(Frame::ack(id, None).is_ack());
        assert!(Frame::ack(id, Some(json!(1))).is_ack());
        assert!(!Frame::request(id, Package::bare(Tag::Promote)).is_ack());
    }

    #[test]
    fn test_bare_ack_omits_payload() {
        let frame = Frame::ack(CorrelationId::new(1), None);
        assert_eq!(serde_json::to_value(&frame).unwrap(), json!({"id": 1}));
    }
}
