//! Error types for the starmesh replication stack.

use crate::codec::CodecError;
use crate::types::PeerId;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by [`EventBus`](crate::events::EventBus) waits.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// No matching event was emitted before the deadline.
    #[error("Timed out after {timeout:?} waiting for {kind}")]
    Timeout { kind: String, timeout: Duration },

    /// The listener was removed before an event arrived.
    #[error("Event bus listener removed before delivery")]
    Closed,
}

/// Errors reported by a transport implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Another endpoint already claimed this id.
    #[error("Peer id already taken: {0}")]
    IdTaken(PeerId),

    /// No live endpoint answers to this id.
    #[error("Peer unavailable: {0}")]
    PeerUnavailable(PeerId),

    /// The link is closed (or was never opened).
    #[error("Link to {0} is closed")]
    LinkClosed(PeerId),

    /// The local endpoint has been destroyed.
    #[error("Endpoint {0} destroyed")]
    EndpointDestroyed(PeerId),
}

/// Errors surfaced by a [`ReliableChannel`](crate::channel::ReliableChannel) send.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel closed before the acknowledgment arrived.
    #[error("Channel to {peer} closed")]
    Closed { peer: PeerId },

    /// The underlying link reported an error.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame encoding or decoding failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Errors related to the [`LinkManager`](crate::link::LinkManager).
#[derive(Debug, Error)]
pub enum LinkError {
    /// The link did not open within the deadline.
    #[error("Connection to {peer} timed out after {timeout:?}")]
    ConnectionTimeout { peer: PeerId, timeout: Duration },

    /// The transport reported the target as unreachable while connecting.
    #[error("Peer {peer} unavailable: {reason}")]
    PeerUnavailable { peer: PeerId, reason: String },

    /// No registered channel for this peer.
    #[error("Connection lost: {peer}")]
    ConnectionLost { peer: PeerId },

    /// Send on a registered channel failed.
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Transport error while opening a link.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors related to session management on a
/// [`ReplicationNetwork`](crate::network::ReplicationNetwork).
#[derive(Debug, Error)]
pub enum MeshError {
    /// `host` was called while already hosting.
    #[error("Already hosting {0}")]
    AlreadyHosting(String),

    /// `join` was called while already joined.
    #[error("Already joined {0}")]
    AlreadyJoined(String),

    /// Membership did not settle before the join deadline.
    #[error("Join of {name} did not settle within {timeout:?}")]
    JoinTimeout { name: String, timeout: Duration },

    /// Connecting or sending failed.
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// Binding the rendezvous endpoint failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors returned to the caller of `dispatch`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// At least one member's reducer rejected the action.
    ///
    /// Displays as the distinct reasons joined with `", "`.
    #[error("{}", reasons.join(", "))]
    Rejected { reasons: Vec<String> },

    /// Some members could not be reached during the propose phase.
    #[error("Members unreachable: {peers:?}")]
    Unreachable { peers: Vec<PeerId> },

    /// The round committed, but these members had lost their staged state
    /// and could not be brought back in line.
    #[error("Members diverged: {peers:?}")]
    Diverged { peers: Vec<PeerId> },

    /// No session: the member list is empty.
    #[error("Not joined to any network")]
    NotJoined,

    /// No reducer was configured on this peer.
    #[error("No reducer configured")]
    NoReducer,

    /// The network was left while the dispatch was queued.
    #[error("Network left before dispatch completed")]
    Left,

    /// The dispatch task ended without reporting a result.
    #[error("Dispatch abandoned")]
    Abandoned,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_message_joins_reasons() {
        let err = DispatchError::Rejected {
            reasons: vec!["invalid action".into()],
        };
        assert_eq!(err.to_string(), "invalid action");

        let err = DispatchError::Rejected {
            reasons: vec!["too low".into(), "too high".into()],
        };
        assert_eq!(err.to_string(), "too low, too high");
    }

    #[test]
    fn test_connection_timeout_names_target() {
        let err = LinkError::ConnectionTimeout {
            peer: PeerId::new("room"),
            timeout: Duration::from_millis(50),
        };
        assert!(err.to_string().contains("room"));
    }
}
