//! Wire payloads of the stage/commit round.

use serde::{Deserialize, Serialize};

use crate::types::PeerId;

/// DISPATCH payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal<A> {
    pub round: u64,
    pub action: A,
}

/// CANCEL and PROMOTE payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRef {
    pub round: u64,
}

/// Acknowledgment data for DISPATCH.
///
/// Encoded as `"staged"`, `"busy"` or `{"rejected": message}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageReply {
    Staged,
    /// Another round is already staged here; retry later.
    Busy,
    Rejected(String),
}

/// Acknowledgment data for CANCEL and PROMOTE.
///
/// `Missed` means no staged state carried that round, either because it
/// was never staged here or because it expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundReply {
    Applied,
    Missed,
}

/// A provisional state waiting for CANCEL or PROMOTE.
#[derive(Debug, Clone)]
pub(crate) struct Staged<S> {
    pub round: u64,
    pub proposer: PeerId,
    pub state: S,
}
