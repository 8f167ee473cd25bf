//! Membership payloads, diffing, and host succession.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::PeerId;

/// MEMBER_CHANGE payload: the host's authoritative view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberChange {
    pub host: PeerId,
    pub members: Vec<PeerId>,
    /// Host term; older hosts omit it.
    #[serde(default)]
    pub term: u64,
}

/// CHANGE_HOST payload, sent by a freshly promoted host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAnnouncement {
    pub host: PeerId,
    pub term: u64,
}

/// NEW_JOIN payload: a member's display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameAnnouncement {
    pub name: String,
    pub peer: PeerId,
}

/// Result of comparing two member lists.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemberDiff {
    /// In `new` but not in `old`, in `new` order.
    pub joined: Vec<PeerId>,
    /// In `old` but not in `new`, in `old` order.
    pub left: Vec<PeerId>,
}

impl MemberDiff {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

pub fn diff(old: &[PeerId], new: &[PeerId]) -> MemberDiff {
    MemberDiff {
        joined: new.iter().filter(|p| !old.contains(p)).cloned().collect(),
        left: old.iter().filter(|p| !new.contains(p)).cloned().collect(),
    }
}

/// Whether two member lists hold the same ids, ignoring order.
pub fn same_set(a: &[PeerId], b: &[PeerId]) -> bool {
    a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

/// The member that takes over when `host` disappears: the lowest id that
/// is not the host.
pub fn successor<'a>(members: &'a [PeerId], host: Option<&PeerId>) -> Option<&'a PeerId> {
    members.iter().filter(|m| Some(*m) != host).min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(raw: &[&str]) -> Vec<PeerId> {
        raw.iter().map(|s| PeerId::new(*s)).collect()
    }

    #[test]
    fn test_diff_reports_both_directions() {
        let d = diff(&ids(&["a", "b", "c"]), &ids(&["c", "d", "a"]));
        assert_eq!(d.joined, ids(&["d"]));
        assert_eq!(d.left, ids(&["b"]));
        assert!(!d.is_empty());
    }

    #[test]
    fn test_same_set_ignores_order() {
        assert!(same_set(&ids(&["a", "b"]), &ids(&["b", "a"])));
        assert!(!same_set(&ids(&["a", "b"]), &ids(&["a"])));
        assert!(same_set(&[], &[]));
    }

    #[test]
    fn test_successor_skips_host() {
        let members = ids(&["m", "c", "k"]);
        assert_eq!(successor(&members, Some(&PeerId::new("c"))), Some(&PeerId::new("k")));
        assert_eq!(successor(&members, None), Some(&PeerId::new("c")));
        assert_eq!(successor(&ids(&["c"]), Some(&PeerId::new("c"))), None);
    }

    #[test]
    fn test_member_change_without_term() {
        let change: MemberChange =
            serde_json::from_value(json!({"host": "a", "members": ["a", "b"]})).unwrap();
        assert_eq!(change.term, 0);
        assert_eq!(change.members, ids(&["a", "b"]));
    }
}
