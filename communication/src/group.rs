//! Ordered peer sets and tagged endpoints.

use crate::rpc::{Rpc, Tag};

/// An immutable, ordered, non-empty set of peer ids.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessGroup {
    members: Vec<usize>,
}

impl ProcessGroup {
    pub fn new(members: Vec<usize>) -> Self {
        assert!(!members.is_empty(), "a process group may not be empty");
        ProcessGroup { members }
    }

    /// The peers `first..=last`, in order.
    pub fn range(first: usize, last: usize) -> Self {
        assert!(first <= last, "empty peer range {}..={}", first, last);
        Self::new((first..=last).collect())
    }

    /// Every peer of the transport, in id order.
    pub fn all(rpc: &dyn Rpc) -> Self {
        Self::range(rpc.first(), rpc.last())
    }

    /// Every peer of the transport except this one.
    pub fn others(rpc: &dyn Rpc) -> Self {
        let me = rpc.id();
        Self::new((rpc.first()..=rpc.last()).filter(|&p| p != me).collect())
    }

    pub fn count(&self) -> usize {
        self.members.len()
    }

    /// The peer id at position `index`.
    pub fn member(&self, index: usize) -> usize {
        self.members[index]
    }

    /// The position of `peer` within the group, if present.
    pub fn position(&self, peer: usize) -> Option<usize> {
        self.members.iter().position(|&p| p == peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.members.iter().copied()
    }
}

/// A group plus the base tag its traffic uses.
#[derive(Clone, Debug)]
pub struct Endpoint {
    group: ProcessGroup,
    tag: Tag,
}

impl Endpoint {
    pub fn new(group: ProcessGroup, tag: Tag) -> Self {
        Endpoint { group, tag }
    }

    pub fn group(&self) -> &ProcessGroup {
        &self.group
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_is_inclusive() {
        let group = ProcessGroup::range(1, 7);
        assert_eq!(group.count(), 7);
        assert_eq!(group.member(0), 1);
        assert_eq!(group.member(6), 7);
        assert_eq!(group.position(4), Some(3));
        assert_eq!(group.position(0), None);
    }

    #[test]
    fn singleton_group() {
        let group = ProcessGroup::range(3, 3);
        assert_eq!(group.count(), 1);
        assert_eq!(group.member(0), 3);
    }

    #[test]
    #[should_panic(expected = "may not be empty")]
    fn empty_group_rejected() {
        ProcessGroup::new(Vec::new());
    }
}
