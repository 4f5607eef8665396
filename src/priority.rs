//! Stream priority tree, RFC 7540 §5.3. Spec §4.4.
//!
//! Modeled arena-style: nodes live in one `DashMap<StreamId, PriorityNode>`
//! addressed by id rather than as an owned parent/child pointer graph, the
//! same shape the teacher's `stream_coordinator.rs` already uses for the
//! stream table itself.

use crate::error::{Error, ErrorCode};
use crate::types::StreamId;
use dashmap::DashMap;

pub const DEFAULT_WEIGHT: u8 = 15;

#[derive(Debug, Clone)]
struct PriorityNode {
    parent: StreamId,
    weight: u8,
    children: Vec<StreamId>,
}

/// Dependency tree over every stream id the connection has ever seen
/// priority information for. Streams with no explicit PRIORITY frame stay
/// implicit children of stream 0 with the default weight (RFC 7540
/// §5.3.5).
#[derive(Debug, Default)]
pub struct PriorityTree {
    nodes: DashMap<StreamId, PriorityNode>,
}

impl PriorityTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a (re)parenting instruction for `stream_id`, per RFC 7540
    /// §5.3.1-§5.3.3. Rejects a stream declaring itself its own parent.
    pub fn reprioritize(
        &self,
        stream_id: StreamId,
        parent: StreamId,
        exclusive: bool,
        weight: u8,
    ) -> Result<(), Error> {
        if parent == stream_id {
            return Err(Error::stream(
                stream_id,
                ErrorCode::ProtocolError,
                "stream cannot depend on itself",
            ));
        }

        self.detach(stream_id);

        if exclusive {
            // All of parent's existing children become children of
            // stream_id instead (RFC 7540 §5.3.3).
            let previous_children: Vec<StreamId> = self
                .nodes
                .get(&parent)
                .map(|n| n.children.clone())
                .unwrap_or_default();
            for child in &previous_children {
                if *child != stream_id {
                    if let Some(mut child_node) = self.nodes.get_mut(child) {
                        child_node.parent = stream_id;
                    }
                }
            }
            self.nodes.entry(stream_id).or_insert_with(|| PriorityNode {
                parent,
                weight,
                children: Vec::new(),
            });
            if let Some(mut node) = self.nodes.get_mut(&stream_id) {
                node.parent = parent;
                node.weight = weight;
                node.children.extend(
                    previous_children
                        .into_iter()
                        .filter(|c| *c != stream_id),
                );
            }
        } else {
            self.nodes.insert(
                stream_id,
                PriorityNode {
                    parent,
                    weight,
                    children: Vec::new(),
                },
            );
        }

        self.nodes
            .entry(parent)
            .or_insert_with(|| PriorityNode {
                parent: 0,
                weight: DEFAULT_WEIGHT,
                children: Vec::new(),
            })
            .children
            .push(stream_id);

        Ok(())
    }

    fn detach(&self, stream_id: StreamId) {
        if let Some(node) = self.nodes.get(&stream_id) {
            let old_parent = node.parent;
            drop(node);
            if let Some(mut parent_node) = self.nodes.get_mut(&old_parent) {
                parent_node.children.retain(|c| *c != stream_id);
            }
        }
    }

    #[must_use]
    pub fn weight(&self, stream_id: StreamId) -> u8 {
        self.nodes
            .get(&stream_id)
            .map_or(DEFAULT_WEIGHT, |n| n.weight)
    }

    #[must_use]
    pub fn parent(&self, stream_id: StreamId) -> StreamId {
        self.nodes.get(&stream_id).map_or(0, |n| n.parent)
    }

    pub fn remove(&self, stream_id: StreamId) {
        self.detach(stream_id);
        self.nodes.remove(&stream_id);
    }

    /// Whether `stream_id` sits behind an ancestor that itself has sendable
    /// data right now — RFC 7540 §5.3's "parent blocks children": a stream
    /// competes for bandwidth only once every ancestor up to the root is
    /// unable to use its own share. `is_ready` reports whether a given
    /// stream id currently has data queued for the writer. Bounded walk
    /// guards against a cycle that could only arise from a bug elsewhere,
    /// since `reprioritize` itself never introduces one.
    #[must_use]
    pub fn is_blocked(&self, stream_id: StreamId, is_ready: impl Fn(StreamId) -> bool) -> bool {
        let mut current = self.parent(stream_id);
        let mut steps = 0;
        while current != 0 && steps < 64 {
            if is_ready(current) {
                return true;
            }
            current = self.parent(current);
            steps += 1;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_dependency_is_rejected() {
        let tree = PriorityTree::new();
        let err = tree.reprioritize(5, 5, false, 16).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }

    #[test]
    fn unset_stream_has_default_weight_and_root_parent() {
        let tree = PriorityTree::new();
        assert_eq!(tree.weight(7), DEFAULT_WEIGHT);
        assert_eq!(tree.parent(7), 0);
    }

    #[test]
    fn exclusive_reprioritization_takes_over_siblings() {
        let tree = PriorityTree::new();
        tree.reprioritize(3, 0, false, 16).unwrap();
        tree.reprioritize(5, 0, false, 16).unwrap();
        tree.reprioritize(7, 0, true, 16).unwrap();
        assert_eq!(tree.parent(3), 7);
        assert_eq!(tree.parent(5), 7);
    }

    #[test]
    fn reparenting_updates_weight() {
        let tree = PriorityTree::new();
        tree.reprioritize(3, 0, false, 16).unwrap();
        tree.reprioritize(3, 0, false, 200).unwrap();
        assert_eq!(tree.weight(3), 200);
    }

    #[test]
    fn child_is_blocked_while_parent_has_sendable_data() {
        let tree = PriorityTree::new();
        tree.reprioritize(3, 0, false, 16).unwrap();
        tree.reprioritize(5, 3, false, 16).unwrap();
        assert!(tree.is_blocked(5, |id| id == 3));
        assert!(!tree.is_blocked(5, |_| false));
    }

    #[test]
    fn stream_parented_directly_on_root_is_never_blocked_by_root() {
        let tree = PriorityTree::new();
        tree.reprioritize(3, 0, false, 16).unwrap();
        assert!(!tree.is_blocked(3, |_| true));
    }
}
