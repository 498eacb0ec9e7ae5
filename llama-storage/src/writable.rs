//! C7: the writable staging area. Buffers node/edge additions and
//! deletions between checkpoints; never touches an existing immutable
//! level. Shaped like a log-structured memtable: per-node buffers,
//! tombstone sets, and a `freeze`-style consuming drain, keyed by the
//! packed [`NodeId`]/[`EdgeId`] identifiers this engine uses.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, RwLock};

use llama_api::{EdgeId, NodeId, NIL_NODE};

/// A buffered, not-yet-frozen edge. Streaming mode (§0.5) sets
/// `supersedes` to the frozen edge this one replaces, letting the
/// checkpoint engine thread a forward pointer for weight age-off.
#[derive(Debug, Clone)]
pub struct WritableEdge {
    pub target: NodeId,
    pub tombstone: bool,
    pub supersedes: Option<EdgeId>,
}

#[derive(Debug, Default)]
struct WritableNode {
    out_edges: Vec<WritableEdge>,
    pending_deletions: u32,
    tombstone: bool,
}

/// A consuming snapshot of one node's pending writes, handed to the
/// checkpoint engine by [`WritableStage::drain`].
pub struct WritableNodeDelta {
    pub out_edges: Vec<WritableEdge>,
    pub deleted_count: u32,
    pub tombstone: bool,
}

/// The process-wide (per-database) writable vertex table: a sparse map
/// keyed by `NodeId`, each entry guarded by its own lock so unrelated
/// nodes never contend (the "per-node spinlock" of §4.6, realized here as
/// a `Mutex` since the engine exposes no suspension points to make a true
/// spinlock worth the busy-wait).
#[derive(Default)]
pub struct WritableStage {
    nodes: RwLock<BTreeMap<NodeId, Mutex<WritableNode>>>,
    max_node_seen: AtomicI64,
}

impl WritableStage {
    pub fn new() -> Self {
        WritableStage {
            nodes: RwLock::new(BTreeMap::new()),
            max_node_seen: AtomicI64::new(NIL_NODE),
        }
    }

    fn touch(&self, node: NodeId) {
        self.max_node_seen.fetch_max(node, Ordering::SeqCst);
        if self.nodes.read().unwrap().contains_key(&node) {
            return;
        }
        self.nodes.write().unwrap().entry(node).or_default();
    }

    /// Largest node id any call has named, or [`NIL_NODE`] if none yet.
    /// The checkpoint engine derives `max_nodes` from this (§4.7 step 2).
    pub fn max_node_seen(&self) -> NodeId {
        self.max_node_seen.load(Ordering::SeqCst)
    }

    pub fn add_edge(&self, source: NodeId, target: NodeId, supersedes: Option<EdgeId>) {
        self.touch(source);
        self.touch(target);
        let nodes = self.nodes.read().unwrap();
        let mut entry = nodes[&source].lock().unwrap();
        entry.out_edges.push(WritableEdge { target, tombstone: false, supersedes });
    }

    /// Marks the most recently added, not-yet-tombstoned buffered edge to
    /// `target` as deleted. Frozen edges (already in a committed level) are
    /// deleted by lowering `max_visible_level` directly on the MLCSR, not
    /// through this path. Does not touch `pending_deletions`: that counter
    /// feeds `deleted_frozen_out` (§4.7 step 3), and a buffered edge that
    /// never reached a frozen level was never counted in a prior level's
    /// degree in the first place — `drain` simply omits it from
    /// `out_edges`, which is enough for the checkpoint engine to see it gone.
    pub fn delete_buffered_edge(&self, source: NodeId, target: NodeId) -> bool {
        let nodes = self.nodes.read().unwrap();
        let Some(node) = nodes.get(&source) else { return false };
        let mut entry = node.lock().unwrap();
        if let Some(edge) = entry.out_edges.iter_mut().rev().find(|e| e.target == target && !e.tombstone) {
            edge.tombstone = true;
            true
        } else {
            false
        }
    }

    /// Marks a previously frozen out-edge as deleted at this checkpoint;
    /// the checkpoint engine still needs to know the count to compute
    /// `deleted_frozen_out` (§4.7 step 3) even though the edge itself lives
    /// in a committed level and is handled via `max_visible_level` lowering.
    pub fn record_frozen_deletion(&self, source: NodeId) {
        self.touch(source);
        let nodes = self.nodes.read().unwrap();
        nodes[&source].lock().unwrap().pending_deletions += 1;
    }

    pub fn tombstone_node(&self, node: NodeId) {
        self.touch(node);
        let nodes = self.nodes.read().unwrap();
        nodes[&node].lock().unwrap().tombstone = true;
    }

    /// Consumes all buffered writes, handing one delta per touched node in
    /// ascending `NodeId` order (matching the checkpoint engine's
    /// sequential per-node sweep). Leaves the stage empty for the next
    /// ingestion batch.
    pub fn drain(&self) -> BTreeMap<NodeId, WritableNodeDelta> {
        let mut nodes = self.nodes.write().unwrap();
        let taken = std::mem::take(&mut *nodes);
        taken
            .into_iter()
            .map(|(node, lock)| {
                let inner = lock.into_inner().unwrap();
                let out_edges: Vec<_> = inner.out_edges.into_iter().filter(|e| !e.tombstone).collect();
                (
                    node,
                    WritableNodeDelta {
                        out_edges,
                        deleted_count: inner.pending_deletions,
                        tombstone: inner.tombstone,
                    },
                )
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_delete_drops_the_edge_from_the_delta() {
        let stage = WritableStage::new();
        stage.add_edge(1, 2, None);
        stage.add_edge(1, 3, None);
        assert!(stage.delete_buffered_edge(1, 2));
        let delta = stage.drain();
        let node1 = &delta[&1];
        assert_eq!(node1.out_edges.len(), 1);
        assert_eq!(node1.out_edges[0].target, 3);
        // deleting a still-buffered edge is not a frozen-edge deletion: it
        // never reached a committed level, so it must not count toward
        // `deleted_frozen_out` (it's already gone from `out_edges` above).
        assert_eq!(node1.deleted_count, 0);
    }

    #[test]
    fn record_frozen_deletion_still_increments_the_counter() {
        let stage = WritableStage::new();
        stage.add_edge(1, 2, None);
        stage.record_frozen_deletion(1);
        let delta = stage.drain();
        assert_eq!(delta[&1].deleted_count, 1);
    }

    #[test]
    fn drain_empties_the_stage() {
        let stage = WritableStage::new();
        stage.add_edge(1, 2, None);
        let _ = stage.drain();
        assert!(stage.is_empty());
        assert_eq!(stage.max_node_seen(), 2);
    }

    #[test]
    fn tombstoned_node_is_reported_in_its_delta() {
        let stage = WritableStage::new();
        stage.tombstone_node(5);
        let delta = stage.drain();
        assert!(delta[&5].tombstone);
    }

    #[test]
    fn deleting_an_absent_edge_is_a_no_op() {
        let stage = WritableStage::new();
        stage.add_edge(1, 2, None);
        assert!(!stage.delete_buffered_edge(1, 9));
    }
}
