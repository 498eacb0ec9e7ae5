//! The database root object (§9 "the database value is the sole root from
//! which everything else is reachable"). Owns the MLCSR, the property
//! store, and the writable stage; wires the checkpoint engine (C8) and
//! eviction (C9) into one public surface, and implements
//! [`llama_api::GraphStore`]/[`llama_api::LevelView`] for embedders that
//! only want the read-side traversal primitives.

use std::sync::Mutex;

use llama_api::{EdgeId, GraphStore, LevelId, LevelView, LoaderConfig, NodeId, NIL_NODE};

use crate::checkpoint::run_checkpoint;
use crate::error::Result;
use crate::mlcsr::{EdgeIter, Mlcsr};
use crate::property::{PropertyId, PropertyStore, PropertyValue};
use crate::writable::WritableStage;

/// Construction-time knobs the embedder supplies; the core never reads
/// environment variables for any of these (§6, §0.3).
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Entries per vertex-table / edge-table page.
    pub page_len: usize,
    /// Hint for internal parallel regions; the reference implementation
    /// runs level construction and reverse-edge building sequentially, but
    /// the field is threaded through so a parallel-for backend has
    /// somewhere to read it from without reaching into the environment.
    pub worker_count: usize,
    pub loader: LoaderConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            page_len: 4096,
            worker_count: 1,
            loader: LoaderConfig::default(),
        }
    }
}

/// The single owning root: an MLCSR, a property store sharing its level
/// lineage, and the writable stage that buffers mutations between
/// checkpoints.
pub struct Database {
    mlcsr: Mlcsr,
    properties: PropertyStore,
    stage: WritableStage,
    config: DatabaseConfig,
    stream_weight: Option<PropertyId>,
    stream_forward: Option<PropertyId>,
    /// Out-edges from a committed level that a caller asked to delete but
    /// that haven't been rolled into a checkpoint yet; applied as a
    /// `max_visible_level` lowering at the start of the next `checkpoint()`
    /// (§4.6: deleting a frozen edge doesn't touch the writable stage's
    /// edge buffers, only its deletion counters).
    pending_frozen_deletions: Mutex<Vec<EdgeId>>,
}

impl Database {
    pub fn open(config: DatabaseConfig) -> Self {
        Database {
            mlcsr: Mlcsr::new(config.page_len),
            properties: PropertyStore::new(config.page_len),
            stage: WritableStage::new(),
            config,
            stream_weight: None,
            stream_forward: None,
            pending_frozen_deletions: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn properties(&self) -> &PropertyStore {
        &self.properties
    }

    pub fn mlcsr(&self) -> &Mlcsr {
        &self.mlcsr
    }

    /// Turns on streaming mode (§0.5 / §9's `we_supersedes` open question):
    /// registers the two edge properties weight age-off needs and records
    /// their ids so `checkpoint()`/`evict()` thread them through without the
    /// caller repeating the names everywhere. Idempotent only in the sense
    /// that calling it twice creates two more properties and returns an
    /// error on the name collision — callers should call it once at
    /// startup.
    pub fn enable_streaming(&mut self, weight_name: &str, forward_name: &str) -> Result<()> {
        let weight = self.properties.create_edge_property(weight_name)?;
        let forward = self.properties.create_edge_property(forward_name)?;
        self.stream_weight = Some(weight);
        self.stream_forward = Some(forward);
        Ok(())
    }

    pub fn is_streaming(&self) -> bool {
        self.stream_forward.is_some()
    }

    /// Buffers a new edge. In streaming mode, prefer
    /// [`Database::add_edge_superseding`] when re-adding a previously
    /// deleted edge so weight age-off can follow the forward pointer.
    pub fn add_edge(&self, source: NodeId, target: NodeId) {
        self.stage.add_edge(source, target, None);
    }

    /// Streaming re-add: `old` is the frozen edge this buffered edge will
    /// supersede once checkpointed.
    pub fn add_edge_superseding(&self, source: NodeId, target: NodeId, old: EdgeId) {
        self.stage.add_edge(source, target, Some(old));
    }

    /// Deletes one out-edge `source -> target`, whether it's still buffered
    /// or already part of a committed level. Returns `false` if no such
    /// edge is visible at the current `max_level`. Per §7, an unknown edge
    /// is a recoverable no-op, never an error.
    pub fn delete_edge(&self, source: NodeId, target: NodeId) -> bool {
        if self.stage.delete_buffered_edge(source, target) {
            return true;
        }
        let Some(max_level) = self.mlcsr.levels().max_level() else {
            return false;
        };
        for edge in self.mlcsr.iter_out(source, max_level, max_level) {
            if self.mlcsr.edge_target(edge) == Some(target) {
                self.stage.record_frozen_deletion(source);
                self.pending_frozen_deletions.lock().unwrap().push(edge);
                return true;
            }
        }
        false
    }

    /// Tombstones a node: at the next checkpoint all of its out-edges
    /// become invisible and its precomputed degree drops to zero.
    pub fn delete_node(&self, node: NodeId) {
        self.stage.tombstone_node(node);
    }

    /// Runs one checkpoint (§4.7), lowering the visibility of any out-edges
    /// `delete_edge` queued against a committed level, then freezing the
    /// writable stage into a new MLCSR level and property levels. Returns
    /// the id of the newly committed level.
    pub fn checkpoint(&self) -> Result<LevelId> {
        let next_level = self.mlcsr.levels().next_level_id();
        let pending: Vec<EdgeId> = std::mem::take(&mut *self.pending_frozen_deletions.lock().unwrap());
        for edge in pending {
            self.mlcsr.update_max_visible_level_lower_only(edge, next_level)?;
        }
        log::debug!("checkpoint: starting level {next_level}");
        let level = run_checkpoint(&self.mlcsr, &self.properties, &self.stage, &self.config.loader, self.stream_forward)?;
        log::debug!("checkpoint: committed level {level}");
        Ok(level)
    }

    /// §4.8: advances `min_level`, running streaming weight age-off when
    /// enabled.
    pub fn set_min_level(&self, m: LevelId) -> Result<()> {
        crate::eviction::advance_min_level(&self.mlcsr, &self.properties, m, self.stream_weight, self.stream_forward)
    }

    /// §4.8 `keep_only_recent_versions(k)` convenience wrapper.
    pub fn keep_only_recent_versions(&self, k: u32) -> Result<()> {
        crate::eviction::keep_only_recent_versions(&self.mlcsr, &self.properties, k)
    }

    pub fn create_node_property(&self, name: &str) -> Result<PropertyId> {
        self.properties.create_node_property(name)
    }

    pub fn create_edge_property(&self, name: &str) -> Result<PropertyId> {
        self.properties.create_edge_property(name)
    }

    pub fn set_node_property(&self, id: PropertyId, node: NodeId, value: PropertyValue) -> Result<()> {
        self.properties.with_node_property(id, |p| p.set(node, value))
    }

    pub fn node_property(&self, id: PropertyId, node: NodeId, level: LevelId) -> Result<PropertyValue> {
        self.properties.with_node_property(id, |p| p.get(node, level))
    }

    pub fn edge_property(&self, id: PropertyId, edge: EdgeId) -> Result<PropertyValue> {
        let Some((level, index)) = llama_api::unpack_edge_id(edge) else {
            return Ok(PropertyValue::Null);
        };
        self.properties.with_edge_property(id, |p| p.get(level, index))
    }
}

/// A read-only view of the graph pinned to one committed level.
pub struct DatabaseView<'a> {
    db: &'a Database,
    level: LevelId,
}

impl<'a> DatabaseView<'a> {
    pub fn level_id(&self) -> LevelId {
        self.level
    }
}

impl<'a> LevelView for DatabaseView<'a> {
    type Edges<'b>
        = EdgeIter<'a>
    where
        Self: 'b;

    fn out_edges(&self, node: NodeId) -> Self::Edges<'_> {
        self.db.mlcsr.iter_out(node, self.level, self.level)
    }

    fn in_edges(&self, node: NodeId) -> Self::Edges<'_> {
        self.db.mlcsr.iter_in(node, self.level, self.level)
    }

    fn out_degree(&self, node: NodeId) -> u32 {
        self.db.mlcsr.out_degree(node, self.level).unwrap_or(0)
    }

    fn in_degree(&self, node: NodeId) -> u32 {
        self.db.mlcsr.in_degree(node, self.level).unwrap_or(0)
    }

    fn target(&self, edge: EdgeId) -> NodeId {
        self.db.mlcsr.edge_target(edge).unwrap_or(NIL_NODE)
    }

    fn level(&self) -> LevelId {
        self.level
    }
}

impl GraphStore for Database {
    type View<'a>
        = DatabaseView<'a>
    where
        Self: 'a;

    fn view_at(&self, level: LevelId) -> Self::View<'_> {
        DatabaseView { db: self, level }
    }

    fn max_level(&self) -> LevelId {
        self.mlcsr.levels().max_level().unwrap_or(0)
    }

    fn min_level(&self) -> LevelId {
        self.mlcsr.levels().min_level()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_basic_add_checkpoint_and_view() {
        let db = Database::open(DatabaseConfig::default());
        db.add_edge(1, 2);
        db.add_edge(1, 3);
        db.add_edge(2, 3);
        let l0 = db.checkpoint().unwrap();

        let view = db.view_at(l0);
        assert_eq!(view.out_degree(1), 2);
        assert_eq!(view.out_degree(2), 1);
        let out1: Vec<_> = view.out_edges(1).collect();
        assert_eq!(out1.len(), 2);
        for e in out1 {
            assert!(matches!(view.target(e), 2 | 3));
        }
    }

    #[test]
    fn s2_delete_frozen_edge_then_checkpoint() {
        let db = Database::open(DatabaseConfig::default());
        db.add_edge(1, 2);
        db.add_edge(1, 3);
        let l0 = db.checkpoint().unwrap();

        assert!(db.delete_edge(1, 2));
        let l1 = db.checkpoint().unwrap();

        let view0 = db.view_at(l0);
        assert_eq!(view0.out_degree(1), 2);
        let view1 = db.view_at(l1);
        assert_eq!(view1.out_degree(1), 1);
        let remaining: Vec<_> = view1.out_edges(1).map(|e| view1.target(e)).collect();
        assert_eq!(remaining, vec![3]);
    }

    #[test]
    fn deleting_an_unknown_edge_is_a_recoverable_no_op() {
        let db = Database::open(DatabaseConfig::default());
        db.add_edge(1, 2);
        db.checkpoint().unwrap();
        assert!(!db.delete_edge(1, 99));
    }

    #[test]
    fn streaming_mode_threads_through_checkpoint_and_eviction() {
        let mut db = Database::open(DatabaseConfig::default());
        db.enable_streaming("stream_weight", "stream_forward").unwrap();
        let weight_id = db.properties.property_id("stream_weight").unwrap();

        db.add_edge(1, 2);
        let l0 = db.checkpoint().unwrap();
        let e0 = db.mlcsr().lookup_out_edge_id(1, l0).unwrap().unwrap();
        db.properties
            .with_edge_property(weight_id, |p| {
                let (level, idx) = llama_api::unpack_edge_id(e0).unwrap();
                p.set(e0, level, idx, PropertyValue::Int(9));
            })
            .unwrap();

        db.add_edge_superseding(1, 2, e0);
        db.checkpoint().unwrap();

        db.add_edge(1, 2);
        db.checkpoint().unwrap();
        db.set_min_level(1).unwrap();
        assert_eq!(db.mlcsr().levels().min_level(), 1);
    }

    #[test]
    fn node_and_edge_properties_round_trip() {
        let db = Database::open(DatabaseConfig::default());
        let rank = db.create_node_property("rank").unwrap();
        db.set_node_property(rank, 1, PropertyValue::Float(0.5)).unwrap();
        db.add_edge(1, 2);
        let l0 = db.checkpoint().unwrap();
        assert_eq!(db.node_property(rank, 1, l0).unwrap(), PropertyValue::Float(0.5));
    }
}
