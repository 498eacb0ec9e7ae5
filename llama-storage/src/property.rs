//! C6: typed node and edge properties that share the MLCSR's snapshot
//! lineage. Node properties reuse the SW-COW [`PagedArray`] machinery
//! (`page_array.rs`) that backs the vertex table; edge properties are one
//! flat array per edge level, indexed the same way the edge table itself
//! is.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use llama_api::{EdgeId, LevelId, NodeId, NIL_EDGE};

use crate::error::{Error, Result};
use crate::page::PageManager;
use crate::page_array::PagedArray;

/// A property payload. Deliberately a small closed set rather than a
/// generic type parameter: §1 excludes "general-purpose property indexing"
/// and the checkpoint/eviction machinery (stream weights, forward
/// pointers) only ever needs identifiers and numbers, so one value enum
/// keeps the property store free of monomorphized duplicates per caller
/// type.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
}

impl Default for PropertyValue {
    fn default() -> Self {
        PropertyValue::Null
    }
}

impl PropertyValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_edge_id(&self) -> EdgeId {
        self.as_int().unwrap_or(NIL_EDGE)
    }
}

/// A dense, compile-time-bounded identifier for a registered property.
pub type PropertyId = u32;

/// Upper bound on live properties per store: a small fixed-capacity table
/// rather than unbounded growth.
pub const MAX_PROPERTIES: u32 = 256;

/// Per-node property, following the MLCSR's level lineage. Levels `0..=L`
/// each own a [`PagedArray`]; a level with no explicit writes is filled in
/// by `ensure_min_levels` as a zero-modification COW extension of its
/// predecessor, exactly like an MLCSR level nothing wrote to.
pub struct NodeProperty {
    pm: Arc<PageManager<PropertyValue>>,
    page_len: usize,
    levels: RwLock<Vec<Option<PagedArray<PropertyValue>>>>,
    pending: RwLock<HashMap<NodeId, PropertyValue>>,
}

impl NodeProperty {
    pub fn new(pm: Arc<PageManager<PropertyValue>>, page_len: usize) -> Self {
        NodeProperty {
            pm,
            page_len,
            levels: RwLock::new(Vec::new()),
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Stage a value in the writable area; visible only after `freeze`.
    pub fn set(&self, node: NodeId, value: PropertyValue) {
        self.pending.write().unwrap().insert(node, value);
    }

    fn last_level(&self) -> Option<usize> {
        let levels = self.levels.read().unwrap();
        levels.iter().rposition(|l| l.is_some())
    }

    /// Freeze pending writes into a new property level aligned with MLCSR
    /// level `level_id`. If levels are missing in between (the property was
    /// created after the graph already had history, or `ensure_min_levels`
    /// was never called), they are backfilled as empty COW extensions first.
    pub fn freeze(&self, level_id: LevelId, max_nodes: usize) -> Result<()> {
        self.ensure_min_levels(level_id, max_nodes)?;
        let pending = std::mem::take(&mut *self.pending.write().unwrap());
        let new_array = self.new_level_array(max_nodes)?;
        for (node, value) in pending {
            new_array.cow_write(node, value)?;
        }
        new_array.finish();
        self.install(level_id, new_array);
        Ok(())
    }

    fn new_level_array(&self, max_nodes: usize) -> Result<PagedArray<PropertyValue>> {
        match self.last_level() {
            None => PagedArray::new_dense(self.pm.clone(), self.page_len, max_nodes),
            Some(prev_idx) => {
                let levels = self.levels.read().unwrap();
                let prev = levels[prev_idx].as_ref().expect("checked Some above");
                PagedArray::new_cow_from(self.pm.clone(), self.page_len, max_nodes, prev)
            }
        }
    }

    fn install(&self, level_id: LevelId, array: PagedArray<PropertyValue>) {
        let mut levels = self.levels.write().unwrap();
        let idx = level_id as usize;
        while levels.len() <= idx {
            levels.push(None);
        }
        levels[idx] = Some(array);
    }

    /// Backfill any MLCSR levels this property has no entry for yet, up to
    /// (but not including) `up_to_level`, as empty COW extensions — the
    /// property-store analogue of a level nobody wrote to.
    pub fn ensure_min_levels(&self, up_to_level: LevelId, max_nodes: usize) -> Result<()> {
        let have = self.levels.read().unwrap().len() as LevelId;
        for missing in have..up_to_level {
            let array = self.new_level_array(max_nodes)?;
            array.finish();
            self.install(missing, array);
        }
        Ok(())
    }

    pub fn get(&self, node: NodeId, level_id: LevelId) -> PropertyValue {
        let levels = self.levels.read().unwrap();
        match levels.get(level_id as usize).and_then(|l| l.as_ref()) {
            Some(arr) => arr.lookup(node).unwrap_or_default(),
            None => PropertyValue::Null,
        }
    }

    /// Release an evicted level's pages and drop it from the lineage.
    pub fn delete_level(&self, level_id: LevelId) -> Result<()> {
        let mut levels = self.levels.write().unwrap();
        if let Some(slot) = levels.get_mut(level_id as usize) {
            if let Some(arr) = slot.take() {
                arr.release_all_pages(&self.pm)?;
            }
        }
        Ok(())
    }
}

/// Per-edge-level flat property array, indexed exactly like that level's
/// edge table.
pub struct EdgeProperty {
    levels: RwLock<HashMap<LevelId, RwLock<Vec<PropertyValue>>>>,
}

impl EdgeProperty {
    pub fn new() -> Self {
        EdgeProperty { levels: RwLock::new(HashMap::new()) }
    }

    /// Dense-initialize this property's slot for a freshly created edge
    /// level, running `init` once per reserved index so writes during level
    /// construction go through the same dense-write path as the edges
    /// themselves (§4.5).
    pub fn init_level<F>(&self, level_id: LevelId, capacity: u64, mut init: F)
    where
        F: FnMut(u64) -> PropertyValue,
    {
        let values = (0..capacity).map(&mut init).collect();
        self.levels.write().unwrap().insert(level_id, RwLock::new(values));
    }

    pub fn set(&self, edge: EdgeId, level_id: LevelId, index: u64, value: PropertyValue) {
        let _ = edge;
        if let Some(level) = self.levels.read().unwrap().get(&level_id) {
            let mut guard = level.write().unwrap();
            if let Some(slot) = guard.get_mut(index as usize) {
                *slot = value;
            }
        }
    }

    pub fn get(&self, level_id: LevelId, index: u64) -> PropertyValue {
        self.levels
            .read()
            .unwrap()
            .get(&level_id)
            .and_then(|level| level.read().unwrap().get(index as usize).cloned())
            .unwrap_or_default()
    }

    pub fn delete_level(&self, level_id: LevelId) {
        self.levels.write().unwrap().remove(&level_id);
    }
}

impl Default for EdgeProperty {
    fn default() -> Self {
        Self::new()
    }
}

enum PropertySlot {
    Node(NodeProperty),
    Edge(EdgeProperty),
}

/// The registry of named properties, bounded to [`MAX_PROPERTIES`] live
/// entries. Name lookup is guarded on insert; once a property exists its
/// slot is never moved, so readers never contend with writers on the map.
pub struct PropertyStore {
    pm: Arc<PageManager<PropertyValue>>,
    page_len: usize,
    by_name: RwLock<HashMap<String, PropertyId>>,
    slots: RwLock<Vec<PropertySlot>>,
}

impl PropertyStore {
    pub fn new(page_len: usize) -> Self {
        PropertyStore {
            pm: Arc::new(PageManager::new(page_len)),
            page_len,
            by_name: RwLock::new(HashMap::new()),
            slots: RwLock::new(Vec::new()),
        }
    }

    fn register(&self, name: &str, slot: PropertySlot) -> Result<PropertyId> {
        let mut by_name = self.by_name.write().unwrap();
        if by_name.contains_key(name) {
            return Err(Error::DuplicateProperty(name.to_string()));
        }
        let mut slots = self.slots.write().unwrap();
        if slots.len() as u32 >= MAX_PROPERTIES {
            return Err(Error::UnsupportedConfig("property store is at capacity"));
        }
        let id = slots.len() as PropertyId;
        slots.push(slot);
        by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn create_node_property(&self, name: &str) -> Result<PropertyId> {
        self.register(name, PropertySlot::Node(NodeProperty::new(self.pm.clone(), self.page_len)))
    }

    pub fn create_edge_property(&self, name: &str) -> Result<PropertyId> {
        self.register(name, PropertySlot::Edge(EdgeProperty::new()))
    }

    pub fn property_id(&self, name: &str) -> Result<PropertyId> {
        self.by_name
            .read()
            .unwrap()
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownProperty(name.to_string()))
    }

    pub fn with_node_property<R>(&self, id: PropertyId, f: impl FnOnce(&NodeProperty) -> R) -> Result<R> {
        let slots = self.slots.read().unwrap();
        match slots.get(id as usize) {
            Some(PropertySlot::Node(p)) => Ok(f(p)),
            Some(PropertySlot::Edge(_)) => Err(Error::UnsupportedConfig("property is an edge property, not a node property")),
            None => Err(Error::UnknownProperty(format!("property id {id}"))),
        }
    }

    pub fn with_edge_property<R>(&self, id: PropertyId, f: impl FnOnce(&EdgeProperty) -> R) -> Result<R> {
        let slots = self.slots.read().unwrap();
        match slots.get(id as usize) {
            Some(PropertySlot::Edge(p)) => Ok(f(p)),
            Some(PropertySlot::Node(_)) => Err(Error::UnsupportedConfig("property is a node property, not an edge property")),
            None => Err(Error::UnknownProperty(format!("property id {id}"))),
        }
    }

    /// Gives every registered edge property a dense, Null-filled slot for a
    /// freshly created edge level (§4.7 step 5), so later writes during
    /// that level's construction land through the normal `set` path rather
    /// than silently no-oping against a level that doesn't exist yet.
    pub fn init_edge_level(&self, level_id: LevelId, capacity: u64) {
        let slots = self.slots.read().unwrap();
        for slot in slots.iter() {
            if let PropertySlot::Edge(p) = slot {
                p.init_level(level_id, capacity, |_| PropertyValue::Null);
            }
        }
    }

    /// Freezes every node property's writable slot at `level_id` (§4.7
    /// step 9), run once per checkpoint after the MLCSR level itself is
    /// committed.
    pub fn freeze_node_properties(&self, level_id: LevelId, max_nodes: usize) -> Result<()> {
        let slots = self.slots.read().unwrap();
        for slot in slots.iter() {
            if let PropertySlot::Node(p) = slot {
                p.freeze(level_id, max_nodes)?;
            }
        }
        Ok(())
    }

    /// Every registered property is told to drop its `level_id` slot; run
    /// by the eviction engine (§4.8) right before the level's pages are
    /// released.
    pub fn delete_level(&self, level_id: LevelId) -> Result<()> {
        let slots = self.slots.read().unwrap();
        for slot in slots.iter() {
            match slot {
                PropertySlot::Node(p) => p.delete_level(level_id)?,
                PropertySlot::Edge(p) => p.delete_level(level_id),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_property_freezes_and_reads_back() {
        let store = PropertyStore::new(4);
        let id = store.create_node_property("rank").unwrap();
        store
            .with_node_property(id, |p| {
                p.set(3, PropertyValue::Float(0.42));
                p.freeze(0, 16)
            })
            .unwrap()
            .unwrap();
        let value = store.with_node_property(id, |p| p.get(3, 0)).unwrap();
        assert_eq!(value, PropertyValue::Float(0.42));
    }

    #[test]
    fn node_property_inherits_across_levels() {
        let store = PropertyStore::new(4);
        let id = store.create_node_property("rank").unwrap();
        store
            .with_node_property(id, |p| {
                p.set(1, PropertyValue::Int(7));
                p.freeze(0, 8)
            })
            .unwrap()
            .unwrap();
        store.with_node_property(id, |p| p.freeze(1, 8)).unwrap().unwrap();
        let value = store.with_node_property(id, |p| p.get(1, 1)).unwrap();
        assert_eq!(value, PropertyValue::Int(7));
    }

    #[test]
    fn duplicate_property_name_rejected() {
        let store = PropertyStore::new(4);
        store.create_node_property("x").unwrap();
        assert!(store.create_node_property("x").is_err());
    }

    #[test]
    fn edge_property_dense_init_and_set() {
        let prop = EdgeProperty::new();
        prop.init_level(0, 4, |_| PropertyValue::Int(1));
        assert_eq!(prop.get(0, 2), PropertyValue::Int(1));
        prop.set(0, 0, 2, PropertyValue::Int(99));
        assert_eq!(prop.get(0, 2), PropertyValue::Int(99));
    }

    #[test]
    fn unknown_property_id_is_recoverable() {
        let store = PropertyStore::new(4);
        assert!(store.with_node_property(99, |_| ()).is_err());
    }
}
