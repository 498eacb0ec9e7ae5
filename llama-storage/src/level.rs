//! C4: the ordered collection of immutable levels (snapshots), plus the
//! `Level` type itself. A level owns one out-edge CSR (vertex table + edge
//! table) and, once reverse edges are built, one in-edge CSR and an optional
//! edge-id translation map.
//!
//! Continuation records are realized here as a per-level side table
//! (`Level::continuations`) rather than literal VT-shaped records spliced
//! into the edge table: a node's vertex-table entry already carries, by the
//! COW inheritance invariant, the edge id of the nearest ancestor level at
//! which it last contributed edges, so all a continuation needs to record is
//! "what was that value one contribution further back" — a plain node-keyed
//! map does this without forcing the edge table to hold two incompatible
//! entry shapes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use llama_api::{EdgeId, LevelId, NodeId, MAX_LEVEL, NIL_EDGE};

use crate::error::{Error, Result};
use crate::et::EtArray;
use crate::page::PageManager;
use crate::vt::{PagedVt, VtArray, VtEntry};

/// Bidirectional mapping between an out-edge id and its corresponding
/// in-edge id at the same level, enabling O(1) reverse lookup.
pub struct Translation {
    out_to_in: Vec<AtomicI64>,
    in_to_out: Vec<AtomicI64>,
}

impl Translation {
    pub fn new(out_capacity: u64, in_capacity: u64) -> Self {
        Translation {
            out_to_in: (0..out_capacity).map(|_| AtomicI64::new(NIL_EDGE)).collect(),
            in_to_out: (0..in_capacity).map(|_| AtomicI64::new(NIL_EDGE)).collect(),
        }
    }

    pub fn set_out_to_in(&self, out_index: u64, in_edge: EdgeId) {
        self.out_to_in[out_index as usize].store(in_edge, Ordering::SeqCst);
    }

    pub fn set_in_to_out(&self, in_index: u64, out_edge: EdgeId) {
        self.in_to_out[in_index as usize].store(out_edge, Ordering::SeqCst);
    }

    pub fn out_to_in(&self, out_index: u64) -> EdgeId {
        self.out_to_in[out_index as usize].load(Ordering::SeqCst)
    }

    pub fn in_to_out(&self, in_index: u64) -> EdgeId {
        self.in_to_out[in_index as usize].load(Ordering::SeqCst)
    }
}

pub struct Level {
    pub id: LevelId,
    pub max_nodes: usize,
    pub out_vt: VtArray,
    pub out_et: EtArray,
    pub in_vt: RwLock<Option<VtArray>>,
    pub in_et: RwLock<Option<EtArray>>,
    pub translation: RwLock<Option<Translation>>,
    out_continuations: RwLock<HashMap<NodeId, EdgeId>>,
    in_continuations: RwLock<HashMap<NodeId, EdgeId>>,
}

impl Level {
    pub fn new(id: LevelId, max_nodes: usize, out_vt: VtArray, out_et: EtArray) -> Self {
        Level {
            id,
            max_nodes,
            out_vt,
            out_et,
            in_vt: RwLock::new(None),
            in_et: RwLock::new(None),
            translation: RwLock::new(None),
            out_continuations: RwLock::new(HashMap::new()),
            in_continuations: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_continuation(&self, node: NodeId, ancestor_adj_start: EdgeId) {
        self.out_continuations.write().unwrap().insert(node, ancestor_adj_start);
    }

    pub fn continuation(&self, node: NodeId) -> Option<EdgeId> {
        self.out_continuations.read().unwrap().get(&node).copied()
    }

    pub fn set_in_continuation(&self, node: NodeId, ancestor_adj_start: EdgeId) {
        self.in_continuations.write().unwrap().insert(node, ancestor_adj_start);
    }

    pub fn in_continuation(&self, node: NodeId) -> Option<EdgeId> {
        self.in_continuations.read().unwrap().get(&node).copied()
    }

    pub fn has_reverse_edges(&self) -> bool {
        self.in_vt.read().unwrap().is_some()
    }

    /// Releases every page this level privately owns or shares back to the
    /// page manager. Must only be called once, by `set_min_level` evicting
    /// this exact level.
    fn release_pages(&self, pm: &PageManager<VtEntry>) -> Result<()> {
        release_vt_pages(&self.out_vt, pm)?;
        if let Some(in_vt) = self.in_vt.read().unwrap().as_ref() {
            release_vt_pages(in_vt, pm)?;
        }
        Ok(())
    }
}

fn release_vt_pages(vt: &VtArray, pm: &PageManager<VtEntry>) -> Result<()> {
    match vt {
        VtArray::Dense(p) | VtArray::Cow(p) => p.release_all_pages(pm),
        VtArray::Flat(_) => Ok(()),
    }
}

/// The append-only, min/max-tracked sequence of levels.
pub struct LevelCollection {
    pm: Arc<PageManager<VtEntry>>,
    levels: RwLock<Vec<Option<Arc<Level>>>>,
    min_level: AtomicU32,
    max_level_signed: AtomicI64,
}

impl LevelCollection {
    pub fn new(pm: Arc<PageManager<VtEntry>>) -> Self {
        LevelCollection {
            pm,
            levels: RwLock::new(Vec::new()),
            min_level: AtomicU32::new(0),
            max_level_signed: AtomicI64::new(-1),
        }
    }

    pub fn page_manager(&self) -> Arc<PageManager<VtEntry>> {
        self.pm.clone()
    }

    pub fn next_level_id(&self) -> LevelId {
        (self.max_level_signed.load(Ordering::SeqCst) + 1) as LevelId
    }

    pub fn append(&self, level: Arc<Level>) -> Result<LevelId> {
        let id = level.id;
        if id as u64 > MAX_LEVEL as u64 {
            return Err(Error::LevelOverflow(id));
        }
        let mut levels = self.levels.write().unwrap();
        let idx = id as usize;
        while levels.len() <= idx {
            levels.push(None);
        }
        levels[idx] = Some(level);
        self.max_level_signed.store(id as i64, Ordering::SeqCst);
        Ok(id)
    }

    pub fn get(&self, id: LevelId) -> Option<Arc<Level>> {
        self.levels.read().unwrap().get(id as usize).and_then(|l| l.clone())
    }

    pub fn min_level(&self) -> LevelId {
        self.min_level.load(Ordering::SeqCst)
    }

    pub fn max_level(&self) -> Option<LevelId> {
        let v = self.max_level_signed.load(Ordering::SeqCst);
        if v < 0 {
            None
        } else {
            Some(v as LevelId)
        }
    }

    /// Structural eviction: release pages of every level in `[min_level, m)`
    /// and drop their `Arc`. Bookkeeping that must inspect those levels
    /// first (precomputed-degree maintenance, streaming-weight age-off) is
    /// the caller's responsibility and must run before this.
    pub fn set_min_level(&self, m: LevelId) -> Result<()> {
        let max = self
            .max_level()
            .ok_or(Error::InvalidMinLevel { requested: m, max_level: 0 })?;
        if m > max {
            return Err(Error::InvalidMinLevel { requested: m, max_level: max });
        }
        let old_min = self.min_level.load(Ordering::SeqCst);
        for l in old_min..m {
            if let Some(level) = self.get(l) {
                level.release_pages(&self.pm)?;
            }
            self.levels.write().unwrap()[l as usize] = None;
        }
        self.min_level.store(m, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::et::EtArray;

    fn make_level(id: LevelId, pm: Arc<PageManager<VtEntry>>, prev: Option<&Level>, nodes: usize) -> Arc<Level> {
        let vt = match prev {
            None => VtArray::Dense(PagedVt::new_dense(pm, 4, nodes).unwrap()),
            Some(p) => {
                let VtArray::Dense(paged) | VtArray::Cow(paged) = &p.out_vt else {
                    panic!("expected paged vt")
                };
                VtArray::Cow(PagedVt::new_cow_from(pm, 4, nodes, paged).unwrap())
            }
        };
        Arc::new(Level::new(id, nodes, vt, EtArray::new(16)))
    }

    #[test]
    fn append_and_lookup() {
        let pm = Arc::new(PageManager::<VtEntry>::new(4));
        let levels = LevelCollection::new(pm.clone());
        let l0 = make_level(0, pm.clone(), None, 8);
        levels.append(l0).unwrap();
        assert_eq!(levels.max_level(), Some(0));
        assert!(levels.get(0).is_some());
        assert!(levels.get(1).is_none());
    }

    #[test]
    fn set_min_level_rejects_evicting_the_top_level() {
        let pm = Arc::new(PageManager::<VtEntry>::new(4));
        let levels = LevelCollection::new(pm.clone());
        levels.append(make_level(0, pm.clone(), None, 8)).unwrap();
        assert!(levels.set_min_level(1).is_err());
    }

    #[test]
    fn set_min_level_releases_pages() {
        let pm = Arc::new(PageManager::<VtEntry>::new(4));
        let levels = LevelCollection::new(pm.clone());
        let l0 = make_level(0, pm.clone(), None, 8);
        levels.append(l0.clone()).unwrap();
        let l1 = make_level(1, pm.clone(), Some(&l0), 8);
        levels.append(l1).unwrap();
        levels.set_min_level(1).unwrap();
        assert!(levels.get(0).is_none());
        assert_eq!(levels.min_level(), 1);
    }

    #[test]
    fn appending_past_max_level_is_rejected() {
        let pm = Arc::new(PageManager::<VtEntry>::new(4));
        let levels = LevelCollection::new(pm.clone());
        let past_max = MAX_LEVEL + 1;
        let level = make_level(past_max, pm, None, 8);
        assert!(matches!(levels.append(level), Err(Error::LevelOverflow(id)) if id == past_max));
    }
}
