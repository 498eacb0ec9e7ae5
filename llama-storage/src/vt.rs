//! C2: the vertex-table page array. Three usage modes share one entry shape
//! and operation contract (see the capability-tagging note in `DESIGN.md`):
//! DENSE (exclusively owned pages, used for level 0), COW (pages shared with
//! the previous level until first write), and FLAT (one contiguous buffer,
//! no sharing, minimal overhead). DENSE and COW both ride on the generic
//! [`PagedArray`] in `page_array.rs`, the same machinery the property store
//! (C6) reuses.

use std::sync::RwLock;

use llama_api::{EdgeId, NodeId, NIL_EDGE};

use crate::error::{Error, Result};
use crate::page_array::PagedArray;

/// A node's adjacency summary at one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VtEntry {
    pub adj_list_start: EdgeId,
    pub level_length: u32,
    pub degree: u32,
}

impl Default for VtEntry {
    fn default() -> Self {
        VtEntry {
            adj_list_start: NIL_EDGE,
            level_length: 0,
            degree: 0,
        }
    }
}

/// DENSE and COW both use this; the distinction lives in `VtArray`.
pub type PagedVt = PagedArray<VtEntry>;

/// FLAT: one contiguous buffer with no page-level sharing.
pub struct FlatVt {
    data: RwLock<Vec<VtEntry>>,
}

impl FlatVt {
    pub fn new(capacity: usize) -> Self {
        FlatVt {
            data: RwLock::new(vec![VtEntry::default(); capacity]),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.read().unwrap().len()
    }

    pub fn lookup(&self, node: NodeId) -> VtEntry {
        let idx = node as usize;
        let data = self.data.read().unwrap();
        if node < 0 || idx >= data.len() {
            VtEntry::default()
        } else {
            data[idx]
        }
    }

    pub fn write(&self, node: NodeId, value: VtEntry) -> Result<()> {
        let idx = node as usize;
        let mut data = self.data.write().unwrap();
        if node < 0 || idx >= data.len() {
            return Err(Error::NodeOutOfRange(node));
        }
        data[idx] = value;
        Ok(())
    }

    pub fn size_bytes(&self) -> usize {
        self.data.read().unwrap().len() * std::mem::size_of::<VtEntry>()
    }
}

/// A level's vertex table, tagged by which representation backs it.
pub enum VtArray {
    Dense(PagedVt),
    Cow(PagedVt),
    Flat(FlatVt),
}

impl VtArray {
    pub fn capacity(&self) -> usize {
        match self {
            VtArray::Dense(p) | VtArray::Cow(p) => p.capacity(),
            VtArray::Flat(f) => f.capacity(),
        }
    }

    pub fn lookup(&self, node: NodeId) -> Result<VtEntry> {
        match self {
            VtArray::Dense(p) | VtArray::Cow(p) => p.lookup(node),
            VtArray::Flat(f) => Ok(f.lookup(node)),
        }
    }

    pub fn write(&self, node: NodeId, value: VtEntry) -> Result<()> {
        match self {
            VtArray::Dense(p) | VtArray::Cow(p) => p.cow_write(node, value),
            VtArray::Flat(f) => f.write(node, value),
        }
    }

    pub fn finish(&self) {
        if let VtArray::Dense(p) | VtArray::Cow(p) = self {
            p.finish();
        }
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            VtArray::Dense(p) | VtArray::Cow(p) => p.size_bytes(),
            VtArray::Flat(f) => f.size_bytes(),
        }
    }

    /// Nodes whose entry at `self` differs from the corresponding entry at
    /// `previous`. Takes the page-pointer-equality fast path when both
    /// arrays are paged; falls back to a full comparison otherwise.
    pub fn modified_nodes(&self, previous: &VtArray) -> Result<Vec<NodeId>> {
        match (self, previous) {
            (VtArray::Dense(cur) | VtArray::Cow(cur), VtArray::Dense(prev) | VtArray::Cow(prev)) => {
                cur.modified_nodes(prev)
            }
            _ => {
                let cap = self.capacity().max(previous.capacity());
                let mut out = Vec::new();
                for node in 0..cap as i64 {
                    if self.lookup(node)? != previous.lookup(node)? {
                        out.push(node);
                    }
                }
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageManager;
    use std::sync::Arc;

    #[test]
    fn dense_write_and_lookup() {
        let pm = Arc::new(PageManager::<VtEntry>::new(4));
        let vt = PagedVt::new_dense(pm, 4, 10).unwrap();
        vt.cow_write(
            5,
            VtEntry {
                adj_list_start: 42,
                level_length: 2,
                degree: 2,
            },
        )
        .unwrap();
        assert_eq!(vt.lookup(5).unwrap().degree, 2);
        assert_eq!(vt.lookup(6).unwrap(), VtEntry::default());
    }

    #[test]
    fn cow_preserves_previous_level() {
        let pm = Arc::new(PageManager::<VtEntry>::new(4));
        let level0 = PagedVt::new_dense(pm.clone(), 4, 8).unwrap();
        level0
            .cow_write(1, VtEntry { adj_list_start: 1, level_length: 1, degree: 1 })
            .unwrap();
        level0.finish();

        let level1 = PagedVt::new_cow_from(pm, 4, 8, &level0).unwrap();
        level1
            .cow_write(2, VtEntry { adj_list_start: 2, level_length: 1, degree: 1 })
            .unwrap();

        assert_eq!(level0.lookup(1).unwrap().degree, 1);
        assert_eq!(level0.lookup(2).unwrap(), VtEntry::default());
        assert_eq!(level1.lookup(1).unwrap().degree, 1);
        assert_eq!(level1.lookup(2).unwrap().degree, 1);
    }

    #[test]
    fn modified_nodes_reports_only_written_entries() {
        let pm = Arc::new(PageManager::<VtEntry>::new(4));
        let level0 = PagedVt::new_dense(pm.clone(), 4, 16).unwrap();
        level0.finish();
        let level1 = PagedVt::new_cow_from(pm, 4, 16, &level0).unwrap();
        level1
            .cow_write(9, VtEntry { adj_list_start: 1, level_length: 1, degree: 1 })
            .unwrap();
        let arr0 = VtArray::Dense(level0);
        let arr1 = VtArray::Cow(level1);
        assert_eq!(arr1.modified_nodes(&arr0).unwrap(), vec![9]);
    }

    #[test]
    fn flat_has_no_overhead_beyond_entries() {
        let flat = FlatVt::new(100);
        assert_eq!(flat.size_bytes(), 100 * std::mem::size_of::<VtEntry>());
    }
}
