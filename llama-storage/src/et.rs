//! C3: the flat, per-level edge table. Each slot holds a target node id and
//! a `max_visible_level` field; an edge is visible at query level `Q` iff
//! `Q < max_visible_level`. Lowering that field is the only mutation
//! permitted once the table has been finalized.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

use llama_api::{LevelId, NodeId, NIL_NODE};

use crate::error::{Error, Result};

/// Sentinel meaning "always visible"; assigned to freshly written edges.
/// Always larger than any real [`llama_api::LevelId`] a query can specify.
pub const ALWAYS_VISIBLE: LevelId = LevelId::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EtEntry {
    pub target: NodeId,
    pub max_visible_level: LevelId,
}

pub struct EtArray {
    targets: Vec<AtomicI64>,
    visibility: Vec<AtomicU32>,
    capacity: u64,
    write_index: AtomicU64,
    closed: AtomicBool,
}

impl EtArray {
    pub fn new(capacity: u64) -> Self {
        let cap = capacity as usize;
        EtArray {
            targets: (0..cap).map(|_| AtomicI64::new(NIL_NODE)).collect(),
            visibility: (0..cap).map(|_| AtomicU32::new(ALWAYS_VISIBLE)).collect(),
            capacity,
            write_index: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Reserve `count` contiguous slots and return the first index. Used by
    /// the MLCSR level-construction path to lay out a node's new edges plus
    /// its continuation record.
    pub fn reserve(&self, count: u64) -> Result<u64> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ArrayFinalized("edge table"));
        }
        let start = self.write_index.fetch_add(count, Ordering::SeqCst);
        if start + count > self.capacity {
            return Err(Error::OutOfMemory(((start + count) * 16) as usize));
        }
        Ok(start)
    }

    fn bounds_check(&self, index: u64) -> Result<usize> {
        if index >= self.capacity {
            return Err(Error::PageNotAllocated(index));
        }
        Ok(index as usize)
    }

    pub fn write_value(&self, index: u64, target: NodeId) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ArrayFinalized("edge table"));
        }
        let i = self.bounds_check(index)?;
        self.targets[i].store(target, Ordering::SeqCst);
        self.visibility[i].store(ALWAYS_VISIBLE, Ordering::SeqCst);
        Ok(())
    }

    pub fn memset_range(&self, start: u64, len: u64, target: NodeId) -> Result<()> {
        for i in start..start + len {
            self.write_value(i, target)?;
        }
        Ok(())
    }

    pub fn copy_range(&self, dst_start: u64, src: &EtArray, src_start: u64, len: u64) -> Result<()> {
        for offset in 0..len {
            let value = src.entry(src_start + offset)?;
            self.write_value(dst_start + offset, value.target)?;
            if value.max_visible_level != ALWAYS_VISIBLE {
                self.update_max_visible_level(dst_start + offset, value.max_visible_level)?;
            }
        }
        Ok(())
    }

    /// Hint only; the in-memory array has nothing to prefetch from disk.
    pub fn prefetch(&self, _start: u64, _len: u64) {
        log::trace!("prefetch hint ignored for in-memory edge table");
    }

    pub fn entry(&self, index: u64) -> Result<EtEntry> {
        let i = self.bounds_check(index)?;
        Ok(EtEntry {
            target: self.targets[i].load(Ordering::SeqCst),
            max_visible_level: self.visibility[i].load(Ordering::SeqCst),
        })
    }

    pub fn is_visible(&self, index: u64, query_level: LevelId) -> Result<bool> {
        Ok(query_level < self.entry(index)?.max_visible_level)
    }

    /// Unconditional overwrite of the visibility field.
    pub fn update_max_visible_level(&self, index: u64, level: LevelId) -> Result<()> {
        let i = self.bounds_check(index)?;
        self.visibility[i].store(level, Ordering::SeqCst);
        Ok(())
    }

    /// CAS loop: succeeds (returns `true`) iff `level` is strictly lower
    /// than the field's current value. Idempotent: calling again with the
    /// same or a higher level is a no-op returning `false`.
    pub fn update_max_visible_level_lower_only(&self, index: u64, level: LevelId) -> Result<bool> {
        let i = self.bounds_check(index)?;
        loop {
            let current = self.visibility[i].load(Ordering::Acquire);
            if level >= current {
                return Ok(false);
            }
            match self.visibility[i].compare_exchange(
                current,
                level,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(true),
                Err(_) => continue,
            }
        }
    }

    pub fn finish(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn size_bytes(&self) -> usize {
        self.targets.len() * std::mem::size_of::<i64>() + self.visibility.len() * std::mem::size_of::<u32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_write() {
        let et = EtArray::new(16);
        let start = et.reserve(3).unwrap();
        et.write_value(start, 10).unwrap();
        et.write_value(start + 1, 11).unwrap();
        assert_eq!(et.entry(start).unwrap().target, 10);
        assert_eq!(et.entry(start).unwrap().max_visible_level, ALWAYS_VISIBLE);
    }

    #[test]
    fn reserve_past_capacity_fails() {
        let et = EtArray::new(4);
        et.reserve(3).unwrap();
        assert!(et.reserve(3).is_err());
    }

    #[test]
    fn lower_only_is_monotone_and_idempotent() {
        let et = EtArray::new(4);
        et.write_value(0, 5).unwrap();
        assert!(et.update_max_visible_level_lower_only(0, 10).unwrap());
        assert!(!et.update_max_visible_level_lower_only(0, 20).unwrap());
        assert_eq!(et.entry(0).unwrap().max_visible_level, 10);
        assert!(!et.update_max_visible_level_lower_only(0, 10).unwrap());
    }

    #[test]
    fn write_after_finish_is_rejected() {
        let et = EtArray::new(4);
        et.reserve(1).unwrap();
        et.finish();
        assert!(et.write_value(0, 1).is_err());
        // lowering visibility remains legal after finish.
        assert!(et.update_max_visible_level_lower_only(0, 3).unwrap());
    }
}
