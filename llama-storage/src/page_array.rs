//! Generic SW-COW page array: the machinery C2 describes for the vertex
//! table is reused as-is by the property store (C6), which shares the same
//! SW-COW machinery. `PagedArray<T>` is that shared machinery;
//! `vt::VtArray` and `property::NodeProperty` are its two callers, each
//! choosing their own element type.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use llama_api::NodeId;

use crate::error::{Error, Result};
use crate::page::{PageId, PageManager};

/// DENSE (every page exclusively owned) and COW (pages shared with the
/// previous level's array until first write) share this representation;
/// which discipline applies is a property of how the array was
/// constructed, not of its type.
pub struct PagedArray<T> {
    pm: Arc<PageManager<T>>,
    page_len: usize,
    capacity: usize,
    table: RwLock<Vec<PageId>>,
    closed: AtomicBool,
    modified_pages: AtomicUsize,
}

impl<T: Clone + Default> PagedArray<T> {
    /// DENSE: every page exclusively allocated up front.
    pub fn new_dense(pm: Arc<PageManager<T>>, page_len: usize, capacity: usize) -> Result<Self> {
        let n_pages = div_ceil(capacity, page_len);
        let mut table = Vec::with_capacity(n_pages);
        for _ in 0..n_pages {
            table.push(pm.allocate()?);
        }
        Ok(PagedArray {
            pm,
            page_len,
            capacity,
            table: RwLock::new(table),
            closed: AtomicBool::new(false),
            modified_pages: AtomicUsize::new(n_pages),
        })
    }

    /// COW: the indirection table is cloned from `previous`, acquiring a
    /// share of every inherited page; any page beyond `previous`'s capacity
    /// is filled with the shared zero page.
    pub fn new_cow_from(
        pm: Arc<PageManager<T>>,
        page_len: usize,
        capacity: usize,
        previous: &PagedArray<T>,
    ) -> Result<Self> {
        let n_pages = div_ceil(capacity, page_len);
        let prev_table = previous.table.read().unwrap();
        let mut table = Vec::with_capacity(n_pages);
        for i in 0..n_pages {
            if let Some(&pid) = prev_table.get(i) {
                pm.acquire(pid, 1)?;
                table.push(pid);
            } else {
                table.push(pm.zero_page()?);
            }
        }
        Ok(PagedArray {
            pm,
            page_len,
            capacity,
            table: RwLock::new(table),
            closed: AtomicBool::new(false),
            modified_pages: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn lookup(&self, node: NodeId) -> Result<T> {
        let idx = node as usize;
        if node < 0 || idx >= self.capacity {
            return Ok(T::default());
        }
        let (page_idx, offset) = (idx / self.page_len, idx % self.page_len);
        let pid = self.table.read().unwrap()[page_idx];
        let mapped = self.pm.read(pid)?;
        Ok(mapped.guard()[offset].clone())
    }

    /// Write through the SW-COW protocol: write in place if this page's
    /// refcount is 1, otherwise take a private copy first. The refcount
    /// check is repeated under the table lock to catch a racing writer that
    /// observed the same shared page (the "concurrent COW" two-step check,
    /// see `DESIGN.md`).
    pub fn cow_write(&self, node: NodeId, value: T) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ArrayFinalized("paged array"));
        }
        let idx = node as usize;
        if node < 0 || idx >= self.capacity {
            return Err(Error::NodeOutOfRange(node));
        }
        let (page_idx, offset) = (idx / self.page_len, idx % self.page_len);

        let optimistic_pid = self.table.read().unwrap()[page_idx];
        if self.pm.refcount(optimistic_pid)? == 1 {
            self.pm.write(optimistic_pid)?.guard()[offset] = value;
            return Ok(());
        }

        let mut table = self.table.write().unwrap();
        let current_pid = table[page_idx];
        let target_pid = if self.pm.refcount(current_pid)? == 1 {
            current_pid
        } else {
            let new_pid = self.pm.cow(current_pid)?;
            table[page_idx] = new_pid;
            self.modified_pages.fetch_add(1, Ordering::SeqCst);
            new_pid
        };
        drop(table);
        self.pm.write(target_pid)?.guard()[offset] = value;
        Ok(())
    }

    pub fn finish(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn size_bytes(&self) -> usize {
        let table_len = self.table.read().unwrap().len();
        table_len * std::mem::size_of::<PageId>()
            + self.modified_pages.load(Ordering::SeqCst) * self.page_len * std::mem::size_of::<T>()
    }

    pub fn page_id_at(&self, page_idx: usize) -> Option<PageId> {
        self.table.read().unwrap().get(page_idx).copied()
    }

    pub fn page_len(&self) -> usize {
        self.page_len
    }

    pub(crate) fn table_snapshot(&self) -> Vec<PageId> {
        self.table.read().unwrap().clone()
    }

    /// Walk the indirection table and release every page it references.
    /// Only valid once, when this array's owning level is being evicted.
    pub fn release_all_pages(&self, pm: &PageManager<T>) -> Result<()> {
        for page_id in self.table_snapshot() {
            pm.release(page_id)?;
        }
        Ok(())
    }
}

impl<T: Clone + Default + PartialEq> PagedArray<T> {
    /// Nodes whose entry in `self` differs from the corresponding entry in
    /// `previous`. Page-pointer equality is the fast path; within a page
    /// whose pointer changed, entries are compared one by one. Yields in
    /// ascending `NodeId` order (§4.2 `modified_node_iter`).
    pub fn modified_nodes(&self, previous: &PagedArray<T>) -> Result<Vec<NodeId>> {
        let page_len = self.page_len;
        let n_pages = div_ceil(self.capacity, page_len);
        let mut out = Vec::new();
        for page_idx in 0..n_pages {
            let cur_pid = self.page_id_at(page_idx);
            let prev_pid = previous.page_id_at(page_idx);
            if cur_pid == prev_pid {
                continue;
            }
            let start = page_idx * page_len;
            let end = ((page_idx + 1) * page_len).min(self.capacity);
            for node in start..end {
                let node = node as i64;
                if self.lookup(node)? != previous.lookup(node)? {
                    out.push(node);
                }
            }
        }
        Ok(out)
    }
}

fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_write_and_lookup() {
        let pm = Arc::new(PageManager::<u32>::new(4));
        let arr = PagedArray::new_dense(pm, 4, 10).unwrap();
        arr.cow_write(5, 42).unwrap();
        assert_eq!(arr.lookup(5).unwrap(), 42);
        assert_eq!(arr.lookup(6).unwrap(), 0);
    }

    #[test]
    fn cow_preserves_previous_level() {
        let pm = Arc::new(PageManager::<u32>::new(4));
        let level0 = PagedArray::new_dense(pm.clone(), 4, 8).unwrap();
        level0.cow_write(1, 11).unwrap();
        level0.finish();

        let level1 = PagedArray::new_cow_from(pm, 4, 8, &level0).unwrap();
        level1.cow_write(2, 22).unwrap();

        assert_eq!(level0.lookup(1).unwrap(), 11);
        assert_eq!(level0.lookup(2).unwrap(), 0);
        assert_eq!(level1.lookup(1).unwrap(), 11);
        assert_eq!(level1.lookup(2).unwrap(), 22);
    }

    #[test]
    fn modified_nodes_reports_only_written_entries() {
        let pm = Arc::new(PageManager::<u32>::new(4));
        let level0 = PagedArray::new_dense(pm.clone(), 4, 16).unwrap();
        level0.finish();
        let level1 = PagedArray::new_cow_from(pm, 4, 16, &level0).unwrap();
        level1.cow_write(9, 1).unwrap();
        assert_eq!(level1.modified_nodes(&level0).unwrap(), vec![9]);
    }
}
