//! C1: fixed-size page allocator with reference-counted pages and a
//! per-manager free list. Pages are never returned to the OS; a released
//! page (refcount reaching zero) is recycled by a later `allocate`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};

/// Identifies a page within one [`PageManager`]. Opaque outside this module
/// except for the `u64` needed to embed it in other on-disk structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u64);

/// Inner directory size: `2^DIR_BITS` pages per outer block, matching the
/// original allocator's 256-page allocation step.
const DIR_BITS: u32 = 8;
const DIR_LEN: usize = 1 << DIR_BITS;

struct PageSlot<T> {
    data: RwLock<Vec<T>>,
    refcount: AtomicUsize,
}

/// A typed, reference-counted fixed-size page allocator.
///
/// The outer directory (`Vec<OuterBlock>`) grows by the ordinary amortized
/// doubling of `Vec::push`; it never shrinks. Freed pages go on a free list
/// and are reused in place rather than deallocated.
pub struct PageManager<T> {
    page_length: usize,
    outer: Mutex<Vec<Vec<Option<Arc<PageSlot<T>>>>>>,
    free_list: Mutex<Vec<PageId>>,
    next_id: AtomicU64,
    zero_page: Mutex<Option<PageId>>,
}

impl<T: Clone + Default> PageManager<T> {
    pub fn new(page_length: usize) -> Self {
        PageManager {
            page_length,
            outer: Mutex::new(Vec::new()),
            free_list: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            zero_page: Mutex::new(None),
        }
    }

    pub fn page_length(&self) -> usize {
        self.page_length
    }

    fn slot(&self, id: PageId) -> Result<Arc<PageSlot<T>>> {
        let (outer_idx, inner_idx) = split(id);
        let outer = self.outer.lock().unwrap();
        outer
            .get(outer_idx)
            .and_then(|block| block.get(inner_idx))
            .and_then(|slot| slot.clone())
            .ok_or(Error::PageNotAllocated(id.0))
    }

    fn insert_fresh(&self, id: PageId, slot: Arc<PageSlot<T>>) {
        let (outer_idx, inner_idx) = split(id);
        let mut outer = self.outer.lock().unwrap();
        while outer.len() <= outer_idx {
            outer.push((0..DIR_LEN).map(|_| None).collect());
            log::debug!("page manager: directory grew to {} outer blocks", outer.len());
        }
        outer[outer_idx][inner_idx] = Some(slot);
    }

    /// Allocate a fresh zero-initialized page with refcount 1.
    pub fn allocate(&self) -> Result<PageId> {
        if let Some(id) = self.free_list.lock().unwrap().pop() {
            let slot = self.slot(id)?;
            *slot.data.write().unwrap() = vec![T::default(); self.page_length];
            slot.refcount.store(1, Ordering::SeqCst);
            return Ok(id);
        }
        let id = PageId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let slot = Arc::new(PageSlot {
            data: RwLock::new(vec![T::default(); self.page_length]),
            refcount: AtomicUsize::new(1),
        });
        self.insert_fresh(id, slot);
        Ok(id)
    }

    /// The shared, all-default read-only page. Every call increments its
    /// refcount; callers must `release` it like any other page once they
    /// stop referencing it.
    pub fn zero_page(&self) -> Result<PageId> {
        let mut guard = self.zero_page.lock().unwrap();
        let id = match *guard {
            Some(id) => id,
            None => {
                let id = self.allocate()?;
                *guard = Some(id);
                id
            }
        };
        self.acquire(id, 1)?;
        Ok(id)
    }

    pub fn acquire(&self, id: PageId, count: usize) -> Result<usize> {
        let slot = self.slot(id)?;
        Ok(slot.refcount.fetch_add(count, Ordering::SeqCst) + count)
    }

    /// Decrement the refcount; if it reaches zero the page is returned to
    /// the free list.
    pub fn release(&self, id: PageId) -> Result<usize> {
        let slot = self.slot(id)?;
        let previous = slot.refcount.fetch_sub(1, Ordering::SeqCst);
        let new_count = previous - 1;
        if new_count == 0 {
            self.free_list.lock().unwrap().push(id);
        }
        Ok(new_count)
    }

    pub fn refcount(&self, id: PageId) -> Result<usize> {
        Ok(self.slot(id)?.refcount.load(Ordering::SeqCst))
    }

    /// Allocate a new page, copy `src`'s contents into it, and release
    /// `src`. Used when a shared page must be privately mutated.
    pub fn cow(&self, src: PageId) -> Result<PageId> {
        let src_slot = self.slot(src)?;
        let copy = src_slot.data.read().unwrap().clone();
        let new_id = self.allocate()?;
        let new_slot = self.slot(new_id)?;
        *new_slot.data.write().unwrap() = copy;
        self.release(src)?;
        Ok(new_id)
    }

    pub fn read(&self, id: PageId) -> Result<MappedRead<T>> {
        let slot = self.slot(id)?;
        Ok(MappedRead { slot })
    }

    /// Caller must ensure the page's refcount is 1 before writing; the page
    /// manager does not enforce this (the SW-COW protocol in `vt` does).
    pub fn write(&self, id: PageId) -> Result<MappedWrite<T>> {
        let slot = self.slot(id)?;
        Ok(MappedWrite { slot })
    }

    /// Sum of live refcounts plus the free-list length; used by the
    /// conservation property test.
    pub fn accounting(&self) -> (u64, usize) {
        let outer = self.outer.lock().unwrap();
        let mut live = 0u64;
        for block in outer.iter() {
            for slot in block.iter().flatten() {
                live += slot.refcount.load(Ordering::SeqCst) as u64;
            }
        }
        (live, self.free_list.lock().unwrap().len())
    }

    pub fn pages_ever_allocated(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }
}

fn split(id: PageId) -> (usize, usize) {
    let v = id.0 as usize;
    (v >> DIR_BITS, v & (DIR_LEN - 1))
}

/// A short-lived read handle into a page; the page cannot be recycled while
/// this is held because it holds the slot's `Arc`, not just its id.
pub struct MappedRead<T> {
    slot: Arc<PageSlot<T>>,
}

impl<T> MappedRead<T> {
    pub fn guard(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.slot.data.read().unwrap()
    }
}

pub struct MappedWrite<T> {
    slot: Arc<PageSlot<T>>,
}

impl<T> MappedWrite<T> {
    pub fn guard(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        self.slot.data.write().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_read_write_roundtrip() {
        let pm: PageManager<u32> = PageManager::new(16);
        let id = pm.allocate().unwrap();
        {
            let w = pm.write(id).unwrap();
            w.guard()[3] = 99;
        }
        let r = pm.read(id).unwrap();
        assert_eq!(r.guard()[3], 99);
    }

    #[test]
    fn release_to_zero_recycles_via_free_list() {
        let pm: PageManager<u32> = PageManager::new(4);
        let id = pm.allocate().unwrap();
        assert_eq!(pm.release(id).unwrap(), 0);
        let id2 = pm.allocate().unwrap();
        assert_eq!(id, id2);
        assert_eq!(pm.refcount(id2).unwrap(), 1);
    }

    #[test]
    fn cow_produces_independent_page() {
        let pm: PageManager<u32> = PageManager::new(4);
        let id = pm.allocate().unwrap();
        pm.write(id).unwrap().guard()[0] = 7;
        pm.acquire(id, 1).unwrap(); // simulate a second owner (level B)
        let cowed = pm.cow(id).unwrap();
        assert_ne!(cowed, id);
        assert_eq!(pm.read(cowed).unwrap().guard()[0], 7);
        pm.write(cowed).unwrap().guard()[0] = 8;
        assert_eq!(pm.read(id).unwrap().guard()[0], 7);
        // cow released one reference to `id`; the second owner keeps it alive.
        assert_eq!(pm.refcount(id).unwrap(), 1);
    }

    #[test]
    fn conservation_holds_across_allocate_release() {
        let pm: PageManager<u32> = PageManager::new(4);
        let a = pm.allocate().unwrap();
        let _b = pm.allocate().unwrap();
        pm.acquire(a, 2).unwrap();
        pm.release(a).unwrap();
        let (live, free) = pm.accounting();
        assert_eq!(live + free as u64, pm.pages_ever_allocated());
    }
}
