//! C10: the persistence interface. The core treats durable storage as an
//! opaque collaborator (§4.9); this module defines that contract as a trait
//! plus the in-memory implementation the rest of the crate tests against.
//! No on-disk layout is normative here — an embedder wanting durability
//! implements [`PersistenceBackend`] as its own page store, using the
//! level/chunk/header vocabulary this module's types already name, without
//! this crate mandating a file layout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use llama_api::LevelId;

use crate::error::{Error, Result};

/// Where, within one context, a level's header/indirection-table/body start.
/// Offsets are opaque to the core; only the persistence backend interprets
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelHandle {
    pub level: LevelId,
    pub header_offset: u64,
    pub vt_offset: u64,
    pub body_offset: u64,
}

/// A bulk allocation within one level, returned by `allocate_chunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHandle {
    pub id: u64,
    pub level: LevelId,
    pub offset: u64,
    pub len: u64,
}

/// A mapped view of one chunk. Real backends would hand out an `mmap`
/// pointer here; since the on-disk format isn't normative, this crate's
/// implementation hands out a guarded in-memory buffer with the same
/// writable-then-one-way-finalized lifecycle `mmap_chunk`/`finalize_chunk`
/// describe.
pub struct MappedChunk {
    data: Arc<Mutex<Vec<u8>>>,
    writable: bool,
}

impl MappedChunk {
    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn read(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    /// Overwrite this chunk's contents. Fails if the chunk is not writable
    /// (already finalized).
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::ArrayFinalized("persistence chunk"));
        }
        *self.data.lock().unwrap() = bytes.to_vec();
        Ok(())
    }
}

/// One opened persistence context: a namespace + name pair, transactional
/// at the level granularity (§4.9: a level's allocation, body writes, and
/// header finalization either all become visible together or none does).
pub trait PersistenceContext: Send + Sync {
    fn allocate_level(
        &self,
        level: LevelId,
        header_size: u64,
        vt_size: u64,
        vt_partitions: u32,
    ) -> Result<LevelHandle>;

    fn allocate_chunk(&self, level: LevelId, bytes: u64) -> Result<ChunkHandle>;

    fn read_header(&self) -> Result<Vec<u8>>;
    fn write_header(&self, bytes: &[u8]) -> Result<()>;

    fn mmap_chunk(&self, handle: &ChunkHandle, writable: bool) -> Result<MappedChunk>;

    /// One-way transition from writable to read-only; may shrink the chunk
    /// to `final_bytes`. Calling this twice on the same handle is an
    /// invariant violation (fatal, per §7).
    fn finalize_chunk(&self, handle: &ChunkHandle, final_bytes: u64) -> Result<()>;

    /// Durability fence for everything allocated under `level` so far.
    fn sync(&self, level: LevelId) -> Result<()>;
}

/// Opens (idempotently) named contexts and hands out `Arc<dyn
/// PersistenceContext>` instances. The core's only entry point into
/// durability; nothing above this trait boundary names a file format.
pub trait PersistenceBackend: Send + Sync {
    fn open_context(&self, namespace: &str, name: &str) -> Result<Arc<dyn PersistenceContext>>;
}

struct ChunkRecord {
    level: LevelId,
    data: Arc<Mutex<Vec<u8>>>,
    finalized: bool,
    checksum: Option<u32>,
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// The in-memory reference implementation: every chunk lives in a `Vec<u8>`
/// behind a mutex, keyed by an incrementing id. Used by this crate's own
/// tests and suitable as the default backend for an embedder that doesn't
/// need durability across process restarts.
#[derive(Default)]
pub struct MemoryContext {
    header: RwLock<Vec<u8>>,
    chunks: Mutex<HashMap<u64, ChunkRecord>>,
    next_chunk_id: Mutex<u64>,
    levels: Mutex<HashMap<LevelId, LevelHandle>>,
}

impl PersistenceContext for MemoryContext {
    fn allocate_level(
        &self,
        level: LevelId,
        header_size: u64,
        vt_size: u64,
        vt_partitions: u32,
    ) -> Result<LevelHandle> {
        let _ = vt_partitions;
        let mut levels = self.levels.lock().unwrap();
        let handle = LevelHandle {
            level,
            header_offset: 0,
            vt_offset: header_size,
            body_offset: header_size + vt_size,
        };
        levels.insert(level, handle);
        log::debug!("persistence: allocated level {level} (header {header_size}B, vt {vt_size}B)");
        Ok(handle)
    }

    fn allocate_chunk(&self, level: LevelId, bytes: u64) -> Result<ChunkHandle> {
        let mut next_id = self.next_chunk_id.lock().unwrap();
        let id = *next_id;
        *next_id += 1;
        drop(next_id);
        let record = ChunkRecord {
            level,
            data: Arc::new(Mutex::new(vec![0u8; bytes as usize])),
            finalized: false,
            checksum: None,
        };
        self.chunks.lock().unwrap().insert(id, record);
        Ok(ChunkHandle { id, level, offset: 0, len: bytes })
    }

    fn read_header(&self) -> Result<Vec<u8>> {
        Ok(self.header.read().unwrap().clone())
    }

    fn write_header(&self, bytes: &[u8]) -> Result<()> {
        *self.header.write().unwrap() = bytes.to_vec();
        Ok(())
    }

    fn mmap_chunk(&self, handle: &ChunkHandle, writable: bool) -> Result<MappedChunk> {
        let chunks = self.chunks.lock().unwrap();
        let record = chunks
            .get(&handle.id)
            .ok_or_else(|| Error::Persistence(format!("unknown chunk {}", handle.id)))?;
        if writable && record.finalized {
            return Err(Error::ArrayFinalized("persistence chunk"));
        }
        if record.finalized {
            let body = record.data.lock().unwrap();
            if let Some(expected) = record.checksum {
                if crc32(&body) != expected {
                    return Err(Error::Persistence(format!("chunk {} failed crc32 check", handle.id)));
                }
            }
        }
        Ok(MappedChunk { data: record.data.clone(), writable: writable && !record.finalized })
    }

    /// One-way finalize. The body's crc32 is taken once at finalize time
    /// and re-checked on every subsequent read-only `mmap_chunk`.
    fn finalize_chunk(&self, handle: &ChunkHandle, final_bytes: u64) -> Result<()> {
        let mut chunks = self.chunks.lock().unwrap();
        let record = chunks
            .get_mut(&handle.id)
            .ok_or_else(|| Error::Persistence(format!("unknown chunk {}", handle.id)))?;
        if record.finalized {
            return Err(Error::ArrayFinalized("persistence chunk"));
        }
        let mut data = record.data.lock().unwrap();
        data.truncate(final_bytes as usize);
        record.checksum = Some(crc32(&data));
        drop(data);
        record.finalized = true;
        Ok(())
    }

    fn sync(&self, level: LevelId) -> Result<()> {
        let chunks = self.chunks.lock().unwrap();
        if chunks.values().any(|c| c.level == level && !c.finalized) {
            log::trace!("persistence: sync on level {level} with unfinalized chunks outstanding");
        }
        Ok(())
    }
}

/// Opens one [`MemoryContext`] per `(namespace, name)` pair and caches it;
/// re-opening the same pair returns the same context, matching the `open`
/// idempotence §4.9 requires.
#[derive(Default)]
pub struct MemoryPersistenceBackend {
    contexts: Mutex<HashMap<(String, String), Arc<MemoryContext>>>,
}

impl MemoryPersistenceBackend {
    pub fn new() -> Self {
        MemoryPersistenceBackend::default()
    }
}

impl PersistenceBackend for MemoryPersistenceBackend {
    fn open_context(&self, namespace: &str, name: &str) -> Result<Arc<dyn PersistenceContext>> {
        let key = (namespace.to_string(), name.to_string());
        let mut contexts = self.contexts.lock().unwrap();
        let ctx = contexts.entry(key).or_insert_with(|| Arc::new(MemoryContext::default()));
        Ok(ctx.clone() as Arc<dyn PersistenceContext>)
    }
}
