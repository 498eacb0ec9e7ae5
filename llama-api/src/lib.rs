//! Identifiers, edge-id packing, and the read-side view trait shared between
//! the storage engine and its embedders.

use serde::{Deserialize, Serialize};

/// A dense, signed node identifier. Negative values other than [`NIL_NODE`]
/// are never produced by the engine.
pub type NodeId = i64;

/// Sentinel meaning "no node".
pub const NIL_NODE: NodeId = -1;

/// A monotonically assigned snapshot identifier.
pub type LevelId = u32;

/// Number of bits of an [`EdgeId`] reserved for the level field.
pub const LEVEL_BITS: u32 = 16;

/// Number of bits of an [`EdgeId`] reserved for the in-level index.
pub const INDEX_BITS: u32 = 64 - LEVEL_BITS;

/// Highest level id a committed snapshot may carry. Two values above this are
/// reserved (see [`WRITABLE_LEVEL`] and the all-ones pattern used by
/// [`NIL_EDGE`]).
pub const MAX_LEVEL: LevelId = (1 << LEVEL_BITS) - 3;

/// Reserved level-field value marking an [`EdgeId`] that addresses a record
/// in the writable stage rather than a committed level's edge table.
pub const WRITABLE_LEVEL: LevelId = (1 << LEVEL_BITS) - 2;

/// Reserved level-field value matching the all-ones bit pattern of `-1i64`,
/// used only so that [`NIL_EDGE`] decodes to an unmistakable sentinel.
pub const LEVEL_NIL: LevelId = (1 << LEVEL_BITS) - 1;

/// A 64-bit edge identifier. The top [`LEVEL_BITS`] bits (unsigned) encode
/// the level that owns the edge; the remaining bits encode the edge's index
/// within that level's edge table.
pub type EdgeId = i64;

/// Sentinel meaning "no edge". Bit pattern is all-ones, so it can never be
/// produced by [`pack_edge_id`] for a valid level/index pair.
pub const NIL_EDGE: EdgeId = -1;

/// Pack a level id and an in-level index into an [`EdgeId`].
///
/// # Panics
/// Panics if `level` exceeds [`LEVEL_NIL`] or `index` does not fit in
/// [`INDEX_BITS`] bits. Callers are expected to have validated these
/// against the level collection before calling.
pub fn pack_edge_id(level: LevelId, index: u64) -> EdgeId {
    assert!(level <= LEVEL_NIL, "level id out of range: {level}");
    assert!(
        index < (1u64 << INDEX_BITS),
        "edge index out of range: {index}"
    );
    (((level as u64) << INDEX_BITS) | index) as i64
}

/// Unpack an [`EdgeId`] into its level and in-level index.
///
/// Returns `None` for [`NIL_EDGE`].
pub fn unpack_edge_id(edge: EdgeId) -> Option<(LevelId, u64)> {
    if edge == NIL_EDGE {
        return None;
    }
    let bits = edge as u64;
    let level = (bits >> INDEX_BITS) as LevelId;
    let index = bits & ((1u64 << INDEX_BITS) - 1);
    Some((level, index))
}

/// True if `edge` addresses a writable-stage record rather than a committed
/// level.
pub fn is_writable_edge(edge: EdgeId) -> bool {
    matches!(unpack_edge_id(edge), Some((level, _)) if level == WRITABLE_LEVEL)
}

/// How a loader should materialize undirected input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Directed,
    UndirectedDouble,
    UndirectedOrdered,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Directed
    }
}

/// Recognized checkpoint options (§6), supplied by the embedder. The core
/// never reads environment variables for these; construct one explicitly
/// and pass it to the checkpoint engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Build the in-edge CSR at each checkpoint.
    pub reverse_edges: bool,
    /// Additionally build edge-id translation maps. Implies `reverse_edges`.
    pub reverse_maps: bool,
    /// Collapse parallel edges within a level before writing them.
    pub deduplicate: bool,
    /// Sort each adjacency list before emission.
    pub sort_edges: bool,
    /// How undirected input should be materialized.
    pub direction: Direction,
    /// External-sort memory budget, in bytes.
    pub xs_buffer_size: usize,
    /// External-sort scratch directories, tried in order.
    pub tmp_dirs: Vec<std::path::PathBuf>,
    /// Progress callback frequency hint; `None` disables progress reporting.
    pub print_progress: Option<usize>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            reverse_edges: false,
            reverse_maps: false,
            deduplicate: false,
            sort_edges: false,
            direction: Direction::default(),
            xs_buffer_size: 64 * 1024 * 1024,
            tmp_dirs: Vec::new(),
            print_progress: None,
        }
    }
}

impl LoaderConfig {
    /// Validates the option combination `reverse_maps` depends on (§4.7
    /// step 1: "fail fast if an unsupported combination is requested").
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.reverse_maps && !self.reverse_edges {
            return Err("reverse_maps requires reverse_edges");
        }
        Ok(())
    }
}

/// A snapshot-producing store: the root object embedders hold.
pub trait GraphStore {
    type View<'a>: LevelView
    where
        Self: 'a;

    /// Obtain a read-only view pinned to `level`. Reading at a level below
    /// the current `min_level` or above `max_level` yields an empty view,
    /// never an error.
    fn view_at(&self, level: LevelId) -> Self::View<'_>;

    /// The most recently committed level.
    fn max_level(&self) -> LevelId;

    /// The oldest level still visible to readers.
    fn min_level(&self) -> LevelId;
}

/// A read-only view of the graph as of one committed level.
pub trait LevelView {
    type Edges<'a>: Iterator<Item = EdgeId> + 'a
    where
        Self: 'a;

    fn out_edges(&self, node: NodeId) -> Self::Edges<'_>;
    fn in_edges(&self, node: NodeId) -> Self::Edges<'_>;

    /// O(1): reads the precomputed degree field, never re-scans.
    fn out_degree(&self, node: NodeId) -> u32;
    /// O(1): reads the precomputed degree field, never re-scans.
    fn in_degree(&self, node: NodeId) -> u32;

    fn target(&self, edge: EdgeId) -> NodeId;

    fn level(&self) -> LevelId;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_id_round_trips() {
        for (level, index) in [(0u32, 0u64), (1, 42), (MAX_LEVEL, (1 << INDEX_BITS) - 1)] {
            let e = pack_edge_id(level, index);
            assert_eq!(unpack_edge_id(e), Some((level, index)));
        }
    }

    #[test]
    fn nil_edge_has_no_components() {
        assert_eq!(unpack_edge_id(NIL_EDGE), None);
    }

    #[test]
    fn loader_config_rejects_maps_without_reverse_edges() {
        let mut cfg = LoaderConfig { reverse_maps: true, ..Default::default() };
        assert!(cfg.validate().is_err());
        cfg.reverse_edges = true;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn writable_level_is_detected() {
        let e = pack_edge_id(WRITABLE_LEVEL, 7);
        assert!(is_writable_edge(e));
        let e2 = pack_edge_id(0, 7);
        assert!(!is_writable_edge(e2));
    }
}
