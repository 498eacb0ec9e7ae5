use llama_api::{LevelId, NodeId};
use thiserror::Error;

/// Fatal errors: invariant violations and resource exhaustion. Recoverable
/// caller mistakes (unknown node, unknown property, nil edge) are never
/// represented here — they surface as `None`/empty iterators instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("level {0} exceeds the maximum representable level id")]
    LevelOverflow(LevelId),

    #[error("level {0} is already finalized and cannot accept further writes")]
    LevelFinalized(LevelId),

    #[error("level {0} has not finished vertex construction")]
    LevelNotReady(LevelId),

    #[error("node {0} is out of range for this level's vertex table")]
    NodeOutOfRange(NodeId),

    #[error("page {0} is not allocated")]
    PageNotAllocated(u64),

    #[error("property {0:?} does not exist")]
    UnknownProperty(String),

    #[error("a property named {0:?} already exists")]
    DuplicateProperty(String),

    #[error("loader config requests an unsupported combination: {0}")]
    UnsupportedConfig(&'static str),

    #[error("{0} is finalized and cannot accept further writes")]
    ArrayFinalized(&'static str),

    #[error("min_level {requested} must be <= max_level (max_level = {max_level})")]
    InvalidMinLevel { requested: LevelId, max_level: LevelId },

    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),

    #[error("persistence backend failed: {0}")]
    Persistence(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
