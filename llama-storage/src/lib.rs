//! LLAMA storage core: a multi-versioned, append-only CSR graph engine.
//!
//! [`Database`] is the single owning root (§9): it wires together the MLCSR
//! (`mlcsr`), the property store (`property`), the writable staging area
//! (`writable`), the checkpoint engine (`checkpoint`), and eviction
//! (`eviction`). Most embedders only need [`Database`] and the
//! [`llama_api::GraphStore`]/[`llama_api::LevelView`] traits it implements;
//! the per-component modules are public for callers building their own
//! orchestration (a custom loader, an alternate checkpoint policy) on top of
//! the same primitives.

pub mod checkpoint;
pub mod database;
pub mod error;
pub mod et;
pub mod eviction;
pub mod level;
pub mod mlcsr;
pub mod page;
pub mod page_array;
pub mod persistence;
pub mod property;
pub mod vt;
pub mod writable;

pub use database::{Database, DatabaseConfig, DatabaseView};
pub use error::{Error, Result};
pub use mlcsr::Mlcsr;
pub use property::{PropertyId, PropertyStore, PropertyValue};
