//! Entity store backends
//!
//! The engine only ever sees [`gatekeep_core::EntityStore`]; these modules
//! provide the default in-memory backend and an optional SQLite backend.

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryEntityStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteEntityStore;
