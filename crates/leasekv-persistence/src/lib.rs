//! LeaseKV Persistence - Backing row stores
//!
//! This crate provides:
//! - The `LockRow` / `RowPatch` row model shared with the lock protocol
//! - The `RowStore` trait: read, upsert, delete and scan by key
//! - A SQLite backend over SeaORM, one table per key-value namespace
//! - An in-memory backend for single-process use and tests

pub mod memory;
pub mod model;
pub mod sql;
pub mod traits;

// Re-export sea-orm for convenience
pub use sea_orm;

pub use memory::MemoryRowStore;
pub use model::{LockRow, RowPatch, is_claimable};
pub use sql::{SqliteDatabase, SqliteRowStore};
pub use traits::RowStore;
