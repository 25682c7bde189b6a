//! Backing row store abstraction
//!
//! The lock protocol needs only keyed reads, keyed upserts and deletes,
//! plus full scans for enumeration. Each call must be atomic on its own
//! row, and a read issued after a completed write must observe that write
//! or a later one. No multi-row transactions are required.

use async_trait::async_trait;
use leasekv_common::Token;

use crate::model::{LockRow, RowPatch};

/// Keyed row storage for one key-value namespace
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Name of the namespace (table) this store reads and writes
    fn table_name(&self) -> &str;

    /// Read one row by key
    async fn read_row(&self, key: &str) -> anyhow::Result<Option<LockRow>>;

    /// Insert the row if absent, else update only the patched columns
    async fn upsert_row(&self, key: &str, patch: RowPatch) -> anyhow::Result<()>;

    /// Delete a row, returning whether one existed
    async fn delete_row(&self, key: &str) -> anyhow::Result<bool>;

    /// All keys, ordered
    async fn keys(&self) -> anyhow::Result<Vec<String>>;

    /// All `(key, raw value)` pairs, ordered by key
    async fn items(&self) -> anyhow::Result<Vec<(String, Option<String>)>>;

    /// Number of rows
    async fn len(&self) -> anyhow::Result<u64>;

    /// Atomically write the lease `(token, locked_until)` if the row is
    /// claimable by `token` at `now` (see [`LockRow::is_claimable_by`]).
    ///
    /// Returns `Some(granted)` when the backend performs the check and the
    /// write as one atomic step, `None` when it offers no such primitive
    /// and the caller must fall back to read, upsert, re-read.
    async fn claim_lease(
        &self,
        _key: &str,
        _token: Token,
        _now: f64,
        _locked_until: f64,
    ) -> anyhow::Result<Option<bool>> {
        Ok(None)
    }
}
