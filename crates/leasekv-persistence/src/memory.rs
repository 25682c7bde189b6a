//! In-memory row store
//!
//! Backed by a `DashMap`, so every per-row operation holds the shard lock
//! for its duration. Only shares state between handles within one process.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use leasekv_common::Token;

use crate::model::{LockRow, RowPatch};
use crate::traits::RowStore;

#[derive(Clone)]
pub struct MemoryRowStore {
    table: String,
    rows: Arc<DashMap<String, LockRow>>,
    atomic_claim: bool,
}

impl MemoryRowStore {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            rows: Arc::new(DashMap::new()),
            atomic_claim: true,
        }
    }

    /// A store without the atomic claim primitive, forcing the lock onto
    /// its optimistic read, upsert, re-read path.
    pub fn optimistic(table: impl Into<String>) -> Self {
        Self {
            atomic_claim: false,
            ..Self::new(table)
        }
    }
}

impl Default for MemoryRowStore {
    fn default() -> Self {
        Self::new(leasekv_common::DEFAULT_TABLE)
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    fn table_name(&self) -> &str {
        &self.table
    }

    async fn read_row(&self, key: &str) -> anyhow::Result<Option<LockRow>> {
        Ok(self.rows.get(key).map(|row| row.clone()))
    }

    async fn upsert_row(&self, key: &str, patch: RowPatch) -> anyhow::Result<()> {
        self.rows
            .entry(key.to_string())
            .or_insert_with(|| LockRow::new(key))
            .apply(&patch);
        Ok(())
    }

    async fn delete_row(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.rows.remove(key).is_some())
    }

    async fn keys(&self) -> anyhow::Result<Vec<String>> {
        let mut keys: Vec<String> = self.rows.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }

    async fn items(&self) -> anyhow::Result<Vec<(String, Option<String>)>> {
        let mut items: Vec<(String, Option<String>)> = self
            .rows
            .iter()
            .map(|e| (e.key().clone(), e.value.clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(items)
    }

    async fn len(&self) -> anyhow::Result<u64> {
        Ok(self.rows.len() as u64)
    }

    async fn claim_lease(
        &self,
        key: &str,
        token: Token,
        now: f64,
        locked_until: f64,
    ) -> anyhow::Result<Option<bool>> {
        if !self.atomic_claim {
            return Ok(None);
        }

        let mut row = self
            .rows
            .entry(key.to_string())
            .or_insert_with(|| LockRow::new(key));
        if !row.is_claimable_by(token, now) {
            return Ok(Some(false));
        }
        row.apply(&RowPatch::lease(token, locked_until));
        Ok(Some(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_inserts_then_patches() {
        let store = MemoryRowStore::new("kv");
        assert!(store.read_row("carlos").await.unwrap().is_none());

        store
            .upsert_row("carlos", RowPatch::value(Some("1".to_string())))
            .await
            .unwrap();
        let row = store.read_row("carlos").await.unwrap().unwrap();
        assert_eq!(row.value.as_deref(), Some("1"));
        assert!(row.lock_token.is_unlocked());

        store
            .upsert_row("carlos", RowPatch::lease(Token::from_raw(1.5), 10.0))
            .await
            .unwrap();
        let row = store.read_row("carlos").await.unwrap().unwrap();
        assert_eq!(row.value.as_deref(), Some("1"));
        assert_eq!(row.lock_token, Token::from_raw(1.5));
        assert_eq!(row.locked_until, 10.0);
    }

    #[tokio::test]
    async fn test_scan_is_ordered() {
        let store = MemoryRowStore::default();
        for key in ["santiago", "adri", "carlos"] {
            store.upsert_row(key, RowPatch::unlock()).await.unwrap();
        }
        assert_eq!(
            store.keys().await.unwrap(),
            vec!["adri", "carlos", "santiago"]
        );
        assert_eq!(store.len().await.unwrap(), 3);
        assert!(store.delete_row("adri").await.unwrap());
        assert!(!store.delete_row("adri").await.unwrap());
        assert_eq!(store.items().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_claim_lease() {
        let store = MemoryRowStore::new("kv");
        let a = Token::from_raw(1.1);
        let b = Token::from_raw(1.9);

        assert_eq!(store.claim_lease("k", a, 100.0, 105.0).await.unwrap(), Some(true));
        assert_eq!(store.claim_lease("k", b, 101.0, 106.0).await.unwrap(), Some(false));
        assert_eq!(store.claim_lease("k", a, 101.0, 110.0).await.unwrap(), Some(true));
        assert_eq!(store.claim_lease("k", b, 111.0, 116.0).await.unwrap(), Some(true));

        let optimistic = MemoryRowStore::optimistic("kv");
        assert_eq!(optimistic.claim_lease("k", a, 0.0, 1.0).await.unwrap(), None);
        assert!(optimistic.read_row("k").await.unwrap().is_none());
    }
}
