//! Token-guarded key-value store
//!
//! Values are JSON documents stored as text. Reads are unguarded. Every
//! write first proves the caller holds the key's lease, then writes, then
//! releases the lease.
//!
//! ```no_run
//! # async fn demo() -> leasekv_common::Result<()> {
//! use leasekv_common::LeaseKvSettings;
//! use leasekv_consistency::GuardedKvStore;
//!
//! let kv = GuardedKvStore::open(&LeaseKvSettings::from_env()?).await?;
//! kv.wait_set("last_time", &1_700_000_000, kv.options().poll_interval, kv.options().timeout)
//!     .await?;
//! assert_eq!(kv.get("last_time").await?, Some(serde_json::json!(1_700_000_000)));
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use leasekv_common::{LeaseKvSettings, Result, Token};
use leasekv_persistence::{RowPatch, RowStore, SqliteDatabase};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::lock::{LeaseGuard, LeaseLock, WaitOptions};

/// Key-value table whose writes are gated by lease tokens
#[derive(Clone)]
pub struct GuardedKvStore {
    lock: LeaseLock,
    options: WaitOptions,
}

impl GuardedKvStore {
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self::with_options(store, WaitOptions::default())
    }

    pub fn with_options(store: Arc<dyn RowStore>, options: WaitOptions) -> Self {
        Self {
            lock: LeaseLock::new(store),
            options,
        }
    }

    /// Connect to the configured SQLite database and open its table
    pub async fn open(settings: &LeaseKvSettings) -> Result<Self> {
        settings.validate()?;
        let db = SqliteDatabase::connect(&settings.store).await?;
        let store = db.row_store(&settings.store.table).await?;
        Ok(Self::with_options(
            Arc::new(store),
            WaitOptions::from(&settings.lease),
        ))
    }

    pub fn lock(&self) -> &LeaseLock {
        &self.lock
    }

    /// Lease, poll interval and timeout used by the `try_*`, `wait_*` and
    /// scoped-token helpers
    pub fn options(&self) -> &WaitOptions {
        &self.options
    }

    fn store(&self) -> &Arc<dyn RowStore> {
        self.lock.store()
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// The stored value, `None` if the key has no row or was never written.
    /// A stored JSON `null` comes back as `Some(Value::Null)`.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let row = self.store().read_row(key).await?;
        match row.and_then(|row| row.value) {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// The stored value deserialized as `T`
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn get_or(&self, key: &str, default: Value) -> Result<Value> {
        Ok(self.get(key).await?.unwrap_or(default))
    }

    pub async fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// All keys with a row, including keys that were only ever locked
    pub async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.store().keys().await?)
    }

    /// All values; rows without a value yield `null`
    pub async fn values(&self) -> Result<Vec<Value>> {
        Ok(self.items().await?.into_iter().map(|(_, v)| v).collect())
    }

    /// All `(key, value)` pairs; rows without a value yield `null`
    pub async fn items(&self) -> Result<Vec<(String, Value)>> {
        let mut items = Vec::new();
        for (key, text) in self.store().items().await? {
            let value = match text {
                Some(text) => serde_json::from_str(&text)?,
                None => Value::Null,
            };
            items.push((key, value));
        }
        Ok(items)
    }

    pub async fn len(&self) -> Result<u64> {
        Ok(self.store().len().await?)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    // ========================================================================
    // Guarded writes
    // ========================================================================

    async fn write_value(&self, key: &str, text: String) -> Result<()> {
        self.store()
            .upsert_row(key, RowPatch::value(Some(text)))
            .await?;
        Ok(())
    }

    async fn delete_row(&self, key: &str) -> Result<bool> {
        Ok(self.store().delete_row(key).await?)
    }

    /// Write `value` under a token obtained from [`ask_token`](Self::ask_token),
    /// [`wait_token`](Self::wait_token) or the scoped helpers, then release
    /// the key.
    ///
    /// Fails with `TokenInvalid` (and writes nothing) unless `token` is the
    /// key's current holder.
    pub async fn set<V: Serialize + ?Sized>(&self, key: &str, value: &V, token: Token) -> Result<()> {
        let text = serde_json::to_string(value)?;
        let keys = [key.to_string()];
        self.lock.verify_held(&keys, token).await?;

        let written = self.write_value(key, text).await;
        let released = self.lock.release(key, token, Duration::ZERO).await;
        written?;
        released?;
        Ok(())
    }

    /// Delete `key` (value and lease together) under a held token.
    /// Returns whether a row was removed.
    pub async fn delete(&self, key: &str, token: Token) -> Result<bool> {
        let keys = [key.to_string()];
        self.lock.verify_held(&keys, token).await?;

        match self.delete_row(key).await {
            Ok(removed) => Ok(removed),
            Err(e) => {
                self.lock.release(key, token, Duration::ZERO).await?;
                Err(e)
            }
        }
    }

    /// Write `value` if the key can be locked right now. Returns false,
    /// without writing, when another holder has it.
    pub async fn try_set<V: Serialize + ?Sized>(&self, key: &str, value: &V) -> Result<bool> {
        let text = serde_json::to_string(value)?;
        let guard = self.ask_token(&[key]).await?;
        if guard.token().is_none() {
            guard.release().await?;
            return Ok(false);
        }

        let written = self.write_value(key, text).await;
        guard.release().await?;
        written.map(|()| true)
    }

    /// Delete `key` if it can be locked right now. Returns false when
    /// another holder has it.
    pub async fn try_delete(&self, key: &str) -> Result<bool> {
        let guard = self.ask_token(&[key]).await?;
        if guard.token().is_none() {
            guard.release().await?;
            return Ok(false);
        }
        self.delete_locked(key, guard).await?;
        Ok(true)
    }

    /// Wait for the key, then write `value`. Fails with `Timeout` if the
    /// key stays held past `timeout`.
    pub async fn wait_set<V: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &V,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let options = self
            .options
            .with_poll_interval(poll_interval)
            .with_timeout(timeout);
        let guard = self.lock.wait(&[key], &options).await?;
        let token = guard.raw_token();

        match self.set(key, value, token).await {
            // `set` already gave the key back
            Ok(()) => {
                guard.disarm();
                Ok(())
            }
            Err(e) => finish(guard, Err(e)).await,
        }
    }

    /// Wait for the key, then delete it.
    pub async fn wait_delete(
        &self,
        key: &str,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let options = self
            .options
            .with_poll_interval(poll_interval)
            .with_timeout(timeout);
        let guard = self.lock.wait(&[key], &options).await?;
        self.delete_locked(key, guard).await
    }

    /// Delete under an already granted guard. The lease goes with the row,
    /// so the guard is only released if the delete failed.
    async fn delete_locked(&self, key: &str, guard: LeaseGuard) -> Result<bool> {
        match self.delete_row(key).await {
            Ok(removed) => {
                guard.disarm();
                Ok(removed)
            }
            Err(e) => {
                guard.release().await?;
                Err(e)
            }
        }
    }

    // ========================================================================
    // Scoped tokens
    // ========================================================================

    /// Try once to lock `keys` for the default lease.
    ///
    /// ```no_run
    /// # async fn demo(kv: leasekv_consistency::GuardedKvStore) -> leasekv_common::Result<()> {
    /// let guard = kv.ask_token(&["some_key"]).await?;
    /// match guard.token() {
    ///     Some(token) => kv.set("some_key", &42, token).await?,
    ///     None => { /* locked by someone else */ }
    /// }
    /// guard.release().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn ask_token(&self, keys: &[&str]) -> Result<LeaseGuard> {
        self.lock.ask(keys, self.options.max_duration).await
    }

    /// Wait for `keys` with the default lease, poll interval and timeout.
    pub async fn wait_token(&self, keys: &[&str]) -> Result<LeaseGuard> {
        self.lock.wait(keys, &self.options).await
    }

    /// Run `f` with the token for `keys` if they can be locked right now
    /// (`None` otherwise). The keys are released afterwards whatever `f`
    /// returns.
    pub async fn with_token<F, Fut, T>(&self, keys: &[&str], f: F) -> Result<T>
    where
        F: FnOnce(Option<Token>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.ask_token(keys).await?;
        let output = f(guard.token()).await;
        finish(guard, output).await
    }

    /// Wait for `keys`, then run `f` with the token. The keys are released
    /// afterwards whatever `f` returns.
    pub async fn with_blocking_token<F, Fut, T>(&self, keys: &[&str], f: F) -> Result<T>
    where
        F: FnOnce(Token) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.wait_token(keys).await?;
        let output = f(guard.raw_token()).await;
        finish(guard, output).await
    }
}

/// Release `guard`, preferring the critical section's own error over a
/// release failure.
async fn finish<T>(guard: LeaseGuard, output: Result<T>) -> Result<T> {
    let released = guard.release().await;
    let value = output?;
    released?;
    Ok(value)
}
