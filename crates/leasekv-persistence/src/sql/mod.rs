//! SQLite persistence backend (via SeaORM)
//!
//! One table per key-value namespace:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS <table>(
//!     key text NOT NULL PRIMARY KEY,
//!     value text,
//!     lock_token double NOT NULL,
//!     locked_until double NOT NULL
//! )
//! ```
//!
//! Any number of processes may open the same database file; SQLite
//! serializes their writes and each statement below touches a single row.

use std::collections::BTreeSet;

use async_trait::async_trait;
use leasekv_common::{LeaseKvError, StoreSettings, Token, is_valid_identifier};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, DbErr, QueryResult,
    Statement, Value,
};

use crate::model::{COLUMNS, LockRow, RowPatch};
use crate::traits::RowStore;

fn storage_error(e: DbErr) -> LeaseKvError {
    LeaseKvError::Storage(e.into())
}

fn statement(sql: impl Into<String>, values: Vec<Value>) -> Statement {
    Statement::from_sql_and_values(DbBackend::Sqlite, sql, values)
}

/// A SQLite database holding one or more key-value tables
#[derive(Clone, Debug)]
pub struct SqliteDatabase {
    db: DatabaseConnection,
}

impl SqliteDatabase {
    /// Open (and create, with `mode=rwc`) the database described by `settings`
    pub async fn connect(settings: &StoreSettings) -> leasekv_common::Result<Self> {
        // Each pooled connection to `:memory:` would see its own database
        let max_connections = if settings.is_in_memory() {
            1
        } else {
            settings.max_connections
        };

        let mut opt = ConnectOptions::new(settings.url.clone());
        opt.max_connections(max_connections)
            .min_connections(1)
            .sqlx_logging(settings.sqlx_logging);

        let db = Database::connect(opt).await.map_err(storage_error)?;

        if !settings.is_in_memory() {
            db.execute_unprepared("PRAGMA journal_mode=WAL")
                .await
                .map_err(storage_error)?;
        }

        tracing::info!(
            url = %settings.url,
            max_connections = max_connections,
            "SQLite row store connected"
        );

        Ok(Self { db })
    }

    /// Wrap an existing connection
    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Get a reference to the underlying database connection
    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn health_check(&self) -> anyhow::Result<()> {
        self.db.execute_unprepared("SELECT 1").await?;
        Ok(())
    }

    /// Names of all user tables, sorted
    pub async fn table_names(&self) -> anyhow::Result<Vec<String>> {
        let rows = self
            .db
            .query_all(statement(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY 1",
                vec![],
            ))
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String>("", "name").map_err(anyhow::Error::from))
            .collect()
    }

    /// Column names of `table`, in declaration order
    pub async fn table_columns(&self, table: &str) -> anyhow::Result<Vec<String>> {
        let rows = self
            .db
            .query_all(statement(
                "SELECT name FROM pragma_table_info(?)",
                vec![table.into()],
            ))
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String>("", "name").map_err(anyhow::Error::from))
            .collect()
    }

    /// Open the key-value table `table`, creating it if missing.
    ///
    /// Fails with `SchemaMismatch` when a table of that name exists with
    /// different columns.
    pub async fn row_store(&self, table: &str) -> leasekv_common::Result<SqliteRowStore> {
        if !is_valid_identifier(table) {
            return Err(LeaseKvError::IllegalArgument(format!(
                "invalid table name '{}'",
                table
            )));
        }

        self.db
            .execute_unprepared(&format!(
                "CREATE TABLE IF NOT EXISTS {}(\
                 key text NOT NULL PRIMARY KEY, \
                 value text, \
                 lock_token double NOT NULL, \
                 locked_until double NOT NULL)",
                table
            ))
            .await
            .map_err(storage_error)?;

        let columns = self.table_columns(table).await?;
        let found: BTreeSet<&str> = columns.iter().map(String::as_str).collect();
        let expected: BTreeSet<&str> = COLUMNS.into_iter().collect();
        if found != expected {
            return Err(LeaseKvError::SchemaMismatch {
                table: table.to_string(),
                columns,
            });
        }

        tracing::debug!(table = table, "Key-value table ready");

        Ok(SqliteRowStore {
            db: self.db.clone(),
            table: table.to_string(),
        })
    }
}

/// Row store over one SQLite key-value table
#[derive(Clone, Debug)]
pub struct SqliteRowStore {
    db: DatabaseConnection,
    table: String,
}

impl SqliteRowStore {
    fn decode(row: &QueryResult) -> Result<LockRow, DbErr> {
        Ok(LockRow {
            key: row.try_get("", "key")?,
            value: row.try_get("", "value")?,
            lock_token: Token::from_raw(row.try_get("", "lock_token")?),
            locked_until: row.try_get("", "locked_until")?,
        })
    }

    fn upsert_statement(&self, key: &str, patch: &RowPatch) -> Statement {
        let mut updates = Vec::new();
        if patch.value.is_some() {
            updates.push("value = excluded.value");
        }
        if patch.lock_token.is_some() {
            updates.push("lock_token = excluded.lock_token");
        }
        if patch.locked_until.is_some() {
            updates.push("locked_until = excluded.locked_until");
        }

        let on_conflict = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };

        statement(
            format!(
                "INSERT INTO {} (key, value, lock_token, locked_until) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(key) {}",
                self.table, on_conflict
            ),
            vec![
                key.into(),
                patch.value.clone().flatten().into(),
                patch.lock_token.unwrap_or(Token::UNLOCKED).as_f64().into(),
                patch.locked_until.unwrap_or(0.0).into(),
            ],
        )
    }
}

#[async_trait]
impl RowStore for SqliteRowStore {
    fn table_name(&self) -> &str {
        &self.table
    }

    async fn read_row(&self, key: &str) -> anyhow::Result<Option<LockRow>> {
        let row = self
            .db
            .query_one(statement(
                format!(
                    "SELECT key, value, lock_token, locked_until FROM {} WHERE key = ?",
                    self.table
                ),
                vec![key.into()],
            ))
            .await?;
        Ok(row.as_ref().map(Self::decode).transpose()?)
    }

    async fn upsert_row(&self, key: &str, patch: RowPatch) -> anyhow::Result<()> {
        self.db.execute(self.upsert_statement(key, &patch)).await?;
        Ok(())
    }

    async fn delete_row(&self, key: &str) -> anyhow::Result<bool> {
        let result = self
            .db
            .execute(statement(
                format!("DELETE FROM {} WHERE key = ?", self.table),
                vec![key.into()],
            ))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn keys(&self) -> anyhow::Result<Vec<String>> {
        let rows = self
            .db
            .query_all(statement(
                format!("SELECT key FROM {} ORDER BY key", self.table),
                vec![],
            ))
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String>("", "key").map_err(anyhow::Error::from))
            .collect()
    }

    async fn items(&self) -> anyhow::Result<Vec<(String, Option<String>)>> {
        let rows = self
            .db
            .query_all(statement(
                format!("SELECT key, value FROM {} ORDER BY key", self.table),
                vec![],
            ))
            .await?;
        rows.iter()
            .map(|row| -> anyhow::Result<(String, Option<String>)> {
                Ok((row.try_get("", "key")?, row.try_get("", "value")?))
            })
            .collect()
    }

    async fn len(&self) -> anyhow::Result<u64> {
        let row = self
            .db
            .query_one(statement(
                format!("SELECT COUNT(*) AS n FROM {}", self.table),
                vec![],
            ))
            .await?;
        let n: i64 = match row {
            Some(row) => row.try_get("", "n")?,
            None => 0,
        };
        Ok(n as u64)
    }

    async fn claim_lease(
        &self,
        key: &str,
        token: Token,
        now: f64,
        locked_until: f64,
    ) -> anyhow::Result<Option<bool>> {
        // The upsert's WHERE clause sees the existing row; zero changes
        // means a live lease held by another token.
        let result = self
            .db
            .execute(statement(
                format!(
                    "INSERT INTO {t} (key, value, lock_token, locked_until) VALUES (?, NULL, ?, ?) \
                     ON CONFLICT(key) DO UPDATE SET \
                     lock_token = excluded.lock_token, locked_until = excluded.locked_until \
                     WHERE {t}.lock_token = 0 OR {t}.locked_until < ? OR {t}.lock_token = ?",
                    t = self.table
                ),
                vec![
                    key.into(),
                    token.as_f64().into(),
                    locked_until.into(),
                    now.into(),
                    token.as_f64().into(),
                ],
            ))
            .await?;
        Ok(Some(result.rows_affected() > 0))
    }
}
