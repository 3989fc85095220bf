//! SQLite backend for the scavenge state.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, Sqlite, SqlitePool};
use std::collections::HashSet;
use tokio::sync::Mutex;

use common::database::sqlite_dsn_with_create;

use super::kv::KvStore;

struct Connection {
    conn: PoolConnection<Sqlite>,
    tables: HashSet<&'static str>,
}

/// Scavenge state stored in a SQLite database, one table per named map.
///
/// The store holds a single connection for the lifetime of a run so that
/// BEGIN/COMMIT bracket every write made through it. Dropping the store
/// releases the pool.
pub struct SqliteKvStore {
    pool: SqlitePool,
    connection: Mutex<Connection>,
}

impl SqliteKvStore {
    pub async fn open(dsn: &str) -> Result<Self> {
        let dsn = sqlite_dsn_with_create(dsn);
        log::debug!("Opening scavenge state database with DSN: {dsn}");

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&dsn)
            .await
            .with_context(|| format!("Failed to open scavenge state database '{dsn}'"))?;
        let conn = pool
            .acquire()
            .await
            .context("Failed to acquire scavenge state connection")?;

        Ok(Self {
            pool,
            connection: Mutex::new(Connection {
                conn,
                tables: HashSet::new(),
            }),
        })
    }

    /// Release the connection and close the pool
    pub async fn close(self) {
        let Self { pool, connection } = self;
        drop(connection);
        pool.close().await;
    }
}

impl Connection {
    async fn ensure_table(&mut self, table: &'static str) -> Result<()> {
        if self.tables.contains(table) {
            return Ok(());
        }
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            )"
        );
        sqlx::query(&sql)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("Failed to create table {table}"))?;
        self.tables.insert(table);
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        sqlx::query(sql)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("Failed to execute {sql}"))?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, table: &'static str, key: &str) -> Result<Option<String>> {
        let mut connection = self.connection.lock().await;
        connection.ensure_table(table).await?;
        let sql = format!("SELECT value FROM {table} WHERE key = ?");
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&mut *connection.conn)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get::<String, _>("value")?),
            None => None,
        })
    }

    async fn put(&self, table: &'static str, key: &str, value: &str) -> Result<()> {
        let mut connection = self.connection.lock().await;
        connection.ensure_table(table).await?;
        let sql = format!(
            "INSERT INTO {table} (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value"
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(value)
            .execute(&mut *connection.conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, table: &'static str, key: &str) -> Result<bool> {
        let mut connection = self.connection.lock().await;
        connection.ensure_table(table).await?;
        let sql = format!("DELETE FROM {table} WHERE key = ?");
        let result = sqlx::query(&sql)
            .bind(key)
            .execute(&mut *connection.conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn scan(
        &self,
        table: &'static str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, String)>> {
        let mut connection = self.connection.lock().await;
        connection.ensure_table(table).await?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match after {
            Some(after) => {
                let sql =
                    format!("SELECT key, value FROM {table} WHERE key > ? ORDER BY key LIMIT ?");
                sqlx::query(&sql)
                    .bind(after)
                    .bind(limit)
                    .fetch_all(&mut *connection.conn)
                    .await?
            }
            None => {
                let sql = format!("SELECT key, value FROM {table} ORDER BY key LIMIT ?");
                sqlx::query(&sql)
                    .bind(limit)
                    .fetch_all(&mut *connection.conn)
                    .await?
            }
        };
        rows.into_iter()
            .map(|row| Ok((row.try_get("key")?, row.try_get("value")?)))
            .collect()
    }

    async fn clear(&self, table: &'static str) -> Result<()> {
        let mut connection = self.connection.lock().await;
        connection.ensure_table(table).await?;
        connection.execute(&format!("DELETE FROM {table}")).await
    }

    async fn begin(&self) -> Result<()> {
        self.connection.lock().await.execute("BEGIN").await
    }

    async fn commit(&self) -> Result<()> {
        self.connection.lock().await.execute("COMMIT").await
    }

    async fn rollback(&self) -> Result<()> {
        let mut connection = self.connection.lock().await;
        connection.execute("ROLLBACK").await?;
        // tables created inside the transaction are gone again
        connection.tables.clear();
        Ok(())
    }
}
