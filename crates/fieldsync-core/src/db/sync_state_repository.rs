//! Persisted sync bookkeeping

use crate::error::{Error, Result};
use libsql::Connection;

const WATERMARK_KEY: &str = "pull_watermark";

/// Trait for scalar sync state (async)
#[allow(async_fn_in_trait)]
pub trait SyncStateRepository {
    /// Time of the last completed pull (Unix ms); the epoch before the first one
    async fn watermark(&self) -> Result<i64>;

    async fn set_watermark(&self, millis: i64) -> Result<()>;
}

/// libSQL implementation of `SyncStateRepository`
pub struct LibSqlSyncStateRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSyncStateRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM sync_state WHERE key = ?", [key])
            .await?;

        if let Some(row) = rows.next().await? {
            let value: String = row.get(0)?;
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO sync_state (key, value) VALUES (?, ?)",
                [key, value],
            )
            .await?;
        Ok(())
    }
}

impl SyncStateRepository for LibSqlSyncStateRepository<'_> {
    async fn watermark(&self) -> Result<i64> {
        match self.get_value(WATERMARK_KEY).await? {
            Some(value) => value.trim().parse().map_err(|_| {
                Error::Database(format!("corrupt {WATERMARK_KEY} value: {value}"))
            }),
            None => Ok(0),
        }
    }

    async fn set_watermark(&self, millis: i64) -> Result<()> {
        self.set_value(WATERMARK_KEY, &millis.to_string()).await
    }
}
