//! Conflict log for parked operations

use crate::error::Result;
use crate::models::{ConflictKind, EntityType, SyncConflict};
use libsql::{Connection, Row};

/// Trait for the conflict log (async)
#[allow(async_fn_in_trait)]
pub trait ConflictRepository {
    /// Record a parked operation; returns the conflict id
    async fn record(
        &self,
        sequence: i64,
        entity_type: EntityType,
        entity_id: &str,
        kind: ConflictKind,
        message: &str,
        detected_at: i64,
    ) -> Result<i64>;

    async fn get(&self, id: i64) -> Result<Option<SyncConflict>>;

    /// Unresolved conflicts, newest first
    async fn list_open(&self, limit: usize) -> Result<Vec<SyncConflict>>;

    /// All conflicts, newest first
    async fn list(&self, limit: usize) -> Result<Vec<SyncConflict>>;

    /// Mark resolved; returns false if it was already resolved or missing
    async fn mark_resolved(&self, id: i64, resolution: &str, resolved_at: i64) -> Result<bool>;
}

/// libSQL implementation of `ConflictRepository`
pub struct LibSqlConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlConflictRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    const COLUMNS: &'static str = "id, sequence, entity_type, entity_id, kind, message, \
         detected_at, resolved_at, resolution";

    fn parse_conflict(row: &Row) -> Result<SyncConflict> {
        let entity_type: String = row.get(2)?;
        let kind: String = row.get(4)?;
        Ok(SyncConflict {
            id: row.get(0)?,
            sequence: row.get(1)?,
            entity_type: entity_type.parse()?,
            entity_id: row.get(3)?,
            kind: kind.parse()?,
            message: row.get(5)?,
            detected_at: row.get(6)?,
            resolved_at: row.get(7)?,
            resolution: row.get(8)?,
        })
    }

    async fn select(&self, filter: &str, limit: usize) -> Result<Vec<SyncConflict>> {
        let sql = format!(
            "SELECT {} FROM sync_conflicts {filter} ORDER BY detected_at DESC, id DESC LIMIT ?",
            Self::COLUMNS
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = self.conn.query(&sql, [limit]).await?;

        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(Self::parse_conflict(&row)?);
        }
        Ok(conflicts)
    }
}

impl ConflictRepository for LibSqlConflictRepository<'_> {
    async fn record(
        &self,
        sequence: i64,
        entity_type: EntityType,
        entity_id: &str,
        kind: ConflictKind,
        message: &str,
        detected_at: i64,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO sync_conflicts
                    (sequence, entity_type, entity_id, kind, message, detected_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                libsql::params![
                    sequence,
                    entity_type.as_str(),
                    entity_id,
                    kind.as_str(),
                    crate::util::compact_text(message),
                    detected_at,
                ],
            )
            .await?;
        Ok(self.conn.last_insert_rowid())
    }

    async fn get(&self, id: i64) -> Result<Option<SyncConflict>> {
        let sql = format!("SELECT {} FROM sync_conflicts WHERE id = ?", Self::COLUMNS);
        let mut rows = self.conn.query(&sql, [id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_conflict(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_open(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.select("WHERE resolved_at IS NULL", limit).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.select("", limit).await
    }

    async fn mark_resolved(&self, id: i64, resolution: &str, resolved_at: i64) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE sync_conflicts SET resolved_at = ?, resolution = ?
                 WHERE id = ? AND resolved_at IS NULL",
                libsql::params![resolved_at, resolution, id],
            )
            .await?;
        Ok(updated > 0)
    }
}
