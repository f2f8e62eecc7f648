//! Durable mutation queue

use crate::error::{Error, Result};
use crate::models::{EntityType, Mutation, QueuedOperation};
use libsql::{Connection, Row};
use serde_json::Value;

/// Ordered, append-only log of pending writes (async)
///
/// Entries leave the queue only through [`MutationQueue::remove`].
#[allow(async_fn_in_trait)]
pub trait MutationQueue {
    /// Append a write and return its sequence; durable once this returns
    async fn enqueue(&self, mutation: &Mutation, now_millis: i64) -> Result<i64>;

    /// All queued operations in sequence order, parked ones included.
    /// Nothing is removed.
    async fn drain(&self) -> Result<Vec<QueuedOperation>>;

    /// Fetch one entry
    async fn get(&self, sequence: i64) -> Result<Option<QueuedOperation>>;

    /// Delete an entry; returns false if it was already gone
    async fn remove(&self, sequence: i64) -> Result<bool>;

    /// Record a failed attempt and return the new attempt count
    async fn mark_retry(&self, sequence: i64, next_attempt_at: i64, error: &str) -> Result<u32>;

    /// Stop pushing an entry until it is resolved
    async fn park(&self, sequence: i64, reason: &str) -> Result<()>;

    /// Make a parked entry pushable again, optionally with a new payload
    async fn unpark(
        &self,
        sequence: i64,
        replacement: Option<(&Value, Option<i64>)>,
    ) -> Result<()>;

    /// Point unparked entries for an entity queued after `after_sequence`
    /// at a new remote version. Only entries that carry a base are touched.
    /// Returns the number of entries changed.
    async fn rebase(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        after_sequence: i64,
        base_updated_at: i64,
    ) -> Result<usize>;

    /// Number of entries, parked ones included
    async fn count(&self) -> Result<usize>;

    /// Whether any entry targets the given entity
    async fn has_pending(&self, entity_type: EntityType, entity_id: &str) -> Result<bool>;
}

/// libSQL implementation of `MutationQueue`
pub struct LibSqlMutationQueue<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlMutationQueue<'a> {
    /// Create a new queue over the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    const COLUMNS: &'static str = "sequence, kind, entity_type, entity_id, payload, \
         base_updated_at, attempts, next_attempt_at, parked, last_error, created_at";

    fn parse_operation(row: &Row) -> Result<QueuedOperation> {
        let kind: String = row.get(1)?;
        let entity_type: String = row.get(2)?;
        let payload: String = row.get(4)?;
        let attempts: i64 = row.get(6)?;

        Ok(QueuedOperation {
            sequence: row.get(0)?,
            kind: kind.parse()?,
            entity_type: entity_type.parse()?,
            entity_id: row.get(3)?,
            payload: serde_json::from_str(&payload)?,
            base_updated_at: row.get(5)?,
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            next_attempt_at: row.get(7)?,
            parked: row.get::<i64>(8)? != 0,
            last_error: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    async fn attempts(&self, sequence: i64) -> Result<u32> {
        let mut rows = self
            .conn
            .query(
                "SELECT attempts FROM mutation_queue WHERE sequence = ?",
                [sequence],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Err(Error::NotFound(format!("queued operation {sequence}")));
        };
        let attempts: i64 = row.get(0)?;
        Ok(u32::try_from(attempts).unwrap_or(u32::MAX))
    }
}

impl MutationQueue for LibSqlMutationQueue<'_> {
    async fn enqueue(&self, mutation: &Mutation, now_millis: i64) -> Result<i64> {
        if mutation.entity_id.trim().is_empty() {
            return Err(Error::InvalidInput("entity id must not be empty".into()));
        }
        let payload = serde_json::to_string(&mutation.payload)?;

        self.conn
            .execute(
                "INSERT INTO mutation_queue
                    (kind, entity_type, entity_id, payload, base_updated_at, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                libsql::params![
                    mutation.kind.as_str(),
                    mutation.entity_type.as_str(),
                    mutation.entity_id.as_str(),
                    payload,
                    mutation.base_updated_at,
                    now_millis,
                ],
            )
            .await?;

        let sequence = self.conn.last_insert_rowid();
        tracing::debug!(
            sequence,
            kind = mutation.kind.as_str(),
            entity_type = mutation.entity_type.as_str(),
            entity_id = %mutation.entity_id,
            "Enqueued mutation"
        );
        Ok(sequence)
    }

    async fn drain(&self) -> Result<Vec<QueuedOperation>> {
        let sql = format!(
            "SELECT {} FROM mutation_queue ORDER BY sequence ASC",
            Self::COLUMNS
        );
        let mut rows = self.conn.query(&sql, ()).await?;

        let mut operations = Vec::new();
        while let Some(row) = rows.next().await? {
            operations.push(Self::parse_operation(&row)?);
        }
        Ok(operations)
    }

    async fn get(&self, sequence: i64) -> Result<Option<QueuedOperation>> {
        let sql = format!(
            "SELECT {} FROM mutation_queue WHERE sequence = ?",
            Self::COLUMNS
        );
        let mut rows = self.conn.query(&sql, [sequence]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_operation(&row)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, sequence: i64) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM mutation_queue WHERE sequence = ?", [sequence])
            .await?;
        Ok(removed > 0)
    }

    async fn mark_retry(&self, sequence: i64, next_attempt_at: i64, error: &str) -> Result<u32> {
        let updated = self
            .conn
            .execute(
                "UPDATE mutation_queue
                 SET attempts = attempts + 1, next_attempt_at = ?, last_error = ?
                 WHERE sequence = ?",
                libsql::params![next_attempt_at, crate::util::compact_text(error), sequence],
            )
            .await?;
        if updated == 0 {
            return Err(Error::NotFound(format!("queued operation {sequence}")));
        }
        self.attempts(sequence).await
    }

    async fn park(&self, sequence: i64, reason: &str) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE mutation_queue SET parked = 1, last_error = ? WHERE sequence = ?",
                libsql::params![crate::util::compact_text(reason), sequence],
            )
            .await?;
        if updated == 0 {
            return Err(Error::NotFound(format!("queued operation {sequence}")));
        }
        Ok(())
    }

    async fn unpark(
        &self,
        sequence: i64,
        replacement: Option<(&Value, Option<i64>)>,
    ) -> Result<()> {
        let updated = if let Some((payload, base_updated_at)) = replacement {
            self.conn
                .execute(
                    "UPDATE mutation_queue
                     SET parked = 0, next_attempt_at = 0, last_error = NULL,
                         payload = ?, base_updated_at = ?
                     WHERE sequence = ?",
                    libsql::params![serde_json::to_string(payload)?, base_updated_at, sequence],
                )
                .await?
        } else {
            self.conn
                .execute(
                    "UPDATE mutation_queue
                     SET parked = 0, next_attempt_at = 0, last_error = NULL
                     WHERE sequence = ?",
                    [sequence],
                )
                .await?
        };
        if updated == 0 {
            return Err(Error::NotFound(format!("queued operation {sequence}")));
        }
        Ok(())
    }

    async fn rebase(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        after_sequence: i64,
        base_updated_at: i64,
    ) -> Result<usize> {
        let updated = self
            .conn
            .execute(
                "UPDATE mutation_queue SET base_updated_at = ?
                 WHERE entity_type = ? AND entity_id = ? AND sequence > ?
                   AND parked = 0 AND base_updated_at IS NOT NULL",
                libsql::params![
                    base_updated_at,
                    entity_type.as_str(),
                    entity_id,
                    after_sequence
                ],
            )
            .await?;
        Ok(usize::try_from(updated).unwrap_or_default())
    }

    async fn count(&self) -> Result<usize> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM mutation_queue", ())
            .await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn has_pending(&self, entity_type: EntityType, entity_id: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT EXISTS(
                    SELECT 1 FROM mutation_queue WHERE entity_type = ? AND entity_id = ?
                )",
                [entity_type.as_str(), entity_id],
            )
            .await?;
        Ok(match rows.next().await? {
            Some(row) => row.get::<i64>(0)? != 0,
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::OperationKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn update(entity_id: &str, value: i64) -> Mutation {
        Mutation::new(
            OperationKind::Update,
            EntityType::Feature,
            entity_id,
            json!({"properties": {"area": value}}),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_enqueue_assigns_increasing_sequences() {
        let db = setup().await;
        let queue = LibSqlMutationQueue::new(db.connection());

        let first = queue.enqueue(&update("f-1", 1), 10).await.unwrap();
        let second = queue.enqueue(&update("f-1", 2), 10).await.unwrap();
        let third = queue.enqueue(&update("f-2", 3), 11).await.unwrap();

        assert!(first < second && second < third);
        assert_eq!(queue.count().await.unwrap(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_drain_is_fifo_and_non_destructive() {
        let db = setup().await;
        let queue = LibSqlMutationQueue::new(db.connection());
        for value in 0..5 {
            queue.enqueue(&update("f-1", value), 10).await.unwrap();
        }

        let drained = queue.drain().await.unwrap();
        let values: Vec<_> = drained
            .iter()
            .map(|op| op.payload["properties"]["area"].as_i64().unwrap())
            .collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.drain().await.unwrap(), drained);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sequences_not_reused_after_removal() {
        let db = setup().await;
        let queue = LibSqlMutationQueue::new(db.connection());

        let first = queue.enqueue(&update("f-1", 1), 10).await.unwrap();
        assert!(queue.remove(first).await.unwrap());
        let second = queue.enqueue(&update("f-1", 2), 10).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_double_remove_is_harmless() {
        let db = setup().await;
        let queue = LibSqlMutationQueue::new(db.connection());
        let sequence = queue.enqueue(&update("f-1", 1), 10).await.unwrap();

        assert!(queue.remove(sequence).await.unwrap());
        assert!(!queue.remove(sequence).await.unwrap());
        assert!(queue.drain().await.unwrap().is_empty());
        assert_eq!(queue.count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mark_retry_increments_attempts() {
        let db = setup().await;
        let queue = LibSqlMutationQueue::new(db.connection());
        let sequence = queue.enqueue(&update("f-1", 1), 10).await.unwrap();

        assert_eq!(queue.mark_retry(sequence, 100, "timeout").await.unwrap(), 1);
        assert_eq!(queue.mark_retry(sequence, 200, "timeout").await.unwrap(), 2);

        let op = queue.get(sequence).await.unwrap().unwrap();
        assert_eq!(op.attempts, 2);
        assert_eq!(op.next_attempt_at, 200);
        assert_eq!(op.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mark_retry_missing_entry() {
        let db = setup().await;
        let queue = LibSqlMutationQueue::new(db.connection());
        assert!(matches!(
            queue.mark_retry(42, 0, "boom").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_park_and_unpark_with_replacement() {
        let db = setup().await;
        let queue = LibSqlMutationQueue::new(db.connection());
        let sequence = queue
            .enqueue(&update("f-1", 1).based_on(500), 10)
            .await
            .unwrap();

        queue.park(sequence, "stale base").await.unwrap();
        let parked = queue.get(sequence).await.unwrap().unwrap();
        assert!(parked.parked);
        assert!(!parked.is_due(i64::MAX));

        let replacement = json!({"properties": {"area": 99}});
        queue
            .unpark(sequence, Some((&replacement, Some(900))))
            .await
            .unwrap();
        let op = queue.get(sequence).await.unwrap().unwrap();
        assert!(!op.parked);
        assert_eq!(op.payload, replacement);
        assert_eq!(op.base_updated_at, Some(900));
        assert_eq!(op.last_error, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rebase_moves_later_entries_only() {
        let db = setup().await;
        let queue = LibSqlMutationQueue::new(db.connection());
        let first = queue
            .enqueue(&update("f-1", 1).based_on(100), 10)
            .await
            .unwrap();
        let second = queue
            .enqueue(&update("f-1", 2).based_on(100), 11)
            .await
            .unwrap();
        let parked = queue
            .enqueue(&update("f-1", 3).based_on(100), 12)
            .await
            .unwrap();
        let unbased = queue.enqueue(&update("f-1", 4), 13).await.unwrap();
        let other = queue
            .enqueue(&update("f-2", 5).based_on(100), 14)
            .await
            .unwrap();
        queue.park(parked, "stale").await.unwrap();

        assert_eq!(
            queue
                .rebase(EntityType::Feature, "f-1", first, 700)
                .await
                .unwrap(),
            1
        );

        let base = |op: Option<QueuedOperation>| op.unwrap().base_updated_at;
        assert_eq!(base(queue.get(first).await.unwrap()), Some(100));
        assert_eq!(base(queue.get(second).await.unwrap()), Some(700));
        assert_eq!(base(queue.get(parked).await.unwrap()), Some(100));
        assert_eq!(base(queue.get(unbased).await.unwrap()), None);
        assert_eq!(base(queue.get(other).await.unwrap()), Some(100));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_has_pending() {
        let db = setup().await;
        let queue = LibSqlMutationQueue::new(db.connection());
        queue.enqueue(&update("f-1", 1), 10).await.unwrap();

        assert!(queue.has_pending(EntityType::Feature, "f-1").await.unwrap());
        assert!(!queue.has_pending(EntityType::Feature, "f-2").await.unwrap());
        assert!(!queue.has_pending(EntityType::Correction, "f-1").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rejects_blank_entity_id() {
        let db = setup().await;
        let queue = LibSqlMutationQueue::new(db.connection());
        assert!(matches!(
            queue.enqueue(&update("  ", 1), 10).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
