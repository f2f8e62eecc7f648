//! Shared local store wrapper used by producers and the sync coordinator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use libsql::Connection;
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::db::{
    CachedFeature, ConflictRepository, CorrectionRepository, Database, FeatureRepository,
    LibSqlConflictRepository, LibSqlCorrectionRepository, LibSqlFeatureRepository,
    LibSqlMutationQueue, LibSqlSyncStateRepository, MutationQueue, SyncStateRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    ConflictKind, ConflictResolution, Correction, EntityType, Feature, FeatureId, FeatureLock,
    Mutation, QueuedOperation, SyncConflict,
};

/// What happened to one remote record during pull-merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Cached copy replaced
    Applied,
    /// Cached copy replaced, but local edits are still queued for it
    AppliedNeedsReview,
    /// Cached copy is newer; nothing written
    Stale,
}

/// Thread-safe handle over the local database.
///
/// Every call takes the connection lock for its whole duration, so cache,
/// queue and watermark writes never interleave.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl LocalStore {
    /// Open a store at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::open(&db_path).await?;
        tracing::info!(path = %db_path.display(), "Opened local store");
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
            clock: Arc::new(SystemClock),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
            clock: Arc::new(SystemClock),
        })
    }

    /// Stamp locally created rows with `clock` instead of the system time.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    // Queue

    /// Append a write to the queue; durable once this returns.
    pub async fn enqueue(&self, mutation: &Mutation) -> Result<i64> {
        let now = self.clock.now_millis();
        let db = self.db.lock().await;
        LibSqlMutationQueue::new(db.connection())
            .enqueue(mutation, now)
            .await
    }

    /// Save a locally edited feature and queue its write in one transaction.
    ///
    /// The review flag is left as it is: a new edit does not settle a
    /// parked conflict.
    pub async fn record_feature_edit(&self, feature: &Feature, mutation: &Mutation) -> Result<i64> {
        let now = self.clock.now_millis();
        let db = self.db.lock().await;
        let conn = db.connection();
        transaction(conn, async {
            LibSqlFeatureRepository::new(conn)
                .upsert(feature, None)
                .await?;
            LibSqlMutationQueue::new(conn).enqueue(mutation, now).await
        })
        .await
    }

    /// Drop a feature from the cache and queue its delete in one transaction.
    pub async fn record_feature_delete(&self, id: &FeatureId, mutation: &Mutation) -> Result<i64> {
        let now = self.clock.now_millis();
        let db = self.db.lock().await;
        let conn = db.connection();
        transaction(conn, async {
            LibSqlFeatureRepository::new(conn).delete(id).await?;
            LibSqlMutationQueue::new(conn).enqueue(mutation, now).await
        })
        .await
    }

    /// Save a correction and queue its write in one transaction.
    pub async fn record_correction(
        &self,
        correction: &Correction,
        mutation: &Mutation,
    ) -> Result<i64> {
        let now = self.clock.now_millis();
        let db = self.db.lock().await;
        let conn = db.connection();
        transaction(conn, async {
            LibSqlCorrectionRepository::new(conn).save(correction).await?;
            LibSqlMutationQueue::new(conn).enqueue(mutation, now).await
        })
        .await
    }

    /// Queued operations in push order. Nothing is removed.
    pub async fn pending_operations(&self) -> Result<Vec<QueuedOperation>> {
        let db = self.db.lock().await;
        LibSqlMutationQueue::new(db.connection()).drain().await
    }

    pub async fn get_operation(&self, sequence: i64) -> Result<Option<QueuedOperation>> {
        let db = self.db.lock().await;
        LibSqlMutationQueue::new(db.connection()).get(sequence).await
    }

    pub async fn remove_operation(&self, sequence: i64) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlMutationQueue::new(db.connection())
            .remove(sequence)
            .await
    }

    /// Record a failed push and return the new attempt count.
    pub async fn mark_retry(
        &self,
        sequence: i64,
        next_attempt_at: i64,
        error: &str,
    ) -> Result<u32> {
        let db = self.db.lock().await;
        LibSqlMutationQueue::new(db.connection())
            .mark_retry(sequence, next_attempt_at, error)
            .await
    }

    /// Carry a confirmed remote version forward to the entity's later
    /// queued writes, so they are not rejected by our own earlier push.
    pub async fn rebase_pending(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        after_sequence: i64,
        base_updated_at: i64,
    ) -> Result<usize> {
        let db = self.db.lock().await;
        LibSqlMutationQueue::new(db.connection())
            .rebase(entity_type, entity_id, after_sequence, base_updated_at)
            .await
    }

    pub async fn queue_len(&self) -> Result<usize> {
        let db = self.db.lock().await;
        LibSqlMutationQueue::new(db.connection()).count().await
    }

    /// Park `operation`, log the conflict and flag the affected feature.
    pub async fn park_operation(
        &self,
        operation: &QueuedOperation,
        kind: ConflictKind,
        message: &str,
        detected_at: i64,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        let conn = db.connection();
        transaction(conn, async {
            LibSqlMutationQueue::new(conn)
                .park(operation.sequence, message)
                .await?;
            let conflict_id = LibSqlConflictRepository::new(conn)
                .record(
                    operation.sequence,
                    operation.entity_type,
                    &operation.entity_id,
                    kind,
                    message,
                    detected_at,
                )
                .await?;
            if let Some(feature_id) = affected_feature(operation) {
                LibSqlFeatureRepository::new(conn)
                    .set_needs_review(feature_id, true)
                    .await?;
            }
            Ok::<_, Error>(conflict_id)
        })
        .await
    }

    // Cache

    /// Merge one record fetched from the remote.
    ///
    /// The remote copy always replaces the cached one. It is flagged for
    /// review when local writes for the same feature are still queued.
    pub async fn merge_remote_feature(&self, feature: &Feature) -> Result<MergeOutcome> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let pending = LibSqlMutationQueue::new(conn)
            .has_pending(EntityType::Feature, feature.id.as_str())
            .await?;
        let applied = LibSqlFeatureRepository::new(conn)
            .upsert(feature, Some(pending))
            .await?;
        Ok(match (applied, pending) {
            (false, _) => MergeOutcome::Stale,
            (true, true) => MergeOutcome::AppliedNeedsReview,
            (true, false) => MergeOutcome::Applied,
        })
    }

    pub async fn get_feature(&self, id: &FeatureId) -> Result<Option<CachedFeature>> {
        let db = self.db.lock().await;
        LibSqlFeatureRepository::new(db.connection()).get(id).await
    }

    pub async fn list_features(&self, layer_id: &str) -> Result<Vec<CachedFeature>> {
        let db = self.db.lock().await;
        LibSqlFeatureRepository::new(db.connection())
            .list_by_layer(layer_id)
            .await
    }

    pub async fn list_features_needing_review(&self) -> Result<Vec<CachedFeature>> {
        let db = self.db.lock().await;
        LibSqlFeatureRepository::new(db.connection())
            .list_needing_review()
            .await
    }

    /// Refresh advisory lock metadata after a lease round-trip.
    pub async fn set_lock_metadata(
        &self,
        feature_id: &FeatureId,
        lock: Option<&FeatureLock>,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlFeatureRepository::new(db.connection())
            .set_lock(feature_id, lock)
            .await
    }

    pub async fn list_corrections(&self, feature_id: &FeatureId) -> Result<Vec<Correction>> {
        let db = self.db.lock().await;
        LibSqlCorrectionRepository::new(db.connection())
            .list_for_feature(feature_id)
            .await
    }

    // Watermark

    pub async fn watermark(&self) -> Result<i64> {
        let db = self.db.lock().await;
        LibSqlSyncStateRepository::new(db.connection())
            .watermark()
            .await
    }

    pub async fn set_watermark(&self, millis: i64) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlSyncStateRepository::new(db.connection())
            .set_watermark(millis)
            .await
    }

    // Conflicts

    /// List conflicts newest first; `open_only` hides resolved ones.
    pub async fn list_conflicts(&self, limit: usize, open_only: bool) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        let repo = LibSqlConflictRepository::new(db.connection());
        if open_only {
            repo.list_open(limit).await
        } else {
            repo.list(limit).await
        }
    }

    /// Apply a manual decision to a parked operation.
    pub async fn resolve_conflict(&self, id: i64, resolution: ConflictResolution) -> Result<()> {
        let now = self.clock.now_millis();
        let db = self.db.lock().await;
        let conn = db.connection();
        let conflicts = LibSqlConflictRepository::new(conn);

        let conflict = conflicts
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sync conflict {id}")))?;
        if !conflict.is_open() {
            return Err(Error::InvalidInput(format!(
                "sync conflict {id} is already resolved"
            )));
        }

        transaction(conn, async {
            let queue = LibSqlMutationQueue::new(conn);
            match &resolution {
                ConflictResolution::DiscardLocal => {
                    queue.remove(conflict.sequence).await?;
                    if conflict.entity_type == EntityType::Feature
                        && !queue
                            .has_pending(EntityType::Feature, &conflict.entity_id)
                            .await?
                    {
                        LibSqlFeatureRepository::new(conn)
                            .set_needs_review(&conflict.entity_id, false)
                            .await?;
                    }
                }
                ConflictResolution::RetryLocal => {
                    queue.unpark(conflict.sequence, None).await?;
                }
                ConflictResolution::Replace {
                    payload,
                    base_updated_at,
                } => {
                    queue
                        .unpark(conflict.sequence, Some((payload, *base_updated_at)))
                        .await?;
                }
            }
            conflicts
                .mark_resolved(id, resolution.as_str(), now)
                .await?;
            Ok::<_, Error>(())
        })
        .await?;

        tracing::info!(
            conflict_id = id,
            sequence = conflict.sequence,
            resolution = resolution.as_str(),
            "Resolved sync conflict"
        );
        Ok(())
    }
}

/// Feature whose cached copy a parked operation leaves out of date.
fn affected_feature(operation: &QueuedOperation) -> Option<&str> {
    match operation.entity_type {
        EntityType::Feature => Some(operation.entity_id.as_str()),
        EntityType::Correction => operation.payload.get("feature_id")?.as_str(),
        EntityType::Layer => None,
    }
}

/// Run `work` between BEGIN and COMMIT, rolling back if it fails.
async fn transaction<T>(
    conn: &Connection,
    work: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    conn.execute("BEGIN TRANSACTION", ()).await?;
    match work.await {
        Ok(value) => {
            if let Err(e) = conn.execute("COMMIT", ()).await {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(e.into());
            }
            Ok(value)
        }
        Err(error) => {
            conn.execute("ROLLBACK", ()).await.ok();
            Err(error)
        }
    }
}
