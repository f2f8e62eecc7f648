//! Local feature and correction caches

use crate::error::Result;
use crate::models::{
    Correction, CorrectionId, Feature, FeatureAudit, FeatureId, FeatureLock,
};
use libsql::{Connection, Row};

/// A cached feature with its local review flag.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedFeature {
    pub feature: Feature,
    /// Set when the remote copy replaced a record that still had queued edits,
    /// or when a push for it was parked
    pub needs_review: bool,
}

/// Trait for feature cache operations (async)
#[allow(async_fn_in_trait)]
pub trait FeatureRepository {
    /// Replace the cached record as a whole.
    ///
    /// Returns false, leaving the row untouched, when the cached copy is
    /// newer than `feature`. `needs_review = None` keeps the cached flag
    /// (false for a new row).
    async fn upsert(&self, feature: &Feature, needs_review: Option<bool>) -> Result<bool>;

    async fn get(&self, id: &FeatureId) -> Result<Option<CachedFeature>>;

    async fn list_by_layer(&self, layer_id: &str) -> Result<Vec<CachedFeature>>;

    async fn list_needing_review(&self) -> Result<Vec<CachedFeature>>;

    async fn set_needs_review(&self, id: &str, needs_review: bool) -> Result<bool>;

    /// Overwrite the advisory lock metadata
    async fn set_lock(&self, id: &FeatureId, lock: Option<&FeatureLock>) -> Result<bool>;

    async fn delete(&self, id: &FeatureId) -> Result<bool>;
}

/// libSQL implementation of `FeatureRepository`
pub struct LibSqlFeatureRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlFeatureRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    const COLUMNS: &'static str = "id, layer_id, geometry, properties, status, \
         lock_holder, lock_acquired_at, lock_expires_at, corrected_by, corrected_at, \
         validated_by, validated_at, created_at, updated_at, needs_review";

    fn parse_feature(row: &Row) -> Result<CachedFeature> {
        let id: String = row.get(0)?;
        let geometry: String = row.get(2)?;
        let properties: String = row.get(3)?;
        let status: String = row.get(4)?;
        let lock_holder: Option<String> = row.get(5)?;
        let lock_acquired_at: Option<i64> = row.get(6)?;
        let lock_expires_at: Option<i64> = row.get(7)?;

        let lock = match (lock_holder, lock_acquired_at, lock_expires_at) {
            (Some(holder), Some(acquired_at), Some(expires_at)) => Some(FeatureLock {
                holder,
                acquired_at,
                expires_at,
            }),
            _ => None,
        };

        Ok(CachedFeature {
            feature: Feature {
                id: id.parse()?,
                layer_id: row.get(1)?,
                geometry: serde_json::from_str(&geometry)?,
                properties: serde_json::from_str(&properties)?,
                status: status.parse()?,
                lock,
                audit: FeatureAudit {
                    corrected_by: row.get(8)?,
                    corrected_at: row.get(9)?,
                    validated_by: row.get(10)?,
                    validated_at: row.get(11)?,
                    created_at: row.get(12)?,
                    updated_at: row.get(13)?,
                },
            },
            needs_review: row.get::<i64>(14)? != 0,
        })
    }

    async fn collect(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<CachedFeature>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut features = Vec::new();
        while let Some(row) = rows.next().await? {
            features.push(Self::parse_feature(&row)?);
        }
        Ok(features)
    }
}

impl FeatureRepository for LibSqlFeatureRepository<'_> {
    async fn upsert(&self, feature: &Feature, needs_review: Option<bool>) -> Result<bool> {
        let geometry = serde_json::to_string(&feature.geometry)?;
        let properties = serde_json::to_string(&feature.properties)?;
        let lock = feature.lock.as_ref();

        let written = self
            .conn
            .execute(
                "INSERT INTO features (
                    id, layer_id, geometry, properties, status,
                    lock_holder, lock_acquired_at, lock_expires_at,
                    corrected_by, corrected_at, validated_by, validated_at,
                    created_at, updated_at, needs_review
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, COALESCE(?15, 0))
                 ON CONFLICT(id) DO UPDATE SET
                    layer_id = excluded.layer_id,
                    geometry = excluded.geometry,
                    properties = excluded.properties,
                    status = excluded.status,
                    lock_holder = excluded.lock_holder,
                    lock_acquired_at = excluded.lock_acquired_at,
                    lock_expires_at = excluded.lock_expires_at,
                    corrected_by = excluded.corrected_by,
                    corrected_at = excluded.corrected_at,
                    validated_by = excluded.validated_by,
                    validated_at = excluded.validated_at,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at,
                    needs_review = COALESCE(?15, features.needs_review)
                 WHERE excluded.updated_at >= features.updated_at",
                libsql::params![
                    feature.id.as_str(),
                    feature.layer_id.as_str(),
                    geometry,
                    properties,
                    feature.status.as_str(),
                    lock.map(|lock| lock.holder.clone()),
                    lock.map(|lock| lock.acquired_at),
                    lock.map(|lock| lock.expires_at),
                    feature.audit.corrected_by.clone(),
                    feature.audit.corrected_at,
                    feature.audit.validated_by.clone(),
                    feature.audit.validated_at,
                    feature.audit.created_at,
                    feature.audit.updated_at,
                    needs_review.map(i64::from),
                ],
            )
            .await?;

        if written == 0 {
            tracing::debug!(
                feature_id = %feature.id,
                updated_at = feature.audit.updated_at,
                "Skipped stale feature write"
            );
        }
        Ok(written > 0)
    }

    async fn get(&self, id: &FeatureId) -> Result<Option<CachedFeature>> {
        let sql = format!("SELECT {} FROM features WHERE id = ?", Self::COLUMNS);
        Ok(self.collect(&sql, [id.as_str()]).await?.into_iter().next())
    }

    async fn list_by_layer(&self, layer_id: &str) -> Result<Vec<CachedFeature>> {
        let sql = format!(
            "SELECT {} FROM features WHERE layer_id = ? ORDER BY id ASC",
            Self::COLUMNS
        );
        self.collect(&sql, [layer_id]).await
    }

    async fn list_needing_review(&self) -> Result<Vec<CachedFeature>> {
        let sql = format!(
            "SELECT {} FROM features WHERE needs_review = 1 ORDER BY updated_at DESC",
            Self::COLUMNS
        );
        self.collect(&sql, ()).await
    }

    async fn set_needs_review(&self, id: &str, needs_review: bool) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE features SET needs_review = ? WHERE id = ?",
                libsql::params![i64::from(needs_review), id],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn set_lock(&self, id: &FeatureId, lock: Option<&FeatureLock>) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE features
                 SET lock_holder = ?, lock_acquired_at = ?, lock_expires_at = ?
                 WHERE id = ?",
                libsql::params![
                    lock.map(|lock| lock.holder.clone()),
                    lock.map(|lock| lock.acquired_at),
                    lock.map(|lock| lock.expires_at),
                    id.as_str(),
                ],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn delete(&self, id: &FeatureId) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM features WHERE id = ?", [id.as_str()])
            .await?;
        Ok(deleted > 0)
    }
}

/// Trait for locally authored corrections (async)
#[allow(async_fn_in_trait)]
pub trait CorrectionRepository {
    /// Store a correction, replacing an earlier copy with the same id
    async fn save(&self, correction: &Correction) -> Result<()>;

    async fn get(&self, id: CorrectionId) -> Result<Option<Correction>>;

    /// Corrections of one feature, oldest first
    async fn list_for_feature(&self, feature_id: &FeatureId) -> Result<Vec<Correction>>;
}

/// libSQL implementation of `CorrectionRepository`
pub struct LibSqlCorrectionRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlCorrectionRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl CorrectionRepository for LibSqlCorrectionRepository<'_> {
    async fn save(&self, correction: &Correction) -> Result<()> {
        let record = serde_json::to_string(correction)?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO corrections (id, feature_id, status, created_at, record)
                 VALUES (?, ?, ?, ?, ?)",
                libsql::params![
                    correction.id().as_str(),
                    correction.feature_id().as_str(),
                    correction.status().as_str(),
                    correction.created_at(),
                    record,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: CorrectionId) -> Result<Option<Correction>> {
        let mut rows = self
            .conn
            .query("SELECT record FROM corrections WHERE id = ?", [id.as_str()])
            .await?;
        match rows.next().await? {
            Some(row) => {
                let record: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&record)?))
            }
            None => Ok(None),
        }
    }

    async fn list_for_feature(&self, feature_id: &FeatureId) -> Result<Vec<Correction>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record FROM corrections WHERE feature_id = ?
                 ORDER BY created_at ASC, id ASC",
                [feature_id.as_str()],
            )
            .await?;
        let mut corrections = Vec::new();
        while let Some(row) = rows.next().await? {
            let record: String = row.get(0)?;
            corrections.push(serde_json::from_str(&record)?);
        }
        Ok(corrections)
    }
}
