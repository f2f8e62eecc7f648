//! Reconciliation cycle: push the mutation queue, then pull remote changes.
//!
//! A cycle only starts from a [`SyncSignal`] while online and idle. Triggers
//! that arrive during a running cycle are coalesced into a no-op; there is
//! no internal timer.

mod conflict;
mod retry;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;

pub use conflict::{ConflictResolver, Disposition, FailureOutcome};
pub use retry::RetryPolicy;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::geometry::{self, DEFAULT_SRID};
use crate::models::{EntityType, OperationKind, QueuedOperation};
use crate::remote::{decode_feature, parse_timestamp, RemoteStore};
use crate::services::{LocalStore, MergeOutcome};
use crate::state::{SyncSignal, SyncState};

/// Payload fields that hold geometry on the wire.
const GEOMETRY_FIELDS: [&str; 2] = ["geom", "geom_corrected"];

/// Summary of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Operations confirmed and removed from the queue
    pub pushed: usize,
    /// Operations that failed and were scheduled for another attempt
    pub retried: usize,
    /// Operations skipped because their backoff had not elapsed, or an
    /// earlier operation for the same entity is still waiting
    pub deferred: usize,
    /// Operations parked during this cycle
    pub parked: usize,
    /// Operations skipped because they were already parked
    pub blocked: usize,
    /// Remote records written to the cache
    pub pulled: usize,
    /// Pulled records flagged because local edits are still queued
    pub flagged_for_review: usize,
    /// Pulled records that could not be decoded; the watermark is held at
    /// the oldest of them
    pub skipped_records: usize,
    /// Set when the pull phase stopped early
    pub pull_error: Option<String>,
    pub watermark_advanced: bool,
    pub duration: Duration,
}

/// Result of a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started(CycleReport),
    /// A cycle was already running
    Coalesced,
    /// No connectivity; nothing started
    Offline,
}

/// Running totals over the coordinator's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub cycles: u64,
    pub pushed: u64,
    pub pulled: u64,
    pub retries: u64,
    pub conflicts: u64,
    pub coalesced: u64,
    /// Unix ms of the last cycle start
    pub last_cycle_at: Option<i64>,
    pub last_error: Option<String>,
}

/// Drives reconciliation between the local store and a remote store.
pub struct SyncCoordinator<R> {
    store: LocalStore,
    remote: R,
    clock: Arc<dyn Clock>,
    resolver: ConflictResolver,
    default_srid: u32,
    active_layers: Mutex<Vec<String>>,
    online: AtomicBool,
    running: AtomicBool,
    stats: Mutex<SyncStats>,
}

/// Returns the coordinator to `Idle` however the cycle ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<R: RemoteStore> SyncCoordinator<R> {
    pub fn new(store: LocalStore, remote: R, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            remote,
            clock,
            resolver: ConflictResolver::default(),
            default_srid: DEFAULT_SRID,
            active_layers: Mutex::new(Vec::new()),
            online: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stats: Mutex::new(SyncStats::default()),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.resolver = ConflictResolver::new(policy);
        self
    }

    /// SRID used for geometry that reaches the push phase unencoded.
    #[must_use]
    pub fn with_default_srid(mut self, srid: u32) -> Self {
        self.default_srid = srid;
        self
    }

    #[must_use]
    pub fn with_active_layers(self, layers: Vec<String>) -> Self {
        Self {
            active_layers: Mutex::new(layers),
            ..self
        }
    }

    /// Replace the set of layers pulled on each cycle.
    pub async fn set_active_layers(&self, layers: Vec<String>) {
        *self.active_layers.lock().await = layers;
    }

    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    pub const fn remote(&self) -> &R {
        &self.remote
    }

    pub fn state(&self) -> SyncState {
        if self.running.load(Ordering::Acquire) {
            SyncState::Running
        } else {
            SyncState::Idle
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub async fn stats(&self) -> SyncStats {
        self.stats.lock().await.clone()
    }

    /// Single entry point for everything that may start a cycle.
    pub async fn handle_signal(&self, signal: SyncSignal) -> Result<TriggerOutcome> {
        match signal {
            SyncSignal::ConnectivityLost => {
                self.online.store(false, Ordering::Release);
                return Ok(TriggerOutcome::Offline);
            }
            SyncSignal::ConnectivityRestored => self.online.store(true, Ordering::Release),
            SyncSignal::Startup { online } => self.online.store(online, Ordering::Release),
            SyncSignal::Wake => {}
        }

        if !self.is_online() {
            tracing::debug!(?signal, "Offline; not starting a sync cycle");
            return Ok(TriggerOutcome::Offline);
        }

        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.stats.lock().await.coalesced += 1;
            tracing::debug!(?signal, "Sync cycle already running; trigger coalesced");
            return Ok(TriggerOutcome::Coalesced);
        }
        let _running = RunningGuard(&self.running);

        let cycle_start = self.clock.now_millis();
        match self.run_cycle(cycle_start).await {
            Ok(report) => {
                self.record_cycle(cycle_start, &report).await;
                Ok(TriggerOutcome::Started(report))
            }
            Err(error) => {
                tracing::error!(%error, "Sync cycle aborted");
                let mut stats = self.stats.lock().await;
                stats.cycles += 1;
                stats.last_cycle_at = Some(cycle_start);
                stats.last_error = Some(error.to_string());
                Err(error)
            }
        }
    }

    async fn run_cycle(&self, cycle_start: i64) -> Result<CycleReport> {
        let started = Instant::now();
        let mut report = CycleReport::default();

        self.push(cycle_start, &mut report).await?;
        self.pull(cycle_start, &mut report).await?;

        report.duration = started.elapsed();
        tracing::info!(
            pushed = report.pushed,
            retried = report.retried,
            deferred = report.deferred,
            parked = report.parked,
            pulled = report.pulled,
            watermark_advanced = report.watermark_advanced,
            duration_ms = u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
            "Sync cycle finished"
        );
        Ok(report)
    }

    /// Push every due operation in sequence order. A failure only affects
    /// its own entity: once an operation is waiting on backoff, later
    /// operations for the same entity wait with it.
    async fn push(&self, cycle_start: i64, report: &mut CycleReport) -> Result<()> {
        let operations = self.store.pending_operations().await?;
        let mut held: HashSet<(EntityType, &str)> = HashSet::new();

        for operation in &operations {
            let entity = (operation.entity_type, operation.entity_id.as_str());
            if operation.parked {
                report.blocked += 1;
                continue;
            }
            if held.contains(&entity) || !operation.is_due(cycle_start) {
                held.insert(entity);
                report.deferred += 1;
                continue;
            }

            match self.push_one(operation).await {
                Ok(remote_version) => {
                    self.store.remove_operation(operation.sequence).await?;
                    report.pushed += 1;
                    if let Some(updated_at) = remote_version {
                        self.store
                            .rebase_pending(
                                operation.entity_type,
                                &operation.entity_id,
                                operation.sequence,
                                updated_at,
                            )
                            .await?;
                    }
                    tracing::debug!(
                        sequence = operation.sequence,
                        kind = operation.kind.as_str(),
                        entity_id = %operation.entity_id,
                        "Pushed queued operation"
                    );
                }
                Err(error) => {
                    let now = self.clock.now_millis();
                    match self
                        .resolver
                        .handle(&self.store, operation, &error, now)
                        .await?
                    {
                        FailureOutcome::Parked { .. } => report.parked += 1,
                        FailureOutcome::Retried { .. } => {
                            held.insert(entity);
                            report.retried += 1;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Send one operation. Returns the record's new remote version, if known.
    async fn push_one(&self, operation: &QueuedOperation) -> Result<Option<i64>> {
        let collection = operation.entity_type.collection();
        let remote_version = match operation.kind {
            OperationKind::Insert => {
                let record = self.prepare_payload(operation)?;
                let stored = self.remote.insert(collection, &record).await?;
                stored.get("updated_at").and_then(parse_timestamp)
            }
            OperationKind::Update => {
                let patch = self.prepare_payload(operation)?;
                self.remote
                    .update(
                        collection,
                        &operation.entity_id,
                        &patch,
                        operation.base_updated_at,
                    )
                    .await?
            }
            OperationKind::Delete => {
                self.remote.delete(collection, &operation.entity_id).await?;
                None
            }
        };
        Ok(remote_version)
    }

    /// Check the payload shape and encode any geometry still in object form.
    fn prepare_payload(&self, operation: &QueuedOperation) -> Result<Value> {
        let Value::Object(fields) = &operation.payload else {
            return Err(Error::InvalidInput(format!(
                "{} payload for {} must be an object",
                operation.kind, operation.entity_id
            )));
        };

        let mut fields = fields.clone();
        if operation.kind == OperationKind::Insert {
            fields
                .entry("id")
                .or_insert_with(|| Value::String(operation.entity_id.clone()));
        }
        for field in GEOMETRY_FIELDS {
            if let Some(value) = fields.get_mut(field) {
                if value.is_object() {
                    let decoded = geometry::decode(value)?;
                    *value = Value::String(geometry::encode(&decoded, self.default_srid)?);
                }
            }
        }
        Ok(Value::Object(fields))
    }

    /// Fetch features changed since the watermark and merge them.
    ///
    /// Remote failures end the pull without touching the watermark; they
    /// do not fail the cycle. The watermark stops at the oldest record that
    /// could not be decoded, so it is fetched again next cycle.
    async fn pull(&self, cycle_start: i64, report: &mut CycleReport) -> Result<()> {
        let layers = self.active_layers.lock().await.clone();
        if layers.is_empty() {
            tracing::debug!("No active layers; skipping pull");
            return Ok(());
        }

        let since = self.store.watermark().await?;
        let records = match self
            .remote
            .query_changed_since(EntityType::Feature.collection(), since, &layers)
            .await
        {
            Ok(records) => records,
            Err(error) => {
                tracing::warn!(since, "Pull failed: {}", error);
                report.pull_error = Some(error.to_string());
                return Ok(());
            }
        };

        let mut watermark = cycle_start;
        for record in &records {
            let feature = match decode_feature(record) {
                Ok(feature) => feature,
                Err(error) => {
                    let updated_at = record.get("updated_at").and_then(parse_timestamp);
                    tracing::warn!(
                        id = record.get("id").and_then(serde_json::Value::as_str).unwrap_or("?"),
                        updated_at,
                        "Skipping undecodable remote feature: {}",
                        error
                    );
                    if let Some(updated_at) = updated_at {
                        watermark = watermark.min(updated_at.max(since));
                    }
                    report.skipped_records += 1;
                    continue;
                }
            };
            match self.store.merge_remote_feature(&feature).await? {
                MergeOutcome::Applied => report.pulled += 1,
                MergeOutcome::AppliedNeedsReview => {
                    report.pulled += 1;
                    report.flagged_for_review += 1;
                }
                MergeOutcome::Stale => {}
            }
        }

        self.store.set_watermark(watermark).await?;
        report.watermark_advanced = watermark > since;
        Ok(())
    }

    async fn record_cycle(&self, cycle_start: i64, report: &CycleReport) {
        let mut stats = self.stats.lock().await;
        stats.cycles += 1;
        stats.pushed += report.pushed as u64;
        stats.pulled += report.pulled as u64;
        stats.retries += report.retried as u64;
        stats.conflicts += report.parked as u64;
        stats.last_cycle_at = Some(cycle_start);
        stats.last_error = report.pull_error.clone();
    }
}
