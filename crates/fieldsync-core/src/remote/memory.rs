//! In-process remote store for offline development and tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::record::parse_timestamp;
use super::{LockGrant, RemoteError, RemoteResult, RemoteStore, DEFAULT_LEASE_MILLIS};
use crate::clock::Clock;
use crate::models::{FeatureLock, OperationKind};
use crate::util::millis_to_rfc3339;

/// Which calls an injected failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureTarget {
    /// insert, update, delete
    Write,
    /// query_changed_since
    Query,
    /// acquire_lock, release_lock
    Lock,
}

/// Failure returned instead of performing the next matching call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFailure {
    Transient,
    Conflict,
    Rejected(u16),
}

impl InjectedFailure {
    fn into_error(self) -> RemoteError {
        match self {
            Self::Transient => RemoteError::Transient("injected transient failure".into()),
            Self::Conflict => RemoteError::Conflict("injected conflict".into()),
            Self::Rejected(status) => RemoteError::Rejected {
                status,
                message: "injected rejection".into(),
            },
        }
    }
}

/// A write the store accepted, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteWrite {
    pub kind: OperationKind,
    pub collection: String,
    pub id: String,
    pub payload: Value,
}

#[derive(Default)]
struct State {
    collections: HashMap<String, BTreeMap<String, Value>>,
    locks: HashMap<String, FeatureLock>,
    writes: Vec<RemoteWrite>,
    failures: VecDeque<(FailureTarget, InjectedFailure)>,
    offline: bool,
}

impl State {
    fn check(&mut self, target: FailureTarget) -> RemoteResult<()> {
        if self.offline {
            return Err(RemoteError::Transient("remote unreachable".into()));
        }
        if let Some(index) = self.failures.iter().position(|(t, _)| *t == target) {
            if let Some((_, failure)) = self.failures.remove(index) {
                return Err(failure.into_error());
            }
        }
        Ok(())
    }

    fn with_lock(&self, id: &str, record: &Value, now: i64) -> Value {
        let mut record = record.clone();
        if let Value::Object(fields) = &mut record {
            match self.locks.get(id).filter(|lock| lock.is_active(now)) {
                Some(lock) => {
                    fields.insert("locked_by".into(), Value::String(lock.holder.clone()));
                    fields.insert("locked_at".into(), millis_to_rfc3339(lock.acquired_at).into());
                    fields.insert(
                        "lock_expires_at".into(),
                        millis_to_rfc3339(lock.expires_at).into(),
                    );
                }
                None => {
                    fields.insert("locked_by".into(), Value::Null);
                    fields.insert("locked_at".into(), Value::Null);
                    fields.insert("lock_expires_at".into(), Value::Null);
                }
            }
        }
        record
    }
}

/// Remote store held in memory.
///
/// Stamps `updated_at` on every write with the injected clock, enforces the
/// `updated_at` precondition on updates and grants time-limited leases.
/// Lease changes do not touch `updated_at`. Clones share state.
#[derive(Clone)]
pub struct InMemoryRemoteStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
    lease_millis: i64,
}

impl InMemoryRemoteStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
            lease_millis: DEFAULT_LEASE_MILLIS,
        }
    }

    #[must_use]
    pub const fn with_lease_millis(mut self, lease_millis: i64) -> Self {
        self.lease_millis = lease_millis;
        self
    }

    /// Store `record` as-is, bypassing the write log.
    pub async fn seed(&self, collection: &str, record: Value) -> RemoteResult<()> {
        let id = record_id(&record)?;
        let mut state = self.state.lock().await;
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id, record);
        Ok(())
    }

    /// Simulate another client editing a record: merge `patch` and bump
    /// `updated_at`, bypassing the write log.
    pub async fn touch(&self, collection: &str, id: &str, patch: &Value) -> RemoteResult<()> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().await;
        let record = state
            .collections
            .get_mut(collection)
            .and_then(|records| records.get_mut(id))
            .ok_or_else(|| not_found(collection, id))?;
        merge(record, patch, now);
        Ok(())
    }

    pub async fn record(&self, collection: &str, id: &str) -> Option<Value> {
        let now = self.clock.now_millis();
        let state = self.state.lock().await;
        state
            .collections
            .get(collection)
            .and_then(|records| records.get(id))
            .map(|record| state.with_lock(id, record, now))
    }

    /// Accepted writes in arrival order.
    pub async fn writes(&self) -> Vec<RemoteWrite> {
        self.state.lock().await.writes.clone()
    }

    /// Current non-expired lease on a feature.
    pub async fn lock(&self, feature_id: &str) -> Option<FeatureLock> {
        let now = self.clock.now_millis();
        let state = self.state.lock().await;
        state
            .locks
            .get(feature_id)
            .filter(|lock| lock.is_active(now))
            .cloned()
    }

    /// Fail the next call matching `target` with `failure`.
    pub async fn inject_failure(&self, target: FailureTarget, failure: InjectedFailure) {
        self.state.lock().await.failures.push_back((target, failure));
    }

    /// While offline every call fails as transient.
    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }
}

impl RemoteStore for InMemoryRemoteStore {
    async fn insert(&self, collection: &str, record: &Value) -> RemoteResult<Value> {
        let now = self.clock.now_millis();
        let id = record_id(record)?;
        let mut state = self.state.lock().await;
        state.check(FailureTarget::Write)?;

        let records = state.collections.entry(collection.to_string()).or_default();
        if let Some(existing) = records.get(&id) {
            return Ok(existing.clone());
        }

        let mut stored = record.clone();
        if let Value::Object(fields) = &mut stored {
            fields.insert("updated_at".into(), millis_to_rfc3339(now).into());
            fields
                .entry("created_at")
                .or_insert_with(|| millis_to_rfc3339(now).into());
        }
        records.insert(id.clone(), stored.clone());
        state.writes.push(RemoteWrite {
            kind: OperationKind::Insert,
            collection: collection.to_string(),
            id,
            payload: record.clone(),
        });
        Ok(stored)
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: &Value,
        base_updated_at: Option<i64>,
    ) -> RemoteResult<Option<i64>> {
        if !patch.is_object() {
            return Err(RemoteError::InvalidPayload("patch must be an object".into()));
        }
        let now = self.clock.now_millis();
        let mut state = self.state.lock().await;
        state.check(FailureTarget::Write)?;

        let record = state
            .collections
            .get_mut(collection)
            .and_then(|records| records.get_mut(id))
            .ok_or_else(|| not_found(collection, id))?;

        if let Some(base) = base_updated_at {
            let current = record.get("updated_at").and_then(parse_timestamp);
            if current.is_some_and(|current| current > base) {
                return Err(RemoteError::Conflict(format!(
                    "{collection}/{id} changed after {}",
                    millis_to_rfc3339(base)
                )));
            }
        }

        merge(record, patch, now);
        state.writes.push(RemoteWrite {
            kind: OperationKind::Update,
            collection: collection.to_string(),
            id: id.to_string(),
            payload: patch.clone(),
        });
        Ok(Some(now))
    }

    async fn delete(&self, collection: &str, id: &str) -> RemoteResult<()> {
        let mut state = self.state.lock().await;
        state.check(FailureTarget::Write)?;

        if let Some(records) = state.collections.get_mut(collection) {
            records.remove(id);
        }
        state.locks.remove(id);
        state.writes.push(RemoteWrite {
            kind: OperationKind::Delete,
            collection: collection.to_string(),
            id: id.to_string(),
            payload: Value::Null,
        });
        Ok(())
    }

    async fn query_changed_since(
        &self,
        collection: &str,
        since_millis: i64,
        layer_ids: &[String],
    ) -> RemoteResult<Vec<Value>> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().await;
        state.check(FailureTarget::Query)?;

        let Some(records) = state.collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut changed: Vec<(i64, &String, &Value)> = records
            .iter()
            .filter_map(|(id, record)| {
                let updated_at = record.get("updated_at").and_then(parse_timestamp)?;
                Some((updated_at, id, record))
            })
            .filter(|(updated_at, _, _)| *updated_at >= since_millis)
            .filter(|(_, _, record)| {
                layer_ids.is_empty()
                    || record
                        .get("layer_id")
                        .and_then(Value::as_str)
                        .is_some_and(|layer| layer_ids.iter().any(|id| id == layer))
            })
            .collect();
        changed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));

        Ok(changed
            .into_iter()
            .map(|(_, id, record)| state.with_lock(id, record, now))
            .collect())
    }

    async fn acquire_lock(&self, feature_id: &str, holder_id: &str) -> RemoteResult<LockGrant> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().await;
        state.check(FailureTarget::Lock)?;

        let current = state
            .locks
            .get(feature_id)
            .filter(|lock| lock.is_active(now))
            .cloned();

        if let Some(lock) = &current {
            if lock.holder != holder_id {
                return Ok(LockGrant {
                    acquired: false,
                    holder: Some(lock.holder.clone()),
                    expires_at: Some(lock.expires_at),
                });
            }
        }

        let lock = FeatureLock {
            holder: holder_id.to_string(),
            acquired_at: current.map_or(now, |lock| lock.acquired_at),
            expires_at: now + self.lease_millis,
        };
        let expires_at = lock.expires_at;
        state.locks.insert(feature_id.to_string(), lock);

        Ok(LockGrant {
            acquired: true,
            holder: Some(holder_id.to_string()),
            expires_at: Some(expires_at),
        })
    }

    async fn release_lock(&self, feature_id: &str) -> RemoteResult<()> {
        let mut state = self.state.lock().await;
        state.check(FailureTarget::Lock)?;
        state.locks.remove(feature_id);
        Ok(())
    }
}

fn record_id(record: &Value) -> RemoteResult<String> {
    match record.get("id") {
        Some(Value::String(id)) if !id.trim().is_empty() => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => Err(RemoteError::InvalidPayload("record has no id".into())),
    }
}

fn not_found(collection: &str, id: &str) -> RemoteError {
    RemoteError::Rejected {
        status: 404,
        message: format!("{collection}/{id} not found"),
    }
}

fn merge(record: &mut Value, patch: &Value, now: i64) {
    if let Value::Object(fields) = record {
        if let Value::Object(changes) = patch {
            for (key, value) in changes {
                fields.insert(key.clone(), value.clone());
            }
        }
        fields.insert("updated_at".into(), millis_to_rfc3339(now).into());
    } else {
        let mut fields = Map::new();
        fields.insert("updated_at".into(), millis_to_rfc3339(now).into());
        *record = Value::Object(fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn store(clock: &ManualClock) -> InMemoryRemoteStore {
        InMemoryRemoteStore::new(Arc::new(clock.clone())).with_lease_millis(1_000)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn insert_is_idempotent_by_id() {
        let clock = ManualClock::new(10_000);
        let remote = store(&clock);

        let first = remote
            .insert("features", &json!({"id": "f-1", "status": "draft"}))
            .await
            .unwrap();
        clock.advance(500);
        let second = remote
            .insert("features", &json!({"id": "f-1", "status": "pending"}))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(remote.writes().await.len(), 1);
        assert_eq!(
            parse_timestamp(&first["updated_at"]),
            Some(10_000),
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_enforces_updated_at_precondition() {
        let clock = ManualClock::new(1_000);
        let remote = store(&clock);
        remote
            .insert("features", &json!({"id": "f-1", "status": "draft"}))
            .await
            .unwrap();

        clock.set(2_000);
        let updated_at = remote
            .update("features", "f-1", &json!({"status": "pending"}), Some(1_000))
            .await
            .unwrap();
        assert_eq!(updated_at, Some(2_000));

        clock.set(3_000);
        let stale = remote
            .update("features", "f-1", &json!({"status": "locked"}), Some(1_000))
            .await;
        assert!(matches!(stale, Err(RemoteError::Conflict(_))));

        remote
            .update("features", "f-1", &json!({"status": "locked"}), None)
            .await
            .unwrap();
        let record = remote.record("features", "f-1").await.unwrap();
        assert_eq!(record["status"], json!("locked"));
        assert_eq!(parse_timestamp(&record["updated_at"]), Some(3_000));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_missing_record_is_rejected() {
        let clock = ManualClock::new(0);
        let remote = store(&clock);
        let result = remote.update("features", "nope", &json!({}), None).await;
        assert!(matches!(
            result,
            Err(RemoteError::Rejected { status: 404, .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_is_idempotent() {
        let clock = ManualClock::new(0);
        let remote = store(&clock);
        remote.delete("features", "ghost").await.unwrap();
        remote.delete("features", "ghost").await.unwrap();
        assert_eq!(remote.writes().await.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn query_filters_by_time_and_layer() {
        let clock = ManualClock::new(0);
        let remote = store(&clock);
        remote
            .seed("features", json!({"id": "a", "layer_id": "parcels", "updated_at": 100}))
            .await
            .unwrap();
        remote
            .seed("features", json!({"id": "b", "layer_id": "roads", "updated_at": 300}))
            .await
            .unwrap();
        remote
            .seed("features", json!({"id": "c", "layer_id": "parcels", "updated_at": 200}))
            .await
            .unwrap();

        let layers = vec!["parcels".to_string()];
        let changed = remote
            .query_changed_since("features", 150, &layers)
            .await
            .unwrap();
        let ids: Vec<_> = changed.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!("c")]);

        let all = remote.query_changed_since("features", 0, &[]).await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!("a"), json!("c"), json!("b")]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn leases_are_exclusive_until_expiry() {
        let clock = ManualClock::new(0);
        let remote = store(&clock);

        assert!(remote.acquire_lock("f-1", "agent-a").await.unwrap().acquired);
        let denied = remote.acquire_lock("f-1", "agent-b").await.unwrap();
        assert!(!denied.acquired);
        assert_eq!(denied.holder.as_deref(), Some("agent-a"));

        clock.advance(1_000);
        assert!(remote.acquire_lock("f-1", "agent-b").await.unwrap().acquired);
        assert_eq!(remote.lock("f-1").await.unwrap().holder, "agent-b");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn same_holder_refreshes_lease() {
        let clock = ManualClock::new(0);
        let remote = store(&clock);
        remote.acquire_lock("f-1", "agent-a").await.unwrap();

        clock.advance(600);
        let refreshed = remote.acquire_lock("f-1", "agent-a").await.unwrap();
        assert_eq!(refreshed.expires_at, Some(1_600));

        let lock = remote.lock("f-1").await.unwrap();
        assert_eq!(lock.acquired_at, 0);
        assert_eq!(lock.expires_at, 1_600);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn locks_show_on_records_without_bumping_updated_at() {
        let clock = ManualClock::new(500);
        let remote = store(&clock);
        remote
            .seed("features", json!({"id": "f-1", "layer_id": "parcels", "updated_at": 100}))
            .await
            .unwrap();

        remote.acquire_lock("f-1", "agent-a").await.unwrap();
        let record = remote.record("features", "f-1").await.unwrap();
        assert_eq!(record["locked_by"], json!("agent-a"));
        assert_eq!(record["updated_at"], json!(100));

        remote.release_lock("f-1").await.unwrap();
        remote.release_lock("f-1").await.unwrap();
        let record = remote.record("features", "f-1").await.unwrap();
        assert_eq!(record["locked_by"], Value::Null);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn injected_failures_hit_matching_calls_once() {
        let clock = ManualClock::new(0);
        let remote = store(&clock);
        remote
            .inject_failure(FailureTarget::Query, InjectedFailure::Transient)
            .await;
        remote
            .inject_failure(FailureTarget::Write, InjectedFailure::Rejected(422))
            .await;

        assert!(matches!(
            remote.insert("features", &json!({"id": "x"})).await,
            Err(RemoteError::Rejected { status: 422, .. })
        ));
        assert!(remote.insert("features", &json!({"id": "x"})).await.is_ok());
        assert!(matches!(
            remote.query_changed_since("features", 0, &[]).await,
            Err(RemoteError::Transient(_))
        ));
        assert!(remote.query_changed_since("features", 0, &[]).await.is_ok());

        remote.set_offline(true).await;
        assert!(remote.acquire_lock("x", "agent").await.unwrap_err().is_transient());
    }
}
