//! Client side of the feature lease protocol.
//!
//! The remote decides who holds a feature; every answer here comes from a
//! round-trip. The cached lock metadata is refreshed afterwards for display.

use std::sync::Arc;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::{FeatureId, FeatureLock};
use crate::remote::{RemoteStore, DEFAULT_LEASE_MILLIS};
use crate::services::LocalStore;

pub struct LockManager<R> {
    remote: R,
    store: LocalStore,
    clock: Arc<dyn Clock>,
}

impl<R: RemoteStore> LockManager<R> {
    pub fn new(remote: R, store: LocalStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            remote,
            store,
            clock,
        }
    }

    /// Try to take (or refresh) the lease on `feature_id` for `holder_id`.
    ///
    /// Returns false when another holder has a live lease. Errors only when
    /// the remote could not answer.
    pub async fn acquire(&self, feature_id: &FeatureId, holder_id: &str) -> Result<bool> {
        let holder_id = holder_id.trim();
        if holder_id.is_empty() {
            return Err(Error::InvalidInput("holder id must not be empty".into()));
        }

        let grant = self
            .remote
            .acquire_lock(feature_id.as_str(), holder_id)
            .await?;
        let now = self.clock.now_millis();

        let advisory = if grant.acquired {
            Some(FeatureLock {
                holder: holder_id.to_string(),
                acquired_at: now,
                expires_at: grant
                    .expires_at
                    .unwrap_or_else(|| now.saturating_add(DEFAULT_LEASE_MILLIS)),
            })
        } else {
            match (grant.holder, grant.expires_at) {
                (Some(holder), Some(expires_at)) => Some(FeatureLock {
                    holder,
                    acquired_at: now,
                    expires_at,
                }),
                _ => None,
            }
        };
        self.refresh_advisory(feature_id, advisory.as_ref()).await;

        tracing::debug!(
            feature_id = %feature_id,
            holder_id,
            acquired = grant.acquired,
            "Lock request answered"
        );
        Ok(grant.acquired)
    }

    /// Drop the lease on `feature_id`. Releasing a free feature succeeds.
    pub async fn release(&self, feature_id: &FeatureId) -> Result<()> {
        self.remote.release_lock(feature_id.as_str()).await?;
        self.refresh_advisory(feature_id, None).await;
        tracing::debug!(feature_id = %feature_id, "Lock released");
        Ok(())
    }

    /// Last known lease holder, for display only.
    pub async fn advisory_holder(&self, feature_id: &FeatureId) -> Result<Option<String>> {
        let now = self.clock.now_millis();
        Ok(self
            .store
            .get_feature(feature_id)
            .await?
            .and_then(|cached| cached.feature.active_lock_holder(now).map(str::to_string)))
    }

    async fn refresh_advisory(&self, feature_id: &FeatureId, lock: Option<&FeatureLock>) {
        // Cache trouble must not change the remote's answer
        if let Err(error) = self.store.set_lock_metadata(feature_id, lock).await {
            tracing::warn!(feature_id = %feature_id, "Failed to cache lock metadata: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::geometry::{Coord, Geometry};
    use crate::models::Feature;
    use crate::remote::{FailureTarget, InMemoryRemoteStore, InjectedFailure};

    struct Fixture {
        clock: ManualClock,
        remote: InMemoryRemoteStore,
        store: LocalStore,
        feature: Feature,
    }

    impl Fixture {
        async fn new() -> Self {
            let clock = ManualClock::new(1_000);
            let remote = InMemoryRemoteStore::new(Arc::new(clock.clone())).with_lease_millis(500);
            let store = LocalStore::open_in_memory().await.unwrap();
            let mut feature = Feature::new("parcels", Geometry::Point(Coord::new(0.0, 0.0)), 1_000);
            feature.audit.updated_at = 1_000;
            store.merge_remote_feature(&feature).await.unwrap();
            Self {
                clock,
                remote,
                store,
                feature,
            }
        }

        fn manager(&self) -> LockManager<InMemoryRemoteStore> {
            LockManager::new(
                self.remote.clone(),
                self.store.clone(),
                Arc::new(self.clock.clone()),
            )
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn only_one_holder_wins() {
        let fx = Fixture::new().await;
        let agent_a = fx.manager();
        let agent_b = fx.manager();

        let a = agent_a.acquire(&fx.feature.id, "agent-a").await.unwrap();
        let b = agent_b.acquire(&fx.feature.id, "agent-b").await.unwrap();
        assert!(a);
        assert!(!b);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expired_lease_can_be_taken() {
        let fx = Fixture::new().await;
        let manager = fx.manager();

        assert!(manager.acquire(&fx.feature.id, "agent-a").await.unwrap());
        fx.clock.advance(500);
        assert!(manager.acquire(&fx.feature.id, "agent-b").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn same_holder_refreshes() {
        let fx = Fixture::new().await;
        let manager = fx.manager();

        assert!(manager.acquire(&fx.feature.id, "agent-a").await.unwrap());
        fx.clock.advance(400);
        assert!(manager.acquire(&fx.feature.id, "agent-a").await.unwrap());
        fx.clock.advance(400);
        assert!(!manager.acquire(&fx.feature.id, "agent-b").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn release_is_idempotent() {
        let fx = Fixture::new().await;
        let manager = fx.manager();

        manager.release(&fx.feature.id).await.unwrap();
        assert!(manager.acquire(&fx.feature.id, "agent-a").await.unwrap());
        manager.release(&fx.feature.id).await.unwrap();
        manager.release(&fx.feature.id).await.unwrap();
        assert!(manager.acquire(&fx.feature.id, "agent-b").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn advisory_metadata_follows_answers() {
        let fx = Fixture::new().await;
        let manager = fx.manager();

        manager.acquire(&fx.feature.id, "agent-a").await.unwrap();
        assert_eq!(
            manager.advisory_holder(&fx.feature.id).await.unwrap().as_deref(),
            Some("agent-a")
        );

        fx.clock.advance(500);
        assert_eq!(manager.advisory_holder(&fx.feature.id).await.unwrap(), None);

        manager.acquire(&fx.feature.id, "agent-b").await.unwrap();
        manager.release(&fx.feature.id).await.unwrap();
        assert_eq!(manager.advisory_holder(&fx.feature.id).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn denial_caches_the_other_holder() {
        let fx = Fixture::new().await;
        fx.manager().acquire(&fx.feature.id, "agent-a").await.unwrap();

        let manager = fx.manager();
        assert!(!manager.acquire(&fx.feature.id, "agent-b").await.unwrap());
        assert_eq!(
            manager.advisory_holder(&fx.feature.id).await.unwrap().as_deref(),
            Some("agent-a")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transport_failure_is_an_error() {
        let fx = Fixture::new().await;
        let manager = fx.manager();
        fx.remote
            .inject_failure(FailureTarget::Lock, InjectedFailure::Transient)
            .await;

        let result = manager.acquire(&fx.feature.id, "agent-a").await;
        assert!(matches!(result, Err(Error::Remote(error)) if error.is_transient()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blank_holder_is_rejected() {
        let fx = Fixture::new().await;
        assert!(matches!(
            fx.manager().acquire(&fx.feature.id, " ").await,
            Err(Error::InvalidInput(_))
        ));
    }
}
