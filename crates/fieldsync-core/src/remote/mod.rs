//! Remote store contract and its implementations.
//!
//! The remote is the source of truth for records and leases. Writes carry
//! wire-encoded geometry; reads may return geometry in any shape accepted by
//! [`crate::geometry::decode`].

mod http;
mod memory;
mod record;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use http::{normalize_rest_url, PostgrestRemoteStore};
pub use memory::{FailureTarget, InMemoryRemoteStore, InjectedFailure, RemoteWrite};
pub use record::{decode_feature, parse_timestamp};

/// Default lease length granted by `acquire_lock`.
pub const DEFAULT_LEASE_MILLIS: i64 = 15 * 60 * 1000;

/// Errors returned by a remote store call.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Temporary failure; the same call may succeed later
    #[error("Transient remote failure: {0}")]
    Transient(String),

    /// Remote state disagrees with the write's precondition
    #[error("Remote precondition failed: {0}")]
    Conflict(String),

    /// Request refused for a reason other than a precondition
    #[error("Remote rejected the request: {message} ({status})")]
    Rejected { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Payload sent or received was not understood
    #[error("Invalid remote payload: {0}")]
    InvalidPayload(String),
}

impl RemoteError {
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Http(_))
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Outcome of a lease request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockGrant {
    pub acquired: bool,
    /// Current holder as reported by the remote, when known
    pub holder: Option<String>,
    /// Unix ms
    pub expires_at: Option<i64>,
}

/// Operations the sync engine needs from the shared backend.
#[allow(async_fn_in_trait)]
pub trait RemoteStore {
    /// Insert `record`. Inserting an id that already exists succeeds and
    /// returns the stored record, so a retried insert is harmless.
    async fn insert(&self, collection: &str, record: &Value) -> RemoteResult<Value>;

    /// Apply `patch` to one record.
    ///
    /// With `base_updated_at`, the patch is applied only if the record has not
    /// been modified after that time; otherwise the call fails with
    /// [`RemoteError::Conflict`]. A missing record is a 404
    /// [`RemoteError::Rejected`], never a conflict. Returns the record's new
    /// `updated_at` in Unix ms when the backend reports it.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: &Value,
        base_updated_at: Option<i64>,
    ) -> RemoteResult<Option<i64>>;

    /// Delete one record. Deleting a missing record succeeds.
    async fn delete(&self, collection: &str, id: &str) -> RemoteResult<()>;

    /// Records modified at or after `since_millis`, oldest first. An empty
    /// `layer_ids` slice means no layer filter.
    async fn query_changed_since(
        &self,
        collection: &str,
        since_millis: i64,
        layer_ids: &[String],
    ) -> RemoteResult<Vec<Value>>;

    /// Take or refresh the lease on a feature.
    async fn acquire_lock(&self, feature_id: &str, holder_id: &str) -> RemoteResult<LockGrant>;

    /// Drop the lease on a feature. Idempotent.
    async fn release_lock(&self, feature_id: &str) -> RemoteResult<()>;
}
