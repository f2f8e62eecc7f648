//! Classification of failed pushes.

use crate::error::{Error, Result};
use crate::models::{ConflictKind, QueuedOperation};
use crate::remote::RemoteError;
use crate::services::LocalStore;

use super::RetryPolicy;

/// What to do with an operation whose push failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Stop pushing it and surface it for manual resolution
    Park(ConflictKind),
    /// Try again after the backoff delay
    Retry,
}

/// Result of handling one failed push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Parked { conflict_id: i64 },
    Retried { attempts: u32, next_attempt_at: i64 },
}

/// Routes push failures to the park path or the retry path.
///
/// No automatic merge is attempted: a conflicting write stays queued, parked,
/// until someone resolves it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    retry: RetryPolicy,
}

impl ConflictResolver {
    pub const fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    pub const fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// A precondition failure parks; so does a payload that can never be
    /// sent. Network, validation and permission failures are retried.
    pub const fn classify(error: &Error) -> Disposition {
        match error {
            Error::Remote(RemoteError::Conflict(_)) => {
                Disposition::Park(ConflictKind::Precondition)
            }
            Error::Remote(RemoteError::InvalidPayload(_))
            | Error::Geometry(_)
            | Error::Serialization(_)
            | Error::InvalidInput(_) => Disposition::Park(ConflictKind::InvalidPayload),
            _ => Disposition::Retry,
        }
    }

    /// Apply the disposition for `error` to `operation` in the local store.
    pub async fn handle(
        &self,
        store: &LocalStore,
        operation: &QueuedOperation,
        error: &Error,
        now_millis: i64,
    ) -> Result<FailureOutcome> {
        match Self::classify(error) {
            Disposition::Park(kind) => {
                let conflict_id = store
                    .park_operation(operation, kind, &error.to_string(), now_millis)
                    .await?;
                tracing::warn!(
                    sequence = operation.sequence,
                    entity_type = operation.entity_type.as_str(),
                    entity_id = %operation.entity_id,
                    kind = kind.as_str(),
                    conflict_id,
                    "Parked queued operation: {}",
                    error
                );
                Ok(FailureOutcome::Parked { conflict_id })
            }
            Disposition::Retry => {
                let attempts = operation.attempts.saturating_add(1);
                let next_attempt_at = self.retry.next_attempt_at(now_millis, attempts);
                let attempts = store
                    .mark_retry(operation.sequence, next_attempt_at, &error.to_string())
                    .await?;
                tracing::debug!(
                    sequence = operation.sequence,
                    attempts,
                    next_attempt_at,
                    "Push failed, will retry: {}",
                    error
                );
                Ok(FailureOutcome::Retried {
                    attempts,
                    next_attempt_at,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeometryError;

    #[test]
    fn precondition_failures_park() {
        assert_eq!(
            ConflictResolver::classify(&Error::Remote(RemoteError::Conflict("stale".into()))),
            Disposition::Park(ConflictKind::Precondition)
        );
    }

    #[test]
    fn unusable_payloads_park() {
        for error in [
            Error::Geometry(GeometryError::Encode("nan".into())),
            Error::Remote(RemoteError::InvalidPayload("no id".into())),
            Error::InvalidInput("patch must be an object".into()),
        ] {
            assert_eq!(
                ConflictResolver::classify(&error),
                Disposition::Park(ConflictKind::InvalidPayload)
            );
        }
    }

    #[test]
    fn everything_else_retries() {
        for error in [
            Error::Remote(RemoteError::Transient("timeout".into())),
            Error::Remote(RemoteError::Rejected {
                status: 403,
                message: "row level security".into(),
            }),
            Error::Database("disk".into()),
        ] {
            assert_eq!(ConflictResolver::classify(&error), Disposition::Retry);
        }
    }
}
