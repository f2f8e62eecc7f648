//! Data models for fieldsync

mod correction;
mod feature;
mod operation;
mod sync_conflict;

pub use correction::{Correction, CorrectionId, CorrectionStatus};
pub use feature::{Feature, FeatureAudit, FeatureId, FeatureLock, FeatureStatus};
pub use operation::{EntityType, Mutation, OperationKind, QueuedOperation};
pub use sync_conflict::{ConflictKind, ConflictResolution, SyncConflict};
