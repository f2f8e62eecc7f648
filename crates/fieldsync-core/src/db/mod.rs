//! Local persistence for fieldsync

mod connection;
mod conflict_repository;
mod feature_repository;
mod migrations;
mod queue_repository;
mod sync_state_repository;

pub use connection::Database;
pub use conflict_repository::{ConflictRepository, LibSqlConflictRepository};
pub use feature_repository::{
    CachedFeature, CorrectionRepository, FeatureRepository, LibSqlCorrectionRepository,
    LibSqlFeatureRepository,
};
pub use queue_repository::{LibSqlMutationQueue, MutationQueue};
pub use sync_state_repository::{LibSqlSyncStateRepository, SyncStateRepository};
