//! fieldsync-core - Offline-first sync engine for field geospatial corrections
//!
//! This crate contains the geometry codec, the durable mutation queue and
//! local cache, the sync coordinator with its conflict handling, and the
//! advisory feature lock manager shared by every fieldsync client.
//!
//! Writes are made locally first: a [`mutations`] builder produces the
//! queued write, [`LocalStore`] saves it together with the cached record,
//! and a [`SyncCoordinator`] pushes the queue and pulls remote changes when
//! a [`SyncSignal`] arrives.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod geometry;
pub mod lock;
pub mod models;
pub mod mutations;
pub mod remote;
pub mod services;
pub mod state;
pub mod sync;
pub mod util;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{parse_client_config, ClientConfig, ConfigError};
pub use error::{Error, Result};
pub use geometry::{Coord, Geometry, GeometryError};
pub use lock::LockManager;
pub use models::{
    ConflictResolution, Correction, CorrectionId, Feature, FeatureId, FeatureStatus, Mutation,
    QueuedOperation, SyncConflict,
};
pub use remote::{InMemoryRemoteStore, PostgrestRemoteStore, RemoteError, RemoteStore};
pub use services::{LocalStore, MergeOutcome};
pub use state::{SyncSignal, SyncState};
pub use sync::{CycleReport, RetryPolicy, SyncCoordinator, SyncStats, TriggerOutcome};
