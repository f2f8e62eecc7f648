//! Shared services used by the sync engine and its hosts

mod local_store;

pub use local_store::{LocalStore, MergeOutcome};
