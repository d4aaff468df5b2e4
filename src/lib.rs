pub mod cli;
pub mod database_ops;
pub mod normalization;
pub mod tracing;

pub mod util {
    pub mod env;
}

pub use database_ops::backfill::{BackfillOrchestrator, BackfillSummary};
pub use database_ops::error::{LocationError, Result};
pub use database_ops::matcher::LocationMatcher;
pub use database_ops::store::LocationStore;
pub use database_ops::sync::{HierarchySynchronizer, LocationIdMap, SyncSummary};
pub use database_ops::verify::{IntegrityVerifier, VerificationCheck};
