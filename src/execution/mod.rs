//! Testhost-side execution: run adapters and report results in batches.

mod manager;
mod run_cache;

pub use manager::ExecutionManager;
pub use run_cache::{OnCacheHit, TestRunCache};
