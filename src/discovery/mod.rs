//! Testhost-side discovery: run adapters, batch what they find, report.

mod cache;
mod enumerator;
mod manager;

pub use cache::{DiscoveryResultCache, OnReportTestCases};
pub use enumerator::DiscovererEnumerator;
pub use manager::DiscoveryManager;
