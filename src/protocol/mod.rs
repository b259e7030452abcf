//! Request/response orchestration between the orchestrator, testhost and
//! datacollector processes.

mod data_collection;
mod events;
mod handler;
mod sender;

pub use data_collection::{
    DataCollectionRequestHandler, DataCollectionRequestSender, DataCollector, TimingCollector,
    COLLECTOR_ENV, RUN_DURATION_METRIC, TEST_HOST_PROCESS_METRIC,
};
pub use events::{DiscoveryEventsHandler, DiscoveryLogger, RunEventsHandler, RunLogger};
pub use handler::{TestHost, TestRequestHandler};
pub use sender::TestRequestSender;
