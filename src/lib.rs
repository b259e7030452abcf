pub mod adapter;
pub mod communication;
pub mod config;
pub mod discovery;
pub mod error;
pub mod execution;
pub mod host;
pub mod job_queue;
pub mod logger;
pub mod managed_name;
pub mod model;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};
