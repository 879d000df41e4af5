pub mod config;
pub mod logging;

pub mod coordinator;
pub mod errhist;
pub mod error;
pub mod phase;
pub mod pool;
pub mod remote;
pub mod run_state;
pub mod s3;
pub mod service;
pub mod signals;
pub mod stats;
