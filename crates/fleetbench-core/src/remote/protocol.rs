//! Wire constants of the private master/service control protocol.

use serde::{Deserialize, Serialize};

use crate::config::BenchPathInfo;

/// Compared verbatim between master and service; any mismatch is rejected
/// before state changes. Bumped whenever the control protocol changes.
pub const PROTOCOL_VERSION: &str = "3.1";

pub mod path {
    pub const INFO: &str = "/info";
    pub const PROTOCOLVERSION: &str = "/protocolversion";
    pub const STATUS: &str = "/status";
    pub const BENCHRESULT: &str = "/benchresult";
    pub const PREPAREFILE: &str = "/preparefile";
    pub const PREPAREPHASE: &str = "/preparephase";
    pub const STARTPHASE: &str = "/startphase";
    pub const INTERRUPTPHASE: &str = "/interruptphase";
}

pub mod param {
    pub const PROTOCOLVERSION: &str = "protocolversion";
    pub const FILENAME: &str = "filename";
    pub const BENCHPHASECODE: &str = "benchphasecode";
    pub const BENCHID: &str = "benchid";
    pub const QUIT: &str = "quit";
}

/// Body of a successful `/preparephase` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareReply {
    pub path_info: BenchPathInfo,
    pub error_history: String,
}
