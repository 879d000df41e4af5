//! Benchmark configuration: set once at master startup, re-derived on each
//! service from the master's JSON prepare payload. Mutated only between
//! phases, never during one.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::phase::PhaseSelection;

/// Default control-plane port of a fleetbench service.
pub const DEFAULT_SERVICE_PORT: u16 = 1611;

/// Per-run benchmark settings. The whole struct travels to services as the
/// `/preparephase` body; unknown keys in the payload are ignored, required
/// keys (`bench_paths`, `num_threads`) are enforced by the parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Target directories (or S3 bucket scratch dirs) the workers operate on.
    pub bench_paths: Vec<PathBuf>,
    /// Worker threads per service (and on the master for local runs).
    pub num_threads: usize,

    #[serde(default = "default_one")]
    pub num_dirs: u64,
    #[serde(default = "default_one")]
    pub num_files: u64,
    /// Per-file / per-object size in bytes.
    #[serde(default)]
    pub file_size: u64,
    /// Read/write granularity in bytes; also the S3 multipart part size.
    #[serde(default = "default_block_size")]
    pub block_size: u64,

    #[serde(default = "default_one_usize")]
    pub iterations: usize,
    /// Per-phase time limit in seconds; 0 disables the limit.
    #[serde(default)]
    pub time_limit_secs: u64,
    #[serde(default)]
    pub next_phase_delay_secs: u64,
    /// Rotate the hosts vector by this many entries between phases.
    #[serde(default)]
    pub rotate_hosts_num: usize,

    /// Remote service hosts; empty means a purely local run. Cleared in the
    /// payload a master sends to its services.
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default = "default_service_port")]
    pub service_port: u16,

    #[serde(default)]
    pub s3_endpoint: Option<String>,
    #[serde(default)]
    pub s3_access_key: Option<String>,
    #[serde(default)]
    pub s3_secret_key: Option<String>,
    #[serde(default)]
    pub s3_region: Option<String>,
    /// Buckets for the S3 object phases.
    #[serde(default)]
    pub buckets: Vec<String>,

    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub dry_run: bool,
    /// Unix epoch seconds to delay the first phase until; 0 starts now.
    #[serde(default)]
    pub start_time_epoch_secs: u64,
    /// Network benchmarking mode; suppresses hosts rotation.
    #[serde(default)]
    pub net_bench: bool,
    /// Custom tree file uploaded to services via `/preparefile`.
    #[serde(default)]
    pub tree_file: Option<PathBuf>,

    #[serde(default)]
    pub phases: PhaseSelection,
}

fn default_one() -> u64 {
    1
}

fn default_one_usize() -> usize {
    1
}

fn default_block_size() -> u64 {
    1024 * 1024
}

fn default_service_port() -> u16 {
    DEFAULT_SERVICE_PORT
}

impl BenchConfig {
    /// Parse the master's prepare payload. serde ignores unknown keys, so a
    /// newer master may send fields this service does not know about; the
    /// protocol version check catches genuinely incompatible peers earlier.
    pub fn from_prepare_payload(json: &str) -> Result<BenchConfig> {
        let cfg: BenchConfig = serde_json::from_str(json).context("malformed prepare payload")?;
        if cfg.bench_paths.is_empty() {
            anyhow::bail!("prepare payload contains no bench paths");
        }
        if cfg.num_threads == 0 {
            anyhow::bail!("prepare payload requests zero worker threads");
        }
        Ok(cfg)
    }

    /// The payload a master sends to its services: same settings, but the
    /// service runs its workers locally, so the host list is dropped.
    pub fn to_service_payload(&self) -> Result<String> {
        let mut cfg = self.clone();
        cfg.hosts.clear();
        cfg.rotate_hosts_num = 0;
        serde_json::to_string(&cfg).context("serialize prepare payload")
    }

    /// Rotate the hosts vector left by `rotate_hosts_num` entries, so ranks
    /// map to different hosts in the next prepare.
    pub fn rotate_hosts(&mut self) {
        if self.hosts.is_empty() || self.rotate_hosts_num == 0 {
            return;
        }
        let n = self.rotate_hosts_num % self.hosts.len();
        self.hosts.rotate_left(n);
    }

    /// Path info advertised by a service after prepare; the master rejects
    /// the run when services disagree.
    pub fn path_info(&self) -> BenchPathInfo {
        let first_is_dir = self
            .bench_paths
            .first()
            .map(|p| p.is_dir())
            .unwrap_or(false);
        BenchPathInfo {
            path_type: if first_is_dir {
                BenchPathType::Dir
            } else {
                BenchPathType::BlockDevOrFile
            },
            file_size: self.file_size,
            block_size: self.block_size,
            num_threads: self.num_threads,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BenchPathType {
    Dir,
    BlockDevOrFile,
}

/// What a service reports about its bench paths in the prepare reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchPathInfo {
    pub path_type: BenchPathType,
    pub file_size: u64,
    pub block_size: u64,
    pub num_threads: usize,
}
