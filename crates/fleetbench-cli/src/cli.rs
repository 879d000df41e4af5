//! CLI surface of the fleetbench master and service.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use fleetbench_core::config::{BenchConfig, DEFAULT_SERVICE_PORT};
use fleetbench_core::coordinator::{Coordinator, CoordinatorOptions};
use fleetbench_core::phase::PhaseSelection;
use fleetbench_core::service::{self, ServiceOptions};
use fleetbench_core::signals;

/// Distributed storage benchmark: run phases locally, or as master drive a
/// fleet of `--service` instances through them in lock-step.
#[derive(Debug, Parser)]
#[command(name = "fleetbench")]
#[command(about = "fleetbench: distributed storage benchmark", long_about = None)]
pub struct Cli {
    /// Benchmark target directories.
    #[arg(value_name = "PATH")]
    pub paths: Vec<PathBuf>,

    /// Comma-separated list of remote service hosts to drive.
    #[arg(long, value_delimiter = ',', value_name = "HOST")]
    pub hosts: Vec<String>,

    /// Control-plane port (service listen port / master connect port).
    #[arg(long, default_value_t = DEFAULT_SERVICE_PORT)]
    pub port: u16,

    /// Run as a service instance for a remote master.
    #[arg(long)]
    pub service: bool,

    /// Keep a service in the foreground instead of daemonising.
    #[arg(long)]
    pub foreground: bool,

    /// Tell the configured service hosts to interrupt their current
    /// benchmark, then exit.
    #[arg(long)]
    pub interrupt: bool,

    /// Like --interrupt, but the services also quit.
    #[arg(long)]
    pub quit: bool,

    #[arg(long, default_value_t = 1, value_name = "N")]
    pub iterations: usize,

    /// Per-phase time limit in seconds (0 = unlimited). Expiry ends the
    /// run early but is not an error.
    #[arg(long = "timelimit", default_value_t = 0, value_name = "SECS")]
    pub time_limit_secs: u64,

    /// Delay between benchmark phases.
    #[arg(long = "next-phase-delay", default_value_t = 0, value_name = "SECS")]
    pub next_phase_delay_secs: u64,

    /// Rotate the hosts list by N entries between phases (forces a fresh
    /// prepare with new rank assignment).
    #[arg(long = "rotate-hosts", default_value_t = 0, value_name = "N")]
    pub rotate_hosts: usize,

    /// Worker threads per host.
    #[arg(short = 't', long, default_value_t = 1, value_name = "N")]
    pub threads: usize,

    #[arg(long = "dirs", default_value_t = 1, value_name = "N")]
    pub num_dirs: u64,

    #[arg(long = "files", default_value_t = 1, value_name = "N")]
    pub num_files: u64,

    /// Per-file / per-object size in bytes.
    #[arg(short = 's', long = "size", default_value_t = 0, value_name = "BYTES")]
    pub file_size: u64,

    /// Read/write block size in bytes; also the S3 multipart part size.
    #[arg(short = 'b', long = "block", default_value_t = 1024 * 1024, value_name = "BYTES")]
    pub block_size: u64,

    /// Run the directory creation phase.
    #[arg(short = 'd', long)]
    pub mkdirs: bool,

    /// Run the file/object write phase.
    #[arg(short = 'w', long)]
    pub write: bool,

    /// Run the file/object read phase.
    #[arg(short = 'r', long)]
    pub read: bool,

    /// Run the stat phase.
    #[arg(long)]
    pub stat: bool,

    /// Run the file/object delete phase.
    #[arg(short = 'F', long)]
    pub del: bool,

    /// Run the directory delete phase.
    #[arg(short = 'D', long)]
    pub rmdirs: bool,

    /// Run a sync before and after each phase.
    #[arg(long)]
    pub sync: bool,

    /// Drop the page cache before and after each phase (requires root).
    #[arg(long)]
    pub dropcache: bool,

    /// List objects in the configured buckets (single worker).
    #[arg(long)]
    pub listobj: bool,

    /// List objects with the buckets sliced across workers.
    #[arg(long = "listobj-parallel")]
    pub listobj_parallel: bool,

    /// Multi-delete all objects in the configured buckets.
    #[arg(long)]
    pub multidel: bool,

    #[arg(long = "put-bacl")]
    pub put_bucket_acl: bool,

    #[arg(long = "get-bacl")]
    pub get_bucket_acl: bool,

    #[arg(long = "put-oacl")]
    pub put_obj_acl: bool,

    #[arg(long = "get-oacl")]
    pub get_obj_acl: bool,

    #[arg(long = "s3-endpoint", value_name = "URL")]
    pub s3_endpoint: Option<String>,

    #[arg(long = "s3-key", value_name = "KEY")]
    pub s3_access_key: Option<String>,

    #[arg(long = "s3-secret", value_name = "SECRET")]
    pub s3_secret_key: Option<String>,

    #[arg(long = "s3-region", value_name = "REGION")]
    pub s3_region: Option<String>,

    /// Comma-separated bucket list for the S3 object phases.
    #[arg(long, value_delimiter = ',', value_name = "BUCKET")]
    pub buckets: Vec<String>,

    /// Free-form label shown in result tables and stats trees.
    #[arg(long, default_value = "")]
    pub label: String,

    /// Show what would run, without running it.
    #[arg(long)]
    pub dry_run: bool,

    /// Unix epoch seconds to delay the first phase until.
    #[arg(long = "start", default_value_t = 0, value_name = "EPOCH_SECS")]
    pub start_time: u64,

    /// Network benchmarking mode (suppresses hosts rotation).
    #[arg(long)]
    pub netbench: bool,

    /// Custom tree file, uploaded to each service before prepare.
    #[arg(long = "tree-file", value_name = "FILE")]
    pub tree_file: Option<PathBuf>,

    /// Service PID file (written with an exclusive lock).
    #[arg(long = "pid-file", value_name = "FILE")]
    pub pid_file: Option<PathBuf>,

    /// Service log file; without it a daemonised service logs to /dev/null.
    #[arg(long = "log-file", value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn to_config(&self) -> Result<BenchConfig> {
        if self.interrupt || self.quit {
            if self.hosts.is_empty() {
                anyhow::bail!("--interrupt/--quit require --hosts");
            }
        } else if self.paths.is_empty() {
            anyhow::bail!("at least one benchmark path is required");
        }
        if self.threads == 0 {
            anyhow::bail!("--threads must be at least 1");
        }

        let phases = PhaseSelection {
            sync: self.sync,
            drop_caches: self.dropcache,
            create_dirs: self.mkdirs,
            create_files: self.write,
            stat_files: self.stat,
            read_files: self.read,
            delete_files: self.del,
            delete_dirs: self.rmdirs,
            list_objects: self.listobj,
            list_obj_parallel: self.listobj_parallel,
            multi_del_obj: self.multidel,
            put_bucket_acl: self.put_bucket_acl,
            put_obj_acl: self.put_obj_acl,
            get_obj_acl: self.get_obj_acl,
            get_bucket_acl: self.get_bucket_acl,
        };

        if phases.needs_s3() && self.buckets.is_empty() {
            anyhow::bail!("S3 phases require --buckets");
        }

        Ok(BenchConfig {
            bench_paths: self.paths.clone(),
            num_threads: self.threads,
            num_dirs: self.num_dirs,
            num_files: self.num_files,
            file_size: self.file_size,
            block_size: self.block_size,
            iterations: self.iterations,
            time_limit_secs: self.time_limit_secs,
            next_phase_delay_secs: self.next_phase_delay_secs,
            rotate_hosts_num: self.rotate_hosts,
            hosts: self.hosts.clone(),
            service_port: self.port,
            s3_endpoint: self.s3_endpoint.clone(),
            s3_access_key: self.s3_access_key.clone(),
            s3_secret_key: self.s3_secret_key.clone(),
            s3_region: self.s3_region.clone(),
            buckets: self.buckets.clone(),
            label: self.label.clone(),
            dry_run: self.dry_run,
            start_time_epoch_secs: self.start_time,
            net_bench: self.netbench,
            tree_file: self.tree_file.clone(),
            phases,
        })
    }
}

/// Dispatch the parsed CLI; returns the process exit code.
pub fn run(cli: Cli) -> i32 {
    if cli.service {
        signals::register_fault_handlers();
        let opts = ServiceOptions {
            port: cli.port,
            foreground: cli.foreground,
            pid_file: cli.pid_file.clone(),
            log_file: cli.log_file.clone(),
        };
        return match service::run_service(&opts) {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("fleetbench service error: {:#}", err);
                1
            }
        };
    }

    let cfg = match cli.to_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("fleetbench error: {:#}", err);
            return 1;
        }
    };
    tracing::debug!("benchmark config: {:?}", cfg);

    let opts = CoordinatorOptions {
        interrupt_services: cli.interrupt,
        quit_services: cli.quit,
    };
    Coordinator::new(cfg, opts).run()
}

#[cfg(test)]
mod tests;
