//! Master-side driver: sequences benchmark phases across iterations,
//! inserts sync/drop-caches runs, rotates hosts, and translates run errors
//! into the process exit code.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::BenchConfig;
use crate::errhist::ErrorHistory;
use crate::error::RunError;
use crate::phase::BenchPhase;
use crate::pool::{PoolState, WorkerPool};
use crate::remote;
use crate::run_state::{self, SharedPhaseState};
use crate::signals;
use crate::stats::{LivePrinter, Statistics};

#[derive(Debug, Clone, Default)]
pub struct CoordinatorOptions {
    /// Only tell the configured services to interrupt, then exit.
    pub interrupt_services: bool,
    /// Like `interrupt_services`, but the services also quit.
    pub quit_services: bool,
}

pub struct Coordinator {
    cfg: BenchConfig,
    opts: CoordinatorOptions,
    run_state: Arc<SharedPhaseState>,
    errhist: Arc<ErrorHistory>,
    stats: Arc<Statistics>,
    pool: WorkerPool,
    bench_id: String,
}

impl Coordinator {
    pub fn new(cfg: BenchConfig, opts: CoordinatorOptions) -> Coordinator {
        let run_state = run_state::process_state();
        let errhist = Arc::new(ErrorHistory::new());
        let stats = Arc::new(Statistics::new());
        let pool = WorkerPool::new(
            Arc::clone(&run_state),
            Arc::clone(&errhist),
            Arc::clone(&stats),
        );
        let epoch_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Coordinator {
            cfg,
            opts,
            run_state,
            errhist,
            stats,
            pool,
            bench_id: format!("{:x}-{:x}", std::process::id(), epoch_secs),
        }
    }

    /// Run the whole benchmark. Returns the process exit code: 0 on success
    /// and on bare time-limit expiry, non-zero on any worker error,
    /// interruption, or config problem.
    pub fn run(mut self) -> i32 {
        signals::register_fault_handlers();

        let result = self.run_inner();

        self.terminate_and_join();
        let leftover = self.errhist.take();
        if !leftover.is_empty() {
            eprint!("{}", leftover);
        }

        let mut exit_code = match &result {
            Ok(()) => 0,
            // workers already logged their own failure; no second diagnostic
            Err(RunError::Worker) => 1,
            Err(err) => {
                eprintln!("{}", err);
                err.exit_code()
            }
        };
        if self.pool.total_errors() > 0 {
            exit_code = 1;
        }
        exit_code
    }

    fn run_inner(&mut self) -> Result<(), RunError> {
        // called only to stop services? then don't prepare a benchmark
        if !self.cfg.hosts.is_empty()
            && (self.opts.interrupt_services || self.opts.quit_services)
        {
            return remote::interrupt_services(
                &self.cfg.hosts,
                self.cfg.service_port,
                self.opts.quit_services,
            )
            .map_err(|err| RunError::Config(format!("{:#}", err)));
        }

        if self.cfg.rotate_hosts_num > 0 && self.cfg.net_bench {
            tracing::warn!("hosts rotation has no effect in net-bench mode and stays disabled");
        }

        self.pool
            .prepare_threads(&self.cfg, self.opts.quit_services)?;

        /* clean worker stop and stats print after ctrl+c; not installed in
        service mode, where a service just quits on an interrupt signal */
        signals::register_interrupt_handlers();

        if !self.cfg.hosts.is_empty() {
            self.pool.check_service_bench_path_infos()?;
        }

        if self.cfg.dry_run {
            Statistics::print_dry_run_info(&self.cfg);
            return Ok(());
        }

        self.wait_for_start_time()?;
        self.run_benchmarks()
    }

    /// Signal workers to self-terminate and join them all. On error paths
    /// mid-phase this degrades to an interrupt.
    fn terminate_and_join(&mut self) {
        match self.pool.state() {
            PoolState::PreparedIdle | PoolState::PhaseDone => {
                let _ = self.pool.start_next_phase(BenchPhase::Terminate, None);
            }
            PoolState::PhaseRunning => self.pool.interrupt_and_notify_workers(),
            PoolState::Unprepared | PoolState::Terminated => {}
        }
        self.pool.join_all_threads();
    }

    fn wait_for_start_time(&self) -> Result<(), RunError> {
        let start = self.cfg.start_time_epoch_secs;
        if start == 0 {
            return Ok(());
        }
        let now_secs = || {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        };
        if now_secs() > start {
            return Err(RunError::Config(
                "Defined start time has already passed. Aborting.".into(),
            ));
        }
        tracing::info!("waiting for defined start time");
        while now_secs() < start {
            if self.run_state.is_interrupted() {
                return Err(RunError::Interrupted);
            }
            std::thread::sleep(Duration::from_millis(500));
        }
        Ok(())
    }

    /// Run all iterations of the selected phases in canonical order, with
    /// sync/drop-caches interleaved and optional delay + hosts rotation
    /// between phases.
    fn run_benchmarks(&mut self) -> Result<(), RunError> {
        let enabled = self.cfg.phases.enabled_phases();

        for _iteration in 0..self.cfg.iterations {
            self.stats.print_table_header();

            self.run_sync_and_drop_caches()?;

            for (index, phase) in enabled.iter().enumerate() {
                self.run_benchmark_phase(*phase)?;

                self.run_sync_and_drop_caches()?;

                if index < enabled.len() - 1 {
                    if self.cfg.next_phase_delay_secs > 0 {
                        std::thread::sleep(Duration::from_secs(self.cfg.next_phase_delay_secs));
                    }
                    self.rotate_hosts()?;
                }
            }
        }
        Ok(())
    }

    /// One lock-step phase: boundary check, dispatch, live stats, barrier,
    /// results, cleanup, boundary check again (so a late interrupt during
    /// the phase still fails the run).
    fn run_benchmark_phase(&mut self, phase: BenchPhase) -> Result<(), RunError> {
        self.run_state.check_phase_boundary()?;

        self.pool.start_next_phase(phase, Some(self.bench_id.clone()))?;

        let printer = LivePrinter::start(Arc::clone(&self.stats));
        let wait_result = self.pool.wait_for_workers_done();
        printer.stop();

        let errors = self.errhist.take();
        if !errors.is_empty() {
            eprint!("{}", errors);
        }

        wait_result?;

        self.stats.print_phase_result(phase);
        self.pool.cleanup_workers_after_phase_done();

        self.run_state.check_phase_boundary()
    }

    /// Sync and drop-caches are not time-interruptible, so the limit is
    /// zeroed around them and restored afterwards.
    fn run_sync_and_drop_caches(&mut self) -> Result<(), RunError> {
        let saved_limit = self.pool.time_limit_secs();
        self.pool.set_time_limit_secs(0);

        if self.cfg.phases.sync {
            self.run_benchmark_phase(BenchPhase::Sync)?;
        }
        if self.cfg.phases.drop_caches {
            self.run_benchmark_phase(BenchPhase::DropCaches)?;
        }

        self.pool.set_time_limit_secs(saved_limit);
        Ok(())
    }

    /// Stop and re-prepare all workers after rotating the hosts vector.
    /// Rotation reassigns ranks, which is why a fresh prepare is required.
    fn rotate_hosts(&mut self) -> Result<(), RunError> {
        if self.cfg.hosts.is_empty() || self.cfg.rotate_hosts_num == 0 || self.cfg.net_bench {
            return Ok(());
        }

        self.pool.interrupt_and_notify_workers();
        self.pool.join_all_threads();
        self.pool.cleanup_workers_after_phase_done();
        self.pool.delete_threads();

        let errors = self.errhist.take();
        if !errors.is_empty() {
            eprint!("{}", errors);
        }

        self.cfg.rotate_hosts();

        self.pool
            .prepare_threads(&self.cfg, self.opts.quit_services)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(dir: &std::path::Path) -> BenchConfig {
        let payload = serde_json::json!({
            "bench_paths": [dir],
            "num_threads": 2,
            "num_dirs": 2,
            "num_files": 4,
            "file_size": 1024,
            "block_size": 256,
            "phases": { "create_dirs": true, "create_files": true, "read_files": true }
        });
        BenchConfig::from_prepare_payload(&payload.to_string()).unwrap()
    }

    #[test]
    fn local_write_then_read_run_exits_zero() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = base_config(dir.path());

        let code = Coordinator::new(cfg, CoordinatorOptions::default()).run();

        assert_eq!(code, 0);
        for i in 0..2 {
            assert!(dir.path().join(format!("d{:04}", i)).is_dir());
        }
        for i in 0..4 {
            let file = dir.path().join(format!("f{:04}", i));
            assert_eq!(std::fs::metadata(&file).unwrap().len(), 1024);
        }
    }

    #[test]
    fn dry_run_does_nothing_and_exits_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = base_config(dir.path());
        cfg.dry_run = true;

        let code = Coordinator::new(cfg, CoordinatorOptions::default()).run();

        assert_eq!(code, 0);
        assert!(!dir.path().join("f0000").exists());
    }

    #[test]
    fn start_time_in_the_past_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = base_config(dir.path());
        cfg.start_time_epoch_secs = 1;

        let code = Coordinator::new(cfg, CoordinatorOptions::default()).run();

        assert_eq!(code, 1);
    }

    #[test]
    fn missing_bench_path_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = base_config(dir.path());
        cfg.bench_paths = vec![std::path::PathBuf::from("/nonexistent/fleetbench/path")];

        let code = Coordinator::new(cfg, CoordinatorOptions::default()).run();

        assert_eq!(code, 1);
    }
}
