//! Shared state of one control service.
//!
//! Mutating endpoints (preparephase / startphase / interruptphase) serialise
//! on the async core mutex; read endpoints (status / benchresult) only touch
//! the statistics aggregator and stay concurrent.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use crate::config::{BenchConfig, BenchPathInfo};
use crate::errhist::ErrorHistory;
use crate::phase::BenchPhase;
use crate::pool::WorkerPool;
use crate::run_state::SharedPhaseState;
use crate::stats::Statistics;

pub struct ServiceState {
    pub core: tokio::sync::Mutex<ServiceCore>,
    pub stats: Arc<Statistics>,
    pub errhist: Arc<ErrorHistory>,
    pub upload_dir: PathBuf,
    pub shutdown: tokio::sync::Notify,
    pub port: u16,
}

impl ServiceState {
    pub fn new(port: u16) -> ServiceState {
        let run_state = Arc::new(SharedPhaseState::new());
        let errhist = Arc::new(ErrorHistory::new());
        let stats = Arc::new(Statistics::new());
        ServiceState {
            core: tokio::sync::Mutex::new(ServiceCore {
                run_state,
                errhist: Arc::clone(&errhist),
                stats: Arc::clone(&stats),
                pool: None,
            }),
            stats,
            errhist,
            upload_dir: std::env::temp_dir().join(format!("fleetbench_svc_{}", port)),
            shutdown: tokio::sync::Notify::new(),
            port,
        }
    }
}

/// The mutable half: current config and the local worker pool. Exactly one
/// control mutator may operate on this at a time.
pub struct ServiceCore {
    run_state: Arc<SharedPhaseState>,
    errhist: Arc<ErrorHistory>,
    stats: Arc<Statistics>,
    pool: Option<WorkerPool>,
}

impl ServiceCore {
    pub fn is_prepared(&self) -> bool {
        self.pool.is_some()
    }

    /// Interrupt and join any residual workers and drop the applied config
    /// with them. Idempotent; safe to call in any state.
    pub fn interrupt_join_reset(&mut self) {
        if let Some(mut pool) = self.pool.take() {
            pool.interrupt_and_notify_workers();
            pool.join_all_threads();
        }
    }

    /// Apply a new config from the master and prepare the local worker
    /// pool. Any residual workers are killed first. On error the service is
    /// fully reset before returning, because the master sends no further
    /// interrupt after a failed prepare.
    pub fn prepare(&mut self, cfg: BenchConfig) -> Result<BenchPathInfo> {
        self.interrupt_join_reset();
        self.errhist.take();

        let result = self.prepare_inner(cfg);
        if result.is_err() {
            self.interrupt_join_reset();
        }
        result
    }

    fn prepare_inner(&mut self, cfg: BenchConfig) -> Result<BenchPathInfo> {
        tracing::info!("preparing new benchmark phase");
        if !cfg.label.is_empty() {
            tracing::info!("label: {}", cfg.label);
        }

        let mut pool = WorkerPool::new(
            Arc::clone(&self.run_state),
            Arc::clone(&self.errhist),
            Arc::clone(&self.stats),
        );
        pool.prepare_threads(&cfg, false)
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        let info = cfg.path_info();
        self.pool = Some(pool);
        Ok(info)
    }

    /// Dispatch a phase to the local pool and return immediately. Settles a
    /// previously completed phase first (no coordinator thread waits on the
    /// barrier in service mode).
    pub fn start_phase(&mut self, phase: BenchPhase, bench_id: Option<String>) -> Result<()> {
        let pool = self
            .pool
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("service is not prepared for a benchmark phase"))?;
        pool.finish_phase_if_done();
        pool.start_next_phase(phase, bench_id)
            .map_err(|e| anyhow::anyhow!("{}", e))
    }
}
