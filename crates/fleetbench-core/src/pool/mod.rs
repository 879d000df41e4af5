//! Worker pool: owns the worker threads (local I/O workers or remote
//! service clients), dispatches phases, and implements the lock-step
//! barrier the coordinator advances on.

mod local;
mod worker;

pub use local::LocalWorker;
pub use worker::{PhaseAborted, PhaseWorker, PoolShared, WorkerControl};

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{BenchConfig, BenchPathInfo};
use crate::errhist::ErrorHistory;
use crate::error::RunError;
use crate::phase::BenchPhase;
use crate::remote::RemoteWorkerClient;
use crate::run_state::SharedPhaseState;
use crate::s3::registry::UploadRegistry;
use crate::stats::{Statistics, WorkerStats};

/// Pool lifecycle. `start_next_phase` is legal only from `PreparedIdle` or
/// `PhaseDone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Unprepared,
    PreparedIdle,
    PhaseRunning,
    PhaseDone,
    Terminated,
}

/// Per-worker bookkeeping the pool keeps outside the worker thread: stats
/// counters, the host a remote worker drives, and the path info its service
/// reported at prepare time.
#[derive(Debug)]
pub struct WorkerSlot {
    pub stats: Arc<WorkerStats>,
    pub host: Option<String>,
    pub path_info: Mutex<Option<BenchPathInfo>>,
}

impl WorkerSlot {
    fn new(host: Option<String>) -> Arc<WorkerSlot> {
        Arc::new(WorkerSlot {
            stats: Arc::new(WorkerStats::default()),
            host,
            path_info: Mutex::new(None),
        })
    }
}

pub struct WorkerPool {
    run_state: Arc<SharedPhaseState>,
    errhist: Arc<ErrorHistory>,
    stats: Arc<Statistics>,
    registry: Arc<UploadRegistry>,
    shared: Arc<PoolShared>,
    slots: Vec<Arc<WorkerSlot>>,
    handles: Vec<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    state: PoolState,
    time_limit_secs: u64,
}

impl WorkerPool {
    pub fn new(
        run_state: Arc<SharedPhaseState>,
        errhist: Arc<ErrorHistory>,
        stats: Arc<Statistics>,
    ) -> WorkerPool {
        let shared = Arc::new(PoolShared::new(
            Arc::clone(&run_state),
            Arc::clone(&stats),
            0,
        ));
        WorkerPool {
            run_state,
            errhist,
            stats,
            registry: Arc::new(UploadRegistry::new()),
            shared,
            slots: Vec::new(),
            handles: Vec::new(),
            timer: None,
            state: PoolState::Unprepared,
            time_limit_secs: 0,
        }
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    pub fn upload_registry(&self) -> Arc<UploadRegistry> {
        Arc::clone(&self.registry)
    }

    /// Workers that finished a phase with a genuine error, over the whole
    /// pool lifetime. Decides the final exit code.
    pub fn total_errors(&self) -> u64 {
        self.shared.total_errors.load(Ordering::Relaxed)
    }

    pub fn time_limit_secs(&self) -> u64 {
        self.time_limit_secs
    }

    /// Temporarily override the per-phase time limit (sync / drop-caches
    /// phases are not time-interruptible).
    pub fn set_time_limit_secs(&mut self, secs: u64) {
        self.time_limit_secs = secs;
    }

    /// Spawn one thread per configured worker and wait until every worker
    /// finished its prepare step. With hosts configured this builds one
    /// remote client per host (ranks follow host order); otherwise
    /// `num_threads` local workers.
    pub fn prepare_threads(
        &mut self,
        cfg: &BenchConfig,
        quit_on_terminate: bool,
    ) -> Result<(), RunError> {
        if self.state != PoolState::Unprepared {
            return Err(RunError::Config(format!(
                "illegal pool state for prepare: {:?}",
                self.state
            )));
        }

        let cfg = Arc::new(cfg.clone());
        let mut workers: Vec<(Box<dyn PhaseWorker>, Arc<WorkerSlot>)> = Vec::new();
        if cfg.hosts.is_empty() {
            for rank in 0..cfg.num_threads {
                workers.push((
                    Box::new(LocalWorker::new(
                        rank,
                        cfg.num_threads,
                        Arc::clone(&cfg),
                        Arc::clone(&self.registry),
                    )),
                    WorkerSlot::new(None),
                ));
            }
        } else {
            for (rank, host) in cfg.hosts.iter().enumerate() {
                let slot = WorkerSlot::new(Some(host.clone()));
                workers.push((
                    Box::new(RemoteWorkerClient::new(
                        rank,
                        host.clone(),
                        cfg.service_port,
                        Arc::clone(&cfg),
                        Arc::clone(&slot),
                        quit_on_terminate,
                    )),
                    slot,
                ));
            }
        }

        self.prepare_workers(workers, cfg.time_limit_secs, &cfg.label)
    }

    /// Lower-level prepare used by `prepare_threads` (and by the pool tests
    /// with synthetic workers): spawn the given workers and run the prepare
    /// barrier.
    pub(crate) fn prepare_workers(
        &mut self,
        workers: Vec<(Box<dyn PhaseWorker>, Arc<WorkerSlot>)>,
        time_limit_secs: u64,
        label: &str,
    ) -> Result<(), RunError> {
        self.time_limit_secs = time_limit_secs;
        let num_workers = workers.len();
        self.shared = Arc::new(PoolShared::new(
            Arc::clone(&self.run_state),
            Arc::clone(&self.stats),
            num_workers,
        ));
        self.slots.clear();
        for (rank, (w, slot)) in workers.into_iter().enumerate() {
            self.slots.push(Arc::clone(&slot));
            self.handles.push(worker::spawn_worker_thread(
                w,
                Arc::clone(&self.shared),
                Arc::clone(&slot.stats),
                Arc::clone(&self.errhist),
                rank,
            ));
        }

        // generation 0 doubles as the prepare barrier
        let prepare_failed = {
            let mut dispatch = self.shared.dispatch.lock().unwrap();
            while dispatch.num_done < num_workers {
                dispatch = self.shared.cond.wait(dispatch).unwrap();
            }
            let failed = dispatch.num_error > 0;
            dispatch.num_done = 0;
            dispatch.num_error = 0;
            failed
        };

        if prepare_failed {
            self.interrupt_and_notify_workers();
            self.join_all_threads();
            self.state = PoolState::Unprepared;
            return Err(RunError::Worker);
        }

        self.stats.set_workers(
            self.slots.iter().map(|s| Arc::clone(&s.stats)).collect(),
            label,
        );
        self.state = PoolState::PreparedIdle;
        Ok(())
    }

    /// Dispatch the next phase to all workers and return immediately.
    pub fn start_next_phase(
        &mut self,
        phase: BenchPhase,
        bench_id: Option<String>,
    ) -> Result<(), RunError> {
        match self.state {
            PoolState::PreparedIdle | PoolState::PhaseDone => {}
            other => {
                return Err(RunError::Config(format!(
                    "illegal pool state for phase {}: {:?}",
                    phase.name(),
                    other
                )))
            }
        }

        self.stats.begin_phase(phase);

        let generation = {
            let mut dispatch = self.shared.dispatch.lock().unwrap();
            dispatch.phase = phase;
            dispatch.bench_id = bench_id;
            dispatch.generation += 1;
            dispatch.num_done = 0;
            dispatch.num_error = 0;
            self.shared.cond.notify_all();
            dispatch.generation
        };

        if phase == BenchPhase::Terminate {
            self.state = PoolState::Terminated;
            return Ok(());
        }

        if self.time_limit_secs > 0 && phase != BenchPhase::Sync && phase != BenchPhase::DropCaches
        {
            self.arm_phase_timer(generation, Duration::from_secs(self.time_limit_secs));
        }

        self.state = PoolState::PhaseRunning;
        Ok(())
    }

    /// Timer thread that flags time-limit expiry if the phase armed for
    /// `generation` is still running at the deadline.
    fn arm_phase_timer(&mut self, generation: u64, limit: Duration) {
        let shared = Arc::clone(&self.shared);
        let num_workers = self.slots.len();
        let deadline = Instant::now() + limit;
        self.timer = Some(
            std::thread::Builder::new()
                .name("phase-timer".into())
                .spawn(move || {
                    let mut dispatch = shared.dispatch.lock().unwrap();
                    loop {
                        if dispatch.generation != generation || dispatch.num_done >= num_workers {
                            return;
                        }
                        let now = Instant::now();
                        if now >= deadline {
                            tracing::warn!("phase time limit expired");
                            shared.run_state.set_phase_time_expired();
                            return;
                        }
                        let (guard, _) = shared
                            .cond
                            .wait_timeout(dispatch, deadline - now)
                            .unwrap();
                        dispatch = guard;
                    }
                })
                .expect("spawn phase timer"),
        );
    }

    /// Block until every worker reported phase completion. The first worker
    /// error interrupts the remaining workers; the error itself surfaces as
    /// `RunError::Worker` once all of them are done.
    pub fn wait_for_workers_done(&mut self) -> Result<(), RunError> {
        let num_workers = self.slots.len();
        let had_error = {
            let mut dispatch = self.shared.dispatch.lock().unwrap();
            loop {
                if dispatch.num_error > 0 && !self.shared.is_interrupted() {
                    self.shared.interrupt.store(true, Ordering::Relaxed);
                    self.shared.cond.notify_all();
                }
                if dispatch.num_done >= num_workers {
                    break dispatch.num_error > 0;
                }
                dispatch = self.shared.cond.wait(dispatch).unwrap();
            }
        };

        self.stats.end_phase();
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
        self.state = PoolState::PhaseDone;

        if had_error {
            return Err(RunError::Worker);
        }
        Ok(())
    }

    /// Service-side reconcile: a service has no coordinator thread waiting
    /// on the barrier, so before dispatching the next phase it settles the
    /// previous one if all workers already reported done. Worker errors are
    /// in the error history at this point; the master saw them in the
    /// result fetch.
    pub fn finish_phase_if_done(&mut self) {
        if self.state != PoolState::PhaseRunning || !self.stats.is_phase_done() {
            return;
        }
        let _ = self.wait_for_workers_done();
        self.cleanup_workers_after_phase_done();
    }

    /// Ask all in-flight workers to abort at their next yield point.
    pub fn interrupt_and_notify_workers(&mut self) {
        let dispatch = self.shared.dispatch.lock().unwrap();
        self.shared.interrupt.store(true, Ordering::Relaxed);
        self.shared.cond.notify_all();
        drop(dispatch);
    }

    pub fn join_all_threads(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
        if self.state != PoolState::Unprepared {
            self.state = PoolState::Terminated;
        }
    }

    /// Reset per-phase counters so the next phase starts from zero.
    pub fn cleanup_workers_after_phase_done(&mut self) {
        for slot in &self.slots {
            slot.stats.reset();
        }
        let mut dispatch = self.shared.dispatch.lock().unwrap();
        dispatch.num_done = 0;
        dispatch.num_error = 0;
        drop(dispatch);
        if self.state == PoolState::PhaseDone {
            self.state = PoolState::PreparedIdle;
        }
    }

    /// Drop worker bookkeeping after a join, so a fresh prepare can assign
    /// new ranks (hosts rotation).
    pub fn delete_threads(&mut self) {
        if !self.handles.is_empty() {
            self.join_all_threads();
        }
        self.slots.clear();
        self.registry = Arc::new(UploadRegistry::new());
        self.state = PoolState::Unprepared;
    }

    /// Master-mode check that all services reported consistent path infos.
    pub fn check_service_bench_path_infos(&self) -> Result<(), RunError> {
        let mut first: Option<(String, BenchPathInfo)> = None;
        for slot in &self.slots {
            let host = match &slot.host {
                Some(host) => host.clone(),
                None => continue,
            };
            let info = slot.path_info.lock().unwrap().clone().ok_or_else(|| {
                RunError::Config(format!("service {} did not report bench path info", host))
            })?;
            match &first {
                None => first = Some((host, info)),
                Some((first_host, first_info)) => {
                    if *first_info != info {
                        return Err(RunError::Config(format!(
                            "services disagree on bench path info: {} reports {:?}, {} reports {:?}",
                            first_host, first_info, host, info
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
