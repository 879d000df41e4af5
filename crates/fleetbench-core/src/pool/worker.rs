//! Worker side of the pool: the phase-dispatch thread loop and the abort
//! sentinel workers use to bail out at yield points.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use anyhow::Result;

use crate::errhist::ErrorHistory;
use crate::phase::BenchPhase;
use crate::run_state::SharedPhaseState;
use crate::stats::{Statistics, WorkerStats};

/// Error returned by a worker that stopped because of an interrupt or the
/// phase time limit. Not counted as a worker failure; the run outcome is
/// decided by the coordinator's phase-boundary check instead.
#[derive(Debug)]
pub struct PhaseAborted;

impl fmt::Display for PhaseAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase aborted")
    }
}

impl std::error::Error for PhaseAborted {}

/// A unit of benchmark execution driven by the pool: a local I/O worker or
/// the master-side client of one remote service.
pub trait PhaseWorker: Send + 'static {
    /// Called once on the worker thread before the first phase. Errors fail
    /// the pool prepare.
    fn prepare(&mut self, _ctl: &WorkerControl) -> Result<()> {
        Ok(())
    }

    /// Execute one phase. Must poll `ctl.check_abort()` at every I/O
    /// boundary and bail with `PhaseAborted` when asked. `Terminate` is the
    /// last call a worker ever receives.
    fn run_phase(
        &mut self,
        phase: BenchPhase,
        bench_id: Option<&str>,
        ctl: &WorkerControl,
    ) -> Result<()>;
}

/// Dispatch state guarded by the pool mutex. `generation` increments once
/// per dispatched phase so every worker observes each phase exactly once.
#[derive(Debug)]
pub(crate) struct Dispatch {
    pub phase: BenchPhase,
    pub bench_id: Option<String>,
    pub generation: u64,
    pub num_done: usize,
    pub num_error: usize,
}

/// State shared between the pool, its worker threads, and the phase timer.
#[derive(Debug)]
pub struct PoolShared {
    pub(crate) dispatch: Mutex<Dispatch>,
    pub(crate) cond: Condvar,
    pub(crate) interrupt: AtomicBool,
    pub(crate) total_errors: AtomicU64,
    pub(crate) num_workers: usize,
    pub(crate) run_state: Arc<SharedPhaseState>,
    pub(crate) stats: Arc<Statistics>,
}

impl PoolShared {
    pub(crate) fn new(
        run_state: Arc<SharedPhaseState>,
        stats: Arc<Statistics>,
        num_workers: usize,
    ) -> Self {
        Self {
            dispatch: Mutex::new(Dispatch {
                phase: BenchPhase::Idle,
                bench_id: None,
                generation: 0,
                num_done: 0,
                num_error: 0,
            }),
            cond: Condvar::new(),
            interrupt: AtomicBool::new(false),
            total_errors: AtomicU64::new(0),
            num_workers,
            run_state,
            stats,
        }
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }
}

/// Handle a worker uses to report progress, record errors, and observe
/// cancellation.
pub struct WorkerControl {
    pub(crate) shared: Arc<PoolShared>,
    pub stats: Arc<WorkerStats>,
    pub errhist: Arc<ErrorHistory>,
    rank: usize,
}

impl WorkerControl {
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// True once this worker should stop what it is doing: pool interrupt,
    /// user interrupt signal, or phase time limit.
    pub fn should_abort(&self) -> bool {
        self.shared.is_interrupted()
            || self.shared.run_state.is_interrupted()
            || self.shared.run_state.is_phase_time_expired()
    }

    /// Yield point: fails with `PhaseAborted` when the worker should stop.
    pub fn check_abort(&self) -> Result<()> {
        if self.should_abort() {
            return Err(PhaseAborted.into());
        }
        Ok(())
    }
}

enum Dispatched {
    Phase(BenchPhase, Option<String>, u64),
    Interrupted,
}

/// Spawn the thread for one worker. The thread blocks interrupt signals,
/// runs the prepare step, then loops on phase dispatch until `Terminate` or
/// a pool interrupt.
pub(crate) fn spawn_worker_thread(
    mut worker: Box<dyn PhaseWorker>,
    shared: Arc<PoolShared>,
    stats: Arc<WorkerStats>,
    errhist: Arc<ErrorHistory>,
    rank: usize,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(format!("worker-{}", rank))
        .spawn(move || {
            crate::signals::block_interrupt_signals();

            let ctl = WorkerControl {
                shared: Arc::clone(&shared),
                stats,
                errhist,
                rank,
            };

            // prepare step; generation 0 is the implicit prepare barrier
            let prep_result = worker.prepare(&ctl);
            let prep_failed = prep_result.is_err();
            mark_done(&ctl, prep_result);
            if prep_failed {
                return;
            }

            let mut last_generation = 0;
            loop {
                match wait_for_dispatch(&shared, last_generation) {
                    Dispatched::Interrupted => {
                        // give the worker a chance to tear down (remote
                        // workers forward the interrupt to their service)
                        let _ = worker.run_phase(BenchPhase::Terminate, None, &ctl);
                        return;
                    }
                    Dispatched::Phase(phase, bench_id, generation) => {
                        last_generation = generation;
                        let result = worker.run_phase(phase, bench_id.as_deref(), &ctl);
                        mark_done(&ctl, result);
                        if phase == BenchPhase::Terminate {
                            return;
                        }
                    }
                }
            }
        })
        .expect("spawn worker thread")
}

fn wait_for_dispatch(shared: &PoolShared, last_generation: u64) -> Dispatched {
    let mut dispatch = shared.dispatch.lock().unwrap();
    loop {
        if shared.is_interrupted() {
            return Dispatched::Interrupted;
        }
        if dispatch.generation > last_generation {
            return Dispatched::Phase(
                dispatch.phase,
                dispatch.bench_id.clone(),
                dispatch.generation,
            );
        }
        dispatch = shared.cond.wait(dispatch).unwrap();
    }
}

/// Report phase completion. Aborted workers count as done-without-error;
/// genuine failures go to the error history and the error counters.
fn mark_done(ctl: &WorkerControl, result: Result<()>) {
    let failed = match result {
        Ok(()) => false,
        Err(err) if err.downcast_ref::<PhaseAborted>().is_some() => false,
        Err(err) => {
            ctl.errhist
                .record(format!("worker {}: {:#}", ctl.rank, err));
            ctl.stats.inc_errors();
            ctl.shared.total_errors.fetch_add(1, Ordering::Relaxed);
            true
        }
    };

    let mut dispatch = ctl.shared.dispatch.lock().unwrap();
    dispatch.num_done += 1;
    if failed {
        dispatch.num_error += 1;
    }
    // the last worker of a dispatched phase flips the phase-done flag, so a
    // service's /status reports completion without a coordinator-side waiter
    if dispatch.generation > 0 && dispatch.num_done >= ctl.shared.num_workers {
        ctl.shared.stats.end_phase();
    }
    ctl.shared.cond.notify_all();
}
