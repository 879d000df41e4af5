//! Pool dispatch, barrier, interrupt, and time-limit tests with synthetic
//! workers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use crate::config::{BenchPathInfo, BenchPathType};
use crate::errhist::ErrorHistory;
use crate::error::RunError;
use crate::phase::BenchPhase;
use crate::run_state::SharedPhaseState;
use crate::stats::Statistics;

use super::worker::{PhaseWorker, WorkerControl};
use super::{PoolState, WorkerPool, WorkerSlot};

#[derive(Default)]
struct TestWorkerConfig {
    fail_prepare: bool,
    fail_on: Option<BenchPhase>,
    /// Busy-wait in this phase until asked to abort (simulates a long
    /// phase with yield points).
    block_in: Option<BenchPhase>,
}

struct TestWorker {
    config: TestWorkerConfig,
    log: Arc<Mutex<Vec<BenchPhase>>>,
}

impl PhaseWorker for TestWorker {
    fn prepare(&mut self, _ctl: &WorkerControl) -> Result<()> {
        if self.config.fail_prepare {
            anyhow::bail!("synthetic prepare failure");
        }
        Ok(())
    }

    fn run_phase(
        &mut self,
        phase: BenchPhase,
        _bench_id: Option<&str>,
        ctl: &WorkerControl,
    ) -> Result<()> {
        self.log.lock().unwrap().push(phase);
        if self.config.fail_on == Some(phase) {
            anyhow::bail!("synthetic phase failure");
        }
        if self.config.block_in == Some(phase) {
            loop {
                ctl.check_abort()?;
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        ctl.stats.inc_ops(1);
        Ok(())
    }
}

struct TestPool {
    pool: WorkerPool,
    run_state: Arc<SharedPhaseState>,
    errhist: Arc<ErrorHistory>,
    logs: Vec<Arc<Mutex<Vec<BenchPhase>>>>,
}

fn build_pool(configs: Vec<TestWorkerConfig>, time_limit_secs: u64) -> (TestPool, Result<(), RunError>) {
    let run_state = Arc::new(SharedPhaseState::new());
    let errhist = Arc::new(ErrorHistory::new());
    let stats = Arc::new(Statistics::new());
    let mut pool = WorkerPool::new(
        Arc::clone(&run_state),
        Arc::clone(&errhist),
        Arc::clone(&stats),
    );

    let mut logs = Vec::new();
    let workers = configs
        .into_iter()
        .map(|config| {
            let log = Arc::new(Mutex::new(Vec::new()));
            logs.push(Arc::clone(&log));
            (
                Box::new(TestWorker { config, log }) as Box<dyn PhaseWorker>,
                WorkerSlot::new(None),
            )
        })
        .collect();

    let result = pool.prepare_workers(workers, time_limit_secs, "test");
    (
        TestPool {
            pool,
            run_state,
            errhist,
            logs,
        },
        result,
    )
}

#[test]
fn workers_observe_each_phase_exactly_once_in_order() {
    let configs = (0..3).map(|_| TestWorkerConfig::default()).collect();
    let (mut t, prepared) = build_pool(configs, 0);
    prepared.unwrap();
    assert_eq!(t.pool.state(), PoolState::PreparedIdle);

    let phases = [
        BenchPhase::CreateDirs,
        BenchPhase::CreateFiles,
        BenchPhase::ReadFiles,
    ];
    for phase in phases {
        t.pool.start_next_phase(phase, None).unwrap();
        assert_eq!(t.pool.state(), PoolState::PhaseRunning);
        t.pool.wait_for_workers_done().unwrap();
        assert_eq!(t.pool.state(), PoolState::PhaseDone);
        t.pool.cleanup_workers_after_phase_done();
        assert_eq!(t.pool.state(), PoolState::PreparedIdle);
    }

    t.pool
        .start_next_phase(BenchPhase::Terminate, None)
        .unwrap();
    t.pool.join_all_threads();

    for log in &t.logs {
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                BenchPhase::CreateDirs,
                BenchPhase::CreateFiles,
                BenchPhase::ReadFiles,
                BenchPhase::Terminate,
            ]
        );
    }
    assert_eq!(t.pool.total_errors(), 0);
}

#[test]
fn start_next_phase_is_illegal_before_prepare() {
    let run_state = Arc::new(SharedPhaseState::new());
    let mut pool = WorkerPool::new(
        run_state,
        Arc::new(ErrorHistory::new()),
        Arc::new(Statistics::new()),
    );
    match pool.start_next_phase(BenchPhase::CreateFiles, None) {
        Err(RunError::Config(_)) => {}
        other => panic!("expected config error, got {:?}", other),
    }
}

#[test]
fn first_error_interrupts_remaining_workers() {
    let configs = vec![
        TestWorkerConfig {
            fail_on: Some(BenchPhase::CreateFiles),
            ..Default::default()
        },
        TestWorkerConfig {
            block_in: Some(BenchPhase::CreateFiles),
            ..Default::default()
        },
        TestWorkerConfig {
            block_in: Some(BenchPhase::CreateFiles),
            ..Default::default()
        },
    ];
    let (mut t, prepared) = build_pool(configs, 0);
    prepared.unwrap();

    t.pool
        .start_next_phase(BenchPhase::CreateFiles, None)
        .unwrap();
    match t.pool.wait_for_workers_done() {
        Err(RunError::Worker) => {}
        other => panic!("expected worker error, got {:?}", other),
    }

    // only the genuine failure counts; aborted workers are clean
    assert_eq!(t.pool.total_errors(), 1);
    assert!(t.errhist.snapshot().contains("synthetic phase failure"));

    t.pool.join_all_threads();
}

#[test]
fn interrupt_aborts_in_flight_workers_without_errors() {
    let configs = (0..2)
        .map(|_| TestWorkerConfig {
            block_in: Some(BenchPhase::ReadFiles),
            ..Default::default()
        })
        .collect();
    let (mut t, prepared) = build_pool(configs, 0);
    prepared.unwrap();

    t.pool
        .start_next_phase(BenchPhase::ReadFiles, None)
        .unwrap();
    std::thread::sleep(Duration::from_millis(30));
    t.pool.interrupt_and_notify_workers();
    t.pool.wait_for_workers_done().unwrap();

    assert_eq!(t.pool.total_errors(), 0);
    assert!(t.errhist.is_empty());
    t.pool.join_all_threads();
}

#[test]
fn time_limit_expiry_flags_shared_state_and_aborts_workers() {
    let configs = (0..2)
        .map(|_| TestWorkerConfig {
            block_in: Some(BenchPhase::ReadFiles),
            ..Default::default()
        })
        .collect();
    let (mut t, prepared) = build_pool(configs, 1);
    prepared.unwrap();

    t.pool
        .start_next_phase(BenchPhase::ReadFiles, None)
        .unwrap();
    t.pool.wait_for_workers_done().unwrap();

    assert!(t.run_state.is_phase_time_expired());
    assert_eq!(t.pool.total_errors(), 0);
    match t.run_state.check_phase_boundary() {
        Err(RunError::TimeLimit) => {}
        other => panic!("expected time limit, got {:?}", other),
    }

    t.pool.join_all_threads();
}

#[test]
fn prepare_failure_surfaces_as_worker_error() {
    let configs = vec![
        TestWorkerConfig::default(),
        TestWorkerConfig {
            fail_prepare: true,
            ..Default::default()
        },
    ];
    let (t, prepared) = build_pool(configs, 0);
    match prepared {
        Err(RunError::Worker) => {}
        other => panic!("expected worker error, got {:?}", other),
    }
    assert!(t.errhist.snapshot().contains("synthetic prepare failure"));
    assert_eq!(t.pool.state(), PoolState::Unprepared);
}

#[test]
fn inconsistent_service_path_infos_are_rejected() {
    let run_state = Arc::new(SharedPhaseState::new());
    let mut pool = WorkerPool::new(
        run_state,
        Arc::new(ErrorHistory::new()),
        Arc::new(Statistics::new()),
    );

    let info = |file_size| BenchPathInfo {
        path_type: BenchPathType::Dir,
        file_size,
        block_size: 1024,
        num_threads: 2,
    };

    let slot_a = WorkerSlot::new(Some("host-a".into()));
    *slot_a.path_info.lock().unwrap() = Some(info(1024));
    let slot_b = WorkerSlot::new(Some("host-b".into()));
    *slot_b.path_info.lock().unwrap() = Some(info(2048));
    pool.slots = vec![slot_a, slot_b];

    match pool.check_service_bench_path_infos() {
        Err(RunError::Config(msg)) => assert!(msg.contains("disagree")),
        other => panic!("expected config error, got {:?}", other),
    }

    // consistent infos pass
    *pool.slots[1].path_info.lock().unwrap() = Some(info(1024));
    pool.check_service_bench_path_infos().unwrap();

    // a missing report is also a config error
    *pool.slots[1].path_info.lock().unwrap() = None;
    assert!(pool.check_service_bench_path_infos().is_err());
}
