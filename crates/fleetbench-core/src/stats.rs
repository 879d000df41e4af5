//! Benchmark statistics: per-worker atomic counters, the live printer loop,
//! per-phase result lines, and the JSON trees served by the control plane.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::BenchConfig;
use crate::phase::BenchPhase;

/// Counters one worker updates during a phase. Shared with the statistics
/// aggregator; reset between phases.
#[derive(Debug, Default)]
pub struct WorkerStats {
    ops_done: AtomicU64,
    bytes_done: AtomicU64,
    errors: AtomicU64,
}

impl WorkerStats {
    pub fn inc_ops(&self, n: u64) {
        self.ops_done.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_done.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ops(&self) -> u64 {
        self.ops_done.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes_done.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Overwrite with totals polled from a remote service.
    pub fn set_remote(&self, ops: u64, bytes: u64, errors: u64) {
        self.ops_done.store(ops, Ordering::Relaxed);
        self.bytes_done.store(bytes, Ordering::Relaxed);
        self.errors.store(errors, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.ops_done.store(0, Ordering::Relaxed);
        self.bytes_done.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }
}

/// Aggregated view over all workers of one pool. Read endpoints only touch
/// this struct, so `/status` never contends with a running control mutator.
#[derive(Debug)]
pub struct Statistics {
    label: Mutex<String>,
    workers: RwLock<Vec<Arc<WorkerStats>>>,
    phase_code: AtomicU8,
    phase_done: AtomicBool,
    phase_start: Mutex<Option<Instant>>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            label: Mutex::new(String::new()),
            workers: RwLock::new(Vec::new()),
            phase_code: AtomicU8::new(BenchPhase::Idle.wire_code()),
            phase_done: AtomicBool::new(false),
            phase_start: Mutex::new(None),
        }
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the worker slots of a freshly prepared pool.
    pub fn set_workers(&self, workers: Vec<Arc<WorkerStats>>, label: &str) {
        *self.workers.write().unwrap() = workers;
        *self.label.lock().unwrap() = label.to_string();
        self.phase_code
            .store(BenchPhase::Idle.wire_code(), Ordering::Relaxed);
        self.phase_done.store(false, Ordering::Relaxed);
    }

    pub fn begin_phase(&self, phase: BenchPhase) {
        self.phase_code.store(phase.wire_code(), Ordering::Relaxed);
        self.phase_done.store(false, Ordering::Relaxed);
        *self.phase_start.lock().unwrap() = Some(Instant::now());
    }

    pub fn end_phase(&self) {
        self.phase_done.store(true, Ordering::Relaxed);
    }

    pub fn current_phase(&self) -> BenchPhase {
        BenchPhase::from_wire_code(self.phase_code.load(Ordering::Relaxed))
            .unwrap_or(BenchPhase::Idle)
    }

    pub fn is_phase_done(&self) -> bool {
        self.phase_done.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.phase_start
            .lock()
            .unwrap()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    pub fn totals(&self) -> (u64, u64, u64) {
        let workers = self.workers.read().unwrap();
        let mut ops = 0;
        let mut bytes = 0;
        let mut errors = 0;
        for w in workers.iter() {
            ops += w.ops();
            bytes += w.bytes();
            errors += w.error_count();
        }
        (ops, bytes, errors)
    }

    /// Live stats tree for `/status`.
    pub fn live_stats_tree(&self) -> serde_json::Value {
        let (ops, bytes, errors) = self.totals();
        let workers = self.workers.read().unwrap();
        serde_json::json!({
            "label": self.label.lock().unwrap().clone(),
            "phase": self.current_phase().name(),
            "phase_done": self.is_phase_done(),
            "elapsed_ms": self.elapsed().as_millis() as u64,
            "total": { "ops": ops, "bytes": bytes, "errors": errors },
            "workers": workers
                .iter()
                .enumerate()
                .map(|(rank, w)| {
                    serde_json::json!({
                        "rank": rank,
                        "ops": w.ops(),
                        "bytes": w.bytes(),
                        "errors": w.error_count(),
                    })
                })
                .collect::<Vec<_>>(),
        })
    }

    /// Final result tree for `/benchresult`; same shape as the live tree so
    /// the master can aggregate both the same way.
    pub fn bench_result_tree(&self) -> serde_json::Value {
        self.live_stats_tree()
    }

    pub fn print_table_header(&self) {
        let label = self.label.lock().unwrap();
        if !label.is_empty() {
            println!("LABEL: {}", label);
        }
        println!(
            "{:<12} {:>10} {:>14} {:>12} {:>8}",
            "PHASE", "TIME s", "OPS", "MiB", "ERRORS"
        );
    }

    pub fn print_phase_result(&self, phase: BenchPhase) {
        let (ops, bytes, errors) = self.totals();
        println!(
            "{:<12} {:>10.3} {:>14} {:>12.2} {:>8}",
            phase.name(),
            self.elapsed().as_secs_f64(),
            ops,
            bytes as f64 / (1024.0 * 1024.0),
            errors
        );
    }

    fn print_live_line(&self) {
        let (ops, bytes, _) = self.totals();
        println!(
            "live: phase={} elapsed={}s ops={} mib={:.2}",
            self.current_phase().name(),
            self.elapsed().as_secs(),
            ops,
            bytes as f64 / (1024.0 * 1024.0)
        );
    }

    /// Print what a run with this config would do, without doing it.
    pub fn print_dry_run_info(cfg: &BenchConfig) {
        println!("DRY RUN");
        if !cfg.label.is_empty() {
            println!("label: {}", cfg.label);
        }
        println!(
            "hosts: {}",
            if cfg.hosts.is_empty() {
                "(local)".to_string()
            } else {
                cfg.hosts.join(", ")
            }
        );
        println!("threads: {}", cfg.num_threads);
        println!("iterations: {}", cfg.iterations);
        for phase in cfg.phases.enabled_phases() {
            println!("phase: {}", phase.name());
        }
        if cfg.phases.sync {
            println!("phase: {} (interleaved)", BenchPhase::Sync.name());
        }
        if cfg.phases.drop_caches {
            println!("phase: {} (interleaved)", BenchPhase::DropCaches.name());
        }
    }
}

/// Background thread printing one live line per second while a phase runs.
/// Stops on request or when dropped.
pub struct LivePrinter {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl LivePrinter {
    pub fn start(stats: Arc<Statistics>) -> LivePrinter {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("live-stats".into())
            .spawn(move || {
                // short ticks so stop() returns promptly; print once a second
                let mut ticks = 0u32;
                while !stop_flag.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(100));
                    ticks += 1;
                    if ticks % 10 == 0 && !stop_flag.load(Ordering::Relaxed) {
                        stats.print_live_line();
                    }
                }
            })
            .expect("spawn live-stats thread");
        LivePrinter {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LivePrinter {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_sum_worker_counters() {
        let stats = Statistics::new();
        let a = Arc::new(WorkerStats::default());
        let b = Arc::new(WorkerStats::default());
        stats.set_workers(vec![Arc::clone(&a), Arc::clone(&b)], "t");

        a.inc_ops(3);
        a.add_bytes(100);
        b.inc_ops(2);
        b.add_bytes(50);
        b.inc_errors();

        assert_eq!(stats.totals(), (5, 150, 1));
    }

    #[test]
    fn stats_tree_reports_phase_and_workers() {
        let stats = Statistics::new();
        let w = Arc::new(WorkerStats::default());
        stats.set_workers(vec![Arc::clone(&w)], "mylabel");
        stats.begin_phase(BenchPhase::CreateFiles);
        w.inc_ops(7);

        let tree = stats.live_stats_tree();
        assert_eq!(tree["phase"], "write");
        assert_eq!(tree["phase_done"], false);
        assert_eq!(tree["label"], "mylabel");
        assert_eq!(tree["total"]["ops"], 7);
        assert_eq!(tree["workers"][0]["rank"], 0);

        stats.end_phase();
        assert_eq!(stats.bench_result_tree()["phase_done"], true);
    }
}
