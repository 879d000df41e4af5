//! Integration tests: an in-process control service on an ephemeral port,
//! driven over real HTTP with the master-side client helpers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fleetbench_core::remote::http;
use fleetbench_core::remote::protocol::{param, path, PrepareReply, PROTOCOL_VERSION};
use fleetbench_core::service::{serve, ServiceState};

const TIMEOUT: Duration = Duration::from_secs(10);

struct TestService {
    base: String,
    state: Arc<ServiceState>,
    runtime: tokio::runtime::Runtime,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl TestService {
    fn start() -> TestService {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let (listener, port) = runtime.block_on(async {
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
            let port = listener.local_addr().unwrap().port();
            (listener, port)
        });
        let state = Arc::new(ServiceState::new(port));
        let server = runtime.spawn(serve(listener, Arc::clone(&state)));
        TestService {
            base: format!("http://127.0.0.1:{}", port),
            state,
            runtime,
            server,
        }
    }

    fn url(&self, endpoint: &str, query: &str) -> String {
        if query.is_empty() {
            format!("{}{}", self.base, endpoint)
        } else {
            format!("{}{}?{}", self.base, endpoint, query)
        }
    }

    fn get(&self, endpoint: &str, query: &str) -> http::Response {
        http::get(&self.url(endpoint, query), TIMEOUT).unwrap()
    }

    fn post(&self, endpoint: &str, query: &str, body: &str) -> http::Response {
        http::post_bytes(&self.url(endpoint, query), body.as_bytes(), TIMEOUT).unwrap()
    }

    fn prepare_query() -> String {
        format!("{}={}", param::PROTOCOLVERSION, PROTOCOL_VERSION)
    }

    /// Prepare a two-thread local pool over a scratch dir.
    fn prepare(&self, bench_dir: &std::path::Path) -> http::Response {
        let payload = serde_json::json!({
            "bench_paths": [bench_dir],
            "num_threads": 2,
            "num_files": 4,
            "file_size": 1024,
            "block_size": 512,
            "phases": { "create_files": true, "read_files": true }
        });
        self.post(
            path::PREPAREPHASE,
            &Self::prepare_query(),
            &payload.to_string(),
        )
    }

    fn start_phase(&self, code: u8) -> http::Response {
        self.get(
            path::STARTPHASE,
            &format!("{}={}", param::BENCHPHASECODE, code),
        )
    }

    /// Poll `/status` until the service reports the phase done.
    fn wait_phase_done(&self) -> serde_json::Value {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            std::thread::sleep(Duration::from_millis(50));
            let reply = self.get(path::STATUS, "");
            assert!(reply.is_success());
            let tree: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
            if tree["phase_done"].as_bool() == Some(true) {
                return tree;
            }
            assert!(Instant::now() < deadline, "phase did not finish in time");
        }
    }
}

#[test]
fn protocol_version_probe() {
    let svc = TestService::start();
    let reply = svc.get(path::PROTOCOLVERSION, "");
    assert!(reply.is_success());
    assert_eq!(reply.body_string(), PROTOCOL_VERSION);
}

#[test]
fn version_mismatch_is_rejected_before_any_state_change() {
    let svc = TestService::start();

    let reply = svc.post(
        path::PREPAREPHASE,
        &format!("{}=v0", param::PROTOCOLVERSION),
        "{}",
    );
    assert_eq!(reply.status, 400);
    assert!(reply.body_string().contains("Protocol version mismatch"));

    // service remains unprepared
    let reply = svc.start_phase(4);
    assert_eq!(reply.status, 400);
    assert!(reply.body_string().contains("not prepared"));
}

#[test]
fn upload_filename_traversal_is_contained() {
    let svc = TestService::start();

    let query = format!(
        "{}&{}=..%2F..%2F..%2Fetc%2Fpasswd",
        TestService::prepare_query(),
        param::FILENAME
    );
    let reply = svc.post(path::PREPAREFILE, &query, "treefile contents");
    assert!(reply.is_success(), "{}", reply.body_string());

    let uploaded = svc.state.upload_dir.join("passwd");
    assert_eq!(
        std::fs::read_to_string(&uploaded).unwrap(),
        "treefile contents"
    );
    // nothing escaped the upload dir
    assert!(!svc.state.upload_dir.join("etc").exists());

    let _ = std::fs::remove_dir_all(&svc.state.upload_dir);
}

#[test]
fn upload_requires_filename_parameter() {
    let svc = TestService::start();
    let reply = svc.post(path::PREPAREFILE, &TestService::prepare_query(), "x");
    assert_eq!(reply.status, 400);
    assert!(reply.body_string().contains("Missing parameter"));
}

#[test]
fn start_phase_requires_phase_code() {
    let svc = TestService::start();
    let reply = svc.get(path::STARTPHASE, "");
    assert_eq!(reply.status, 400);
    assert!(reply
        .body_string()
        .contains(&format!("Missing parameter: {}", param::BENCHPHASECODE)));
}

#[test]
fn write_then_read_cycle_and_interrupt_idempotence() {
    let svc = TestService::start();
    let bench_dir = tempfile::tempdir().unwrap();

    // prepare
    let reply = svc.prepare(bench_dir.path());
    assert!(reply.is_success(), "{}", reply.body_string());
    let prepared: PrepareReply = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(prepared.path_info.num_threads, 2);
    assert_eq!(prepared.path_info.file_size, 1024);

    // write phase (wire code 4 = CreateFiles)
    let reply = svc.start_phase(4);
    assert!(reply.is_success(), "{}", reply.body_string());
    svc.wait_phase_done();

    let result = svc.get(path::BENCHRESULT, "");
    let tree: serde_json::Value = serde_json::from_slice(&result.body).unwrap();
    assert_eq!(tree["phase"], "write");
    assert_eq!(tree["total"]["ops"], 4);
    assert_eq!(tree["total"]["bytes"], 4 * 1024);
    assert_eq!(tree["total"]["errors"], 0);
    for i in 0..4 {
        let file = bench_dir.path().join(format!("f{:04}", i));
        assert_eq!(std::fs::metadata(&file).unwrap().len(), 1024);
    }

    // read phase right after; the service settles the previous phase itself
    let reply = svc.start_phase(6);
    assert!(reply.is_success(), "{}", reply.body_string());
    svc.wait_phase_done();
    let result = svc.get(path::BENCHRESULT, "");
    let tree: serde_json::Value = serde_json::from_slice(&result.body).unwrap();
    assert_eq!(tree["phase"], "read");
    assert_eq!(tree["total"]["bytes"], 4 * 1024);

    // interrupt resets to unprepared; a second interrupt is a no-op
    let reply = svc.get(path::INTERRUPTPHASE, "");
    assert!(reply.is_success());
    let reply = svc.get(path::INTERRUPTPHASE, "");
    assert!(reply.is_success());

    let reply = svc.start_phase(4);
    assert_eq!(reply.status, 400);
    assert!(reply.body_string().contains("not prepared"));
}

#[test]
fn prepare_error_fully_resets_the_service() {
    let svc = TestService::start();

    // nonexistent bench path makes the worker prepare step fail
    let payload = serde_json::json!({
        "bench_paths": ["/nonexistent/fleetbench/path"],
        "num_threads": 1
    });
    let reply = svc.post(
        path::PREPAREPHASE,
        &TestService::prepare_query(),
        &payload.to_string(),
    );
    assert_eq!(reply.status, 400);
    assert!(reply.body_string().contains("Preparation phase error"));

    // no further interrupt is sent by the master in this path; the service
    // must already be unprepared
    let reply = svc.start_phase(4);
    assert_eq!(reply.status, 400);
    assert!(reply.body_string().contains("not prepared"));
}

#[test]
fn quit_closes_the_listening_socket() {
    let svc = TestService::start();

    let reply = svc.get(path::INTERRUPTPHASE, &format!("{}=1", param::QUIT));
    assert!(reply.is_success());

    // the serve future must complete once the reply is delivered
    let served = svc.runtime.block_on(async {
        tokio::time::timeout(TIMEOUT, svc.server).await
    });
    served.expect("server did not shut down").unwrap().unwrap();
}
