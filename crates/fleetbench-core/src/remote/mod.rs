//! Master-side client of one remote service. Runs inside a pool worker
//! thread and mirrors a local worker's lifecycle: prepare pushes config to
//! the service, each dispatched phase becomes a startphase call plus a
//! status poll loop, and terminate forwards the interrupt.
//!
//! Failure policy: network errors, non-2xx replies, and protocol-version
//! mismatches put this client into error state without retry; benchmark
//! runs have to be reproducible, not resilient.

pub mod http;
pub mod protocol;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::BenchConfig;
use crate::phase::BenchPhase;
use crate::pool::{PhaseWorker, WorkerControl, WorkerSlot};

use protocol::{param, path, PrepareReply, PROTOCOL_VERSION};

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);
const STATUS_POLL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RemoteWorkerClient {
    rank: usize,
    host: String,
    base_url: String,
    cfg: Arc<BenchConfig>,
    slot: Arc<WorkerSlot>,
    quit_on_terminate: bool,
    tree_file: Option<PathBuf>,
}

impl RemoteWorkerClient {
    pub fn new(
        rank: usize,
        host: String,
        port: u16,
        cfg: Arc<BenchConfig>,
        slot: Arc<WorkerSlot>,
        quit_on_terminate: bool,
    ) -> RemoteWorkerClient {
        RemoteWorkerClient {
            rank,
            base_url: format!("http://{}:{}", host, port),
            host,
            tree_file: cfg.tree_file.clone(),
            cfg,
            slot,
            quit_on_terminate,
        }
    }

    fn url(&self, endpoint: &str, query: &str) -> String {
        if query.is_empty() {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}{}?{}", self.base_url, endpoint, query)
        }
    }

    fn check_protocol_version(&self) -> Result<()> {
        let reply = http::get(
            &self.url(path::PROTOCOLVERSION, ""),
            http::REQUEST_TIMEOUT,
        )
        .with_context(|| format!("service {} unreachable", self.host))?;
        if !reply.is_success() {
            anyhow::bail!(
                "service {}: protocol version probe failed: {}",
                self.host,
                reply.body_string()
            );
        }
        let service_version = reply.body_string();
        if service_version != PROTOCOL_VERSION {
            anyhow::bail!(
                "Protocol version mismatch. Service {} version: {}; master version: {}",
                self.host,
                service_version,
                PROTOCOL_VERSION
            );
        }
        Ok(())
    }

    fn upload_tree_file(&self) -> Result<()> {
        let tree_file = match &self.tree_file {
            Some(path) => path,
            None => return Ok(()),
        };
        let filename = tree_file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow::anyhow!("tree file has no usable name"))?;
        let query = format!(
            "{}={}&{}={}",
            param::PROTOCOLVERSION,
            http::url_encode(PROTOCOL_VERSION),
            param::FILENAME,
            http::url_encode(filename)
        );
        let reply = http::post_file(
            &self.url(path::PREPAREFILE, &query),
            tree_file,
            http::REQUEST_TIMEOUT,
        )
        .with_context(|| format!("service {}: tree file upload failed", self.host))?;
        if !reply.is_success() {
            anyhow::bail!("service {}: {}", self.host, reply.body_string());
        }
        Ok(())
    }

    fn send_prepare_phase(&self, ctl: &WorkerControl) -> Result<()> {
        let payload = self.cfg.to_service_payload()?;
        let query = format!(
            "{}={}",
            param::PROTOCOLVERSION,
            http::url_encode(PROTOCOL_VERSION)
        );
        let reply = http::post_bytes(
            &self.url(path::PREPAREPHASE, &query),
            payload.as_bytes(),
            http::REQUEST_TIMEOUT,
        )
        .with_context(|| format!("service {}: prepare failed", self.host))?;
        if !reply.is_success() {
            anyhow::bail!("service {}: {}", self.host, reply.body_string());
        }

        let prepare_reply: PrepareReply = serde_json::from_slice(&reply.body)
            .with_context(|| format!("service {}: malformed prepare reply", self.host))?;
        if !prepare_reply.error_history.is_empty() {
            ctl.errhist.record(prepare_reply.error_history.trim_end());
        }
        *self.slot.path_info.lock().unwrap() = Some(prepare_reply.path_info);
        Ok(())
    }

    /// Cancel whatever the service is doing; with quit the service also
    /// closes its listening socket and exits.
    fn send_interrupt(&self, quit: bool) -> Result<()> {
        let query = if quit {
            format!("{}=1", param::QUIT)
        } else {
            String::new()
        };
        let reply = http::get(&self.url(path::INTERRUPTPHASE, &query), http::REQUEST_TIMEOUT)
            .with_context(|| format!("service {}: interrupt failed", self.host))?;
        if !reply.is_success() {
            anyhow::bail!("service {}: {}", self.host, reply.body_string());
        }
        Ok(())
    }

    fn send_start_phase(
        &self,
        phase: BenchPhase,
        bench_id: Option<&str>,
        ctl: &WorkerControl,
    ) -> Result<()> {
        let mut query = format!("{}={}", param::BENCHPHASECODE, phase.wire_code());
        if let Some(id) = bench_id {
            query.push_str(&format!("&{}={}", param::BENCHID, http::url_encode(id)));
        }
        let reply = http::get(&self.url(path::STARTPHASE, &query), http::REQUEST_TIMEOUT)
            .with_context(|| format!("service {}: start phase failed", self.host))?;
        if !reply.is_success() {
            anyhow::bail!("service {}: {}", self.host, reply.body_string());
        }
        let errhist = reply.body_string();
        if !errhist.is_empty() {
            ctl.errhist.record(errhist.trim_end());
        }
        Ok(())
    }

    /// Apply one polled stats tree to this worker's slot so the master's
    /// live view aggregates the whole fleet.
    fn apply_remote_stats(&self, tree: &serde_json::Value) {
        let total = &tree["total"];
        self.slot.stats.set_remote(
            total["ops"].as_u64().unwrap_or(0),
            total["bytes"].as_u64().unwrap_or(0),
            total["errors"].as_u64().unwrap_or(0),
        );
    }

    /// Poll `/status` until the service reports the phase done, then fetch
    /// the final `/benchresult`.
    fn poll_until_phase_done(&self, ctl: &WorkerControl) -> Result<()> {
        loop {
            if ctl.should_abort() {
                let _ = self.send_interrupt(false);
                return Err(crate::pool::PhaseAborted.into());
            }
            std::thread::sleep(STATUS_POLL_INTERVAL);

            let reply = http::get(&self.url(path::STATUS, ""), STATUS_POLL_TIMEOUT)
                .with_context(|| format!("service {}: status poll failed", self.host))?;
            if !reply.is_success() {
                anyhow::bail!("service {}: {}", self.host, reply.body_string());
            }
            let tree: serde_json::Value = serde_json::from_slice(&reply.body)
                .with_context(|| format!("service {}: malformed status reply", self.host))?;
            self.apply_remote_stats(&tree);
            if tree["phase_done"].as_bool().unwrap_or(false) {
                break;
            }
        }

        let reply = http::get(&self.url(path::BENCHRESULT, ""), http::REQUEST_TIMEOUT)
            .with_context(|| format!("service {}: result fetch failed", self.host))?;
        if !reply.is_success() {
            anyhow::bail!("service {}: {}", self.host, reply.body_string());
        }
        let tree: serde_json::Value = serde_json::from_slice(&reply.body)
            .with_context(|| format!("service {}: malformed result reply", self.host))?;
        self.apply_remote_stats(&tree);

        let remote_errors = tree["total"]["errors"].as_u64().unwrap_or(0);
        if remote_errors > 0 {
            anyhow::bail!(
                "service {} reported {} worker errors",
                self.host,
                remote_errors
            );
        }
        Ok(())
    }
}

impl PhaseWorker for RemoteWorkerClient {
    fn prepare(&mut self, ctl: &WorkerControl) -> Result<()> {
        tracing::debug!(rank = self.rank, host = %self.host, "preparing remote service");
        self.check_protocol_version()?;
        self.upload_tree_file()?;
        self.send_prepare_phase(ctl)
    }

    fn run_phase(
        &mut self,
        phase: BenchPhase,
        bench_id: Option<&str>,
        ctl: &WorkerControl,
    ) -> Result<()> {
        if phase == BenchPhase::Terminate {
            // best effort; the service may already be gone
            if let Err(err) = self.send_interrupt(self.quit_on_terminate) {
                tracing::debug!("{:#}", err);
            }
            return Ok(());
        }

        self.send_start_phase(phase, bench_id, ctl)?;
        self.poll_until_phase_done(ctl)
    }
}

/// One-shot helper for `--interrupt` / `--quit`: tell every configured
/// service to cancel (and optionally exit) without preparing a benchmark.
pub fn interrupt_services(hosts: &[String], port: u16, quit: bool) -> Result<()> {
    let mut first_error = None;
    for host in hosts {
        let query = if quit { format!("{}=1", param::QUIT) } else { String::new() };
        let url = if query.is_empty() {
            format!("http://{}:{}{}", host, port, path::INTERRUPTPHASE)
        } else {
            format!("http://{}:{}{}?{}", host, port, path::INTERRUPTPHASE, query)
        };
        match http::get(&url, http::REQUEST_TIMEOUT) {
            Ok(reply) if reply.is_success() => {
                tracing::info!("service {} interrupted", host);
            }
            Ok(reply) => {
                tracing::error!("service {}: {}", host, reply.body_string());
                first_error.get_or_insert_with(|| {
                    anyhow::anyhow!("service {}: {}", host, reply.body_string())
                });
            }
            Err(err) => {
                tracing::error!("service {}: {:#}", host, err);
                first_error.get_or_insert(err);
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
