//! Per-service HTTP control plane.
//!
//! State machine: UNPREPARED → (preparephase) → PREPARED → (startphase) →
//! RUNNING → (workers done) → PREPARED; interruptphase resets from any
//! state, and with `quit` also closes the listening socket.

pub mod daemon;
mod handlers;
mod state;

pub use handlers::router;
pub use state::{ServiceCore, ServiceState};

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

/// Startup options of `fleetbench --service`.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub port: u16,
    pub foreground: bool,
    pub pid_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

/// Run the control service until a client asks it to quit. Blocks the
/// calling thread; daemonises first unless running in the foreground, so no
/// other threads may exist when this is called.
pub fn run_service(opts: &ServiceOptions) -> Result<()> {
    daemon::check_port_available(opts.port)?;

    if !opts.foreground {
        daemon::daemonize(opts.log_file.as_deref())?;
    }

    let _pid_file = match &opts.pid_file {
        Some(path) => Some(daemon::write_pid_file(path)?),
        None => None,
    };

    // the runtime (and with it the S3 SDK, lazily) comes up only after the
    // daemonise forks above
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build service runtime")?;

    let state = Arc::new(ServiceState::new(opts.port));

    runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", opts.port))
            .await
            .with_context(|| format!("bind service port {}", opts.port))?;
        println!("Fleetbench service now listening. Port: {}", opts.port);
        tracing::info!("service listening, port {}", opts.port);

        serve(listener, Arc::clone(&state)).await
    })?;

    // quit requested: stop and reset any local workers before exiting
    let mut core = state.core.blocking_lock();
    core.interrupt_join_reset();
    drop(core);

    println!("Service stopped listening. Port: {}", opts.port);
    Ok(())
}

/// Serve the control plane on an already-bound listener until shutdown is
/// requested. Split out so tests can drive a service on an ephemeral port.
pub async fn serve(listener: tokio::net::TcpListener, state: Arc<ServiceState>) -> Result<()> {
    let app = router(Arc::clone(&state));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            state.shutdown.notified().await;
        })
        .await
        .context("HTTP service failed")
}
