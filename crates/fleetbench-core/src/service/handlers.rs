//! HTTP endpoint handlers of the control service.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::config::BenchConfig;
use crate::phase::BenchPhase;
use crate::remote::protocol::{param, path, PrepareReply, PROTOCOL_VERSION};

use super::state::ServiceState;

pub fn router(state: Arc<ServiceState>) -> Router {
    Router::new()
        .route(path::INFO, get(info))
        .route(path::PROTOCOLVERSION, get(protocol_version))
        .route(path::STATUS, get(status))
        .route(path::BENCHRESULT, get(bench_result))
        .route(path::PREPAREFILE, post(prepare_file))
        .route(path::PREPAREPHASE, post(prepare_phase))
        .route(path::STARTPHASE, get(start_phase))
        .route(path::INTERRUPTPHASE, get(interrupt_phase))
        .with_state(state)
}

fn bad_request(body: String) -> Response {
    (StatusCode::BAD_REQUEST, body).into_response()
}

/// Every mutator checks the master's protocol version before touching any
/// state; a mismatch or a missing parameter is a 400.
fn check_protocol_version(params: &HashMap<String, String>) -> Result<(), String> {
    let master_version = params
        .get(param::PROTOCOLVERSION)
        .ok_or_else(|| format!("Missing parameter: {}", param::PROTOCOLVERSION))?;
    if master_version != PROTOCOL_VERSION {
        return Err(format!(
            "Protocol version mismatch. Service version: {}; Received master version: {}",
            PROTOCOL_VERSION, master_version
        ));
    }
    Ok(())
}

/// Human diagnostic echo, not used by the master.
async fn info(method: Method, uri: Uri, headers: HeaderMap) -> Html<String> {
    let mut page = format!(
        "<h1>{} {}</h1><h2>Query Fields</h2>",
        method,
        uri.path()
    );
    for pair in uri.query().unwrap_or_default().split('&') {
        if !pair.is_empty() {
            page.push_str(pair);
            page.push_str("<br>");
        }
    }
    page.push_str("<h2>Header Fields</h2>");
    for (name, value) in &headers {
        page.push_str(&format!("{}: {}<br>", name, value.to_str().unwrap_or("?")));
    }
    Html(page)
}

async fn protocol_version() -> &'static str {
    PROTOCOL_VERSION
}

async fn status(State(state): State<Arc<ServiceState>>) -> Json<serde_json::Value> {
    Json(state.stats.live_stats_tree())
}

async fn bench_result(State(state): State<Arc<ServiceState>>) -> Json<serde_json::Value> {
    Json(state.stats.bench_result_tree())
}

/// Strip any directory components; `../../../etc/passwd` becomes `passwd`.
fn sanitize_upload_filename(raw: &str) -> Option<String> {
    Path::new(raw)
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
}

async fn prepare_file(
    State(state): State<Arc<ServiceState>>,
    Query(params): Query<HashMap<String, String>>,
    body: Body,
) -> Response {
    tracing::debug!("HTTP: {}", path::PREPAREFILE);

    let fail = |msg: String| bad_request(format!("File preparation phase error: {}", msg));

    if let Err(msg) = check_protocol_version(&params) {
        return fail(msg);
    }
    let raw_name = match params.get(param::FILENAME) {
        Some(name) => name,
        None => return fail(format!("Missing parameter: {}", param::FILENAME)),
    };
    let filename = match sanitize_upload_filename(raw_name) {
        Some(name) => name,
        None => return fail(format!("Unusable filename: {}", raw_name)),
    };

    tracing::info!("receiving tree file from master: {}", filename);

    if let Err(err) = std::fs::create_dir_all(&state.upload_dir).and_then(|_| {
        std::fs::set_permissions(&state.upload_dir, std::fs::Permissions::from_mode(0o777))
    }) {
        return fail(format!(
            "Failed to create service upload dir {}: {}",
            state.upload_dir.display(),
            err
        ));
    }

    let dest = state.upload_dir.join(&filename);
    match stream_body_to_file(body, &dest).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => {
            // never leave a half-written upload behind
            let _ = tokio::fs::remove_file(&dest).await;
            fail(format!("Saving upload file failed: {:#}", err))
        }
    }
}

/// Write the request body to `dest` chunk by chunk; bodies can be large and
/// must not be buffered whole.
async fn stream_body_to_file(body: Body, dest: &Path) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| anyhow::anyhow!("client disconnected: {}", e))?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

async fn prepare_phase(
    State(state): State<Arc<ServiceState>>,
    Query(params): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    tracing::debug!("HTTP: {}", path::PREPAREPHASE);

    if let Err(msg) = check_protocol_version(&params) {
        return bad_request(format!("Preparation phase error: {}", msg));
    }

    let mut core = state.core.lock().await;
    let result = tokio::task::block_in_place(|| {
        BenchConfig::from_prepare_payload(&body).and_then(|cfg| core.prepare(cfg))
    });

    match result {
        Ok(path_info) => {
            let reply = PrepareReply {
                path_info,
                error_history: state.errhist.snapshot(),
            };
            Json(reply).into_response()
        }
        Err(err) => bad_request(format!(
            "Preparation phase error: {:#}\n{}",
            err,
            state.errhist.snapshot()
        )),
    }
}

async fn start_phase(
    State(state): State<Arc<ServiceState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    tracing::debug!("HTTP: {}", path::STARTPHASE);

    let phase = match params.get(param::BENCHPHASECODE) {
        None => {
            return bad_request(format!("Missing parameter: {}", param::BENCHPHASECODE));
        }
        Some(raw) => match raw.parse::<u8>().ok().and_then(BenchPhase::from_wire_code) {
            Some(phase) => phase,
            None => return bad_request(format!("Invalid bench phase code: {}", raw)),
        },
    };
    let bench_id = params.get(param::BENCHID).cloned();

    let mut core = state.core.lock().await;
    let result = tokio::task::block_in_place(|| core.start_phase(phase, bench_id));

    match result {
        Ok(()) => state.errhist.snapshot().into_response(),
        Err(err) => bad_request(format!("{:#}", err)),
    }
}

async fn interrupt_phase(
    State(state): State<Arc<ServiceState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    tracing::debug!("HTTP: {}", path::INTERRUPTPHASE);

    let mut core = state.core.lock().await;
    tokio::task::block_in_place(|| core.interrupt_join_reset());
    drop(core);

    let reply = state.errhist.snapshot();

    if params.contains_key(param::QUIT) {
        tracing::info!("shutting down as requested by client");
        // graceful shutdown still delivers this response before the
        // listening socket closes
        state.shutdown.notify_one();
    }

    reply.into_response()
}
