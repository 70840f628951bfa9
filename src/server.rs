use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{clamp_timeout_secs, clamp_workers};
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, ValidationError};
use crate::events::{BroadcastSink, ScanEvent};
use crate::ports::validate_ports_spec;
use crate::store::ResultStore;
use crate::target::validate_target;
use crate::types::{JobStatus, ScanParams};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub events: BroadcastSink,
    pub results: ResultStore,
    /// Serve non-loopback peers too.
    pub allow_remote: bool,
}

/// Body of `POST /api/scan`. `timeout` and `max_workers` are hints: numbers
/// or numeric strings are accepted, anything else falls back to the default.
#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub ports: String,
    #[serde(default)]
    pub timeout: Option<Value>,
    #[serde(default, alias = "maxWorkers")]
    pub max_workers: Option<Value>,
}

impl ScanRequest {
    pub fn into_params(self) -> Result<ScanParams, ValidationError> {
        let timeout = self.timeout.as_ref().and_then(positive_number);
        let workers = self
            .max_workers
            .as_ref()
            .and_then(positive_number)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX));
        Ok(ScanParams {
            target: validate_target(&self.target)?,
            ports: validate_ports_spec(&self.ports)?,
            timeout_secs: Some(clamp_timeout_secs(timeout)),
            max_workers: Some(clamp_workers(workers)),
        })
    }
}

/// Whole part of a positive number or numeric string; `None` otherwise.
fn positive_number(value: &Value) -> Option<u64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (n.is_finite() && n >= 1.0).then(|| n.min(u64::MAX as f64) as u64)
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/scan", post(post_scan))
        .route("/scan/{id}", get(get_scan))
        .route("/scan/{id}/download", get(download_scan))
        .route("/scan/{id}/events", get(scan_events))
        .route("/stats", get(get_stats))
        .layer(middleware::from_fn_with_state(state.clone(), loopback_only))
        .with_state(state);

    Router::new().nest("/api", api).layer(TraceLayer::new_for_http())
}

pub async fn serve(
    bind: &str,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(addr = %listener.local_addr()?, "serving API");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn stopped(_: DispatchError) -> Response {
    error_response(StatusCode::SERVICE_UNAVAILABLE, "scan service is shutting down")
}

fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "scan not found")
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
    }
}

async fn loopback_only(State(app): State<AppState>, req: Request, next: Next) -> Response {
    if app.allow_remote {
        return next.run(req).await;
    }
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    match peer {
        Some(ip) if is_loopback(ip) => next.run(req).await,
        _ => error_response(StatusCode::FORBIDDEN, "access is restricted to localhost"),
    }
}

async fn post_scan(
    State(app): State<AppState>,
    body: Result<Json<ScanRequest>, JsonRejection>,
) -> Response {
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let params = match req.into_params() {
        Ok(p) => p,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    match app.dispatcher.enqueue(params).await {
        Ok(job) => (
            StatusCode::CREATED,
            Json(json!({
                "scan_id": job.id,
                "status": job.status,
                "queued_at": job.created_at.format(&Rfc3339).ok(),
            })),
        )
            .into_response(),
        Err(e) => stopped(e),
    }
}

async fn get_scan(State(app): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(id) = id.parse::<Uuid>() else {
        return not_found();
    };
    match app.dispatcher.snapshot(id).await {
        Ok(Some(view)) => (StatusCode::OK, Json(view)).into_response(),
        Ok(None) => not_found(),
        Err(e) => stopped(e),
    }
}

/// Serves the persisted artifact, so results stay downloadable after a restart.
async fn download_scan(State(app): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(id) = id.parse::<Uuid>() else {
        return not_found();
    };
    match app.dispatcher.get_job(id).await {
        Ok(Some(job)) if job.status != JobStatus::Done => {
            return error_response(StatusCode::CONFLICT, "scan has not finished yet");
        }
        Err(e) => return stopped(e),
        _ => {}
    }
    match app.results.load(&id).await {
        Ok(Some(result)) => (
            StatusCode::OK,
            [(
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{id}.json\""),
            )],
            Json(result),
        )
            .into_response(),
        Ok(None) => not_found(),
        Err(e) => {
            warn!(scan_id = %id, error = %format!("{e:#}"), "failed to load result");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "could not read the result file")
        }
    }
}

async fn get_stats(State(app): State<AppState>) -> Response {
    match app.dispatcher.stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => stopped(e),
    }
}

fn to_sse(event: &ScanEvent) -> Option<Event> {
    let data = match event {
        ScanEvent::Status { job, .. } => Event::default().json_data(job),
        ScanEvent::Progress { payload, .. } => Event::default().json_data(payload),
        ScanEvent::Done {
            job_id,
            result,
            result_path,
        } => Event::default().json_data(json!({
            "scan_id": job_id,
            "status": JobStatus::Done,
            "result": result,
            "file_path": result_path,
        })),
        ScanEvent::Error { job_id, error } => Event::default().json_data(json!({
            "scan_id": job_id,
            "error": error.message,
            "code": error.code,
            "timed_out": error.timed_out,
        })),
    };
    match data {
        Ok(e) => Some(e.event(event.name())),
        Err(e) => {
            warn!(error = %e, "failed to encode event");
            None
        }
    }
}

/// Server-sent events for one job: current status first, then live updates
/// until the job reaches a terminal state.
async fn scan_events(State(app): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(id) = id.parse::<Uuid>() else {
        return not_found();
    };
    // subscribe before the snapshot so nothing falls in between
    let mut rx = app.events.subscribe();
    let view = match app.dispatcher.snapshot(id).await {
        Ok(Some(view)) => view,
        Ok(None) => return not_found(),
        Err(e) => return stopped(e),
    };

    let (tx, out) = mpsc::channel::<Event>(64);
    let finished = view.status.is_terminal();
    let initial = to_sse(&ScanEvent::Status {
        job_id: id,
        job: Box::new(view),
    });

    tokio::spawn(async move {
        if let Some(initial) = initial {
            if tx.send(initial).await.is_err() {
                return;
            }
        }
        if finished {
            return;
        }
        loop {
            match rx.recv().await {
                Ok(event) if event.job_id() == id => {
                    let terminal = event.is_terminal();
                    if let Some(sse) = to_sse(&event) {
                        if tx.send(sse).await.is_err() {
                            break;
                        }
                    }
                    if terminal {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(scan_id = %id, skipped, "event subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let stream = ReceiverStream::new(out).map(Ok::<_, Infallible>);
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_hints_are_lenient() {
        assert_eq!(positive_number(&json!(60)), Some(60));
        assert_eq!(positive_number(&json!("60")), Some(60));
        assert_eq!(positive_number(&json!(12.5)), Some(12));
        assert_eq!(positive_number(&json!(-5)), None);
        assert_eq!(positive_number(&json!(0)), None);
        assert_eq!(positive_number(&json!("soon")), None);
        assert_eq!(positive_number(&json!(null)), None);
        assert_eq!(positive_number(&json!([1])), None);
    }

    #[test]
    fn request_hints_are_clamped() {
        let req: ScanRequest = serde_json::from_value(json!({
            "target": "127.0.0.1",
            "ports": "22",
            "timeout": "12.5",
            "maxWorkers": 1e12,
        }))
        .unwrap();
        let params = req.into_params().unwrap();
        assert_eq!(params.timeout_secs, Some(12));
        assert_eq!(params.max_workers, Some(512));
    }
}
