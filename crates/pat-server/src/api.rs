//! REST API handlers and SSE streaming for pat-server.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{sse::Event, IntoResponse, Redirect, Response, Sse},
    routing::get,
    Form, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{error, info};

use pat_core::export::to_csv_string;
use pat_core::store::MAX_RESULTS;
use pat_core::{Experiment, ExperimentConfiguration, PatError, WorkloadStep};

use crate::state::AppState;

const STREAM_POLL: Duration = Duration::from_millis(500);

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(redirect_base))
        .route("/experiments/", get(list_experiments).post(start_experiment))
        .route("/experiments/{name}", get(get_experiment))
        .route("/experiments/{name}/stream", get(stream_experiment))
        .route("/workloads", get(list_workloads))
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// A failed request, rendered as a status code and a plain-text message.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<PatError> for ApiError {
    fn from(e: PatError) -> Self {
        let status = match &e {
            PatError::UnknownExperiment(_) => StatusCode::NOT_FOUND,
            PatError::Validation(_) | PatError::InvalidConfiguration(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", e);
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn location(guid: &str) -> String {
    format!("/experiments/{guid}")
}

fn csv_location(guid: &str) -> String {
    format!("/experiments/{guid}.csv")
}

/// Parse an optional form field, falling back to `default` when it is
/// missing or blank.
fn field<T: std::str::FromStr>(name: &str, value: Option<&str>, default: T) -> ApiResult<T> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| ApiError::bad_request(format!("invalid {name}: {v:?}"))),
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn redirect_base() -> Redirect {
    Redirect::to("/experiments/")
}

async fn list_experiments(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let mut items = vec![];
    state.lab.visit(|e| {
        let guid = e.guid();
        let status = state
            .state(guid)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        items.push(json!({
            "Location": location(guid),
            "CsvLocation": csv_location(guid),
            "Name": format!("Experiment ({guid})"),
            "State": status,
        }));
    })?;
    Ok(Json(json!({ "Items": items })))
}

/// Form fields accepted when starting an experiment. All optional.
#[derive(Deserialize, Default)]
pub struct StartForm {
    iterations: Option<String>,
    concurrency: Option<String>,
    interval: Option<String>,
    stop: Option<String>,
    workload: Option<String>,
}

async fn start_experiment(
    State(state): State<AppState>,
    Form(form): Form<StartForm>,
) -> ApiResult<Response> {
    let iterations = field("iterations", form.iterations.as_deref(), 1usize)?;
    let concurrency = field("concurrency", form.concurrency.as_deref(), 1usize)?;
    let interval = field("interval", form.interval.as_deref(), 0u64)?;
    let stop = field("stop", form.stop.as_deref(), 0u64)?;
    let workload = form
        .workload
        .filter(|w| !w.trim().is_empty())
        .unwrap_or_else(|| "dummy".to_string());

    let config = ExperimentConfiguration::new(
        iterations,
        concurrency,
        Duration::from_secs(interval),
        Duration::from_secs(stop),
        state.worker.clone(),
        workload,
    );
    let running = state.lab.run(config)?;
    let guid = running.guid().to_string();
    state.track(running);
    info!(guid = %guid, "Experiment started over HTTP");

    let loc = location(&guid);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, loc.clone())],
        Json(json!({ "Location": loc, "CsvLocation": csv_location(&guid) })),
    )
        .into_response())
}

/// `GET /experiments/{guid}` returns JSON samples; a `.csv` suffix returns
/// the same samples as CSV.
async fn get_experiment(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    if let Some(guid) = name.strip_suffix(".csv") {
        let data = state.lab.get_data(guid)?;
        let body = to_csv_string(&data)?;
        return Ok(([(header::CONTENT_TYPE, "text/csv")], body).into_response());
    }
    let data = state.lab.get_data(&name)?;
    Ok(Json(json!({ "Items": data })).into_response())
}

/// What one poll of an experiment's samples turned up.
enum Poll {
    Samples(String),
    Idle,
    /// Nothing new can arrive: the experiment is not running here, or its
    /// reads are already capped at `MAX_RESULTS`.
    Done,
}

fn poll_samples(state: &AppState, guid: &str, sent: &mut usize) -> Poll {
    // Checked before reading, so a finished experiment's samples are all stored.
    let live = state.state(guid).is_some_and(|s| !s.is_finished());
    let data = match state.lab.get_data(guid) {
        Ok(data) => data,
        Err(e) => {
            error!(guid = %guid, "Failed to read samples for stream: {}", e);
            return Poll::Idle;
        }
    };
    if data.len() > *sent {
        let payload = serde_json::to_string(&data[*sent..]).unwrap_or_default();
        *sent = data.len();
        return Poll::Samples(payload);
    }
    if !live || data.len() >= MAX_RESULTS {
        return Poll::Done;
    }
    Poll::Idle
}

/// SSE endpoint: every 500ms, sends the samples stored since the last event.
/// The first event carries everything stored so far. The stream ends once
/// no further samples can be read.
async fn stream_experiment(
    State(state): State<AppState>,
    Path(guid): Path<String>,
) -> ApiResult<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>> {
    state.lab.get_data(&guid)?;
    let mut sent = 0;

    let interval = tokio::time::interval(STREAM_POLL);
    let stream = IntervalStream::new(interval)
        .map(move |_| poll_samples(&state, &guid, &mut sent))
        .take_while(|poll| !matches!(poll, Poll::Done))
        .filter_map(|poll| match poll {
            Poll::Samples(payload) => Some(Ok(Event::default().event("samples").data(payload))),
            Poll::Idle | Poll::Done => None,
        });

    Ok(Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

async fn list_workloads(State(state): State<AppState>) -> impl IntoResponse {
    let mut steps = vec![];
    state.worker.visit(&mut |s: &WorkloadStep| {
        steps.push(json!({ "Name": s.name, "Description": s.description }));
    });
    Json(steps)
}
