//! Router tests for pat-server, driven through `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use pat_core::store::{KvStore, MemoryLists};
use pat_core::{ExperimentState, Laboratory, LocalWorker, Worker, WorkloadStep};
use pat_server::{build_router, AppState};
use tokio::runtime::Handle;
use tower::ServiceExt;

fn make_state() -> AppState {
    let mut worker = LocalWorker::new();
    worker.add_workload_step(WorkloadStep::new(
        "push",
        || {
            std::thread::sleep(Duration::from_millis(5));
            Ok(())
        },
        "Pushes an app",
    ));
    worker.add_workload_step(WorkloadStep::new(
        "crash",
        || anyhow::bail!("app crashed"),
        "Always fails",
    ));
    let lab = Laboratory::with_handle(Arc::new(KvStore::new(MemoryLists::new())), Handle::current());
    AppState::new(lab, Arc::new(worker))
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, String) {
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let headers = res.headers().clone();
    let body = res.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8_lossy(&body).into_owned())
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_form(form: &str) -> Request<Body> {
    Request::post("/experiments/")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(form.to_string()))
        .unwrap()
}

/// Start an experiment and wait for it to finish. Returns its guid.
async fn start_and_finish(state: &AppState, app: &Router, form: &str) -> String {
    let (status, headers, _) = send(app, post_form(form)).await;
    assert_eq!(status, StatusCode::CREATED);
    let location = headers[header::LOCATION].to_str().unwrap().to_string();
    let guid = location.trim_start_matches("/experiments/").to_string();
    assert_eq!(wait_until_finished(state, &guid).await, ExperimentState::Completed);
    guid
}

async fn wait_until_finished(state: &AppState, guid: &str) -> ExperimentState {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match state.state(guid) {
                Some(s) if s.is_finished() => return s,
                Some(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                None => panic!("experiment {guid} is not tracked"),
            }
        }
    })
    .await
    .expect("experiment should finish")
}

#[tokio::test]
async fn test_root_redirects_to_experiments() {
    let app = build_router(make_state());
    let (status, headers, _) = send(&app, get("/")).await;
    assert!(status.is_redirection());
    assert_eq!(headers[header::LOCATION], "/experiments/");
}

#[tokio::test]
async fn test_list_starts_empty() {
    let app = build_router(make_state());
    let (status, _, body) = send(&app, get("/experiments/")).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["Items"], serde_json::json!([]));
}

#[tokio::test]
async fn test_post_runs_experiment_and_lists_it() {
    let state = make_state();
    let app = build_router(state.clone());
    let guid = start_and_finish(&state, &app, "iterations=3&concurrency=2&workload=push").await;

    let (_, _, body) = send(&app, get("/experiments/")).await;
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    let items = json["Items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["Location"], format!("/experiments/{guid}"));
    assert_eq!(items[0]["CsvLocation"], format!("/experiments/{guid}.csv"));
    assert_eq!(items[0]["State"], "COMPLETED");

    let (status, _, body) = send(&app, get(&format!("/experiments/{guid}"))).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    let results: Vec<_> = json["Items"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|s| s["Type"] == "result")
        .collect();
    assert_eq!(results.len(), 3);
    assert_eq!(results[2]["Total"], 3);
}

#[tokio::test]
async fn test_finished_experiments_keep_only_their_state() {
    let state = make_state();
    let app = build_router(state.clone());
    let guid = start_and_finish(&state, &app, "iterations=2&workload=push").await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while state.running(&guid).is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("finished experiment should be dropped");

    assert!(state.running.is_empty());
    assert_eq!(state.state(&guid), Some(ExperimentState::Completed));
    let (_, _, body) = send(&app, get("/experiments/")).await;
    assert!(body.contains("COMPLETED"));
}

#[tokio::test]
async fn test_csv_variant() {
    let state = make_state();
    let app = build_router(state.clone());
    let guid = start_and_finish(&state, &app, "iterations=2&workload=push,crash").await;

    let (status, headers, body) = send(&app, get(&format!("/experiments/{guid}.csv"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "text/csv");
    let mut lines = body.lines();
    assert_eq!(lines.next(), Some(pat_core::export::CSV_HEADER));
    assert!(body.contains("app crashed"));
}

#[tokio::test]
async fn test_invalid_workload_is_bad_request() {
    let state = make_state();
    let app = build_router(state.clone());
    let (status, _, body) = send(&app, post_form("workload=push,deploy")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("deploy"));
    assert!(state.lab.experiments().unwrap().is_empty());
}

#[tokio::test]
async fn test_bad_numbers_are_bad_request() {
    let app = build_router(make_state());
    let (status, _, body) = send(&app, post_form("iterations=lots&workload=push")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("iterations"));

    let (status, _, _) = send(&app, post_form("concurrency=0&workload=push")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_experiment_is_not_found() {
    let app = build_router(make_state());
    for uri in ["/experiments/nope", "/experiments/nope.csv", "/experiments/nope/stream"] {
        let (status, _, _) = send(&app, get(uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn test_workloads_lists_registered_steps() {
    let app = build_router(make_state());
    let (status, _, body) = send(&app, get("/workloads")).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json[0]["Name"], "push");
    assert_eq!(json[1]["Name"], "crash");
    assert_eq!(json[1]["Description"], "Always fails");
}

#[tokio::test]
async fn test_stream_sends_stored_samples() {
    let state = make_state();
    let app = build_router(state.clone());
    let guid = start_and_finish(&state, &app, "iterations=2&workload=push").await;

    let res = app
        .clone()
        .oneshot(get(&format!("/experiments/{guid}/stream")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[header::CONTENT_TYPE], "text/event-stream");

    let mut body = res.into_body();
    let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
        .await
        .expect("an event within the poll interval")
        .unwrap()
        .unwrap();
    let text = String::from_utf8_lossy(frame.data_ref().unwrap()).into_owned();
    assert!(text.starts_with("event: samples"));
    assert!(text.contains("\"Total\":2"));
}

#[tokio::test]
async fn test_stream_ends_after_a_finished_experiment() {
    let state = make_state();
    let app = build_router(state.clone());
    let guid = start_and_finish(&state, &app, "iterations=2&workload=push").await;

    let res = app
        .clone()
        .oneshot(get(&format!("/experiments/{guid}/stream")))
        .await
        .unwrap();
    let body = tokio::time::timeout(Duration::from_secs(5), res.into_body().collect())
        .await
        .expect("stream should close once everything was sent")
        .unwrap()
        .to_bytes();
    let text = String::from_utf8_lossy(&body);
    assert_eq!(text.matches("event: samples").count(), 1);
}
