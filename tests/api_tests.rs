//! HTTP API tests against the real router, plus the remote chunk invoker
//! talking to a served instance.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;

use chunk_relay::api;
use chunk_relay::config::{RelayConfig, WorkerConfig};
use chunk_relay::error::RelayError;
use chunk_relay::job::{Checkpoint, JobSpec, JobStatus};
use chunk_relay::relay::Relay;
use chunk_relay::store::JobStore;
use chunk_relay::worker::{ChunkInvoker, ChunkRequest, RemoteInvoker};

use test_harness::{test_clock, ScriptedProcessor};

fn relay_with(processor: ScriptedProcessor, max_concurrent_jobs: usize) -> Relay {
    let mut config = RelayConfig::default().with_max_concurrent_jobs(max_concurrent_jobs);
    config.worker = WorkerConfig {
        worker_id: "api-test".to_string(),
        continue_delay_ms: 0,
        ..WorkerConfig::default()
    };
    Relay::new(
        config,
        Arc::new(processor),
        Arc::new(test_clock()),
        CancellationToken::new(),
    )
}

fn relay() -> Relay {
    relay_with(ScriptedProcessor::new(100), 3)
}

fn app(relay: &Relay) -> Router {
    api::router(relay.api_state())
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn created_job(relay: &Relay, status: JobStatus) -> Uuid {
    let job = relay
        .store
        .create(JobSpec::new("annotate").with_total(100))
        .await
        .unwrap();
    relay.store.set_status(job.id, status, None).await.unwrap();
    job.id
}

#[tokio::test]
async fn test_start_job_returns_created() {
    let relay = relay();
    let response = app(&relay)
        .oneshot(post(
            "/api/jobs",
            json!({ "kind": "annotate", "total_units": 10, "params": { "units": 10 } }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "annotate");
    assert_eq!(body["status"], "running");
    assert_eq!(body["checkpoint"], json!({ "kind": "offset", "index": 0 }));
    assert!(Uuid::parse_str(body["id"].as_str().unwrap()).is_ok());
}

#[tokio::test]
async fn test_start_job_with_empty_kind_is_bad_request() {
    let relay = relay();
    let response = app(&relay)
        .oneshot(post("/api/jobs", json!({ "kind": "" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("kind"));
}

#[tokio::test]
async fn test_start_job_at_capacity_is_unavailable() {
    let relay = relay_with(ScriptedProcessor::new(100), 1);
    created_job(&relay, JobStatus::Running).await;

    let response = app(&relay)
        .oneshot(post("/api/jobs", json!({ "kind": "annotate" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("1 of 1"));
}

#[tokio::test]
async fn test_get_job() {
    let relay = relay();
    let id = created_job(&relay, JobStatus::Paused).await;

    let response = app(&relay)
        .oneshot(get(&format!("/api/jobs/{}", id)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], id.to_string());
    assert_eq!(body["status"], "paused");
    assert_eq!(body["total_units"], 100);
}

#[tokio::test]
async fn test_get_unknown_job_is_not_found() {
    let relay = relay();
    let response = app(&relay)
        .oneshot(get(&format!("/api/jobs/{}", Uuid::new_v4())))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_json(response).await["error"].is_string());
}

#[tokio::test]
async fn test_list_jobs_by_status() {
    let relay = relay();
    created_job(&relay, JobStatus::Paused).await;
    created_job(&relay, JobStatus::Running).await;
    created_job(&relay, JobStatus::Cancelled).await;

    let response = app(&relay)
        .oneshot(get("/api/jobs?status=paused,running"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 2);

    let response = app(&relay).oneshot(get("/api/jobs")).await.unwrap();
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 3);

    let response = app(&relay)
        .oneshot(get("/api/jobs?kind=enrich"))
        .await
        .unwrap();
    assert!(body_json(response).await.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_list_jobs_with_unknown_status_is_bad_request() {
    let relay = relay();
    let response = app(&relay)
        .oneshot(get("/api/jobs?status=stuck"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_run_chunk_endpoint() {
    let relay = relay();
    let id = created_job(&relay, JobStatus::Running).await;

    let response = app(&relay)
        .oneshot(post(
            &format!("/api/jobs/{}/chunks", id),
            json!({ "continue_from": { "kind": "offset", "index": 20 } }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["processed"], 50);
    assert_eq!(body["status"], "running");
    assert_eq!(body["next_checkpoint"], json!({ "kind": "offset", "index": 70 }));
}

#[tokio::test]
async fn test_run_chunk_without_body_uses_stored_checkpoint() {
    let relay = relay();
    let id = created_job(&relay, JobStatus::Running).await;

    let response = app(&relay)
        .oneshot(post_empty(&format!("/api/jobs/{}/chunks", id)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await["next_checkpoint"],
        json!({ "kind": "offset", "index": 50 })
    );
}

#[tokio::test]
async fn test_run_chunk_with_malformed_body_is_bad_request() {
    let relay = relay();
    let id = created_job(&relay, JobStatus::Running).await;

    let response = app(&relay)
        .oneshot(post(
            &format!("/api/jobs/{}/chunks", id),
            json!({ "continue_from": { "kind": "spiral", "index": 20 } }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let job = relay.store.get(id).await.unwrap();
    assert_eq!(job.checkpoint, Checkpoint::offset(0));
    assert_eq!(job.processed_units, 0);
}

#[tokio::test]
async fn test_run_chunk_past_the_end_is_bad_request() {
    let relay = relay();
    let id = created_job(&relay, JobStatus::Running).await;

    let response = app(&relay)
        .oneshot(post(
            &format!("/api/jobs/{}/chunks", id),
            json!({ "continue_from": { "kind": "offset", "index": 500 } }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let job = relay.store.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.checkpoint, Checkpoint::offset(0));
}

#[tokio::test]
async fn test_run_chunk_on_claimed_job_conflicts() {
    let relay = relay();
    let id = created_job(&relay, JobStatus::Running).await;
    relay
        .store
        .claim(id, "somebody-else", chrono::Duration::minutes(2))
        .await
        .unwrap();

    let response = app(&relay)
        .oneshot(post_empty(&format!("/api/jobs/{}/chunks", id)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert!(body_json(response).await["error"]
        .as_str()
        .unwrap()
        .contains("somebody-else"));
}

#[tokio::test]
async fn test_lifecycle_actions() {
    let relay = relay();
    let id = created_job(&relay, JobStatus::Running).await;

    let response = app(&relay)
        .oneshot(post_empty(&format!("/api/jobs/{}/pause", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "paused");

    let response = app(&relay)
        .oneshot(post_empty(&format!("/api/jobs/{}/restart", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "created");

    let response = app(&relay)
        .oneshot(post_empty(&format!("/api/jobs/{}/cancel", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "cancelled");

    let response = app(&relay)
        .oneshot(post_empty(&format!("/api/jobs/{}/resume", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_health_endpoint() {
    let relay = relay();
    created_job(&relay, JobStatus::Running).await;

    let response = app(&relay).oneshot(get("/api/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["gate"]["status"], "healthy");
    assert_eq!(body["gate"]["active_jobs"], 1);
    assert_eq!(body["gate"]["max_concurrent_jobs"], 3);
    assert_eq!(body["gate"]["delay_multiplier"], 1.0);
    assert_eq!(body["admission"]["decision"], "admitted");
}

#[tokio::test]
async fn test_monitor_endpoints() {
    let relay = relay();
    let id = created_job(&relay, JobStatus::Running).await;

    let response = app(&relay)
        .oneshot(post_empty("/api/monitor/sweep"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let report = body_json(response).await;
    assert_eq!(report["resumed"], json!([id.to_string()]));

    let response = app(&relay).oneshot(get("/api/monitor")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["stats"]["attempts"], 1);
    assert_eq!(body["stats"]["successes"], 1);
    let jobs = body["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["auto_resume_attempts"], 1);
    assert_eq!(jobs[0]["health"], "healthy");
}

/// Serve `relay`'s API on an ephemeral port.
async fn serve(relay: &Relay, shutdown: CancellationToken) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(relay);
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_remote_invoker_runs_chunk_over_http() {
    let relay = relay();
    let id = created_job(&relay, JobStatus::Running).await;
    let shutdown = CancellationToken::new();
    let base = serve(&relay, shutdown.clone()).await;

    let invoker = RemoteInvoker::new(base, Duration::from_secs(5)).unwrap();
    let report = invoker
        .invoke(ChunkRequest::continue_from(id, Checkpoint::offset(50)))
        .await
        .unwrap();

    assert_eq!(report.job_id, id);
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.next_checkpoint, Checkpoint::offset(100));
    assert_eq!(relay.store.get(id).await.unwrap().processed_units, 50);

    shutdown.cancel();
}

#[tokio::test]
async fn test_remote_invoker_surfaces_server_errors() {
    let relay = relay();
    let shutdown = CancellationToken::new();
    let base = serve(&relay, shutdown.clone()).await;

    let invoker = RemoteInvoker::new(format!("{}/", base), Duration::from_secs(5)).unwrap();
    let err = invoker
        .invoke(ChunkRequest::fresh(Uuid::new_v4()))
        .await
        .unwrap_err();

    match err {
        RelayError::Remote(message) => {
            assert!(message.starts_with("404"));
            assert!(message.contains("Job not found"));
        }
        other => panic!("unexpected error {:?}", other),
    }

    shutdown.cancel();
}
