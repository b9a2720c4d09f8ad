//! Job service tests: gated starts, chained chunks and the pause, resume,
//! cancel and restart actions.

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde_json::json;

use chunk_relay::error::RelayError;
use chunk_relay::gate::RejectReason;
use chunk_relay::job::{Checkpoint, JobSpec, JobStatus};
use chunk_relay::store::JobStore;

use test_harness::{assert_eventually, Harness, ScriptedProcessor};

fn spec(units: u64) -> JobSpec {
    JobSpec::new("annotate")
        .with_total(units)
        .with_params(json!({ "units": units }))
}

#[tokio::test]
async fn test_started_job_runs_to_completion() {
    let h = Harness::new(ScriptedProcessor::new(120));
    let service = h.service(3);

    let job = service.start(spec(120)).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);

    let store = h.store.clone();
    let id = job.id;
    assert_eventually(
        || {
            let store = store.clone();
            async move { store.get(id).await.unwrap().status == JobStatus::Completed }
        },
        Duration::from_secs(5),
        "job should complete across three chunks",
    )
    .await;

    let job = h.job(id).await;
    assert_eq!(job.processed_units, 120);
    assert_eq!(job.checkpoint, Checkpoint::offset(120));
    assert_eq!(h.processor.calls(), 120);
}

#[tokio::test]
async fn test_start_rejected_at_capacity() {
    let h = Harness::new(ScriptedProcessor::new(100).with_latency(Duration::from_millis(20)));
    let service = h.service(1);

    let first = service.start(spec(100)).await.unwrap();
    let err = service.start(spec(100)).await.unwrap_err();

    assert!(matches!(
        err,
        RelayError::AdmissionRejected(RejectReason::AtCapacity { active: 1, max: 1 })
    ));
    assert_eq!(h.store.len().await, 1);

    service.cancel(first.id).await.unwrap();
}

#[tokio::test]
async fn test_start_rejects_empty_kind() {
    let h = Harness::new(ScriptedProcessor::new(10));
    let service = h.service(3);

    let err = service.start(JobSpec::new("")).await.unwrap_err();
    assert!(matches!(err, RelayError::InvalidSpec(_)));
}

#[tokio::test]
async fn test_pause_then_resume() {
    let h = Harness::new(ScriptedProcessor::new(100).with_latency(Duration::from_millis(5)));
    let service = h.service(3);
    let job = service.start(spec(100)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    let paused = service.pause(job.id).await.unwrap();
    assert_eq!(paused.status, JobStatus::Paused);

    // Let the in-flight unit land, then make sure nothing moves.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let settled = h.job(job.id).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let later = h.job(job.id).await;
    assert_eq!(settled.checkpoint, later.checkpoint);
    assert_eq!(later.status, JobStatus::Paused);
    assert!(later.processed_units < 100);
    assert!(later.lease.is_none());

    let resumed = service.resume(job.id).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Running);
    assert_eq!(resumed.checkpoint, later.checkpoint);

    let store = h.store.clone();
    let id = job.id;
    assert_eventually(
        || {
            let store = store.clone();
            async move { store.get(id).await.unwrap().status == JobStatus::Completed }
        },
        Duration::from_secs(5),
        "resumed job should complete",
    )
    .await;
    assert_eq!(h.job(id).await.processed_units, 100);
    assert_eq!(h.processor.calls(), 100, "no unit may be processed twice");
}

#[tokio::test]
async fn test_cancel_running_chunk() {
    let h = Harness::new(ScriptedProcessor::new(100).with_latency(Duration::from_millis(10)));
    let service = h.service(3);
    let job = service.start(spec(100)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let flagged = service.cancel(job.id).await.unwrap();
    assert!(flagged.is_cancelling);

    let store = h.store.clone();
    let id = job.id;
    assert_eventually(
        || {
            let store = store.clone();
            async move { store.get(id).await.unwrap().status == JobStatus::Cancelled }
        },
        Duration::from_secs(2),
        "running chunk should observe cancellation",
    )
    .await;
    assert!(h.job(id).await.processed_units < 100);
}

#[tokio::test]
async fn test_cancel_idle_job_finishes_immediately() {
    let h = Harness::new(ScriptedProcessor::new(100));
    let service = h.service(3);
    let job = h.running_job(100).await;

    let cancelled = service.cancel(job.id).await.unwrap();

    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.processed_units, 0);
    assert_eq!(h.processor.calls(), 0);
}

#[tokio::test]
async fn test_actions_on_terminal_jobs() {
    let h = Harness::new(ScriptedProcessor::new(100));
    let service = h.service(3);
    let job = h.running_job(100).await;
    h.store
        .set_status(job.id, JobStatus::Completed, None)
        .await
        .unwrap();

    assert!(matches!(
        service.resume(job.id).await.unwrap_err(),
        RelayError::Terminal(_)
    ));
    assert!(matches!(
        service.pause(job.id).await.unwrap_err(),
        RelayError::Terminal(_)
    ));
    assert!(matches!(
        service.restart(job.id).await.unwrap_err(),
        RelayError::Terminal(_)
    ));
    assert_eq!(
        service.cancel(job.id).await.unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn test_unknown_job() {
    let h = Harness::new(ScriptedProcessor::new(100));
    let service = h.service(3);

    assert!(matches!(
        service.pause(uuid::Uuid::new_v4()).await.unwrap_err(),
        RelayError::JobNotFound(_)
    ));
}

#[tokio::test]
async fn test_restart_rewinds_paused_job() {
    let h = Harness::new(ScriptedProcessor::new(100));
    let service = h.service(3);
    let job = h.running_job(100).await;
    service
        .run_chunk(chunk_relay::worker::ChunkRequest::fresh(job.id))
        .await
        .unwrap();
    service.pause(job.id).await.unwrap();

    let restarted = service.restart(job.id).await.unwrap();
    assert_eq!(restarted.status, JobStatus::Created);
    assert_eq!(restarted.checkpoint, Checkpoint::offset(0));
    assert_eq!(restarted.processed_units, 0);

    service.resume(job.id).await.unwrap();
    let store = h.store.clone();
    let id = job.id;
    assert_eventually(
        || {
            let store = store.clone();
            async move { store.get(id).await.unwrap().status == JobStatus::Completed }
        },
        Duration::from_secs(5),
        "restarted job should run again from zero",
    )
    .await;
    assert_eq!(h.processor.calls(), 150);
}

#[tokio::test]
async fn test_manual_resume_clears_auto_resume_attempts() {
    let h = Harness::new(ScriptedProcessor::new(100));
    let service = h.service(3);
    let job = h.running_job(100).await;

    h.clock.advance(ChronoDuration::minutes(6));
    let report = service.monitor().sweep().await;
    assert_eq!(report.resumed, vec![job.id]);
    assert_eq!(service.monitor().attempts(&job.id).await, 1);

    service.resume(job.id).await.unwrap();
    assert_eq!(service.monitor().attempts(&job.id).await, 0);
}

#[tokio::test]
async fn test_gate_status_reports_running_jobs() {
    let h = Harness::new(ScriptedProcessor::new(100));
    let service = h.service(4);
    h.running_job(100).await;
    h.running_job(100).await;

    let status = service.gate_status().await.unwrap();
    assert_eq!(status.snapshot.active_jobs, 2);
    assert_eq!(status.snapshot.max_concurrent_jobs, 4);
    assert_eq!(status.delay_multiplier, 1.0);
    assert!(status.cooldown_until.is_none());
    assert!(service.admission().await.is_admitted());
}
