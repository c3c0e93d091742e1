//! Integration tests for the health poller against a local axum server.

use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use gantry_ci::fakes::ScriptedRunner;
use gantry_ci::{
    HealthCheckConfig, HealthPoller, Pipeline, PipelineRunner, StageBody, StageDefinition,
};
use gantry_core::{BranchContext, BuildOutcome, CapabilityFacts, StageOutcome};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Serve `app` on an ephemeral port and return its base URL.
async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Answers 503 until the `ready_after`-th request, then 200 with `status`.
fn warming_up(ready_after: u32, status: &'static str) -> (Router, Arc<AtomicU32>) {
    let hits = Arc::new(AtomicU32::new(0));
    let counter = hits.clone();
    let app = Router::new().route(
        "/health",
        get(move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < ready_after {
                    (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "starting" })))
                } else {
                    (StatusCode::OK, Json(json!({ "status": status })))
                }
            }
        }),
    );
    (app, hits)
}

#[tokio::test]
async fn test_poll_recovers_after_retries() {
    let (app, hits) = warming_up(3, "healthy");
    let base = serve(app).await;

    let config = HealthCheckConfig::new(format!("{base}/health")).with_attempts(5, 10);
    let report = HealthPoller::new().poll(&config).await;

    assert!(report.healthy);
    assert_eq!(report.attempts_made, 3);
    assert_eq!(report.last_status_code, Some(200));
    assert!(report.last_error.is_none());
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_poll_never_exceeds_budget() {
    let (app, hits) = warming_up(u32::MAX, "healthy");
    let base = serve(app).await;

    let config = HealthCheckConfig::new(format!("{base}/health")).with_attempts(3, 5);
    let report = HealthPoller::new().poll(&config).await;

    assert!(!report.healthy);
    assert_eq!(report.attempts_made, 3);
    assert_eq!(report.last_status_code, Some(503));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_accept_status_checks_body() {
    let app = Router::new()
        .route("/down", get(|| async { Json(json!({ "status": "unhealthy" })) }))
        .route("/degraded", get(|| async { Json(json!({ "status": "degraded" })) }))
        .route("/plain", get(|| async { "ok" }));
    let base = serve(app).await;
    let poller = HealthPoller::new();

    let down = HealthCheckConfig::new(format!("{base}/down"))
        .with_attempts(2, 5)
        .accepting(&["healthy", "degraded"]);
    let report = poller.poll(&down).await;
    assert!(!report.healthy);
    assert!(report.last_error.unwrap().contains("'unhealthy' not accepted"));

    let degraded = HealthCheckConfig::new(format!("{base}/degraded"))
        .with_attempts(1, 5)
        .accepting(&["healthy", "degraded"]);
    assert!(poller.poll(&degraded).await.healthy);

    let plain = HealthCheckConfig::new(format!("{base}/plain")).with_attempts(1, 5);
    assert!(poller.poll(&plain).await.healthy);
}

#[tokio::test]
async fn test_health_stage_gates_deployment() {
    let (app, _) = warming_up(2, "healthy");
    let base = serve(app).await;
    let ws = tempfile::tempdir().unwrap();

    let check = HealthCheckConfig::new(format!("{base}/health"))
        .with_attempts(4, 10)
        .accepting(&["healthy"]);
    let unreachable = HealthCheckConfig::new(format!("{base}/missing")).with_attempts(2, 5);
    let pipeline = Pipeline::new("deploy")
        .with_stage(StageDefinition::new("Health check", StageBody::HealthCheck(check)))
        .with_stage(StageDefinition::new("Smoke", StageBody::HealthCheck(unreachable)));

    let runner = PipelineRunner::new(Arc::new(ScriptedRunner::new()), ws.path());
    let report = runner
        .run(
            &pipeline,
            Arc::new(CapabilityFacts::default()),
            &BranchContext::new("main", "abc123"),
        )
        .await;

    let health = report.find("Health check").unwrap();
    assert_eq!(health.outcome, StageOutcome::Success);
    assert_eq!(health.metric("health_attempts"), Some(2.0));

    let smoke = report.find("Smoke").unwrap();
    assert_eq!(smoke.outcome, StageOutcome::Failed);
    assert!(smoke.annotations[0].contains("unhealthy after 2 attempt(s)"));
    assert_eq!(report.outcome, BuildOutcome::Failed);

    let json: Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(json["outcome"], "failed");
}
