use std::sync::Arc;
use std::time::Duration;

use portaljobs_core::{Queue, WorkerId};
use portaljobs_infra::config::OrchestratorConfig;
use portaljobs_infra::jobs::{
    InMemoryJobStore, InMemoryNotifier, TracingTelemetry, Worker, WorkerDeps, WorkerHandle,
};
use portaljobs_worker::app::{AppServices, build_app};
use portaljobs_worker::handlers::{NOOP, builtin_registry};
use reqwest::StatusCode;
use serde_json::json;

struct TestServer {
    base_url: String,
    worker: WorkerHandle,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let mut config = OrchestratorConfig::default();
        config.queues.get_mut(Queue::Default).poll_interval_ms = 20;

        let store = InMemoryJobStore::arc();
        let telemetry = Arc::new(TracingTelemetry::new());
        let worker = Worker::new(
            &config,
            WorkerId::new("admin-test").unwrap(),
            WorkerDeps {
                jobs: store.clone(),
                slots: store.clone(),
                ledger: store.clone(),
                registry: Arc::new(builtin_registry()),
                notifier: Arc::new(InMemoryNotifier::new()),
                telemetry: telemetry.clone(),
            },
        );
        let producer = worker.producer();
        let budget = worker.budget();
        let worker = worker.start().await.unwrap();

        // Same router as prod, bound to an ephemeral port.
        let app = build_app(AppServices {
            jobs: store,
            producer,
            worker: worker.clone(),
            budget,
            telemetry,
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            worker,
            handle,
        }
    }

    async fn stop(self) {
        self.handle.abort();
        self.worker.shutdown().await;
    }
}

async fn job_state_eventually(
    client: &reqwest::Client,
    base_url: &str,
    id: &str,
    want: &str,
) -> serde_json::Value {
    for _ in 0..200 {
        let res = client
            .get(format!("{}/jobs/{}", base_url, id))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let job: serde_json::Value = res.json().await.unwrap();
        if job["state"] == want {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} did not reach {want} in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_endpoint_is_up() {
    let server = TestServer::spawn().await;
    let res = reqwest::get(format!("{}/healthz", server.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_job_type_is_rejected() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/jobs", server.base_url))
        .json(&json!({ "job_type": "does.not.exist", "payload": {} }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_job_type");

    let res = client
        .get(format!("{}/jobs?state=PENDING", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let pending: Vec<serde_json::Value> = res.json().await.unwrap();
    assert!(pending.is_empty());

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submitted_job_runs_and_shows_in_stats() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/jobs", server.base_url))
        .json(&json!({ "job_type": NOOP, "payload": { "hello": "world" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: serde_json::Value = res.json().await.unwrap();
    let id = body["job_id"].as_str().unwrap().to_string();

    let job = job_state_eventually(&client, &server.base_url, &id, "SUCCEEDED").await;
    assert_eq!(job["queue"], "DEFAULT");
    assert_eq!(job["attempt_count"], 1);
    assert_eq!(job["history"].as_array().unwrap().len(), 1);

    // Worker counters are bumped just after the store write.
    let mut stats = serde_json::Value::Null;
    for _ in 0..200 {
        stats = client
            .get(format!("{}/stats", server.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if stats["worker"]["jobs_succeeded"] == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stats["queues"]["DEFAULT"]["succeeded"], 1);
    assert_eq!(stats["worker"]["worker_id"], "admin-test");
    assert_eq!(stats["worker"]["jobs_succeeded"], 1);
    assert_eq!(stats["budget"]["tier"], "full");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_lookups_are_client_errors() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/jobs/not-a-uuid", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .get(format!("{}/jobs?state=BOGUS", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .get(format!("{}/jobs/{}", server.base_url, portaljobs_core::JobId::new()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    server.stop().await;
}
