use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use firelancer_infra::jobs::{InMemoryJobStore, RetryPolicy};
use firelancer_worker::{FirelancerWorker, HealthCheckConfig, NoopAssetPreviewStrategy, WorkerConfig};

fn worker() -> FirelancerWorker<Arc<InMemoryJobStore>> {
    let mut config = WorkerConfig::default();
    config.job_queue.poll_interval = Duration::from_millis(10);
    config.job_queue.retry_policy = RetryPolicy::immediate();
    FirelancerWorker::new(InMemoryJobStore::arc(), config, Arc::new(NoopAssetPreviewStrategy)).unwrap()
}

fn local_health(route: &str) -> HealthCheckConfig {
    HealthCheckConfig {
        hostname: "127.0.0.1".to_string(),
        port: 0,
        route: route.to_string(),
    }
}

#[tokio::test]
async fn health_reflects_job_queue_state() {
    let mut worker = worker();
    let addr = worker.start_health_check_server(&local_health("/health")).await.unwrap();
    let url = format!("http://{addr}/health");
    let client = reqwest::Client::new();

    let before = client.get(&url).send().await.unwrap();
    assert_eq!(before.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(before.json::<Value>().await.unwrap(), json!({ "status": "unavailable" }));

    worker.start_job_queue().unwrap();
    let running = client.get(&url).send().await.unwrap();
    assert_eq!(running.status(), reqwest::StatusCode::OK);
    assert_eq!(running.json::<Value>().await.unwrap(), json!({ "status": "ok" }));

    worker.queue().stop().await;
    let stopped = client.get(&url).send().await.unwrap();
    assert_eq!(stopped.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

    worker.shutdown().await;
}

#[tokio::test]
async fn route_without_leading_slash_is_served() {
    let mut worker = worker();
    worker.start_job_queue().unwrap();
    let addr = worker.start_health_check_server(&local_health("ready")).await.unwrap();

    let response = reqwest::get(format!("http://{addr}/ready")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    worker.shutdown().await;
}

#[tokio::test]
async fn shutdown_releases_the_port() {
    let mut worker = worker();
    worker.start_job_queue().unwrap();
    let addr = worker.start_health_check_server(&local_health("/health")).await.unwrap();

    let abandoned = worker
        .run_until(async { tokio::time::sleep(Duration::from_millis(20)).await })
        .await;
    assert_eq!(abandoned, 0);

    assert!(reqwest::get(format!("http://{addr}/health")).await.is_err());
}

#[tokio::test]
async fn builtin_asset_preview_queue_is_registered() {
    let worker = worker();
    assert_eq!(worker.queue().registered_queues(), vec!["asset-preview"]);
}
