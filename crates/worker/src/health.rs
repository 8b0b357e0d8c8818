//! Health-check HTTP endpoint for the worker process.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use firelancer_infra::jobs::{JobQueueService, JobStorage};

use crate::config::HealthCheckConfig;

/// Answers whether the worker should be reported healthy.
pub trait HealthProbe: Send + Sync + 'static {
    fn is_healthy(&self) -> bool;
}

impl<S: JobStorage> HealthProbe for JobQueueService<S> {
    fn is_healthy(&self) -> bool {
        self.is_running()
    }
}

pub fn router(route: &str, probe: Arc<dyn HealthProbe>) -> Router {
    Router::new().route(route, get(health)).with_state(probe)
}

async fn health(State(probe): State<Arc<dyn HealthProbe>>) -> (StatusCode, Json<Value>) {
    if probe.is_healthy() {
        (StatusCode::OK, Json(json!({ "status": "ok" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable" })),
        )
    }
}

/// A running health-check server. Dropping it without calling
/// [`shutdown`](Self::shutdown) leaves the listener serving until the runtime exits.
#[derive(Debug)]
pub struct HealthCheckServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<std::io::Result<()>>,
}

impl HealthCheckServer {
    pub async fn bind(
        config: &HealthCheckConfig,
        probe: Arc<dyn HealthProbe>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let route = config.normalized_route();
        let app = router(&route, probe);

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    rx.await.ok();
                })
                .await
        });

        info!(%addr, route = %route, "health check server listening");
        Ok(Self {
            addr,
            shutdown: Some(tx),
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> std::io::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            tx.send(()).ok();
        }
        match self.handle.await {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "health check server task failed");
                Err(std::io::Error::other(err))
            }
        }
    }
}
