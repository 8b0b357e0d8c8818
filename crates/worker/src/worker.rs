//! The worker process host: wires the job queue, event bus and health check
//! together and drives their lifecycle.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info, warn};

use firelancer_events::EventBus;
use firelancer_infra::db::{self, DbError};
use firelancer_infra::jobs::{JobQueueService, JobStorage, PostgresJobStore, QueueError};

use crate::config::{HealthCheckConfig, WorkerConfig, WorkerConfigError};
use crate::health::{HealthCheckServer, HealthProbe};
use crate::processors::{register_builtin_processors, AssetPreviewStrategy, NoopAssetPreviewStrategy};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] WorkerConfigError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("failed to start health check server on {addr}: {source}")]
    HealthCheck {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub struct FirelancerWorker<S> {
    queue: Arc<JobQueueService<S>>,
    bus: EventBus,
    config: WorkerConfig,
    health: Option<HealthCheckServer>,
}

impl<S: JobStorage> FirelancerWorker<S> {
    /// Build the queue on `store` and register the built-in processors.
    pub fn new(
        store: S,
        config: WorkerConfig,
        preview_strategy: Arc<dyn AssetPreviewStrategy>,
    ) -> Result<Self, WorkerError> {
        let bus = EventBus::new();
        let queue = JobQueueService::with_event_bus(store, config.job_queue.clone(), bus.clone())?;
        register_builtin_processors(&queue, &bus, preview_strategy)?;
        Ok(Self {
            queue: Arc::new(queue),
            bus,
            config,
            health: None,
        })
    }

    pub fn queue(&self) -> &Arc<JobQueueService<S>> {
        &self.queue
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn start_job_queue(&self) -> Result<(), WorkerError> {
        self.queue.start()?;
        info!(queues = ?self.queue.registered_queues(), "job queue started");
        Ok(())
    }

    /// Bind the health endpoint. Calling it again returns the address already bound.
    pub async fn start_health_check_server(
        &mut self,
        config: &HealthCheckConfig,
    ) -> Result<SocketAddr, WorkerError> {
        if let Some(server) = &self.health {
            return Ok(server.local_addr());
        }

        let probe: Arc<dyn HealthProbe> = self.queue.clone();
        let server = HealthCheckServer::bind(config, probe)
            .await
            .map_err(|source| WorkerError::HealthCheck {
                addr: config.bind_addr(),
                source,
            })?;
        let addr = server.local_addr();
        self.health = Some(server);
        Ok(addr)
    }

    /// Wait for SIGINT or SIGTERM, then [`shutdown`](Self::shutdown).
    pub async fn run_until_shutdown(self) -> usize {
        self.run_until(shutdown_signal()).await
    }

    pub async fn run_until(self, signal: impl Future<Output = ()>) -> usize {
        signal.await;
        self.shutdown().await
    }

    /// Stop the queue within its grace period, then the health server.
    /// Returns how many running jobs had to be abandoned.
    pub async fn shutdown(self) -> usize {
        let abandoned = self.queue.stop().await;
        if abandoned > 0 {
            warn!(abandoned, "jobs still running at shutdown were abandoned");
        }

        if let Some(server) = self.health {
            if let Err(err) = server.shutdown().await {
                warn!(error = %err, "health check server did not shut down cleanly");
            }
        }
        info!("worker stopped");
        abandoned
    }
}

/// Composition root for the production worker: logging, database,
/// migrations, Postgres-backed queue and built-in processors.
pub async fn bootstrap_worker(
    config: WorkerConfig,
) -> Result<FirelancerWorker<PostgresJobStore>, WorkerError> {
    firelancer_observability::init(config.log_format);

    let pool = db::connect(&config.database_url, config.max_connections).await?;
    db::run_migrations(&pool).await?;
    info!(max_connections = config.max_connections, "database ready");

    FirelancerWorker::new(
        PostgresJobStore::new(pool),
        config,
        Arc::new(NoopAssetPreviewStrategy),
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
