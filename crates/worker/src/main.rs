use anyhow::Context;

use firelancer_worker::{bootstrap_worker, WorkerConfig};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        tracing::error!(error = ?err, "worker failed to start");
        eprintln!("firelancer-worker: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env().context("loading worker configuration")?;
    let health_check = config.health_check.clone();

    let mut worker = bootstrap_worker(config)
        .await
        .context("bootstrapping worker")?;
    worker.start_job_queue().context("starting job queue")?;
    let addr = worker
        .start_health_check_server(&health_check)
        .await
        .context("starting health check server")?;
    tracing::info!(%addr, "worker running");

    worker.run_until_shutdown().await;
    Ok(())
}
