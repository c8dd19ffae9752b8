mod compute;
mod config;
mod error;
mod executor;
mod handlers;
mod logging;
mod progress;
mod reconcile;
mod remote;
mod runner;
mod state;
mod store;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::compute::ProcessComputeLibrary;
use crate::config::MasterConfig;
use crate::executor::JobExecutorService;
use crate::logging::JobLogRegistry;
use crate::remote::OpenSshConnector;
use crate::runner::RunnerContext;
use crate::state::AppState;
use crate::store::{JobStore, SqliteJobStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = MasterConfig::load().context("configuración del master")?;

    let logs = JobLogRegistry::new(config.logging.job_log_capacity);
    let _log_guard =
        logging::init_logging(&config.logging, logs.clone()).context("inicializando logs")?;

    let store: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::open(&config.storage.database_path).context("abriendo el almacén de jobs")?,
    );
    reconcile::reconcile_interrupted_jobs(store.as_ref())?;

    let merge_settings = config.merge.settings()?;
    let config = Arc::new(config);

    let ctx = Arc::new(RunnerContext {
        store: store.clone(),
        compute: Arc::new(ProcessComputeLibrary::new(config.compute.program.clone())),
        connector: Arc::new(OpenSshConnector::new(config.storage.jobs_dir.join(".ssh"))),
        config: config.clone(),
        merge_settings,
        logs: logs.clone(),
    });
    let executor = JobExecutorService::new(ctx, config.executor.max_concurrent_jobs);

    let state = AppState {
        store,
        executor,
        logs,
        config: config.clone(),
    };

    // router HTTP
    let app = handlers::build_router(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("escuchando en {}", config.server.listen_addr))?;
    info!(
        max_concurrent_jobs = config.executor.max_concurrent_jobs,
        cluster = config.cluster.is_some(),
        "master escuchando en {}",
        listener.local_addr()?
    );

    axum::serve(listener, app).await?;
    Ok(())
}
