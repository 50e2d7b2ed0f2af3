use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use photo_select::{
    config::Config,
    create_router,
    queue::{self, Job, JobDispatcher, TokioDispatcher, Worker},
    storage::{self, StorageGateway},
    utils::{init_logger, Clock, StatusLog, SystemClock},
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let config = Config::from_env()?;
    info!("Configuration loaded: {:?}", config.server);

    let gateway = storage::connect(&config.storage)?;
    info!("Storage provider: {}", gateway.provider_name());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let status_log = StatusLog::new(config.pipeline.status_log_capacity);

    let worker = Arc::new(Worker::new(
        gateway.clone(),
        clock.clone(),
        config.folders.clone(),
        &config.pipeline,
        status_log.clone(),
    ));
    let jobs: Arc<dyn JobDispatcher> = Arc::new(TokioDispatcher::new(worker));

    // Folder setup and the first optimization pass run in the background
    jobs.dispatch(Job::Startup);

    let schedule = queue::parse_schedule(&config.pipeline.sweep_schedule)?;
    tokio::spawn(queue::run_cron(jobs.clone(), schedule, Job::Sweep));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let state = AppState::new(config, gateway, clock, jobs, status_log);
    let app = create_router(state);

    info!("Server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
