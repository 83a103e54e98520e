#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use transcribe_agent::{
    config::{self, Config},
    controller::HttpControllerClient,
    schedule::TaskScheduler,
    storage::sink,
    transfer::{FileTransfer, VolumeProbe},
    utils::logger,
    workdir::Workdir,
    AppContext,
};

const REPORT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received ctrl_c signal, shutting down"),
                    _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                let _ = ctrl_c.await;
                info!("Received ctrl_c signal, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received ctrl_c signal, shutting down");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    let _guard = logger::init(config.log_dir.clone())?;
    info!("Starting transcription agent, revision {}", env!("GIT_HASH"));

    let worker = config::resolve_worker_name(&config.remote_ipv4_url).await;
    info!("Worker name is {}", worker);

    let workdir = Arc::new(Workdir::new(
        config.input_dir.clone(),
        config.output_dir.clone(),
        config.details_dir.clone(),
    ));
    workdir.ensure().await?;
    workdir.sweep_input().await?;

    let sink = sink::from_config(&config.storage)?;

    let client = Arc::new(HttpControllerClient::new(config.controller_url.clone(), worker.clone()));
    let transfer = Arc::new(FileTransfer::new(Arc::new(VolumeProbe)));

    let scheduler = Arc::new(TaskScheduler::new(
        client,
        sink,
        workdir,
        transfer,
        config.decoder_start_timeout,
    ));
    scheduler
        .spawn_poller(config.profile(worker.clone()), config.poll_interval)
        .await;

    let ctx = Arc::new(AppContext {
        lifecycle: scheduler.handle(),
        worker,
    });

    // the active task is failed before the listener closes so a pending /stop can answer
    let stopping = scheduler.clone();
    let shutdown = async move {
        shutdown_signal().await;
        stopping.shutdown(REPORT_FLUSH_TIMEOUT).await;
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    match transcribe_agent::web::start_server(ctx, addr, shutdown).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            scheduler.shutdown(REPORT_FLUSH_TIMEOUT).await;
            return Err(e);
        }
    }

    Ok(())
}
