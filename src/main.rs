use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flowgraph::server::{self, AppState};
use flowgraph::{Config, SessionManager};
use tokio::sync::Notify;
use tokio::time;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load();
    init_tracing(&config);

    let running = Arc::new(AtomicBool::new(true));
    let shutdown = Arc::new(Notify::new());
    {
        let running = running.clone();
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("interrupt received; shutting down");
            running.store(false, Ordering::SeqCst);
            shutdown.notify_one();
        })?;
    }

    let sessions = Arc::new(SessionManager::new(Arc::new(config.clone())));

    let stats_sessions = sessions.clone();
    let running_clone = running.clone();
    let stats_interval = config.stats_interval();
    tokio::spawn(async move {
        let mut interval = time::interval(stats_interval);
        interval.tick().await;
        while running_clone.load(Ordering::SeqCst) {
            interval.tick().await;
            let sessions = stats_sessions.clone();
            let _ = tokio::task::spawn_blocking(move || sessions.log_stats()).await;
        }
    });

    let notified = shutdown.clone();
    let (addr, server) = server::spawn(config.bind_addr(), AppState::new(sessions.clone()), async move {
        notified.notified().await;
    })?;
    info!(%addr, tshark = %config.tshark, "flowgraph ready");

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(%err, "server failed"),
        Err(err) => error!(%err, "server task panicked"),
    }

    running.store(false, Ordering::SeqCst);
    tokio::task::spawn_blocking(move || sessions.shutdown()).await?;
    info!("shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = config
        .log
        .as_deref()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
