use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use advisord::config::Config;
use advisord::engine::{Clock, Engine, SystemClock};
use advisord::notify::NotifyHub;
use advisord::publisher::{JournalSink, LogSink, PublisherHandle, SyncSink};
use advisord::{observability, reaper, wire};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let mut sinks: Vec<Arc<dyn SyncSink>> = vec![Arc::new(LogSink)];
    if let Some(ref path) = config.journal_path {
        sinks.push(Arc::new(JournalSink::open(path).await?));
    }
    let publisher = PublisherHandle::spawn(sinks, config.retry_policy());

    let engine = Arc::new(Engine::open(
        &config.wal_path(),
        config.engine_config(),
        Arc::new(SystemClock) as Arc<dyn Clock>,
        publisher.clone(),
        Arc::new(NotifyHub::new()),
    )?);

    let reaper_engine = engine.clone();
    let reaper_interval = config.reaper_interval;
    tokio::spawn(async move {
        reaper::run_reaper(reaper_engine, reaper_interval).await;
    });
    let compactor_engine = engine.clone();
    let threshold = config.compact_threshold;
    tokio::spawn(async move {
        reaper::run_compactor(compactor_engine, threshold, reaper_interval).await;
    });
    // Give dead-lettered change records another round once sinks may have recovered.
    let redeliver = publisher.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(reaper_interval * 10);
        interval.tick().await;
        loop {
            interval.tick().await;
            let n = redeliver.redeliver_dead_letters();
            if n > 0 {
                info!("requeued {n} dead-lettered change records");
            }
        }
    });

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("advisord listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  revision: {}", engine.revision());
    info!("  max_connections: {max_connections}");
    info!(
        "  journal: {}",
        config
            .journal_path
            .as_ref()
            .map_or("disabled".to_string(), |p| p.display().to_string())
    );
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    let undelivered = publisher.dead_letters().len();
    if undelivered > 0 {
        tracing::warn!("{undelivered} change records were never delivered");
    }
    info!(revision = engine.revision(), "advisord stopped");
    Ok(())
}
