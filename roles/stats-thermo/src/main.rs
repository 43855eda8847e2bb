use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

mod config;

use config::Config;
use stats_thermo::api::{self, ApiState};
use stats_thermo::backend::open_backend;
use stats_thermo::ingest_handler::{serve_sensor_connection, IngestHandler};
use thermo_stats::{AggregateCoordinator, SystemClock};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_args()?;
    info!("Starting thermo-stats service");
    info!("TCP ingest: {}", config.tcp_address);
    info!("HTTP server: {}", config.http_address);
    info!(
        "Backend: {:?}, stale window: {}s",
        config.backend.kind,
        config.aggregation.stale_window.as_secs()
    );

    let backend = open_backend(&config.backend).await?;
    let coordinator = AggregateCoordinator::new(
        backend.source.clone(),
        backend.store.clone(),
        Arc::new(SystemClock),
        config.aggregation.clone(),
    );
    let state = Arc::new(ApiState::new(coordinator, &backend));
    let handler = Arc::new(IngestHandler::new(backend.sink.clone()));

    let tcp_listener = TcpListener::bind(&config.tcp_address).await?;
    info!("TCP ingest listening on {}", config.tcp_address);

    // HTTP API serves averages to dashboards
    let http_address = config.http_address.clone();
    tokio::spawn(async move {
        if let Err(e) = api::run_http_server(http_address, state).await {
            error!("HTTP server error: {}", e);
        }
    });

    loop {
        match tcp_listener.accept().await {
            Ok((stream, addr)) => {
                info!("New sensor connection from {}", addr);
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_sensor_connection(stream, addr, &handler).await {
                        error!("Error handling sensor connection from {}: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
            }
        }
    }
}
