use std::{net::SocketAddr, process::ExitCode, sync::Arc, time::Duration};
use tickscan_data::{
    config::ScanConfig,
    pipeline::Pipeline,
    sink::{HttpSink, LogSink, StorageSink},
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

mod egress;
mod ingress;

/// Interval between pipeline health log lines.
const HEALTH_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    init_logging();

    info!("Starting tickscan detection server");

    // Configuration errors are fatal
    let config = match load_config() {
        Ok(config) => config,
        Err(message) => {
            error!("{}", message);
            return ExitCode::FAILURE;
        }
    };

    let sink = match storage_sink(&config) {
        Ok(sink) => sink,
        Err(message) => {
            error!("{}", message);
            return ExitCode::FAILURE;
        }
    };
    info!(sink = sink.name(), "storage sink configured");

    let pipeline = match Pipeline::new(config, sink) {
        Ok(pipeline) => Arc::new(pipeline),
        Err(error) => {
            error!(%error, "failed to start detection pipeline");
            return ExitCode::FAILURE;
        }
    };

    // Start WebSocket server
    // Configurable via TICKSCAN_WS_ADDR env var (default: 0.0.0.0:9001)
    let server_addr_str =
        std::env::var("TICKSCAN_WS_ADDR").unwrap_or_else(|_| "0.0.0.0:9001".to_string());
    let server_addr = match server_addr_str.parse::<SocketAddr>() {
        Ok(addr) => addr,
        Err(error) => {
            error!(%error, "invalid TICKSCAN_WS_ADDR {}", server_addr_str);
            return ExitCode::FAILURE;
        }
    };
    let listener = match TcpListener::bind(server_addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(%error, "failed to bind WebSocket server to {}", server_addr);
            return ExitCode::FAILURE;
        }
    };
    let server = tokio::spawn(egress::start_websocket_server(
        listener,
        pipeline.broadcaster().clone(),
    ));
    info!("WebSocket server listening on ws://{}", server_addr);

    // Start tick feed
    // Configurable via TICKSCAN_FEED_URL and TICKSCAN_FEED_SYMBOLS (comma separated, default all)
    let feed_config = ingress::FeedConfig::new(
        std::env::var("TICKSCAN_FEED_URL")
            .unwrap_or_else(|_| ingress::FeedConfig::default().url),
    )
    .with_symbols(
        std::env::var("TICKSCAN_FEED_SYMBOLS")
            .map(|raw| ingress::parse_symbols(&raw))
            .unwrap_or_default(),
    );
    let feed = tokio::spawn(ingress::run_feed_loop(feed_config, Arc::clone(&pipeline)));

    // Periodic health reporting
    let health_pipeline = Arc::clone(&pipeline);
    let health = tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEALTH_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let health = health_pipeline.health();
            for channel in &health.channels {
                info!(
                    channel = %channel.kind,
                    depth = channel.depth,
                    accepted = channel.accepted,
                    processed = channel.processed,
                    shed = channel.shed,
                    rejected = channel.rejected,
                    throughput_per_sec = channel.throughput_per_sec,
                    "channel health"
                );
            }
            info!(
                symbols = health.symbols,
                malformed = health.malformed,
                connections = health.broadcast.connections,
                delivered = health.broadcast.delivered,
                lagged = health.broadcast.lagged,
                buffered_events = health.buffered_events,
                "pipeline health"
            );
        }
    });

    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");

    // Stop accepting new work before draining the pipeline
    server.abort();
    health.abort();
    pipeline.shutdown().await;
    feed.abort();

    info!("tickscan detection server stopped");
    ExitCode::SUCCESS
}

/// Load `TICKSCAN_CONFIG` if set, otherwise the validated defaults.
fn load_config() -> Result<ScanConfig, String> {
    match std::env::var("TICKSCAN_CONFIG") {
        Ok(path) => {
            info!("Loading configuration from {}", path);
            ScanConfig::from_json_file(&path)
                .map_err(|error| format!("invalid configuration {path}: {error}"))
        }
        Err(_) => {
            info!("TICKSCAN_CONFIG not set, using default configuration");
            Ok(ScanConfig::default())
        }
    }
}

/// `TICKSCAN_SINK_URL` overrides the configured endpoint; without either batches are logged.
fn storage_sink(config: &ScanConfig) -> Result<Arc<dyn StorageSink>, String> {
    let endpoint = std::env::var("TICKSCAN_SINK_URL")
        .ok()
        .or_else(|| config.sink.endpoint.clone());

    let Some(endpoint) = endpoint else {
        return Ok(Arc::new(LogSink));
    };

    let url = url::Url::parse(&endpoint)
        .map_err(|error| format!("invalid sink endpoint {endpoint}: {error}"))?;
    let sink = HttpSink::new(url, Duration::from_millis(config.sink.timeout_ms))
        .map_err(|error| format!("failed to build HTTP sink: {error}"))?;

    Ok(Arc::new(sink))
}

/// Initialize logging
///
/// `RUST_LOG` filters (default: info); `TICKSCAN_LOG_FORMAT=json` switches to JSON lines.
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("TICKSCAN_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .flatten_event(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
