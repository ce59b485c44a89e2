use kameo::Actor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use stream_relay::config::{DrainEndpoint, WorkerConfig};
use stream_relay::domain::booking::booking_routes;
use stream_relay::messaging::RedpandaSource;
use stream_relay::metrics::{self, Metrics};
use stream_relay::telemetry;
use stream_relay::worker::{CrossProcessRelayWorker, Destination, DlqActor, GetDlqStats, HttpDrainClient};

// ============================================================================
// Relay Worker - drains Redpanda into HTTP drain endpoints
// ============================================================================

fn destination(endpoint: DrainEndpoint) -> Destination {
    Destination::new(&endpoint.name, &endpoint.url, &endpoint.shared_secret)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    let config = WorkerConfig::from_env();
    tracing::info!(
        brokers = %config.broker_servers,
        group = %config.consumer_group,
        queues = ?config.queue_topics,
        topics = ?config.bus_topics,
        "🚀 Starting relay worker"
    );

    // === Metrics ===
    let metrics = Arc::new(Metrics::new()?);
    let metrics_registry = Arc::new(metrics.registry().clone());
    let metrics_port = config.metrics_port;
    std::thread::spawn(move || match tokio::runtime::Runtime::new() {
        Ok(rt) => rt.block_on(async {
            if let Err(e) = metrics::start_metrics_server(metrics_registry, metrics_port).await {
                tracing::error!("Metrics server error: {}", e);
            }
        }),
        Err(e) => tracing::error!("Failed to start metrics runtime: {}", e),
    });

    // === Worker ===
    let source = Arc::new(RedpandaSource::new(&config)?);
    let drains = Arc::new(HttpDrainClient::new(Duration::from_secs(config.drain_timeout_secs))?);
    let routes = booking_routes(
        destination(DrainEndpoint::from_env("billing", "http://127.0.0.1:8081/drain")),
        destination(DrainEndpoint::from_env("fleet", "http://127.0.0.1:8082/drain")),
    );
    let dlq = DlqActor::spawn(DlqActor::new(10_000));

    let worker = CrossProcessRelayWorker::new(source, routes, drains, &config)
        .with_dlq(dlq.clone())
        .with_metrics(metrics);

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("🛑 Shutdown requested");
            let _ = stop.send(true);
        }
    });

    worker.run(shutdown).await?;

    if let Ok(stats) = dlq.ask(GetDlqStats).send().await {
        tracing::info!(
            dead_lettered = stats.total_received,
            by_routing_key = ?stats.by_routing_key,
            "💀 DLQ summary"
        );
    }

    Ok(())
}
