use chrono::{Duration as ChronoDuration, Utc};
use kameo::Actor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use stream_relay::config::{StoreBackend, StoreConfig, WorkerConfig};
use stream_relay::domain::booking::{
    booking_channels, booking_routes, booking_summary_projector, BookingAggregate, BookingCommand,
    BookingCommandHandler, BookingSummary, BookingTranslator, FieldUpdate, TimeSlot,
};
use stream_relay::event_sourcing::store::{AggregateCommandStore, EventStore, InMemoryEventStore, ScyllaEventStore};
use stream_relay::messaging::InMemoryBroker;
use stream_relay::metrics::{self, Metrics};
use stream_relay::projection::InMemoryReadModelStore;
use stream_relay::relay::{
    CdcChangeFeed, GetFailedDeliveries, GetRelayStats, FailedDeliveries, IntegrationPublisher, ObserverRelay,
    Registration, RelayRegistry, SynchronousRelay,
};
use stream_relay::telemetry;
use stream_relay::utils::RetryConfig;
use stream_relay::worker::{
    CrossProcessRelayWorker, Destination, DlqActor, GetDlqStats, InMemoryDrainClient, InMemoryQueue,
};

// ============================================================================
// Demo: one booking lifecycle through the whole pipeline
// ============================================================================
//
//   BookingCommandHandler → EventStore
//     ├─ SynchronousRelay (save path)  → BookingSummary projection
//     └─ ObserverRelay (after save)    → BookingTranslator → broker
//   broker → queue → CrossProcessRelayWorker → drain endpoints
//
// STREAM_RELAY_STORE_BACKEND=scylla runs the write side against ScyllaDB.
//
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    tracing::info!("🚀 Starting stream relay demo");

    let store_config = StoreConfig::from_env();
    let worker_config = WorkerConfig::from_env();

    // === 1. Metrics ===
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    let metrics_registry = Arc::new(metrics.registry().clone());
    let metrics_port = worker_config.metrics_port;
    std::thread::spawn(move || match tokio::runtime::Runtime::new() {
        Ok(rt) => rt.block_on(async {
            if let Err(e) = metrics::start_metrics_server(metrics_registry, metrics_port).await {
                tracing::error!("Metrics server error: {}", e);
            }
        }),
        Err(e) => tracing::error!("Failed to start metrics runtime: {}", e),
    });

    // === 2. Event store ===
    let mut scylla_session = None;
    let event_store: Arc<dyn EventStore> = match store_config.backend {
        StoreBackend::Memory => Arc::new(InMemoryEventStore::new(store_config.notification_capacity)),
        StoreBackend::Scylla => {
            let store = ScyllaEventStore::connect(&store_config).await?;
            scylla_session = Some(store.session());
            Arc::new(store)
        }
    };
    tracing::info!(backend = ?store_config.backend, "✅ Event store ready");

    // === 3. Relays ===
    // Save path: projections, so reads after a command see its effects.
    let summaries = Arc::new(InMemoryReadModelStore::<BookingSummary>::new());
    let projector = Arc::new(booking_summary_projector(summaries.clone()).with_metrics(metrics.clone()));
    let projection_registry = Arc::new(
        RelayRegistry::builder()
            .register(Registration::for_aggregate::<BookingAggregate>().with_consumer(projector))
            .build(),
    );
    let sync_relay = SynchronousRelay::with_metrics(
        projection_registry,
        Arc::new(IntegrationPublisher::disabled()),
        metrics.clone(),
    );

    // After the save: integration events to the broker, which hands them
    // to the worker's queue.
    let queue = Arc::new(InMemoryQueue::new());
    let broker = Arc::new(InMemoryBroker::bridged_to(queue.clone(), booking_channels()));
    let publisher =
        Arc::new(IntegrationPublisher::new(broker.clone(), RetryConfig::default()).with_metrics(metrics.clone()));
    let integration_registry = Arc::new(
        RelayRegistry::builder()
            .register(Registration::for_aggregate::<BookingAggregate>().with_translator(Arc::new(BookingTranslator)))
            .build(),
    );

    let (stop, shutdown) = watch::channel(false);
    let observer = ObserverRelay::spawn(
        ObserverRelay::with_metrics(event_store.clone(), integration_registry, publisher, metrics.clone())
            .until(shutdown),
    );

    let change_feed = match scylla_session {
        Some(session) if store_config.change_feed => {
            Some(CdcChangeFeed::start(session, &store_config.keyspace, observer.clone()).await?)
        }
        _ => None,
    };

    let commands = BookingCommandHandler::new(Arc::new(
        AggregateCommandStore::new(event_store.clone()).with_participant(Arc::new(sync_relay)),
    ));

    // === 4. Booking lifecycle ===
    tracing::info!("📝 Demonstrating booking lifecycle");

    let booking_id = Uuid::new_v4();
    let correlation_id = Uuid::new_v4();
    let starts_at = Utc::now() + ChronoDuration::days(2);

    let lifecycle = vec![
        BookingCommand::RequestBooking {
            car_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            slot: TimeSlot::new(starts_at, starts_at + ChronoDuration::hours(6)),
            pickup_location: Some("Central Station".to_string()),
        },
        BookingCommand::ConfirmBooking { price_cents: 18_500 },
        BookingCommand::RecordPaymentAttempt {
            succeeded: false,
            amount_cents: 18_500,
        },
        BookingCommand::RecordPaymentAttempt {
            succeeded: true,
            amount_cents: 18_500,
        },
        BookingCommand::Reschedule {
            slot: Some(TimeSlot::new(
                starts_at + ChronoDuration::hours(1),
                starts_at + ChronoDuration::hours(7),
            )),
            pickup_location: FieldUpdate::Unchanged,
            notes: FieldUpdate::Set("Customer arrives by train".to_string()),
        },
        BookingCommand::CancelBooking {
            reason: Some("Trip cancelled".to_string()),
        },
    ];

    let mut persisted = 0;
    for command in lifecycle {
        let outcome = commands.handle_with_retry(booking_id, command, correlation_id).await?;
        persisted = outcome.new_version;
        tracing::info!(booking_id = %booking_id, version = outcome.new_version, "✅ Command persisted");
    }

    if let Some(summary) = summaries.all().await.into_iter().find(|s| s.booking_id == booking_id) {
        tracing::info!(
            booking_id = %summary.booking_id,
            status = ?summary.status,
            payment_attempts = summary.payment_attempts,
            paid = summary.paid,
            "📋 Booking summary"
        );
    }

    // The observer runs after the save returns
    let mut stats = Default::default();
    for _ in 0..40 {
        stats = observer
            .ask(GetRelayStats)
            .send()
            .await
            .map_err(|_| anyhow::anyhow!("observer relay unavailable"))?;
        if stats.events_seen >= persisted as u64 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let FailedDeliveries(failed) = observer
        .ask(GetFailedDeliveries)
        .send()
        .await
        .map_err(|_| anyhow::anyhow!("observer relay unavailable"))?;
    tracing::info!(
        notifications = stats.notifications,
        events_seen = stats.events_seen,
        failed = failed.len(),
        held = stats.held_events,
        "🔄 Observer relay caught up"
    );

    // === 5. Cross-process relay worker ===
    tracing::info!(
        published = broker.published().await.len(),
        pending = queue.pending_count().await,
        "Integration events waiting for the worker"
    );

    let drains = Arc::new(InMemoryDrainClient::new());
    let dlq = DlqActor::spawn(DlqActor::new(1_000));
    let worker = CrossProcessRelayWorker::new(
        queue.clone(),
        booking_routes(
            Destination::new("billing", "http://billing.local/drain", "billing-secret"),
            Destination::new("fleet", "http://fleet.local/drain", "fleet-secret"),
        ),
        drains.clone(),
        &worker_config,
    )
    .with_dlq(dlq.clone())
    .with_metrics(metrics.clone());

    let summary = worker.drain().await?;
    let dlq_stats = dlq
        .ask(GetDlqStats)
        .send()
        .await
        .map_err(|_| anyhow::anyhow!("DLQ actor unavailable"))?;
    tracing::info!(
        completed = summary.completed,
        abandoned = summary.abandoned,
        dead_lettered = summary.dead_lettered,
        drain_calls = drains.delivered().await.len(),
        dlq_held = dlq_stats.held,
        "📤 Worker drained the queue"
    );

    // === 6. Shutdown ===
    let _ = stop.send(true);
    if let Some(feed) = change_feed {
        feed.stop().await;
    }

    tracing::info!("🎉 Demo complete!");
    Ok(())
}
