use chrono::{DateTime, Utc};
use kameo::actor::ActorRef;
use kameo::error::Infallible;
use kameo::message::{Context, Message};
use kameo::reply::{Reply, ReplyError};
use kameo::Actor;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};

use super::publisher::IntegrationPublisher;
use super::registry::{RegistryBatchHandler, RelayRegistry};
use crate::event_sourcing::core::EventStreamChangeEvent;
use crate::event_sourcing::store::{EventStore, StreamChanged};
use crate::metrics::Metrics;
use crate::notification::{OrderingReport, StreamBatch, StreamOrderingHandler, StreamProcessingError};

// ============================================================================
// Observer Relay Actor - eventually consistent delivery
// ============================================================================
//
// Fed by the store's "stream changed" broadcast (and optionally by the CDC
// change feed). Runs after the save has returned, one notification at a
// time.
//
// Per stream the relay keeps a cursor (last version delivered):
//
//   cursor 2, notification [5]   → hole: load 3.. from the store first
//   cursor 2, notification [2,3] → 2 dropped, 3 delivered
//   consumer fails at 3          → stream parked at 3; later notifications
//                                  are held until `Redrain` succeeds
//
// A hole the store cannot fill parks the stream the same way. Lost
// broadcast notifications and racing writers' announcements both show up
// as holes on the stream's next notification.
//
// A failure cannot retract the committed save. It is recorded as a failed
// delivery and must be re-drained (`Redrain`); nothing is retried inline.
// Delivery is at-least-once only while this process lives: cursors are not
// persisted.
//
// ============================================================================

const RELAY_NAME: &str = "observer";

#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    /// Versions the store could not supply; later versions are held
    Gap { missing: Vec<i64> },
    Delivery { version: Option<i64> },
}

#[derive(Debug, Clone)]
pub struct FailedDelivery {
    pub stream: String,
    pub kind: FailureKind,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub notifications: u64,
    pub events_seen: u64,
    pub failed_streams: u64,
    pub gaps: u64,
    pub lost_notifications: u64,
    /// Events not delivered because their stream was parked
    pub held_events: u64,
}

pub struct ObserverRelay {
    ordering: StreamOrderingHandler,
    store: Arc<dyn EventStore>,
    receiver: Option<broadcast::Receiver<StreamChanged>>,
    shutdown: watch::Receiver<bool>,
    cursors: HashMap<String, i64>,
    /// Stream → version to re-drain from
    parked: HashMap<String, i64>,
    /// At most one entry per stream: its outstanding failure
    failed: Vec<FailedDelivery>,
    stats: RelayStats,
}

impl ObserverRelay {
    /// Subscribes to `store` immediately, so nothing appended after this
    /// call is missed while the actor starts.
    pub fn new(store: Arc<dyn EventStore>, registry: Arc<RelayRegistry>, publisher: Arc<IntegrationPublisher>) -> Self {
        let handler = RegistryBatchHandler::new(RELAY_NAME, registry, publisher);
        Self::with_handler(store, StreamOrderingHandler::new(RELAY_NAME, Arc::new(handler)))
    }

    pub fn with_metrics(
        store: Arc<dyn EventStore>,
        registry: Arc<RelayRegistry>,
        publisher: Arc<IntegrationPublisher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let handler = RegistryBatchHandler::new(RELAY_NAME, registry, publisher).with_metrics(metrics.clone());
        Self::with_handler(
            store,
            StreamOrderingHandler::new(RELAY_NAME, Arc::new(handler)).with_metrics(metrics),
        )
    }

    fn with_handler(store: Arc<dyn EventStore>, ordering: StreamOrderingHandler) -> Self {
        let receiver = store.subscribe();
        // A dropped sender never reads as "stop"
        let (_, shutdown) = watch::channel(false);
        Self {
            ordering,
            store,
            receiver: Some(receiver),
            shutdown,
            cursors: HashMap::new(),
            parked: HashMap::new(),
            failed: Vec::new(),
            stats: RelayStats::default(),
        }
    }

    /// Stop listening to the store once `shutdown` flips to true.
    pub fn until(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn cursor(&self, stream: &str) -> i64 {
        self.cursors.get(stream).copied().unwrap_or(0)
    }

    async fn process(&mut self, events: Vec<EventStreamChangeEvent>) -> OrderingReport {
        self.stats.notifications += 1;
        self.stats.events_seen += events.len() as u64;
        self.deliver(events).await
    }

    /// Deliver whatever continues each stream from its cursor.
    async fn deliver(&mut self, events: Vec<EventStreamChangeEvent>) -> OrderingReport {
        let mut ready = Vec::new();
        let mut delivered_up_to: HashMap<String, i64> = HashMap::new();
        let mut holes: Vec<(String, Vec<i64>)> = Vec::new();

        for batch in StreamOrderingHandler::group(events) {
            let stream = batch.stream_name().to_string();
            if let Some(resume_from) = self.parked.get(&stream) {
                self.stats.held_events += batch.events().len() as u64;
                tracing::debug!(
                    stream = %stream,
                    resume_from = *resume_from,
                    "Stream parked until re-drained, notification held"
                );
                continue;
            }

            let (events, missing) = self.sequence(&batch).await;
            if let Some(last) = events.last() {
                delivered_up_to.insert(stream.clone(), last.version);
            }
            ready.extend(events);
            if !missing.is_empty() {
                holes.push((stream, missing));
            }
        }

        let mut report = self.ordering.dispatch(ready).await;

        for (stream, last) in delivered_up_to {
            let failure = report.failures().find(|(failed, _)| *failed == stream).map(|(_, error)| error);
            match failure {
                Some(error) => {
                    let cursor = match error.position() {
                        Some((_, version)) => version - 1,
                        None => self.cursor(&stream),
                    };
                    self.cursors.insert(stream.clone(), cursor);
                    self.parked.insert(stream, cursor + 1);
                }
                None => {
                    self.cursors.insert(stream, last);
                }
            }
        }

        for (stream, missing) in holes {
            // A failure earlier in the stream already parked it
            if self.parked.contains_key(&stream) {
                continue;
            }
            self.parked.insert(stream.clone(), self.cursor(&stream) + 1);
            report.errors.push(StreamProcessingError::Gap { stream, missing });
        }

        self.record_failures(&report);
        report
    }

    /// Events of `batch` that continue the stream's cursor, filling a hole
    /// from the store when the notification starts past it. Returns the
    /// versions still missing after that.
    async fn sequence(&self, batch: &StreamBatch) -> (Vec<EventStreamChangeEvent>, Vec<i64>) {
        let stream = batch.stream_name();
        let cursor = self.cursor(stream);

        let fresh: Vec<EventStreamChangeEvent> =
            batch.events().iter().filter(|e| e.version > cursor).cloned().collect();
        let Some(last) = fresh.last().map(|e| e.version) else {
            return (Vec::new(), Vec::new());
        };

        let fresh = StreamBatch::new(stream, fresh);
        if fresh.first_version() == Some(cursor + 1) && fresh.is_contiguous() {
            return (fresh.events().to_vec(), Vec::new());
        }

        let mut candidates = fresh.events().to_vec();
        match self.store.load_from(stream, cursor + 1).await {
            Ok(loaded) => {
                tracing::debug!(
                    stream = %stream,
                    cursor = cursor,
                    loaded = loaded.len(),
                    "Filling hole in stream from the store"
                );
                candidates.extend(loaded.into_iter().filter(|e| e.version <= last));
            }
            Err(e) => {
                tracing::warn!(stream = %stream, error = %e, "Could not load stream to fill hole");
            }
        }
        let candidates = StreamBatch::new(stream, candidates);

        let mut next = cursor + 1;
        let mut ordered = Vec::new();
        for event in candidates.events() {
            if event.version != next {
                break;
            }
            ordered.push(event.clone());
            next += 1;
        }

        let present: Vec<i64> = candidates.events().iter().map(|e| e.version).collect();
        let missing = (next..=last).filter(|v| !present.contains(v)).collect();
        (ordered, missing)
    }

    fn record_failures(&mut self, report: &OrderingReport) {
        let now = Utc::now();

        for error in &report.errors {
            let (kind, message) = match error {
                StreamProcessingError::Gap { missing, .. } => {
                    self.stats.gaps += 1;
                    (FailureKind::Gap { missing: missing.clone() }, error.to_string())
                }
                StreamProcessingError::Failed { error: cause, .. } => {
                    self.stats.failed_streams += 1;
                    (
                        FailureKind::Delivery {
                            version: cause.position().map(|(_, version)| version),
                        },
                        cause.to_string(),
                    )
                }
            };
            tracing::error!(
                stream = %error.stream(),
                error = %message,
                "❌ Asynchronous delivery failed, re-drain required"
            );
            self.failed.retain(|failure| failure.stream != error.stream());
            self.failed.push(FailedDelivery {
                stream: error.stream().to_string(),
                kind,
                error: message,
                failed_at: now,
            });
        }
    }
}

impl Actor for ObserverRelay {
    type Args = Self;
    type Error = Infallible;

    async fn on_start(mut state: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        tracing::info!("ObserverRelay started");

        if let Some(mut receiver) = state.receiver.take() {
            let mut shutdown = state.shutdown.clone();
            tokio::spawn(async move {
                let mut watching = true;
                loop {
                    tokio::select! {
                        stopped = async { shutdown.wait_for(|stop| *stop).await.is_ok() }, if watching => {
                            if stopped {
                                break;
                            }
                            // sender gone: keep relaying until the store closes
                            watching = false;
                        }
                        received = receiver.recv() => match received {
                            Ok(changed) => {
                                if actor_ref.tell(changed).send().await.is_err() {
                                    break;
                                }
                            }
                            Err(RecvError::Lagged(missed)) => {
                                tracing::error!(
                                    missed = missed,
                                    "Stream-changed notifications lost, holes fill on each stream's next change"
                                );
                                let _ = actor_ref.tell(NotificationsLost { missed }).send().await;
                            }
                            Err(RecvError::Closed) => break,
                        },
                    }
                }
                tracing::info!("ObserverRelay stopped listening to the event store");
            });
        }

        Ok(state)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Reload `stream` from `from_version` and relay it again.
pub struct Redrain {
    pub stream: String,
    pub from_version: i64,
}

pub struct NotificationsLost {
    pub missed: u64,
}

pub struct GetFailedDeliveries;

pub struct GetRelayStats;

#[derive(Debug, Clone)]
pub struct RedrainOutcome {
    pub events: usize,
    /// `None` when every event was relayed
    pub error: Option<String>,
}

impl RedrainOutcome {
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct FailedDeliveries(pub Vec<FailedDelivery>);

macro_rules! infallible_reply {
    ($($ty:ty),*) => {
        $(
            impl Reply for $ty {
                type Ok = Self;
                type Error = Infallible;
                type Value = Self;

                fn to_result(self) -> Result<Self, Infallible> {
                    Ok(self)
                }

                fn into_any_err(self) -> Option<Box<dyn ReplyError>> {
                    None
                }

                fn into_value(self) -> Self::Value {
                    self
                }
            }
        )*
    };
}

infallible_reply!(RedrainOutcome, FailedDeliveries, RelayStats);

// ============================================================================
// Handlers
// ============================================================================

impl Message<StreamChanged> for ObserverRelay {
    type Reply = ();

    async fn handle(&mut self, msg: StreamChanged, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        tracing::debug!(stream = %msg.stream_name, events = msg.events.len(), "Stream changed");
        self.process(msg.events).await;
    }
}

impl Message<NotificationsLost> for ObserverRelay {
    type Reply = ();

    async fn handle(&mut self, msg: NotificationsLost, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.stats.lost_notifications += msg.missed;
    }
}

impl Message<Redrain> for ObserverRelay {
    type Reply = RedrainOutcome;

    async fn handle(&mut self, msg: Redrain, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        // Never start past the cursor; that would skip undelivered versions
        let from_version = msg.from_version.min(self.cursor(&msg.stream) + 1).max(1);
        tracing::info!(stream = %msg.stream, from_version = from_version, "🔄 Re-draining stream");

        let events = match self.store.load_from(&msg.stream, from_version).await {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(stream = %msg.stream, error = %e, "Re-drain could not load stream");
                return RedrainOutcome {
                    events: 0,
                    error: Some(e.to_string()),
                };
            }
        };

        self.parked.remove(&msg.stream);
        self.cursors.insert(msg.stream.clone(), from_version - 1);

        let count = events.len();
        let report = self.deliver(events).await;

        if report.is_clean() {
            self.failed.retain(|failure| failure.stream != msg.stream);
            tracing::info!(stream = %msg.stream, events = count, "✅ Stream re-drained");
        }

        RedrainOutcome {
            events: count,
            error: report.errors.first().map(|e| e.to_string()),
        }
    }
}

impl Message<GetFailedDeliveries> for ObserverRelay {
    type Reply = FailedDeliveries;

    async fn handle(&mut self, _msg: GetFailedDeliveries, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        FailedDeliveries(self.failed.clone())
    }
}

impl Message<GetRelayStats> for ObserverRelay {
    type Reply = RelayStats;

    async fn handle(&mut self, _msg: GetRelayStats, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::{Aggregate, EventEnvelope, NewEvent};
    use crate::event_sourcing::store::InMemoryEventStore;
    use crate::relay::registry::tests::{gate_change, Gate, GateEvent, Recording};
    use crate::relay::registry::{DomainEventConsumer, Registration};
    use async_trait::async_trait;
    use kameo::prelude::*;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    /// Refuses one version until `heal` is called.
    #[derive(Default)]
    struct Flaky {
        seen: Mutex<Vec<i64>>,
        refuse: Mutex<Option<i64>>,
    }

    impl Flaky {
        fn refusing(version: i64) -> Self {
            Self {
                refuse: Mutex::new(Some(version)),
                ..Self::default()
            }
        }

        async fn heal(&self) {
            *self.refuse.lock().await = None;
        }
    }

    #[async_trait]
    impl DomainEventConsumer<GateEvent> for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn notify(&self, event: &EventEnvelope<GateEvent>) -> anyhow::Result<()> {
            if *self.refuse.lock().await == Some(event.sequence_number) {
                anyhow::bail!("refused version {}", event.sequence_number);
            }
            self.seen.lock().await.push(event.sequence_number);
            Ok(())
        }
    }

    fn events(count: usize) -> Vec<NewEvent> {
        (0..count)
            .map(|_| NewEvent::from_domain(Gate::AGGREGATE_TYPE, Uuid::new_v4(), &GateEvent::Closed, Uuid::new_v4()).unwrap())
            .collect()
    }

    fn relay<C: DomainEventConsumer<GateEvent> + 'static>(store: &Arc<InMemoryEventStore>, consumer: Arc<C>) -> ObserverRelay {
        let registry = Arc::new(
            RelayRegistry::builder()
                .register(Registration::for_aggregate::<Gate>().with_consumer(consumer))
                .build(),
        );
        ObserverRelay::new(store.clone(), registry, Arc::new(IntegrationPublisher::disabled()))
    }

    /// Wait until the relay has taken in `events_seen` events.
    async fn settle(relay: &ActorRef<ObserverRelay>, events_seen: u64) -> RelayStats {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let stats = relay.ask(GetRelayStats).send().await.unwrap();
                if stats.events_seen >= events_seen {
                    return stats;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("relay caught up")
    }

    #[tokio::test]
    async fn test_appends_are_relayed_after_save() {
        let store = Arc::new(InMemoryEventStore::default());
        let consumer = Arc::new(Recording::default());
        let actor = ObserverRelay::spawn(relay(&store, consumer.clone()));

        store.append("gate-1", 0, events(2)).await.unwrap();
        store.append("gate-1", 2, events(1)).await.unwrap();

        let stats = settle(&actor, 3).await;
        assert_eq!(stats.notifications, 2);
        assert_eq!(*consumer.seen.lock().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failed_stream_is_held_until_redrained() {
        let store = Arc::new(InMemoryEventStore::default());
        let consumer = Arc::new(Flaky::refusing(2));
        let actor = ObserverRelay::spawn(relay(&store, consumer.clone()));

        store.append("gate-1", 0, events(3)).await.unwrap();
        store.append("gate-1", 3, events(1)).await.unwrap();

        let stats = settle(&actor, 4).await;
        // v3 and v4 never overtake the refused v2
        assert_eq!(*consumer.seen.lock().await, vec![1]);
        assert_eq!(stats.held_events, 1);

        let FailedDeliveries(failed) = actor.ask(GetFailedDeliveries).send().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].kind, FailureKind::Delivery { version: Some(2) });

        consumer.heal().await;
        let outcome = actor
            .ask(Redrain { stream: "gate-1".to_string(), from_version: 2 })
            .send()
            .await
            .unwrap();
        assert!(outcome.is_clean());
        assert_eq!(outcome.events, 3);
        assert_eq!(*consumer.seen.lock().await, vec![1, 2, 3, 4]);

        let FailedDeliveries(failed) = actor.ask(GetFailedDeliveries).send().await.unwrap();
        assert!(failed.is_empty());

        // released: new appends flow again
        store.append("gate-1", 4, events(1)).await.unwrap();
        settle(&actor, 5).await;
        assert_eq!(*consumer.seen.lock().await, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_redrain_never_starts_past_the_failure() {
        let store = Arc::new(InMemoryEventStore::default());
        let consumer = Arc::new(Flaky::refusing(2));
        let actor = ObserverRelay::spawn(relay(&store, consumer.clone()));

        store.append("gate-1", 0, events(3)).await.unwrap();
        settle(&actor, 3).await;
        consumer.heal().await;

        let outcome = actor
            .ask(Redrain { stream: "gate-1".to_string(), from_version: 3 })
            .send()
            .await
            .unwrap();
        assert!(outcome.is_clean());
        assert_eq!(*consumer.seen.lock().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_repeated_failed_redrain_keeps_one_record() {
        let store = Arc::new(InMemoryEventStore::default());
        let consumer = Arc::new(Recording {
            fail_on: Some(2),
            ..Recording::default()
        });
        let actor = ObserverRelay::spawn(relay(&store, consumer.clone()));

        store.append("gate-1", 0, events(3)).await.unwrap();
        settle(&actor, 3).await;

        for _ in 0..2 {
            let outcome = actor
                .ask(Redrain { stream: "gate-1".to_string(), from_version: 2 })
                .send()
                .await
                .unwrap();
            assert!(!outcome.is_clean());
        }

        let FailedDeliveries(failed) = actor.ask(GetFailedDeliveries).send().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].kind, FailureKind::Delivery { version: Some(2) });
        // v3 was never handed over
        assert_eq!(*consumer.seen.lock().await, vec![1, 2, 2, 2]);
    }

    #[tokio::test]
    async fn test_missed_notifications_are_filled_from_store() {
        let store = Arc::new(InMemoryEventStore::default());
        // appended before the relay subscribed
        store.append("gate-1", 0, events(2)).await.unwrap();

        let consumer = Arc::new(Recording::default());
        let actor = ObserverRelay::spawn(relay(&store, consumer.clone()));

        store.append("gate-1", 2, events(1)).await.unwrap();

        let stats = settle(&actor, 1).await;
        assert_eq!(stats.gaps, 0);
        assert_eq!(*consumer.seen.lock().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_out_of_order_notifications_are_resequenced() {
        let store = Arc::new(InMemoryEventStore::default());
        let stored = store.append("gate-1", 0, events(3)).await.unwrap().events;

        let consumer = Arc::new(Recording::default());
        let actor = ObserverRelay::spawn(relay(&store, consumer.clone()));

        // Two writers' announcements, the later one first
        for events in [stored[2..].to_vec(), stored[..2].to_vec()] {
            actor
                .tell(StreamChanged {
                    stream_name: "gate-1".to_string(),
                    events,
                })
                .send()
                .await
                .unwrap();
        }

        settle(&actor, 3).await;
        assert_eq!(*consumer.seen.lock().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unfillable_gap_holds_later_versions() {
        let store = Arc::new(InMemoryEventStore::default());
        let consumer = Arc::new(Recording::default());
        let actor = ObserverRelay::spawn(relay(&store, consumer.clone()));

        let change = |v| gate_change("gate-9", v, &GateEvent::Closed);
        actor
            .tell(StreamChanged {
                stream_name: "gate-9".to_string(),
                events: vec![change(4), change(1), change(2)],
            })
            .send()
            .await
            .unwrap();

        let stats = settle(&actor, 3).await;
        assert_eq!(stats.gaps, 1);
        assert_eq!(*consumer.seen.lock().await, vec![1, 2]);

        let FailedDeliveries(failed) = actor.ask(GetFailedDeliveries).send().await.unwrap();
        assert_eq!(failed[0].kind, FailureKind::Gap { missing: vec![3] });

        actor
            .tell(StreamChanged {
                stream_name: "gate-9".to_string(),
                events: vec![change(3)],
            })
            .send()
            .await
            .unwrap();
        let stats = settle(&actor, 4).await;
        assert_eq!(stats.held_events, 1);
        assert_eq!(*consumer.seen.lock().await, vec![1, 2]);
    }
}
