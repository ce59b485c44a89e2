use async_trait::async_trait;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use super::store::ReadModelStore;
use crate::errors::{NotificationError, StoreError};
use crate::event_sourcing::core::{Aggregate, DomainEvent, EventEnvelope};
use crate::event_sourcing::store::SaveParticipant;
use crate::metrics::Metrics;
use crate::notification::ChangeNotificationAggregator;
use crate::relay::DomainEventConsumer;

// ============================================================================
// Read Model Projector
// ============================================================================
//
// Handlers are registered per event-type tag at startup and looked up once
// per event:
//
//   create handler  → record created unless one already exists (replay-safe)
//   update handler  → applied to the existing record; skipped if the record
//                     is not there yet (update arrived before its create)
//   no handler      → not applied, not an error (newer writer, older reader)
//
// Update handlers must tolerate re-application: absolute values are set
// as-is, accumulators merge monotonically.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionOutcome {
    Applied,
    /// Create handler hit an existing record
    AlreadyExists,
    /// Update handler found no record
    MissingRecord,
    /// No handler registered for the event type
    Unhandled,
}

impl ProjectionOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, ProjectionOutcome::Applied)
    }

    fn label(&self) -> &'static str {
        match self {
            ProjectionOutcome::Applied => "applied",
            ProjectionOutcome::AlreadyExists => "already_exists",
            ProjectionOutcome::MissingRecord => "missing_record",
            ProjectionOutcome::Unhandled => "unhandled",
        }
    }
}

type CreateHandler<E, R> = Box<dyn Fn(&EventEnvelope<E>) -> Option<R> + Send + Sync>;
type UpdateHandler<E, R> = Box<dyn Fn(&EventEnvelope<E>, &mut R) + Send + Sync>;

enum Handler<E, R> {
    Create(CreateHandler<E, R>),
    Update(UpdateHandler<E, R>),
}

pub struct ReadModelProjector<E, R> {
    name: &'static str,
    store: Arc<dyn ReadModelStore<R>>,
    handlers: HashMap<&'static str, Handler<E, R>>,
    metrics: Option<Arc<Metrics>>,
}

impl<E: DomainEvent, R: Send + Sync + 'static> ReadModelProjector<E, R> {
    pub fn new(name: &'static str, store: Arc<dyn ReadModelStore<R>>) -> Self {
        Self {
            name,
            store,
            handlers: HashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// `handler` returns `None` when the event does not carry a creatable
    /// record, which is reported as `Unhandled`.
    pub fn on_create<F>(mut self, event_type: &'static str, handler: F) -> Self
    where
        F: Fn(&EventEnvelope<E>) -> Option<R> + Send + Sync + 'static,
    {
        self.handlers.insert(event_type, Handler::Create(Box::new(handler)));
        self
    }

    pub fn on_update<F>(mut self, event_type: &'static str, handler: F) -> Self
    where
        F: Fn(&EventEnvelope<E>, &mut R) + Send + Sync + 'static,
    {
        self.handlers.insert(event_type, Handler::Update(Box::new(handler)));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    pub async fn project(&self, event: &EventEnvelope<E>) -> Result<ProjectionOutcome, NotificationError> {
        let outcome = self.dispatch(event).await.map_err(|e| NotificationError::Projection {
            projection: self.name.to_string(),
            stream: event.stream_name.clone(),
            version: event.sequence_number,
            message: e.to_string(),
        })?;

        match outcome {
            ProjectionOutcome::Applied => tracing::debug!(
                projection = self.name,
                event_type = %event.event_type,
                aggregate_id = %event.aggregate_id,
                "Projection applied"
            ),
            ProjectionOutcome::AlreadyExists => tracing::debug!(
                projection = self.name,
                aggregate_id = %event.aggregate_id,
                "Record already exists, create skipped"
            ),
            ProjectionOutcome::MissingRecord => tracing::warn!(
                projection = self.name,
                event_type = %event.event_type,
                aggregate_id = %event.aggregate_id,
                version = event.sequence_number,
                "No record to update, event skipped"
            ),
            ProjectionOutcome::Unhandled => tracing::debug!(
                projection = self.name,
                event_type = %event.event_type,
                "Event type not projected"
            ),
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_projection(self.name, outcome.label());
        }
        Ok(outcome)
    }

    async fn dispatch(&self, event: &EventEnvelope<E>) -> Result<ProjectionOutcome, StoreError> {
        let Some(handler) = self.handlers.get(event.event_type.as_str()) else {
            return Ok(ProjectionOutcome::Unhandled);
        };

        match handler {
            Handler::Create(create) => {
                let Some(record) = create(event) else {
                    return Ok(ProjectionOutcome::Unhandled);
                };
                if self.store.create_if_absent(event.aggregate_id, record).await? {
                    Ok(ProjectionOutcome::Applied)
                } else {
                    Ok(ProjectionOutcome::AlreadyExists)
                }
            }
            Handler::Update(update) => {
                let apply = |record: &mut R| update(event, record);
                if self.store.update(event.aggregate_id, &apply).await? {
                    Ok(ProjectionOutcome::Applied)
                } else {
                    Ok(ProjectionOutcome::MissingRecord)
                }
            }
        }
    }
}

#[async_trait]
impl<E: DomainEvent, R: Send + Sync + 'static> DomainEventConsumer<E> for ReadModelProjector<E, R> {
    fn name(&self) -> &str {
        self.name
    }

    async fn notify(&self, event: &EventEnvelope<E>) -> anyhow::Result<()> {
        self.project(event).await?;
        Ok(())
    }
}

/// Runs a projector directly in the save path of aggregate `A`, without a
/// relay registry in between.
pub struct ProjectionParticipant<A: Aggregate, R> {
    projector: Arc<ReadModelProjector<A::Event, R>>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: Aggregate, R: Send + Sync + 'static> ProjectionParticipant<A, R> {
    pub fn new(projector: Arc<ReadModelProjector<A::Event, R>>) -> Self {
        Self {
            projector,
            _aggregate: PhantomData,
        }
    }
}

impl<A: Aggregate, R: Send + Sync + 'static> SaveParticipant for ProjectionParticipant<A, R> {
    fn name(&self) -> &str {
        self.projector.name()
    }

    fn enlist(&self, aggregator: &mut ChangeNotificationAggregator) {
        let projector = self.projector.clone();
        aggregator.add_tasks(move |events| {
            let changes: Vec<_> = events
                .iter()
                .filter(|change| change.entity_type == A::AGGREGATE_TYPE)
                .cloned()
                .collect();
            if changes.is_empty() {
                return Vec::new();
            }

            vec![async move {
                let migrator = A::migrator();
                for change in &changes {
                    let event = migrator.resolve(change)?;
                    projector.project(&EventEnvelope::from_change(change, event)).await?;
                }
                Ok::<(), NotificationError>(())
            }
            .boxed()]
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::{AggregateRoot, EventStreamChangeEvent, NewEvent};
    use crate::event_sourcing::store::{AggregateCommandStore, InMemoryEventStore};
    use crate::projection::InMemoryReadModelStore;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    #[serde(tag = "type", content = "data")]
    enum TicketEvent {
        Opened { title: String },
        Retitled { title: String },
        Escalated { level: u32 },
        Archived,
    }

    impl DomainEvent for TicketEvent {
        fn event_type(&self) -> &'static str {
            match self {
                TicketEvent::Opened { .. } => "TicketOpened",
                TicketEvent::Retitled { .. } => "TicketRetitled",
                TicketEvent::Escalated { .. } => "TicketEscalated",
                TicketEvent::Archived => "TicketArchived",
            }
        }
    }

    #[derive(Default)]
    struct Ticket;

    impl Aggregate for Ticket {
        const AGGREGATE_TYPE: &'static str = "Ticket";
        type Event = TicketEvent;
        type Command = TicketEvent;
        type Error = std::io::Error;

        fn apply(&mut self, _event: &TicketEvent) {}

        fn handle_command(&self, command: &TicketEvent) -> Result<Vec<TicketEvent>, std::io::Error> {
            Ok(vec![command.clone()])
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    struct TicketRow {
        title: String,
        level: u32,
    }

    fn projector(store: Arc<InMemoryReadModelStore<TicketRow>>) -> ReadModelProjector<TicketEvent, TicketRow> {
        ReadModelProjector::<TicketEvent, TicketRow>::new("tickets", store)
            .on_create("TicketOpened", |e| match &e.event_data {
                TicketEvent::Opened { title } => Some(TicketRow {
                    title: title.clone(),
                    level: 0,
                }),
                _ => None,
            })
            .on_update("TicketRetitled", |e, row| {
                if let TicketEvent::Retitled { title } = &e.event_data {
                    row.title = title.clone();
                }
            })
            .on_update("TicketEscalated", |e, row| {
                if let TicketEvent::Escalated { level } = &e.event_data {
                    row.level = row.level.max(*level);
                }
            })
    }

    fn envelope(aggregate_id: Uuid, version: i64, event: TicketEvent) -> EventEnvelope<TicketEvent> {
        let new = NewEvent::from_domain(Ticket::AGGREGATE_TYPE, aggregate_id, &event, Uuid::new_v4()).unwrap();
        let change = EventStreamChangeEvent::from_new(&Ticket::stream_name(aggregate_id), version, new, Utc::now());
        EventEnvelope::from_change(&change, event)
    }

    #[tokio::test]
    async fn test_duplicate_create_keeps_one_record() {
        let rows = Arc::new(InMemoryReadModelStore::new());
        let projector = projector(rows.clone());
        let id = Uuid::new_v4();
        let opened = envelope(id, 1, TicketEvent::Opened { title: "a".to_string() });

        assert_eq!(projector.project(&opened).await.unwrap(), ProjectionOutcome::Applied);
        projector
            .project(&envelope(id, 2, TicketEvent::Retitled { title: "b".to_string() }))
            .await
            .unwrap();
        assert_eq!(projector.project(&opened).await.unwrap(), ProjectionOutcome::AlreadyExists);

        assert_eq!(rows.len().await, 1);
        assert_eq!(rows.get(id).await.unwrap().unwrap().title, "b");
    }

    #[tokio::test]
    async fn test_update_before_create_is_skipped() {
        let rows = Arc::new(InMemoryReadModelStore::new());
        let outcome = projector(rows.clone())
            .project(&envelope(Uuid::new_v4(), 2, TicketEvent::Escalated { level: 1 }))
            .await
            .unwrap();

        assert_eq!(outcome, ProjectionOutcome::MissingRecord);
        assert!(!outcome.applied());
        assert!(rows.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_not_applied() {
        let outcome = projector(Arc::new(InMemoryReadModelStore::new()))
            .project(&envelope(Uuid::new_v4(), 3, TicketEvent::Archived))
            .await
            .unwrap();
        assert_eq!(outcome, ProjectionOutcome::Unhandled);
    }

    #[tokio::test]
    async fn test_redelivered_escalation_is_monotonic() {
        let rows = Arc::new(InMemoryReadModelStore::new());
        let projector = projector(rows.clone());
        let id = Uuid::new_v4();
        projector
            .project(&envelope(id, 1, TicketEvent::Opened { title: "a".to_string() }))
            .await
            .unwrap();

        let second = envelope(id, 3, TicketEvent::Escalated { level: 2 });
        projector.project(&envelope(id, 2, TicketEvent::Escalated { level: 1 })).await.unwrap();
        projector.project(&second).await.unwrap();
        // older escalation redelivered after the newer one
        projector.project(&envelope(id, 2, TicketEvent::Escalated { level: 1 })).await.unwrap();

        assert_eq!(rows.get(id).await.unwrap().unwrap().level, 2);
    }

    #[tokio::test]
    async fn test_participant_projects_in_save_path() {
        let rows = Arc::new(InMemoryReadModelStore::new());
        let participant = ProjectionParticipant::<Ticket, _>::new(Arc::new(projector(rows.clone())));
        let store = AggregateCommandStore::new(Arc::new(InMemoryEventStore::default())).with_participant(Arc::new(participant));

        let id = Uuid::new_v4();
        let mut root = AggregateRoot::<Ticket>::new(id);
        root.execute(&TicketEvent::Opened { title: "printer".to_string() }).unwrap();
        root.execute(&TicketEvent::Escalated { level: 3 }).unwrap();
        store.save(&mut root, Uuid::new_v4()).await.unwrap();

        assert_eq!(
            rows.get(id).await.unwrap(),
            Some(TicketRow {
                title: "printer".to_string(),
                level: 3
            })
        );
    }
}
