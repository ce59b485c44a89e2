use std::sync::Arc;
use uuid::Uuid;

use super::event_store::EventStore;
use crate::errors::{SaveError, StoreError};
use crate::event_sourcing::core::{Aggregate, AggregateRoot, EventEnvelope, EventStreamChangeEvent, NewEvent};
use crate::notification::ChangeNotificationAggregator;

// ============================================================================
// Aggregate Command Store
// ============================================================================
//
// Orchestrates: load → command → append → post-save obligations
//
// A save that fails AFTER the append (a participant's obligation failed)
// returns `SaveError::SideEffects`: the events are durably stored, only the
// side effects are incomplete and must be re-drained. There is no rollback.
//
// ============================================================================

/// A party that enlists work against every successful save.
pub trait SaveParticipant: Send + Sync {
    fn name(&self) -> &str;
    fn enlist(&self, aggregator: &mut ChangeNotificationAggregator);
}

#[derive(Debug, Clone)]
pub struct SaveOutcome {
    pub new_version: i64,
    pub appended: Vec<EventStreamChangeEvent>,
}

pub struct AggregateCommandStore {
    store: Arc<dyn EventStore>,
    participants: Vec<Arc<dyn SaveParticipant>>,
}

impl AggregateCommandStore {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            participants: Vec::new(),
        }
    }

    pub fn with_participant(mut self, participant: Arc<dyn SaveParticipant>) -> Self {
        tracing::debug!(participant = %participant.name(), "Registered save participant");
        self.participants.push(participant);
        self
    }

    pub fn event_store(&self) -> Arc<dyn EventStore> {
        self.store.clone()
    }

    /// Rehydrate by replaying the stream. An unknown id yields a fresh root
    /// at version 0.
    pub async fn load<A: Aggregate>(&self, aggregate_id: Uuid) -> Result<AggregateRoot<A>, StoreError> {
        let stream_name = A::stream_name(aggregate_id);
        let changes = self.store.load(&stream_name).await?;
        let migrator = A::migrator();

        let mut history = Vec::with_capacity(changes.len());
        for change in &changes {
            let event = migrator
                .resolve(change)
                .map_err(|e| StoreError::Defect(anyhow::anyhow!("cannot rehydrate {}: {}", stream_name, e)))?;
            history.push(EventEnvelope::from_change(change, event));
        }

        tracing::debug!(stream = %stream_name, events = history.len(), "Rehydrated aggregate");
        Ok(AggregateRoot::from_history(aggregate_id, &history))
    }

    /// Like `load`, but an empty stream is `NotFound`.
    pub async fn load_existing<A: Aggregate>(&self, aggregate_id: Uuid) -> Result<AggregateRoot<A>, StoreError> {
        let root = self.load::<A>(aggregate_id).await?;
        if root.version() == 0 {
            return Err(StoreError::NotFound(root.stream_name()));
        }
        Ok(root)
    }

    /// Append the root's uncommitted events at the version it was loaded at,
    /// then run every participant's obligations.
    pub async fn save<A: Aggregate>(
        &self,
        root: &mut AggregateRoot<A>,
        correlation_id: Uuid,
    ) -> Result<SaveOutcome, SaveError> {
        if !root.has_changes() {
            return Ok(SaveOutcome {
                new_version: root.version(),
                appended: Vec::new(),
            });
        }

        let stream_name = root.stream_name();
        let new_events = root
            .uncommitted()
            .iter()
            .map(|event| NewEvent::from_domain(A::AGGREGATE_TYPE, root.id(), event, correlation_id))
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;

        let outcome = self.store.append(&stream_name, root.version(), new_events).await?;
        root.mark_committed(outcome.new_version);

        let mut aggregator = ChangeNotificationAggregator::new(outcome.events.clone());
        for participant in &self.participants {
            participant.enlist(&mut aggregator);
        }

        if let Err(source) = aggregator.complete().await {
            tracing::error!(
                stream = %stream_name,
                new_version = outcome.new_version,
                error = %source,
                "❌ Events persisted but side effects failed, re-drain required"
            );
            return Err(SaveError::SideEffects {
                new_version: outcome.new_version,
                source,
            });
        }

        Ok(SaveOutcome {
            new_version: outcome.new_version,
            appended: outcome.events,
        })
    }

    /// Load, execute one command, save.
    pub async fn execute<A: Aggregate>(
        &self,
        aggregate_id: Uuid,
        command: A::Command,
        correlation_id: Uuid,
    ) -> Result<SaveOutcome, SaveError> {
        let mut root = self.load::<A>(aggregate_id).await?;
        root.execute(&command).map_err(|e| {
            tracing::debug!(aggregate_id = %aggregate_id, error = %e, "Command rejected");
            SaveError::Rejected(e.to_string())
        })?;
        self.save(&mut root, correlation_id).await
    }
}
