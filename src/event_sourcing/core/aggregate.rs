use std::sync::Arc;
use uuid::Uuid;

use super::event::{DomainEvent, EventEnvelope};
use super::migration::{EventMigrator, UpcastingMigrator};

// ============================================================================
// Aggregate Root Pattern
// ============================================================================
//
// 1. State is derived from events (never stored directly)
// 2. Commands are validated before any event is raised
// 3. `apply` is a pure state transition and cannot fail
//
// `Aggregate` is the domain-side contract. `AggregateRoot<A>` is the
// handle the command store works with: identity, the version the state was
// loaded at, and the events raised since.
//
// ============================================================================

pub trait Aggregate: Default + Send + Sync + 'static {
    /// Tag stored as the entity type of every event; selects relay registrations
    const AGGREGATE_TYPE: &'static str;

    type Event: DomainEvent;
    type Command: Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    fn apply(&mut self, event: &Self::Event);

    /// Business rules: validate the command against current state and
    /// return the events it raises.
    fn handle_command(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;

    fn stream_name(aggregate_id: Uuid) -> String {
        format!("{}-{}", Self::AGGREGATE_TYPE.to_ascii_lowercase(), aggregate_id)
    }

    fn migrator() -> Arc<dyn EventMigrator<Self::Event>> {
        Arc::new(UpcastingMigrator::<Self::Event>::new())
    }
}

#[derive(Debug)]
pub struct AggregateRoot<A: Aggregate> {
    id: Uuid,
    version: i64,
    state: A,
    uncommitted: Vec<A::Event>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// A root with no history (version 0).
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            version: 0,
            state: A::default(),
            uncommitted: Vec::new(),
        }
    }

    /// Rebuild state by folding the stream in order.
    pub fn from_history(id: Uuid, history: &[EventEnvelope<A::Event>]) -> Self {
        let mut root = Self::new(id);
        for envelope in history {
            root.state.apply(&envelope.event_data);
            root.version = envelope.sequence_number;
        }
        root
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Version the state was loaded at; the expected version of the next append.
    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn stream_name(&self) -> String {
        A::stream_name(self.id)
    }

    pub fn uncommitted(&self) -> &[A::Event] {
        &self.uncommitted
    }

    pub fn has_changes(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// Handle a command and apply what it raises. Nothing is applied when
    /// the command is rejected.
    pub fn execute(&mut self, command: &A::Command) -> Result<usize, A::Error> {
        let events = self.state.handle_command(command)?;
        for event in &events {
            self.state.apply(event);
        }
        let raised = events.len();
        self.uncommitted.extend(events);
        Ok(raised)
    }

    /// Called by the store after a successful append.
    pub(crate) fn mark_committed(&mut self, new_version: i64) {
        self.version = new_version;
        self.uncommitted.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    #[serde(tag = "type", content = "data")]
    enum CounterEvent {
        Incremented { by: u32 },
    }

    impl DomainEvent for CounterEvent {
        fn event_type(&self) -> &'static str {
            "Incremented"
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("increment must be positive")]
    struct ZeroIncrement;

    #[derive(Default, Debug)]
    struct Counter {
        total: u32,
    }

    impl Aggregate for Counter {
        const AGGREGATE_TYPE: &'static str = "Counter";
        type Event = CounterEvent;
        type Command = u32;
        type Error = ZeroIncrement;

        fn apply(&mut self, event: &CounterEvent) {
            let CounterEvent::Incremented { by } = event;
            self.total += by;
        }

        fn handle_command(&self, by: &u32) -> Result<Vec<CounterEvent>, ZeroIncrement> {
            if *by == 0 {
                return Err(ZeroIncrement);
            }
            Ok(vec![CounterEvent::Incremented { by: *by }])
        }
    }

    #[test]
    fn test_execute_applies_and_tracks_uncommitted() {
        let mut root = AggregateRoot::<Counter>::new(Uuid::new_v4());
        assert_eq!(root.execute(&3).unwrap(), 1);
        assert_eq!(root.execute(&4).unwrap(), 1);

        assert_eq!(root.state().total, 7);
        assert_eq!(root.uncommitted().len(), 2);
        assert_eq!(root.version(), 0);

        root.mark_committed(2);
        assert!(!root.has_changes());
        assert_eq!(root.version(), 2);
    }

    #[test]
    fn test_rejected_command_changes_nothing() {
        let mut root = AggregateRoot::<Counter>::new(Uuid::new_v4());
        assert!(root.execute(&0).is_err());
        assert_eq!(root.state().total, 0);
        assert!(!root.has_changes());
    }

    #[test]
    fn test_stream_name_is_type_prefixed() {
        let id = Uuid::new_v4();
        assert_eq!(Counter::stream_name(id), format!("counter-{id}"));
    }
}
