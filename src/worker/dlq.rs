use chrono::{DateTime, Utc};
use kameo::actor::ActorRef;
use kameo::error::Infallible;
use kameo::message::{Context, Message};
use kameo::reply::{Reply, ReplyError};
use kameo::Actor;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

// ============================================================================
// Dead Letter Queue Actor
// ============================================================================
//
// Holds worker messages that exhausted their delivery attempts or can never
// be delivered (unknown route, payload outside its contract). Queryable for
// manual intervention; the oldest entries are dropped once `capacity` is
// reached.
//
// ============================================================================

pub struct DlqActor {
    messages: VecDeque<DlqMessage>,
    capacity: usize,
    total_received: u64,
}

impl DlqActor {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            capacity: capacity.max(1),
            total_received: 0,
        }
    }
}

impl Actor for DlqActor {
    type Args = Self;
    type Error = Infallible;

    async fn on_start(state: Self::Args, _actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        tracing::info!(capacity = state.capacity, "DlqActor started - Dead Letter Queue ready");
        Ok(state)
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone)]
pub struct AddToDlq {
    pub id: Uuid,
    pub routing_key: String,
    pub payload: String,
    pub error_message: String,
    pub delivery_count: u32,
}

pub struct GetDlqMessages {
    pub limit: usize,
}

pub struct GetDlqStats;

#[derive(Debug, Clone)]
pub struct DlqMessage {
    pub id: Uuid,
    pub routing_key: String,
    pub payload: String,
    pub error_message: String,
    pub delivery_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DlqMessages(pub Vec<DlqMessage>);

#[derive(Debug, Clone, Default)]
pub struct DlqStats {
    pub total_received: u64,
    pub held: usize,
    pub by_routing_key: HashMap<String, usize>,
}

impl Reply for DlqMessages {
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

impl Reply for DlqStats {
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

// ============================================================================
// Handlers
// ============================================================================

impl Message<AddToDlq> for DlqActor {
    type Reply = ();

    async fn handle(&mut self, msg: AddToDlq, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        tracing::error!(
            message_id = %msg.id,
            routing_key = %msg.routing_key,
            error = %msg.error_message,
            delivery_count = msg.delivery_count,
            "💀 Adding message to Dead Letter Queue"
        );

        if self.messages.len() == self.capacity {
            if let Some(evicted) = self.messages.pop_front() {
                tracing::warn!(message_id = %evicted.id, "DLQ full, evicting oldest message");
            }
        }

        self.total_received += 1;
        self.messages.push_back(DlqMessage {
            id: msg.id,
            routing_key: msg.routing_key,
            payload: msg.payload,
            error_message: msg.error_message,
            delivery_count: msg.delivery_count,
            dead_lettered_at: Utc::now(),
        });
    }
}

impl Message<GetDlqMessages> for DlqActor {
    type Reply = DlqMessages;

    async fn handle(&mut self, msg: GetDlqMessages, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        DlqMessages(self.messages.iter().take(msg.limit).cloned().collect())
    }
}

impl Message<GetDlqStats> for DlqActor {
    type Reply = DlqStats;

    async fn handle(&mut self, _msg: GetDlqStats, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let mut by_routing_key = HashMap::new();
        for message in &self.messages {
            *by_routing_key.entry(message.routing_key.clone()).or_insert(0) += 1;
        }

        DlqStats {
            total_received: self.total_received,
            held: self.messages.len(),
            by_routing_key,
        }
    }
}
