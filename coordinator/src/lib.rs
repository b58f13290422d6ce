//! The off-chain coordinator: serialized request executor, price-time
//! matching, settlement pipeline, and deposit ingestion for the two-asset
//! dark pool (spec.md §1–§2). Transport, signature verification, and
//! chain-RPC plumbing are out of scope — this crate exposes the seams they
//! plug into (`AuthenticatedEnvelope`, `ChainSubmitter`, `DepositEventSource`)
//! and owns everything behind them.

pub mod chain;
pub mod config;
pub mod decimal;
pub mod error;
pub mod executor;
pub mod health;
pub mod ingestor;
pub mod message;
pub mod processor;
pub mod queues;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ledger::Asset;
use matching_engine::{Side, UserId};
use serde::{Deserialize, Serialize};

use crate::decimal::DecimalError;
use crate::error::CoreError;
use crate::executor::{received_message, Executor};
use crate::health::HealthState;
use crate::message::{Message, MessageId, MessageKind, MessageStore};
use crate::queues::{
    CancelRequest, Inbound, IncomingSender, OrderRequest, SharedMessageStore, WithdrawalRequest,
};

/// The authenticated, already-parsed request envelope the core receives.
/// Signature cryptography and timestamp-skew rejection happen at the
/// transport boundary (spec.md §1, §6); this type documents the shape of
/// what survives that boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedEnvelope<T> {
    pub address: UserId,
    pub timestamp: i64,
    pub payload: T,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitOrderBody {
    pub side: String,
    pub price: String,
    pub quantity: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelBody {
    pub order_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawalBody {
    pub asset: String,
    pub amount: String,
}

fn parse_side(s: &str) -> Result<Side, CoreError> {
    match s {
        "buy" => Ok(Side::Buy),
        "sell" => Ok(Side::Sell),
        other => Err(CoreError::Validation(format!("unknown side {other:?}"))),
    }
}

fn parse_asset(s: &str) -> Result<Asset, CoreError> {
    match s {
        "a" => Ok(Asset::A),
        "b" => Ok(Asset::B),
        other => Err(CoreError::Validation(format!("unknown asset {other:?}"))),
    }
}

impl From<DecimalError> for CoreError {
    fn from(e: DecimalError) -> Self {
        CoreError::Validation(e.to_string())
    }
}

/// The entry point a (not-implemented-here) HTTP layer calls once a request
/// is parsed and its signature verified. Allocates the message id,
/// registers a `Received` message so a status query never races the
/// executor, and enqueues onto the incoming queue.
#[derive(Clone)]
pub struct Coordinator {
    messages: SharedMessageStore,
    incoming: IncomingSender,
    next_message_id: Arc<AtomicU64>,
    pub health: Arc<HealthState>,
}

impl Coordinator {
    fn next_id(&self) -> MessageId {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn register_and_enqueue(&self, kind: MessageKind, inbound: Inbound) -> MessageId {
        let message_id = self.next_id();
        {
            let mut messages = self.messages.write().await;
            messages.insert(received_message(message_id, kind));
        }
        // A closed incoming queue means the executor task died; the message
        // stays `Received` forever, which is itself an observable failure
        // signal via the status endpoint.
        let _ = self.incoming.send((message_id, inbound)).await;
        message_id
    }

    pub async fn submit_order(&self, user: UserId, body: SubmitOrderBody) -> Result<MessageId, CoreError> {
        let side = parse_side(&body.side)?;
        let price = decimal::parse_price(&body.price)?;
        let quantity = decimal::parse_amount(&body.quantity)?;
        let req = OrderRequest { user, side, price, quantity };
        Ok(self.register_and_enqueue(MessageKind::Order, Inbound::Order(req)).await)
    }

    pub async fn submit_cancel(&self, user: UserId, body: CancelBody) -> Result<MessageId, CoreError> {
        let order_id: u64 = body
            .order_id
            .parse()
            .map_err(|_| CoreError::Validation(format!("invalid order_id {:?}", body.order_id)))?;
        let req = CancelRequest { user, order_id };
        Ok(self.register_and_enqueue(MessageKind::Cancel, Inbound::Cancel(req)).await)
    }

    pub async fn submit_withdrawal(&self, user: UserId, body: WithdrawalBody) -> Result<MessageId, CoreError> {
        let asset = parse_asset(&body.asset)?;
        let amount = decimal::parse_integer_amount(&body.amount)?;
        let req = WithdrawalRequest { user, asset, amount };
        Ok(self.register_and_enqueue(MessageKind::Withdrawal, Inbound::Withdrawal(req)).await)
    }

    pub async fn status(&self, message_id: MessageId) -> Option<Message> {
        self.messages.read().await.get(message_id)
    }

    /// Lets the deposit ingestor enqueue onto the same incoming queue the
    /// API boundary uses, so both producers feed the one executor.
    pub fn incoming_sender(&self) -> IncomingSender {
        self.incoming.clone()
    }
}

/// Everything the process wires at startup: the three channels and the
/// executor agent, a `Coordinator` handle for the (out-of-scope) HTTP layer,
/// and the receiving/sending ends the caller needs to build the outgoing
/// processor and deposit ingestor around its own `ChainSubmitter` /
/// `DepositEventSource`. Grounded on the teacher's module-level `AppState`
/// construction in `matching_engine_service`/`gateway`, generalized from a
/// shared `RwLock` orderbook to the channel-and-agent topology spec.md §5
/// specifies.
pub struct System {
    pub coordinator: Coordinator,
    pub executor: Executor,
    pub messages: SharedMessageStore,
    pub outgoing_rx: queues::OutgoingReceiver,
    pub compensation_tx: queues::CompensationSender,
    pub health: Arc<HealthState>,
}

pub fn build(channel_capacity: usize) -> System {
    let messages: SharedMessageStore = Arc::new(tokio::sync::RwLock::new(MessageStore::default()));
    let (incoming_tx, incoming_rx) = tokio::sync::mpsc::channel(channel_capacity);
    let (outgoing_tx, outgoing_rx) = tokio::sync::mpsc::channel(channel_capacity);
    let (compensation_tx, compensation_rx) = tokio::sync::mpsc::channel(channel_capacity);
    let health = Arc::new(HealthState::default());

    let executor = Executor::new(
        messages.clone(),
        incoming_rx,
        outgoing_tx,
        compensation_rx,
        health.executor.clone(),
    );

    let coordinator = Coordinator {
        messages: messages.clone(),
        incoming: incoming_tx,
        next_message_id: Arc::new(AtomicU64::new(1)),
        health: health.clone(),
    };

    System {
        coordinator,
        executor,
        messages,
        outgoing_rx,
        compensation_tx,
        health,
    }
}

pub use config::Config as CoordinatorConfig;
pub use health::AgentHeartbeat as Heartbeat;
pub use queues::DepositEvent as CoordinatorDepositEvent;
