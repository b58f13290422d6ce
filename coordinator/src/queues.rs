//! The three cross-agent channels: incoming (multi-producer, single
//! consumer into the executor), outgoing (single-producer/single-consumer
//! from executor to processor), and the compensation channel (processor
//! back into the executor). Also the request/intent payloads carried on
//! them.

use matching_engine::{Amount, OrderId, Price, Side, TradeId, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::message::{MessageId, MessageStore};
use ledger::Asset;

pub type SharedMessageStore = Arc<tokio::sync::RwLock<MessageStore>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub user: UserId,
    pub side: Side,
    pub price: Price,
    pub quantity: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub user: UserId,
    pub order_id: OrderId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub user: UserId,
    pub asset: Asset,
    pub amount: Amount,
}

/// `(tx_hash, event_index)` is the deduplication key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositEvent {
    pub tx_hash: String,
    pub event_index: u32,
    pub user: UserId,
    pub asset: Asset,
    pub amount: Amount,
    pub ledger_seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Inbound {
    Order(OrderRequest),
    Cancel(CancelRequest),
    Withdrawal(WithdrawalRequest),
    Deposit(DepositEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutgoingIntent {
    Settle {
        /// The message of the incoming order whose matching produced this trade.
        taker_message_id: MessageId,
        /// The message of the resting order it matched against. One Settle
        /// intent resolves both legs on chain, so both messages' settlement
        /// tracking must learn the outcome (spec.md §4.7).
        maker_message_id: MessageId,
        buyer: UserId,
        seller: UserId,
        asset_sold: Asset,
        amount_sold: Amount,
        asset_bought: Asset,
        amount_bought: Amount,
        trade_id: TradeId,
    },
    Withdraw {
        message_id: MessageId,
        user: UserId,
        asset: Asset,
        amount: Amount,
    },
}

impl OutgoingIntent {
    /// Every message whose settlement tracking this intent's outcome resolves.
    pub fn message_ids(&self) -> Vec<MessageId> {
        match self {
            OutgoingIntent::Settle { taker_message_id, maker_message_id, .. } => {
                vec![*taker_message_id, *maker_message_id]
            }
            OutgoingIntent::Withdraw { message_id, .. } => vec![*message_id],
        }
    }

    /// The id used for logging; for a `Settle` this is the taker's message,
    /// since that's the request whose submission triggered this intent.
    pub fn primary_message_id(&self) -> MessageId {
        match self {
            OutgoingIntent::Settle { taker_message_id, .. } => *taker_message_id,
            OutgoingIntent::Withdraw { message_id, .. } => *message_id,
        }
    }
}

/// Sent by the outgoing processor back into the executor when a `Withdraw`
/// intent fails terminally on chain, so the user's `available` is restored.
#[derive(Debug, Clone)]
pub enum Compensation {
    CreditBack {
        user: UserId,
        asset: Asset,
        amount: Amount,
    },
}

pub type IncomingSender = tokio::sync::mpsc::Sender<(MessageId, Inbound)>;
pub type IncomingReceiver = tokio::sync::mpsc::Receiver<(MessageId, Inbound)>;
pub type OutgoingSender = tokio::sync::mpsc::Sender<OutgoingIntent>;
pub type OutgoingReceiver = tokio::sync::mpsc::Receiver<OutgoingIntent>;
pub type CompensationSender = tokio::sync::mpsc::Sender<Compensation>;
pub type CompensationReceiver = tokio::sync::mpsc::Receiver<Compensation>;
