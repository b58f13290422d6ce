//! Lifecycle records for every externally originated request. Writes are
//! partitioned between the executor (pre-settlement transitions) and the
//! outgoing processor (settlement transitions) per spec.md §4.7 — enforced
//! here by rejecting any transition outside the allowed DAG rather than by
//! trusting the caller.

use matching_engine::{OrderId, TradeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::CoreError;

pub type MessageId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Order,
    Cancel,
    Withdrawal,
    Deposit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Received,
    Accepted,
    Rejected(String),
    SettlementPending,
    SettlementConfirmed,
    SettlementFailed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub order_id: Option<OrderId>,
    pub trade_ids: Vec<TradeId>,
    pub tx_hash: Option<String>,
    /// Number of outgoing settlement intents still outstanding for this
    /// message. A taker's order message arms for every trade it generated in
    /// one sweep; a resting maker's original message arms one more intent
    /// each time a later taker fills against it, so this can be armed
    /// more than once over a message's lifetime. A withdrawal arms exactly
    /// one Withdraw intent. Reaching zero resolves the message to
    /// SettlementConfirmed, or SettlementFailed if any intent terminally
    /// failed along the way. This aggregation is not spelled out in
    /// spec.md's per-message DAG — see DESIGN.md.
    pending_settlements: usize,
    settlement_failure: Option<String>,
}

impl Message {
    pub fn new(message_id: MessageId, kind: MessageKind) -> Self {
        Self {
            message_id,
            kind,
            status: MessageStatus::Received,
            order_id: None,
            trade_ids: Vec::new(),
            tx_hash: None,
            pending_settlements: 0,
            settlement_failure: None,
        }
    }

    /// Enforces the DAG from spec.md §4.5/§4.7, widened by one pair of edges
    /// this repo's multi-trade arming needs: a resting maker's message can
    /// already be resolved (`SettlementConfirmed`/`SettlementFailed`) from an
    /// earlier settlement round by the time a *later*, independent taker
    /// fills against the same still-resting order and arms it again
    /// (`MessageStore::arm_settlement`) — the executor and outgoing
    /// processor are concurrent, so nothing orders "all fills against an
    /// order land before any of their settlements resolve". A resolved
    /// message going back to `SettlementPending` for a new round isn't the
    /// DAG moving backward in the sense spec.md means (no status is ever
    /// un-terminal for the round that produced it); every other edge stays
    /// exactly as spec.md describes.
    pub fn transition_to(&mut self, next: MessageStatus) -> Result<(), CoreError> {
        use MessageStatus::*;
        let allowed = matches!(
            (&self.status, &next),
            (Received, Accepted)
                | (Received, Rejected(_))
                | (Received, SettlementConfirmed)
                | (Accepted, SettlementPending)
                | (SettlementPending, SettlementConfirmed)
                | (SettlementPending, SettlementFailed(_))
                | (SettlementConfirmed, SettlementPending)
                | (SettlementFailed(_), SettlementPending)
        );
        if !allowed {
            return Err(CoreError::InternalInvariantViolation(format!(
                "illegal message transition {:?} -> {:?}",
                self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}

#[derive(Default)]
pub struct MessageStore {
    messages: HashMap<MessageId, Message>,
}

impl MessageStore {
    pub fn insert(&mut self, message: Message) {
        self.messages.insert(message.message_id, message);
    }

    pub fn get(&self, id: MessageId) -> Option<Message> {
        self.messages.get(&id).cloned()
    }

    pub fn transition(&mut self, id: MessageId, next: MessageStatus) -> Result<(), CoreError> {
        let message = self
            .messages
            .get_mut(&id)
            .ok_or_else(|| CoreError::InternalInvariantViolation(format!("unknown message {id}")))?;
        message.transition_to(next)
    }

    pub fn set_order_id(&mut self, id: MessageId, order_id: OrderId) {
        if let Some(m) = self.messages.get_mut(&id) {
            m.order_id = Some(order_id);
        }
    }

    pub fn push_trade(&mut self, id: MessageId, trade_id: TradeId) {
        if let Some(m) = self.messages.get_mut(&id) {
            m.trade_ids.push(trade_id);
        }
    }

    /// Arms settlement tracking for `additional` more outgoing intents
    /// generated against this message: a taker's order message arms once for
    /// all of its trades, but a resting maker's original message can be
    /// armed again on every later taker that fills against it, so this adds
    /// rather than overwrites. Transitions into `SettlementPending` only when
    /// the count is rising off zero; a message already tracking settlements
    /// stays `SettlementPending` until its count reaches zero again. That
    /// zero-to-nonzero edge can originate from `Accepted` (first arming) or
    /// from `SettlementConfirmed`/`SettlementFailed` (a resting maker's
    /// earlier round already resolved before this later round armed) — both
    /// are legal per `transition_to`.
    pub fn arm_settlement(&mut self, id: MessageId, additional: usize) -> Result<(), CoreError> {
        let message = self
            .messages
            .get_mut(&id)
            .ok_or_else(|| CoreError::InternalInvariantViolation(format!("unknown message {id}")))?;
        if message.pending_settlements == 0 {
            message.transition_to(MessageStatus::SettlementPending)?;
        }
        message.pending_settlements += additional;
        Ok(())
    }

    /// Called by the outgoing processor once per resolved intent. When the
    /// last outstanding intent for a message resolves, transitions the
    /// message to its terminal settlement status.
    pub fn record_settlement_outcome(
        &mut self,
        id: MessageId,
        ok: bool,
        reason: Option<String>,
        tx_hash: Option<String>,
    ) -> Result<(), CoreError> {
        let message = self
            .messages
            .get_mut(&id)
            .ok_or_else(|| CoreError::InternalInvariantViolation(format!("unknown message {id}")))?;

        if let Some(hash) = tx_hash {
            message.tx_hash = Some(hash);
        }
        if !ok {
            message.settlement_failure.get_or_insert(reason.unwrap_or_default());
        }
        message.pending_settlements = message
            .pending_settlements
            .checked_sub(1)
            .ok_or_else(|| CoreError::InternalInvariantViolation("settlement outcome with no pending intents".into()))?;

        if message.pending_settlements == 0 {
            let next = match message.settlement_failure.clone() {
                Some(reason) => MessageStatus::SettlementFailed(reason),
                None => MessageStatus::SettlementConfirmed,
            };
            message.transition_to(next)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_backward_transition() {
        let mut m = Message::new(1, MessageKind::Order);
        m.transition_to(MessageStatus::Accepted).unwrap();
        let err = m.transition_to(MessageStatus::Received).unwrap_err();
        assert!(matches!(err, CoreError::InternalInvariantViolation(_)));
    }

    #[test]
    fn single_trade_order_confirms_after_one_outcome() {
        let mut store = MessageStore::default();
        store.insert(Message::new(1, MessageKind::Order));
        store.transition(1, MessageStatus::Accepted).unwrap();
        store.arm_settlement(1, 1).unwrap();
        assert_eq!(store.get(1).unwrap().status, MessageStatus::SettlementPending);
        store
            .record_settlement_outcome(1, true, None, Some("tx1".into()))
            .unwrap();
        let m = store.get(1).unwrap();
        assert_eq!(m.status, MessageStatus::SettlementConfirmed);
        assert_eq!(m.tx_hash, Some("tx1".into()));
    }

    #[test]
    fn multi_trade_order_waits_for_all_outcomes_and_surfaces_first_failure() {
        let mut store = MessageStore::default();
        store.insert(Message::new(1, MessageKind::Order));
        store.transition(1, MessageStatus::Accepted).unwrap();
        store.arm_settlement(1, 2).unwrap();

        store.record_settlement_outcome(1, true, None, Some("tx1".into())).unwrap();
        assert_eq!(store.get(1).unwrap().status, MessageStatus::SettlementPending);

        store
            .record_settlement_outcome(1, false, Some("chain rejected".into()), None)
            .unwrap();
        let m = store.get(1).unwrap();
        assert_eq!(m.status, MessageStatus::SettlementFailed("chain rejected".into()));
    }

    #[test]
    fn resting_maker_message_arms_again_on_each_later_fill() {
        // A resting order's original message stays Accepted until the first
        // taker fills against it, then re-arms (without resetting its
        // pending count) on a second taker later in its resting life.
        let mut store = MessageStore::default();
        store.insert(Message::new(1, MessageKind::Order));
        store.transition(1, MessageStatus::Accepted).unwrap();

        store.arm_settlement(1, 1).unwrap();
        assert_eq!(store.get(1).unwrap().status, MessageStatus::SettlementPending);
        store.arm_settlement(1, 1).unwrap();
        assert_eq!(store.get(1).unwrap().status, MessageStatus::SettlementPending);

        store.record_settlement_outcome(1, true, None, Some("tx1".into())).unwrap();
        assert_eq!(store.get(1).unwrap().status, MessageStatus::SettlementPending);
        store.record_settlement_outcome(1, true, None, Some("tx2".into())).unwrap();
        assert_eq!(store.get(1).unwrap().status, MessageStatus::SettlementConfirmed);
    }

    #[test]
    fn resolved_message_can_be_rearmed_for_a_later_settlement_round() {
        // A resting maker's message can fully resolve (Confirmed or Failed)
        // before a later, independent taker fills against the same order and
        // arms it again for a second round. Neither resolved state is a dead
        // end.
        let mut store = MessageStore::default();
        store.insert(Message::new(1, MessageKind::Order));
        store.transition(1, MessageStatus::Accepted).unwrap();

        store.arm_settlement(1, 1).unwrap();
        store
            .record_settlement_outcome(1, true, None, Some("tx1".into()))
            .unwrap();
        assert_eq!(store.get(1).unwrap().status, MessageStatus::SettlementConfirmed);

        store.arm_settlement(1, 1).unwrap();
        assert_eq!(store.get(1).unwrap().status, MessageStatus::SettlementPending);
        store
            .record_settlement_outcome(1, true, None, Some("tx2".into()))
            .unwrap();
        let m = store.get(1).unwrap();
        assert_eq!(m.status, MessageStatus::SettlementConfirmed);
        assert_eq!(m.tx_hash, Some("tx2".into()));

        // Same check starting from a Failed resolution instead of Confirmed.
        let mut store2 = MessageStore::default();
        store2.insert(Message::new(2, MessageKind::Order));
        store2.transition(2, MessageStatus::Accepted).unwrap();

        store2.arm_settlement(2, 1).unwrap();
        store2
            .record_settlement_outcome(2, false, Some("chain rejected".into()), None)
            .unwrap();
        assert_eq!(
            store2.get(2).unwrap().status,
            MessageStatus::SettlementFailed("chain rejected".into())
        );

        store2.arm_settlement(2, 1).unwrap();
        assert_eq!(store2.get(2).unwrap().status, MessageStatus::SettlementPending);
        store2
            .record_settlement_outcome(2, true, None, Some("tx3".into()))
            .unwrap();
        // settlement_failure is sticky: a later round succeeding doesn't erase
        // an earlier round's failure, so the message stays Failed with the
        // first reason.
        assert_eq!(
            store2.get(2).unwrap().status,
            MessageStatus::SettlementFailed("chain rejected".into())
        );
    }
}
