//! The single-consumer serializer: the sole mutator of the ledger, order
//! book, and pre-settlement portion of the message store (spec.md §4.4,
//! §5). Grounded on the teacher's single task owning `Arc<RwLock<OrderBook>>`
//! in `matching_engine_service/src/main.rs`, simplified to sole ownership —
//! with exactly one consumer there is nothing left for a lock to arbitrate.

use ledger::{Asset, LedgerError, UserStore};
use matching_engine::{Order, OrderBook, OrderStatus, Price, Side, Trade};
use tracing::{error, info, warn};

use crate::health::AgentHeartbeat;
use crate::message::{Message, MessageId, MessageKind, MessageStatus};
use crate::queues::{
    CancelRequest, Compensation, CompensationReceiver, DepositEvent, IncomingReceiver, Inbound,
    OrderRequest, OutgoingIntent, OutgoingSender, SharedMessageStore, WithdrawalRequest,
};

pub struct Executor {
    book: OrderBook,
    ledger: UserStore,
    messages: SharedMessageStore,
    incoming: IncomingReceiver,
    outgoing: OutgoingSender,
    compensation: CompensationReceiver,
    seen_deposits: std::collections::HashSet<(String, u32)>,
    /// Maps a still-resting order back to the message that submitted it, so
    /// a later taker filling against it can arm that maker's own message's
    /// settlement tracking too (spec.md §4.7) — not just the taker's.
    /// Entries are removed when the order leaves the book (filled or
    /// cancelled), so this never outlives the order it tracks.
    order_messages: std::collections::HashMap<matching_engine::OrderId, MessageId>,
    heartbeat: AgentHeartbeat,
}

impl Executor {
    pub fn new(
        messages: SharedMessageStore,
        incoming: IncomingReceiver,
        outgoing: OutgoingSender,
        compensation: CompensationReceiver,
        heartbeat: AgentHeartbeat,
    ) -> Self {
        Self {
            book: OrderBook::new(),
            ledger: UserStore::new(),
            messages,
            incoming,
            outgoing,
            compensation,
            seen_deposits: std::collections::HashSet::new(),
            order_messages: std::collections::HashMap::new(),
            heartbeat,
        }
    }

    /// Drains the incoming queue and the compensation channel forever. Never
    /// suspends on I/O — the only awaits are on channel recv and the
    /// message-store lock, both CPU-bound in practice.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                Some(compensation) = self.compensation.recv() => {
                    self.apply_compensation(compensation).await;
                    self.heartbeat.mark();
                }
                Some((message_id, inbound)) = self.incoming.recv() => {
                    self.dispatch(message_id, inbound).await;
                    self.heartbeat.mark();
                }
                else => {
                    info!("executor shutting down: all channels closed");
                    return;
                }
            }
        }
    }

    async fn dispatch(&mut self, message_id: MessageId, inbound: Inbound) {
        match inbound {
            Inbound::Order(req) => self.handle_order(message_id, req).await,
            Inbound::Cancel(req) => self.handle_cancel(message_id, req).await,
            Inbound::Withdrawal(req) => self.handle_withdrawal(message_id, req).await,
            Inbound::Deposit(evt) => self.handle_deposit(message_id, evt).await,
        }
    }

    async fn apply_compensation(&mut self, compensation: Compensation) {
        let Compensation::CreditBack { user, asset, amount } = compensation;
        if let Err(e) = self.ledger.credit(user, asset, amount) {
            self.fatal(format!("compensation credit failed: {e}"));
        }
    }

    async fn reject(&mut self, message_id: MessageId, reason: String) {
        let mut messages = self.messages.write().await;
        if let Err(e) = messages.transition(message_id, MessageStatus::Rejected(reason)) {
            self.fatal(e.to_string());
        }
    }

    async fn transition(&mut self, message_id: MessageId, status: MessageStatus) {
        let mut messages = self.messages.write().await;
        if let Err(e) = messages.transition(message_id, status) {
            self.fatal(e.to_string());
        }
    }

    /// Halts the process. Callers may hold a `MessageStore` write guard at
    /// the call site — that's fine, the guard's lock is process-local and
    /// dies with the process anyway.
    fn fatal(&self, reason: String) {
        error!(reason = %reason, "internal invariant violation, halting executor");
        std::process::exit(1);
    }

    // ---- 4.4.1 deposit handler ----------------------------------------

    async fn handle_deposit(&mut self, message_id: MessageId, evt: DepositEvent) {
        let key = (evt.tx_hash.clone(), evt.event_index);
        if self.seen_deposits.contains(&key) {
            // Redelivery of an already-credited event: idempotent no-op.
            self.transition(message_id, MessageStatus::SettlementConfirmed).await;
            return;
        }
        self.seen_deposits.insert(key);
        if let Err(e) = self.ledger.credit(evt.user, evt.asset, evt.amount) {
            self.fatal(format!("deposit credit failed: {e}"));
            return;
        }
        // Deposits are terminal at credit (spec.md §4.4.1); no chain action follows.
        self.transition(message_id, MessageStatus::SettlementConfirmed).await;
    }

    // ---- 4.4.2 order handler -------------------------------------------

    async fn handle_order(&mut self, message_id: MessageId, req: OrderRequest) {
        if req.price.0 == 0 || req.quantity.is_zero() {
            self.reject(message_id, "price and quantity must be positive".into()).await;
            return;
        }

        let (reserve_asset, reserve_amount) = match req.side {
            Side::Buy => match req.price.notional(req.quantity) {
                Some(amount) => (Asset::B, amount),
                None => {
                    self.reject(message_id, "notional overflow".into()).await;
                    return;
                }
            },
            Side::Sell => (Asset::A, req.quantity),
        };

        if let Err(e) = self.ledger.reserve(req.user, reserve_asset, reserve_amount) {
            match e {
                LedgerError::InsufficientAvailable => {
                    self.reject(message_id, "insufficient available balance".into()).await;
                }
                LedgerError::UnderflowBug(reason) => self.fatal(reason.to_string()),
            }
            return;
        }

        let (order_id, seq) = self.book.next_ids();
        let mut order = Order {
            order_id,
            user: req.user,
            side: req.side,
            price: req.price,
            original_quantity: req.quantity,
            remaining_quantity: req.quantity,
            created_seq: seq,
            status: OrderStatus::Open,
        };

        {
            let mut messages = self.messages.write().await;
            if let Err(e) = messages.transition(message_id, MessageStatus::Accepted) {
                self.fatal(e.to_string());
            }
            messages.set_order_id(message_id, order_id);
        }

        // Snapshot resting makers' (original, remaining) quantities *before*
        // matching touches them. A Buy-side maker's own reservation was one
        // lump sum at its own price over its original quantity; consuming it
        // fill-by-fill via a plain `price.notional(fill)` would let floor
        // rounding leak a few wei of permanently-stuck liability across the
        // maker's lifetime. Telescoping against this snapshot instead makes
        // each maker's cumulative consumption collapse to exactly
        // `notional(total filled so far)`, so nothing is left over once it's
        // fully filled (spec.md §4.3's "leftover fractional wei ... released
        // back on full fill", generalized to the resting side too).
        let maker_snapshot: std::collections::HashMap<matching_engine::OrderId, (matching_engine::Amount, matching_engine::Amount)> =
            if req.side == Side::Sell {
                self.book
                    .matchable(Side::Buy, req.price)
                    .map(|o| (o.order_id, (o.original_quantity, o.remaining_quantity)))
                    .collect()
            } else {
                std::collections::HashMap::new()
            };

        let trades = self.book.match_incoming(&mut order);
        order.status = if trades.is_empty() {
            OrderStatus::Open
        } else if order.remaining_quantity.is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };

        // Running cumulative fill for the incoming order's own telescoping,
        // used only when the incoming side is Buy (see `settle_trade`).
        let mut incoming_filled_so_far = matching_engine::Amount::ZERO;

        let mut intents: Vec<OutgoingIntent> = Vec::with_capacity(trades.len());
        // Every distinct maker message touched this sweep, in trade order,
        // so each can be armed for one more settlement outcome below.
        let mut maker_messages: Vec<MessageId> = Vec::with_capacity(trades.len());

        for trade in &trades {
            let maker_snapshot_entry = maker_snapshot.get(&trade.maker_order_id).copied();
            let maker_notional = match self.settle_trade(
                order.side,
                req.price,
                &mut incoming_filled_so_far,
                maker_snapshot_entry,
                trade,
            ) {
                Ok(notional) => notional,
                Err(reason) => {
                    self.fatal(reason);
                    return;
                }
            };

            let maker_message_id = match self.order_messages.get(&trade.maker_order_id).copied() {
                Some(id) => id,
                None => {
                    self.fatal("matched maker order missing message mapping".into());
                    return;
                }
            };
            // The maker left the book (fully filled) exactly when match_incoming
            // removed it from the order arena; drop its mapping the same moment.
            if self.book.get(trade.maker_order_id).is_none() {
                self.order_messages.remove(&trade.maker_order_id);
            }

            {
                let mut messages = self.messages.write().await;
                messages.push_trade(message_id, trade.trade_id);
                messages.push_trade(maker_message_id, trade.trade_id);
            }
            maker_messages.push(maker_message_id);

            intents.push(OutgoingIntent::Settle {
                taker_message_id: message_id,
                maker_message_id,
                buyer: trade.buyer,
                seller: trade.seller,
                asset_sold: Asset::A,
                amount_sold: trade.quantity,
                asset_bought: Asset::B,
                amount_bought: maker_notional,
                trade_id: trade.trade_id,
            });
        }

        if !trades.is_empty() {
            {
                let mut messages = self.messages.write().await;
                if let Err(e) = messages.arm_settlement(message_id, trades.len()) {
                    self.fatal(e.to_string());
                    return;
                }
                for maker_message_id in &maker_messages {
                    if let Err(e) = messages.arm_settlement(*maker_message_id, 1) {
                        self.fatal(e.to_string());
                        return;
                    }
                }
            }

            for intent in intents {
                if self.outgoing.send(intent).await.is_err() {
                    warn!(message_id, "outgoing queue closed while enqueueing settle intent");
                }
            }
        }

        if !order.remaining_quantity.is_zero() {
            self.order_messages.insert(order.order_id, message_id);
            self.book.insert(order);
        }
    }

    /// Applies the ledger deltas for one trade. The maker always trades at
    /// their own quoted price; the Buy-side leg of the trade (whichever
    /// party that is) reserved B as one lump sum at its *own* price over its
    /// *original* quantity, so its per-fill consumption must telescope
    /// against that lump sum rather than recompute `price.notional(fill)`
    /// independently each time — otherwise floor rounding can strand a few
    /// wei of liability that's never released (spec.md §4.3, §4.4.2 step 5).
    ///
    /// `incoming_filled_so_far` tracks the incoming order's own cumulative
    /// fill across this single `handle_order` call (used when the incoming
    /// side is Buy). `maker_snapshot` is the resting maker's
    /// `(original_quantity, remaining_quantity)` as it stood immediately
    /// before matching started (used when the incoming side is Sell, i.e.
    /// the maker is the Buy leg).
    ///
    /// Returns the trade's B-side notional (`maker_notional` below) so the
    /// caller can reuse it for the `Settle` intent's `amount_bought` instead
    /// of recomputing `trade.price.notional(trade.quantity)` a second time.
    fn settle_trade(
        &mut self,
        incoming_side: Side,
        incoming_price: Price,
        incoming_filled_so_far: &mut matching_engine::Amount,
        maker_snapshot: Option<(matching_engine::Amount, matching_engine::Amount)>,
        trade: &Trade,
    ) -> Result<matching_engine::Amount, String> {
        let maker_notional = trade
            .price
            .notional(trade.quantity)
            .ok_or_else(|| "maker notional overflow".to_string())?;

        match incoming_side {
            Side::Buy => {
                let before = incoming_price
                    .notional(*incoming_filled_so_far)
                    .ok_or_else(|| "taker reservation notional overflow".to_string())?;
                *incoming_filled_so_far = incoming_filled_so_far
                    .checked_add(trade.quantity)
                    .ok_or_else(|| "filled quantity overflow".to_string())?;
                let after = incoming_price
                    .notional(*incoming_filled_so_far)
                    .ok_or_else(|| "taker reservation notional overflow".to_string())?;
                let reserved_for_fill = after
                    .checked_sub(before)
                    .ok_or_else(|| "taker reservation telescoping went negative".to_string())?;
                let excess = reserved_for_fill
                    .checked_sub(maker_notional)
                    .ok_or_else(|| "maker price improved past taker's own reservation".to_string())?;

                self.ledger.consume(trade.buyer, Asset::B, maker_notional).map_err(|e| e.to_string())?;
                if !excess.is_zero() {
                    self.ledger.release(trade.buyer, Asset::B, excess).map_err(|e| e.to_string())?;
                }
                self.ledger.credit(trade.buyer, Asset::A, trade.quantity).map_err(|e| e.to_string())?;

                self.ledger.consume(trade.seller, Asset::A, trade.quantity).map_err(|e| e.to_string())?;
                self.ledger.credit(trade.seller, Asset::B, maker_notional).map_err(|e| e.to_string())?;
            }
            Side::Sell => {
                self.ledger.consume(trade.seller, Asset::A, trade.quantity).map_err(|e| e.to_string())?;
                self.ledger.credit(trade.seller, Asset::B, maker_notional).map_err(|e| e.to_string())?;

                // The maker is the Buy leg here: telescope its consumption
                // against its own original reservation the same way.
                let (original, remaining_before) = maker_snapshot
                    .ok_or_else(|| "missing maker snapshot for resting buy order".to_string())?;
                let filled_before = original
                    .checked_sub(remaining_before)
                    .ok_or_else(|| "maker remaining exceeds original".to_string())?;
                let filled_after = filled_before
                    .checked_add(trade.quantity)
                    .ok_or_else(|| "maker filled quantity overflow".to_string())?;
                let before = trade
                    .price
                    .notional(filled_before)
                    .ok_or_else(|| "maker reservation notional overflow".to_string())?;
                let after = trade
                    .price
                    .notional(filled_after)
                    .ok_or_else(|| "maker reservation notional overflow".to_string())?;
                let maker_consumed = after
                    .checked_sub(before)
                    .ok_or_else(|| "maker reservation telescoping went negative".to_string())?;

                self.ledger.consume(trade.buyer, Asset::B, maker_consumed).map_err(|e| e.to_string())?;
                self.ledger.credit(trade.buyer, Asset::A, trade.quantity).map_err(|e| e.to_string())?;
            }
        }
        Ok(maker_notional)
    }

    // ---- 4.4.3 cancel handler -------------------------------------------

    async fn handle_cancel(&mut self, message_id: MessageId, req: CancelRequest) {
        let Some(order) = self.book.get(req.order_id).cloned() else {
            self.reject(message_id, "order not found".into()).await;
            return;
        };
        if order.user != req.user {
            self.reject(message_id, "order not owned by requester".into()).await;
            return;
        }

        // For a Buy order the remaining liability is `notional(original) -
        // notional(filled)`, not `notional(remaining)` — the two only
        // coincide when floor rounding hasn't split the fills (see
        // `settle_trade`'s telescoping comment). Using the former keeps a
        // partially-filled-then-cancelled order's release exact down to the
        // wei.
        let (asset, amount) = match order.side {
            Side::Buy => {
                let filled = match order.original_quantity.checked_sub(order.remaining_quantity) {
                    Some(f) => f,
                    None => {
                        self.fatal("cancel: filled quantity underflow".into());
                        return;
                    }
                };
                let total_reserved = match order.price.notional(order.original_quantity) {
                    Some(n) => n,
                    None => {
                        self.fatal("cancel: reserved notional overflow".into());
                        return;
                    }
                };
                let consumed = match order.price.notional(filled) {
                    Some(n) => n,
                    None => {
                        self.fatal("cancel: consumed notional overflow".into());
                        return;
                    }
                };
                match total_reserved.checked_sub(consumed) {
                    Some(amount) => (Asset::B, amount),
                    None => {
                        self.fatal("cancel: reserved-minus-consumed underflow".into());
                        return;
                    }
                }
            }
            Side::Sell => (Asset::A, order.remaining_quantity),
        };

        if let Err(e) = self.ledger.release(order.user, asset, amount) {
            self.fatal(format!("cancel release failed: {e}"));
            return;
        }
        self.book.remove(req.order_id);
        self.order_messages.remove(&req.order_id);
        // Cancels never touch chain; resolved immediately (spec.md §4.4.3).
        self.transition(message_id, MessageStatus::SettlementConfirmed).await;
    }

    // ---- 4.4.4 withdrawal handler ---------------------------------------

    async fn handle_withdrawal(&mut self, message_id: MessageId, req: WithdrawalRequest) {
        if req.amount.is_zero() {
            self.reject(message_id, "withdrawal amount must be positive".into()).await;
            return;
        }
        match self.ledger.debit(req.user, req.asset, req.amount) {
            Ok(()) => {
                {
                    let mut messages = self.messages.write().await;
                    if let Err(e) = messages.transition(message_id, MessageStatus::Accepted) {
                        self.fatal(e.to_string());
                        return;
                    }
                    if let Err(e) = messages.arm_settlement(message_id, 1) {
                        self.fatal(e.to_string());
                        return;
                    }
                }
                let intent = OutgoingIntent::Withdraw {
                    message_id,
                    user: req.user,
                    asset: req.asset,
                    amount: req.amount,
                };
                if self.outgoing.send(intent).await.is_err() {
                    warn!(message_id, "outgoing queue closed while enqueueing withdraw intent");
                }
            }
            Err(LedgerError::InsufficientAvailable) => {
                self.reject(message_id, "insufficient available balance".into()).await;
            }
            Err(LedgerError::UnderflowBug(reason)) => self.fatal(reason.to_string()),
        }
    }
}

/// Convenience for constructing a `Message` the API boundary inserts before
/// enqueueing a request, so a status query never races an unprocessed
/// message (spec.md §4.7).
pub fn received_message(message_id: MessageId, kind: MessageKind) -> Message {
    Message::new(message_id, kind)
}

/// End-to-end scenarios from spec.md §8, exercised directly against the
/// handlers rather than through a spawned `run()` loop — the ledger and book
/// are private fields of `Executor`, and this test module is a descendant of
/// its defining module, so it can reach in the same way a teacher's unit
/// tests reach into its own service state.
#[cfg(test)]
mod scenario_tests {
    use super::*;
    use matching_engine::{Amount, Price, SCALE};
    use std::sync::Arc;

    fn user(byte: u8) -> matching_engine::UserId {
        [byte; 32]
    }

    fn harness() -> (Executor, SharedMessageStore, tokio::sync::mpsc::Receiver<OutgoingIntent>) {
        let messages: SharedMessageStore = Arc::new(tokio::sync::RwLock::new(crate::message::MessageStore::default()));
        let (_incoming_tx, incoming_rx) = tokio::sync::mpsc::channel(16);
        let (outgoing_tx, outgoing_rx) = tokio::sync::mpsc::channel(16);
        let (_compensation_tx, compensation_rx) = tokio::sync::mpsc::channel(16);
        let executor = Executor::new(messages.clone(), incoming_rx, outgoing_tx, compensation_rx, AgentHeartbeat::new());
        (executor, messages, outgoing_rx)
    }

    async fn register(messages: &SharedMessageStore, id: MessageId, kind: MessageKind) {
        messages.write().await.insert(received_message(id, kind));
    }

    async fn deposit(ex: &mut Executor, messages: &SharedMessageStore, id: MessageId, who: matching_engine::UserId, asset: Asset, amount: Amount) {
        register(messages, id, MessageKind::Deposit).await;
        ex.handle_deposit(
            id,
            DepositEvent {
                tx_hash: format!("tx{id}"),
                event_index: 0,
                user: who,
                asset,
                amount,
                ledger_seq: id,
            },
        )
        .await;
    }

    #[tokio::test]
    async fn scenario_1_simple_match() {
        let (mut ex, messages, mut outgoing_rx) = harness();
        let (u1, u2) = (user(1), user(2));

        deposit(&mut ex, &messages, 1, u1, Asset::A, Amount(100 * SCALE)).await;
        deposit(&mut ex, &messages, 2, u2, Asset::B, Amount(300 * SCALE)).await;

        register(&messages, 3, MessageKind::Order).await;
        ex.handle_order(3, OrderRequest { user: u1, side: Side::Sell, price: Price(2 * SCALE), quantity: Amount(100 * SCALE) }).await;

        register(&messages, 4, MessageKind::Order).await;
        ex.handle_order(4, OrderRequest { user: u2, side: Side::Buy, price: Price(2 * SCALE + SCALE / 2), quantity: Amount(100 * SCALE) }).await;

        assert_eq!(ex.ledger.balance(u1, Asset::B).available, Amount(200 * SCALE));
        assert_eq!(ex.ledger.balance(u1, Asset::A).available, Amount::ZERO);
        assert_eq!(ex.ledger.balance(u2, Asset::A).available, Amount(100 * SCALE));
        assert_eq!(ex.ledger.balance(u2, Asset::B).available, Amount(100 * SCALE));

        let intent = outgoing_rx.try_recv().expect("one settle intent");
        match intent {
            OutgoingIntent::Settle { taker_message_id, maker_message_id, trade_id, .. } => {
                assert_eq!(taker_message_id, 4);
                assert_eq!(maker_message_id, 3);
                assert_eq!(trade_id, 1);
            }
            other => panic!("expected Settle intent, got {other:?}"),
        }
        assert!(outgoing_rx.try_recv().is_err(), "exactly one settle intent should be emitted");

        let maker_msg = messages.read().await.get(3).unwrap();
        assert_eq!(maker_msg.status, MessageStatus::SettlementPending);
        assert_eq!(maker_msg.trade_ids, vec![1]);
        let taker_msg = messages.read().await.get(4).unwrap();
        assert_eq!(taker_msg.status, MessageStatus::SettlementPending);
        assert_eq!(taker_msg.trade_ids, vec![1]);
    }

    #[tokio::test]
    async fn scenario_2_partial_fill_then_rest() {
        let (mut ex, messages, _outgoing_rx) = harness();
        let (u1, u2) = (user(1), user(2));

        deposit(&mut ex, &messages, 1, u1, Asset::A, Amount(100 * SCALE)).await;
        deposit(&mut ex, &messages, 2, u2, Asset::B, Amount(80 * SCALE)).await;

        register(&messages, 3, MessageKind::Order).await;
        ex.handle_order(3, OrderRequest { user: u1, side: Side::Sell, price: Price(2 * SCALE), quantity: Amount(100 * SCALE) }).await;
        let maker_order_id = messages.read().await.get(3).unwrap().order_id.unwrap();

        register(&messages, 4, MessageKind::Order).await;
        ex.handle_order(4, OrderRequest { user: u2, side: Side::Buy, price: Price(2 * SCALE), quantity: Amount(40 * SCALE) }).await;
        let taker_order_id = messages.read().await.get(4).unwrap().order_id.unwrap();

        let maker = ex.book.get(maker_order_id).expect("maker still resting");
        assert_eq!(maker.remaining_quantity, Amount(60 * SCALE));
        assert_eq!(maker.status, OrderStatus::PartiallyFilled);

        assert!(ex.book.get(taker_order_id).is_none(), "fully-filled taker never rests");

        let taker_msg = messages.read().await.get(4).unwrap();
        assert_eq!(taker_msg.status, MessageStatus::SettlementPending);
        assert!(!taker_msg.trade_ids.is_empty(), "taker's trade should be recorded");
    }

    #[tokio::test]
    async fn scenario_3_cancel_releases_liability() {
        let (mut ex, messages, _outgoing_rx) = harness();
        let u1 = user(1);

        deposit(&mut ex, &messages, 1, u1, Asset::A, Amount(50 * SCALE)).await;

        register(&messages, 2, MessageKind::Order).await;
        ex.handle_order(2, OrderRequest { user: u1, side: Side::Sell, price: Price(3 * SCALE), quantity: Amount(50 * SCALE) }).await;
        assert_eq!(ex.ledger.balance(u1, Asset::A).liabilities, Amount(50 * SCALE));
        let order_id = messages.read().await.get(2).unwrap().order_id.unwrap();

        register(&messages, 3, MessageKind::Cancel).await;
        ex.handle_cancel(3, CancelRequest { user: u1, order_id }).await;

        assert_eq!(ex.ledger.balance(u1, Asset::A).liabilities, Amount::ZERO);
        assert!(ex.book.get(order_id).is_none());
        let cancel_msg = messages.read().await.get(3).unwrap();
        assert_eq!(cancel_msg.status, MessageStatus::SettlementConfirmed);
    }

    #[tokio::test]
    async fn scenario_4_insufficient_funds_rejected() {
        let (mut ex, messages, _outgoing_rx) = harness();
        let u3 = user(3);

        register(&messages, 1, MessageKind::Order).await;
        ex.handle_order(1, OrderRequest { user: u3, side: Side::Buy, price: Price(SCALE), quantity: Amount(SCALE) }).await;

        let msg = messages.read().await.get(1).unwrap();
        assert!(matches!(msg.status, MessageStatus::Rejected(_)));
        assert!(msg.order_id.is_none());
        assert!(ex.book.best(Side::Buy).is_none());
    }

    #[tokio::test]
    async fn scenario_5_deposit_deduplication() {
        let (mut ex, messages, _outgoing_rx) = harness();
        let u1 = user(1);
        let evt = DepositEvent { tx_hash: "h".into(), event_index: 0, user: u1, asset: Asset::A, amount: Amount(10 * SCALE), ledger_seq: 1 };

        register(&messages, 1, MessageKind::Deposit).await;
        ex.handle_deposit(1, evt.clone()).await;
        register(&messages, 2, MessageKind::Deposit).await;
        ex.handle_deposit(2, evt).await;

        assert_eq!(ex.ledger.balance(u1, Asset::A).available, Amount(10 * SCALE));
        let redelivered = messages.read().await.get(2).unwrap();
        assert_eq!(redelivered.status, MessageStatus::SettlementConfirmed);
    }

    #[tokio::test]
    async fn maker_message_arms_again_for_a_second_taker() {
        // U1 rests a sell for 100; two separate buyers each take 40, so U1's
        // *original* order-submission message must see both trades and only
        // resolve once both settlement outcomes land (spec.md §4.7).
        let (mut ex, messages, mut outgoing_rx) = harness();
        let (u1, u2, u3) = (user(1), user(2), user(3));

        deposit(&mut ex, &messages, 1, u1, Asset::A, Amount(100 * SCALE)).await;
        deposit(&mut ex, &messages, 2, u2, Asset::B, Amount(80 * SCALE)).await;
        deposit(&mut ex, &messages, 3, u3, Asset::B, Amount(80 * SCALE)).await;

        register(&messages, 4, MessageKind::Order).await;
        ex.handle_order(4, OrderRequest { user: u1, side: Side::Sell, price: Price(2 * SCALE), quantity: Amount(100 * SCALE) }).await;

        register(&messages, 5, MessageKind::Order).await;
        ex.handle_order(5, OrderRequest { user: u2, side: Side::Buy, price: Price(2 * SCALE), quantity: Amount(40 * SCALE) }).await;
        register(&messages, 6, MessageKind::Order).await;
        ex.handle_order(6, OrderRequest { user: u3, side: Side::Buy, price: Price(2 * SCALE), quantity: Amount(40 * SCALE) }).await;

        let maker_msg = messages.read().await.get(4).unwrap();
        assert_eq!(maker_msg.status, MessageStatus::SettlementPending);
        assert_eq!(maker_msg.trade_ids, vec![1, 2]);

        // Both trades resolving independently should only confirm once both land.
        let first = outgoing_rx.try_recv().unwrap();
        let second = outgoing_rx.try_recv().unwrap();
        assert_eq!(first.message_ids(), vec![5, 4]);
        assert_eq!(second.message_ids(), vec![6, 4]);
    }

    #[tokio::test]
    async fn resting_maker_resolved_before_second_taker_fires_does_not_halt() {
        // Same setup as above, but the first round's settlement resolves
        // fully — maker message 4 reaching SettlementConfirmed — before the
        // second taker's fill ever arms it again. The executor and processor
        // are independent concurrent tasks, so this ordering is entirely
        // plausible. Before the fix this hit the disallowed
        // (SettlementConfirmed, SettlementPending) transition and called
        // `fatal`, which exits the process; this test would kill the whole
        // test binary if the bug were still present.
        let (mut ex, messages, mut outgoing_rx) = harness();
        let (u1, u2, u3) = (user(1), user(2), user(3));

        deposit(&mut ex, &messages, 1, u1, Asset::A, Amount(100 * SCALE)).await;
        deposit(&mut ex, &messages, 2, u2, Asset::B, Amount(80 * SCALE)).await;
        deposit(&mut ex, &messages, 3, u3, Asset::B, Amount(80 * SCALE)).await;

        register(&messages, 4, MessageKind::Order).await;
        ex.handle_order(4, OrderRequest { user: u1, side: Side::Sell, price: Price(2 * SCALE), quantity: Amount(100 * SCALE) }).await;

        register(&messages, 5, MessageKind::Order).await;
        ex.handle_order(5, OrderRequest { user: u2, side: Side::Buy, price: Price(2 * SCALE), quantity: Amount(40 * SCALE) }).await;

        let first = outgoing_rx.try_recv().expect("first round's settle intent");
        assert_eq!(first.message_ids(), vec![5, 4]);

        // Fully resolve round 1 — both the taker and the resting maker's
        // message reach a terminal settlement status — before round 2 fires.
        {
            let mut store = messages.write().await;
            store.record_settlement_outcome(5, true, None, Some("tx1".into())).unwrap();
            store.record_settlement_outcome(4, true, None, Some("tx1".into())).unwrap();
        }
        assert_eq!(messages.read().await.get(4).unwrap().status, MessageStatus::SettlementConfirmed);
        assert_eq!(messages.read().await.get(5).unwrap().status, MessageStatus::SettlementConfirmed);

        register(&messages, 6, MessageKind::Order).await;
        ex.handle_order(6, OrderRequest { user: u3, side: Side::Buy, price: Price(2 * SCALE), quantity: Amount(40 * SCALE) }).await;

        // Round 2 re-arms message 4 off its resolved state instead of fataling.
        let maker_msg = messages.read().await.get(4).unwrap();
        assert_eq!(maker_msg.status, MessageStatus::SettlementPending);
        assert_eq!(maker_msg.trade_ids, vec![1, 2]);

        let second = outgoing_rx.try_recv().expect("second round's settle intent");
        assert_eq!(second.message_ids(), vec![6, 4]);

        messages.write().await.record_settlement_outcome(6, true, None, Some("tx2".into())).unwrap();
        messages.write().await.record_settlement_outcome(4, true, None, Some("tx2".into())).unwrap();
        assert_eq!(messages.read().await.get(4).unwrap().status, MessageStatus::SettlementConfirmed);
    }
}
