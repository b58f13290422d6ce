//! The outgoing processor: drains `Settle`/`Withdraw` intents one at a time
//! and submits them on chain, retrying transient failures with bounded
//! exponential backoff. Grounded directly on
//! `matching_engine_service::settlement::SettlementClient::settle_fill`'s
//! attempt counter and `BASE_RETRY_DELAY_MS * 2^attempt` backoff, adapted
//! from a fixed attempt cap to the configurable one spec.md §6 calls for.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::chain::ChainSubmitter;
use crate::config::Config;
use crate::health::AgentHeartbeat;
use crate::queues::{CompensationSender, OutgoingIntent, OutgoingReceiver, SharedMessageStore, Compensation};
use crate::error::ChainError;

pub struct OutgoingProcessor {
    incoming: OutgoingReceiver,
    submitter: Arc<dyn ChainSubmitter>,
    messages: SharedMessageStore,
    compensation: CompensationSender,
    retry_max: u32,
    backoff_initial_ms: u64,
    backoff_cap_ms: u64,
    heartbeat: AgentHeartbeat,
}

impl OutgoingProcessor {
    pub fn new(
        incoming: OutgoingReceiver,
        submitter: Arc<dyn ChainSubmitter>,
        messages: SharedMessageStore,
        compensation: CompensationSender,
        config: &Config,
        heartbeat: AgentHeartbeat,
    ) -> Self {
        Self {
            incoming,
            submitter,
            messages,
            compensation,
            retry_max: config.outgoing_retry_max,
            backoff_initial_ms: config.outgoing_backoff_initial_ms,
            backoff_cap_ms: config.outgoing_backoff_cap_ms,
            heartbeat,
        }
    }

    /// Submits intents strictly sequentially — concurrent submission would
    /// complicate nonce/sequence management on chain (spec.md §5, §9).
    pub async fn run(mut self) {
        while let Some(intent) = self.incoming.recv().await {
            self.process(intent).await;
            self.heartbeat.mark();
        }
        info!("outgoing processor shutting down: queue closed");
    }

    async fn process(&mut self, intent: OutgoingIntent) {
        let message_id = intent.primary_message_id();
        let mut attempt: u32 = 0;
        let mut delay_ms = self.backoff_initial_ms;

        loop {
            match self.submitter.submit(&intent).await {
                Ok(receipt) => {
                    info!(message_id, tx_hash = %receipt.tx_hash, "chain submission confirmed");
                    self.resolve_all(&intent.message_ids(), true, None, Some(receipt.tx_hash)).await;
                    return;
                }
                Err(ChainError::Terminal(reason)) => {
                    error!(message_id, reason = %reason, "chain submission failed terminally");
                    self.handle_terminal_failure(&intent, reason).await;
                    return;
                }
                Err(ChainError::Transient(reason)) => {
                    attempt += 1;
                    if attempt > self.retry_max {
                        error!(message_id, reason = %reason, attempts = attempt, "chain submission exhausted retry budget");
                        self.handle_terminal_failure(&intent, reason).await;
                        return;
                    }
                    warn!(
                        message_id,
                        attempt,
                        retry_max = self.retry_max,
                        delay_ms,
                        reason = %reason,
                        "transient chain failure, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms * 2).min(self.backoff_cap_ms);
                }
            }
        }
    }

    async fn handle_terminal_failure(&mut self, intent: &OutgoingIntent, reason: String) {
        if let OutgoingIntent::Withdraw { user, asset, amount, .. } = intent {
            // Restore the user's `available` that `debit` removed at
            // acceptance time; the withdrawal never left the system.
            let sent = self
                .compensation
                .send(Compensation::CreditBack { user: *user, asset: *asset, amount: *amount })
                .await;
            if sent.is_err() {
                error!("compensation channel closed, cannot credit back failed withdrawal");
            }
        }
        // A terminal `Settle` failure leaves the off-chain ledger as-is; the
        // trade already happened from the venue's perspective (spec.md §4.5,
        // §9 open question — resolved in DESIGN.md as "retry out-of-band").
        self.resolve_all(&intent.message_ids(), false, Some(reason), None).await;
    }

    /// A `Settle` intent resolves two independent messages (taker and maker);
    /// a `Withdraw` resolves one. Applies the same outcome to each.
    async fn resolve_all(&mut self, message_ids: &[crate::message::MessageId], ok: bool, reason: Option<String>, tx_hash: Option<String>) {
        for &message_id in message_ids {
            self.resolve(message_id, ok, reason.clone(), tx_hash.clone()).await;
        }
    }

    async fn resolve(&mut self, message_id: crate::message::MessageId, ok: bool, reason: Option<String>, tx_hash: Option<String>) {
        let mut messages = self.messages.write().await;
        if let Err(e) = messages.record_settlement_outcome(message_id, ok, reason, tx_hash) {
            error!(message_id, error = %e, "internal invariant violation recording settlement outcome, halting");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainReceipt, ScriptedSubmitter};
    use crate::message::{Message, MessageKind, MessageStatus, MessageStore};
    use crate::queues::{Compensation, WithdrawalRequest};
    use ledger::Asset;
    use matching_engine::Amount;

    fn test_config() -> Config {
        Config {
            admin_secret_key: "k".into(),
            orderbook_contract_id: "c".into(),
            chain_rpc_url: "http://localhost".into(),
            timestamp_skew_window_seconds: 300,
            outgoing_retry_max: 2,
            outgoing_backoff_initial_ms: 1,
            outgoing_backoff_cap_ms: 2,
            ingestor_poll_interval_ms: 1,
            bind_addr: "0.0.0.0:0".into(),
        }
    }

    fn user(byte: u8) -> matching_engine::UserId {
        [byte; 32]
    }

    struct Harness {
        processor: OutgoingProcessor,
        messages: SharedMessageStore,
        compensation_rx: tokio::sync::mpsc::Receiver<Compensation>,
    }

    fn harness(outcomes: Vec<Result<ChainReceipt, ChainError>>) -> (Harness, tokio::sync::mpsc::Sender<OutgoingIntent>) {
        let messages: SharedMessageStore = Arc::new(tokio::sync::RwLock::new(MessageStore::default()));
        let (outgoing_tx, outgoing_rx) = tokio::sync::mpsc::channel(16);
        let (compensation_tx, compensation_rx) = tokio::sync::mpsc::channel(16);
        let submitter: Arc<dyn ChainSubmitter> = Arc::new(ScriptedSubmitter::new(outcomes));
        let processor = OutgoingProcessor::new(
            outgoing_rx,
            submitter,
            messages.clone(),
            compensation_tx,
            &test_config(),
            AgentHeartbeat::new(),
        );
        (Harness { processor, messages, compensation_rx }, outgoing_tx)
    }

    async fn register_withdrawal(messages: &SharedMessageStore, id: crate::message::MessageId) {
        let mut store = messages.write().await;
        let mut m = Message::new(id, MessageKind::Withdrawal);
        m.transition_to(MessageStatus::Accepted).unwrap();
        store.insert(m);
        store.arm_settlement(id, 1).unwrap();
    }

    #[tokio::test]
    async fn successful_settle_confirms_both_legs() {
        let (mut h, _outgoing_tx) = harness(vec![Ok(ChainReceipt { tx_hash: "tx1".into() })]);
        {
            let mut store = h.messages.write().await;
            for id in [1, 2] {
                let mut m = Message::new(id, MessageKind::Order);
                m.transition_to(MessageStatus::Accepted).unwrap();
                store.insert(m);
                store.arm_settlement(id, 1).unwrap();
            }
        }

        let intent = OutgoingIntent::Settle {
            taker_message_id: 1,
            maker_message_id: 2,
            buyer: user(1),
            seller: user(2),
            asset_sold: Asset::A,
            amount_sold: Amount(10),
            asset_bought: Asset::B,
            amount_bought: Amount(20),
            trade_id: 1,
        };
        h.processor.process(intent).await;

        for id in [1, 2] {
            let m = h.messages.read().await.get(id).unwrap();
            assert_eq!(m.status, MessageStatus::SettlementConfirmed);
            assert_eq!(m.tx_hash, Some("tx1".into()));
        }
        assert!(h.compensation_rx.try_recv().is_err(), "a successful settle never compensates");
    }

    #[tokio::test]
    async fn terminal_withdrawal_failure_credits_back_and_fails_message() {
        let (mut h, _outgoing_tx) = harness(vec![Err(ChainError::Terminal("contract reverted".into()))]);
        register_withdrawal(&h.messages, 7).await;

        let intent = OutgoingIntent::Withdraw { message_id: 7, user: user(9), asset: Asset::A, amount: Amount(500) };
        h.processor.process(intent).await;

        let m = h.messages.read().await.get(7).unwrap();
        assert_eq!(m.status, MessageStatus::SettlementFailed("contract reverted".into()));

        let compensation = h.compensation_rx.try_recv().expect("terminal withdrawal failure must credit back");
        match compensation {
            Compensation::CreditBack { user: u, asset, amount } => {
                assert_eq!(u, user(9));
                assert_eq!(asset, Asset::A);
                assert_eq!(amount, Amount(500));
            }
        }
    }

    #[tokio::test]
    async fn transient_failures_retry_then_become_terminal_after_budget_exhausted() {
        // retry_max is 2, so three transient failures in a row exhaust the
        // budget without ever reaching a queued success.
        let (mut h, _outgoing_tx) = harness(vec![
            Err(ChainError::Transient("rpc timeout".into())),
            Err(ChainError::Transient("rpc timeout".into())),
            Err(ChainError::Transient("rpc timeout".into())),
        ]);
        register_withdrawal(&h.messages, 3).await;

        let intent = OutgoingIntent::Withdraw { message_id: 3, user: user(4), asset: Asset::B, amount: Amount(10) };
        h.processor.process(intent).await;

        let m = h.messages.read().await.get(3).unwrap();
        assert_eq!(m.status, MessageStatus::SettlementFailed("rpc timeout".into()));
        h.compensation_rx.try_recv().expect("exhausted retries on a withdrawal still credit back");
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_retry() {
        let (mut h, _outgoing_tx) = harness(vec![
            Err(ChainError::Transient("rpc timeout".into())),
            Ok(ChainReceipt { tx_hash: "tx2".into() }),
        ]);
        register_withdrawal(&h.messages, 5).await;

        let intent = OutgoingIntent::Withdraw { message_id: 5, user: user(6), asset: Asset::A, amount: Amount(1) };
        h.processor.process(intent).await;

        let m = h.messages.read().await.get(5).unwrap();
        assert_eq!(m.status, MessageStatus::SettlementConfirmed);
        assert!(h.compensation_rx.try_recv().is_err());
    }
}
