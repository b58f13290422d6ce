//! The thin submitter abstraction the outgoing processor submits through.
//! The real chain-RPC client (signing, nonce management, the Soroban/
//! Horizon wire format) is out of scope per spec.md §1 — this module
//! defines the seam and an HTTP-based stand-in, the same way the teacher's
//! `matching_engine_service::settlement::SettlementClient` stands in for a
//! call to a sibling service rather than embedding its logic.

use async_trait::async_trait;
use ledger::Asset;
use matching_engine::UserId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::error::ChainError;
use crate::queues::OutgoingIntent;

#[derive(Debug, Clone)]
pub struct ChainReceipt {
    pub tx_hash: String,
}

/// One submission attempt. Retry/backoff is owned entirely by the outgoing
/// processor (spec.md §4.5) — an implementation should not retry internally,
/// only classify the outcome as transient or terminal.
#[async_trait]
pub trait ChainSubmitter: Send + Sync {
    async fn submit(&self, intent: &OutgoingIntent) -> Result<ChainReceipt, ChainError>;
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind")]
enum SubmitRequest {
    Settle {
        buyer: String,
        seller: String,
        asset_sold: Asset,
        amount_sold: u64,
        asset_bought: Asset,
        amount_bought: u64,
        trade_id: u64,
    },
    Withdraw {
        user: String,
        asset: Asset,
        amount: u64,
    },
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
struct SubmitErrorResponse {
    error: String,
    retriable: bool,
}

fn hex_user(user: &UserId) -> String {
    user.iter().map(|b| format!("{b:02x}")).collect()
}

/// Calls the admin-authorized `settle`/`withdraw` entry points on the chain
/// contract via its RPC endpoint over HTTP.
pub struct HttpChainSubmitter {
    client: reqwest::Client,
    chain_rpc_url: String,
    orderbook_contract_id: String,
    admin_secret_key: String,
}

impl HttpChainSubmitter {
    pub fn new(chain_rpc_url: String, orderbook_contract_id: String, admin_secret_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build chain RPC http client");
        Self {
            client,
            chain_rpc_url,
            orderbook_contract_id,
            admin_secret_key,
        }
    }

    fn request_for(&self, intent: &OutgoingIntent) -> SubmitRequest {
        match intent {
            OutgoingIntent::Settle {
                buyer,
                seller,
                asset_sold,
                amount_sold,
                asset_bought,
                amount_bought,
                trade_id,
                ..
            } => SubmitRequest::Settle {
                buyer: hex_user(buyer),
                seller: hex_user(seller),
                asset_sold: *asset_sold,
                amount_sold: amount_sold.0,
                asset_bought: *asset_bought,
                amount_bought: amount_bought.0,
                trade_id: *trade_id,
            },
            OutgoingIntent::Withdraw { user, asset, amount, .. } => SubmitRequest::Withdraw {
                user: hex_user(user),
                asset: *asset,
                amount: amount.0,
            },
        }
    }
}

#[async_trait]
impl ChainSubmitter for HttpChainSubmitter {
    async fn submit(&self, intent: &OutgoingIntent) -> Result<ChainReceipt, ChainError> {
        let url = format!("{}/contracts/{}/submit", self.chain_rpc_url, self.orderbook_contract_id);
        let body = self.request_for(intent);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.admin_secret_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChainError::Transient(format!("network error: {e}")))?;

        if response.status().is_success() {
            let parsed: SubmitResponse = response
                .json()
                .await
                .map_err(|e| ChainError::Transient(format!("malformed success response: {e}")))?;
            return Ok(ChainReceipt { tx_hash: parsed.tx_hash });
        }

        let status = response.status();
        match response.json::<SubmitErrorResponse>().await {
            Ok(err) if err.retriable => {
                warn!(error = %err.error, "chain submission reported a transient failure");
                Err(ChainError::Transient(err.error))
            }
            Ok(err) => Err(ChainError::Terminal(err.error)),
            Err(_) => Err(ChainError::Terminal(format!("HTTP {status}"))),
        }
    }
}

/// A scripted submitter for tests: returns queued outcomes in order, and a
/// terminal failure once exhausted.
pub struct ScriptedSubmitter {
    outcomes: tokio::sync::Mutex<std::collections::VecDeque<Result<ChainReceipt, ChainError>>>,
}

impl ScriptedSubmitter {
    pub fn new(outcomes: Vec<Result<ChainReceipt, ChainError>>) -> Self {
        Self {
            outcomes: tokio::sync::Mutex::new(outcomes.into()),
        }
    }
}

#[async_trait]
impl ChainSubmitter for ScriptedSubmitter {
    async fn submit(&self, _intent: &OutgoingIntent) -> Result<ChainReceipt, ChainError> {
        let mut outcomes = self.outcomes.lock().await;
        outcomes
            .pop_front()
            .unwrap_or_else(|| Err(ChainError::Terminal("scripted submitter exhausted".into())))
    }
}
