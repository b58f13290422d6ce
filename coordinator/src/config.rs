//! Process configuration, loaded from the environment via `dotenvy` the way
//! `accounts`'s startup reads `DATABASE_URL`/`JWT_SECRET` — required fields
//! fail fast at boot, defaulted fields fall back silently.

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_secret_key: String,
    pub orderbook_contract_id: String,
    pub chain_rpc_url: String,
    pub timestamp_skew_window_seconds: u64,
    pub outgoing_retry_max: u32,
    pub outgoing_backoff_initial_ms: u64,
    pub outgoing_backoff_cap_ms: u64,
    pub ingestor_poll_interval_ms: u64,
    pub bind_addr: String,
}

impl Config {
    /// Loads `.env` if present, then reads from the process environment.
    /// Required fields that are missing produce an error string naming the
    /// variable; callers should treat that as fatal at startup.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let required = |key: &str| -> anyhow::Result<String> {
            std::env::var(key).map_err(|_| anyhow::anyhow!("missing required env var {key}"))
        };
        let default_u64 = |key: &str, default: u64| -> u64 {
            std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        };
        let default_u32 = |key: &str, default: u32| -> u32 {
            std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        };

        Ok(Self {
            admin_secret_key: required("ADMIN_SECRET_KEY")?,
            orderbook_contract_id: required("ORDERBOOK_CONTRACT_ID")?,
            chain_rpc_url: required("CHAIN_RPC_URL")?,
            timestamp_skew_window_seconds: default_u64("TIMESTAMP_SKEW_WINDOW_SECONDS", 300),
            outgoing_retry_max: default_u32("OUTGOING_RETRY_MAX", 5),
            outgoing_backoff_initial_ms: default_u64("OUTGOING_BACKOFF_INITIAL_MS", 250),
            outgoing_backoff_cap_ms: default_u64("OUTGOING_BACKOFF_CAP_MS", 10_000),
            ingestor_poll_interval_ms: default_u64("INGESTOR_POLL_INTERVAL_MS", 2_000),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
        })
    }
}
