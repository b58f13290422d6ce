use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use tower_http::cors::{Any, CorsLayer};

use coordinator::chain::HttpChainSubmitter;
use coordinator::config::Config;
use coordinator::health::HealthReport;
use coordinator::ingestor::{DepositIngestor, FixedEventSource};
use coordinator::processor::OutgoingProcessor;
use coordinator::Coordinator;

const CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "coordinator=info".into()),
        )
        .init();

    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        tracing::error!("PANIC: {panic_info}\nBacktrace:\n{backtrace}");
        std::process::exit(1);
    }));

    let config = Config::from_env()?;
    tracing::info!(chain_rpc_url = %config.chain_rpc_url, "starting dark pool coordinator");

    let system = coordinator::build(CHANNEL_CAPACITY);

    let submitter = Arc::new(HttpChainSubmitter::new(
        config.chain_rpc_url.clone(),
        config.orderbook_contract_id.clone(),
        config.admin_secret_key.clone(),
    ));

    let processor = OutgoingProcessor::new(
        system.outgoing_rx,
        submitter,
        system.messages.clone(),
        system.compensation_tx.clone(),
        &config,
        system.health.processor.clone(),
    );

    // The real chain-event source is out of scope (spec.md §1); this stands
    // in until a production deployment supplies a `DepositEventSource` that
    // actually polls the contract. See DESIGN.md.
    let event_source = Arc::new(FixedEventSource::new(Vec::new()));
    let ingestor = DepositIngestor::new(
        event_source,
        system.coordinator.incoming_sender(),
        system.messages.clone(),
        &config,
        system.health.ingestor.clone(),
    );

    tokio::spawn(system.executor.run());
    tokio::spawn(processor.run());
    tokio::spawn(ingestor.run());

    let app_state = AppState { coordinator: system.coordinator, health: system.health };
    let app = Router::new()
        .route("/health", get(health))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(bind_addr = %config.bind_addr, "coordinator listening");
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Clone)]
struct AppState {
    #[allow(dead_code)]
    coordinator: Coordinator,
    health: Arc<coordinator::health::HealthState>,
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.health.report())
}
