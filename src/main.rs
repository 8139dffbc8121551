//! Pipeline entry point: wires the components leaves-first, then waits for
//! a shutdown signal and stops them in reverse order.

use pairscout::config::{Config, DEFAULT_CONFIG_PATH};
use pairscout::connection::RpcPool;
use pairscout::onchain::{LogObserver, PairCollector, PairRecord, SeenLogSet, TxAnalyzer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// Per-component deadline during shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string())),
        )
        .init();

    let config = match Config::load(DEFAULT_CONFIG_PATH) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "error loading config");
            std::process::exit(1);
        }
    };

    let pool = match RpcPool::connect(config.nodes).await {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            error!(error = %e, "error creating rpc pool");
            std::process::exit(1);
        }
    };

    let mut collector = PairCollector::new();
    let pair_sink = spawn_pair_sink();
    if let Err(e) = collector.start(vec![pair_sink]) {
        error!(error = %e, "error starting pair collector");
        std::process::exit(1);
    }

    let mut analyzer = TxAnalyzer::new(Arc::clone(&pool));
    if let Err(e) = analyzer.start(collector.channel()) {
        error!(error = %e, "error starting tx analyzer");
        std::process::exit(1);
    }

    let seen = SeenLogSet::new();
    let mut observers = Vec::new();
    for endpoint in pool.observer_endpoints() {
        let mut observer =
            LogObserver::new(endpoint.name.clone(), endpoint.config.clone(), seen.clone());

        if let Err(e) = observer.start(analyzer.channel()).await {
            error!(
                endpoint = %observer.connection_name(),
                error = %e,
                "error starting log observer"
            );
            std::process::exit(1);
        }

        observers.push(observer);
    }

    if let Err(e) = wait_for_shutdown_signal().await {
        error!(error = %e, "error installing signal handlers");
        std::process::exit(1);
    }
    info!("interrupted; stopping");

    for mut observer in observers {
        if let Err(e) = observer.stop(SHUTDOWN_TIMEOUT).await {
            error!(
                endpoint = %observer.connection_name(),
                error = %e,
                "error stopping log observer"
            );
        }
    }

    if let Err(e) = analyzer.stop(SHUTDOWN_TIMEOUT).await {
        error!(error = %e, "error stopping tx analyzer");
    }

    if let Err(e) = collector.stop(SHUTDOWN_TIMEOUT).await {
        error!(error = %e, "error stopping pair collector");
    }
}

/// Default downstream consumer: logs every finished pair as structured
/// JSON. Trading strategies attach by passing more senders to the
/// collector.
fn spawn_pair_sink() -> mpsc::Sender<PairRecord> {
    let (pair_tx, mut pair_rx) = mpsc::channel::<PairRecord>(32);

    tokio::spawn(async move {
        while let Some(pair) = pair_rx.recv().await {
            let summary = serde_json::json!({
                "token": pair.token_address().to_string(),
                "market": pair.market.market.to_string(),
                "amm": pair.observed_amm.amm_id.to_string(),
                "open_time": pair.observed_amm.initial_live.update_time,
                "pooled_native": pair.observed_amm.initial_live.pooled_native,
                "pooled_token": pair.observed_amm.initial_live.pooled_token,
                "price": pair.observed_amm.initial_live.price,
                "time_to_market_secs": pair.token.time_to_market,
                "token_supply": pair.token.total_supply,
                "token_decimals": pair.token.decimals,
            });
            info!(pair = %summary, "pair ready for trading");
        }
    });

    pair_tx
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}
