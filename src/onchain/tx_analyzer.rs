//! Turning transaction candidates into structured facts.
//!
//! A single dispatch loop deduplicates incoming candidates by signature and
//! spawns one detached worker per transaction. Each worker fetches the full
//! transaction through the RPC pool, extracts the facts its kind implies,
//! and forwards them to the pair collector.

use crate::connection::{ClientHandle, RpcPool};
use crate::onchain::amm::AmmFact;
use crate::onchain::market::MarketFact;
use crate::onchain::token::{TokenFact, TOKEN_HISTORY_LIMIT};
use crate::onchain::{Fact, FactSender, TxCandidate, TxCandidateSender, STAGE_CHANNEL_CAPACITY};
use anyhow::{anyhow, bail, Context, Result};
use solana_client::rpc_client::GetConfirmedSignaturesForAddress2Config;
use solana_client::rpc_config::RpcTransactionConfig;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::VersionedTransaction;
use solana_transaction_status::{EncodedConfirmedTransactionWithStatusMeta, UiTransactionEncoding};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Overall budget for resolving one transaction; confirmation can lag the
/// processed-commitment log by a long while on busy slots.
const TX_FETCH_BUDGET: Duration = Duration::from_secs(300);

/// Deadline of each individual fetch attempt within the budget.
const TX_FETCH_SLICE: Duration = Duration::from_secs(5);

/// Deadline for the token history and supply queries.
const TOKEN_QUERY_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a failing endpoint is parked before rejoining the rotation.
const RPC_FAILURE_COOLDOWN: Duration = Duration::from_secs(2);

pub struct TxAnalyzer {
    pool: Arc<RpcPool>,
    candidate_tx: Option<TxCandidateSender>,
    candidate_rx: Option<mpsc::Receiver<TxCandidate>>,
    dispatch: Option<JoinHandle<()>>,
}

impl TxAnalyzer {
    pub fn new(pool: Arc<RpcPool>) -> Self {
        let (candidate_tx, candidate_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        Self {
            pool,
            candidate_tx: Some(candidate_tx),
            candidate_rx: Some(candidate_rx),
            dispatch: None,
        }
    }

    /// The input endpoint for log observers.
    pub fn channel(&self) -> TxCandidateSender {
        self.candidate_tx
            .as_ref()
            .expect("analyzer input already closed")
            .clone()
    }

    /// Start the dispatch loop. Candidates are deduplicated by signature
    /// (the observers race on the same transactions) and handed to
    /// detached per-candidate workers.
    pub fn start(&mut self, out: FactSender) -> Result<()> {
        let Some(mut candidate_rx) = self.candidate_rx.take() else {
            bail!("tx analyzer is already running");
        };

        info!("tx analyzer starting");
        let pool = Arc::clone(&self.pool);

        self.dispatch = Some(tokio::spawn(async move {
            let mut seen: HashSet<Signature> = HashSet::new();

            while let Some(candidate) = candidate_rx.recv().await {
                if !seen.insert(candidate.signature) {
                    continue;
                }

                tokio::spawn(analyze(Arc::clone(&pool), candidate, out.clone()));
            }
        }));

        Ok(())
    }

    /// Close the input and wait for the dispatch loop to drain. Detached
    /// workers are not waited for; they only perform RPC and channel sends.
    pub async fn stop(&mut self, deadline: Duration) -> Result<()> {
        drop(self.candidate_tx.take());

        if let Some(dispatch) = self.dispatch.take() {
            timeout(deadline, dispatch)
                .await
                .context("forced shutdown of tx analyzer")?
                .ok();
        }

        Ok(())
    }
}

/// Per-candidate worker.
async fn analyze(pool: Arc<RpcPool>, candidate: TxCandidate, out: FactSender) {
    let signature = candidate.signature;

    let (rpc_tx, tx) = match fetch_confirmed_transaction(&pool, &candidate).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(signature = %signature, error = %e, "failed to resolve transaction");
            return;
        }
    };

    let block_time = match rpc_tx.block_time {
        Some(t) => t,
        None => {
            warn!(signature = %signature, "transaction carries no block time");
            return;
        }
    };

    let outcome = match &candidate.payload {
        None => analyze_market_init(&pool, &tx, rpc_tx.slot, block_time, &out).await,
        Some(payload) => analyze_add_liquidity(&tx, payload, rpc_tx.slot, block_time, &out).await,
    };

    if let Err(e) = outcome {
        warn!(signature = %signature, error = %e, "transaction analysis failed");
    }
}

/// Fetch the full transaction at confirmed commitment, rotating through
/// pool clients on failure until the overall budget runs out. A failed
/// transaction (meta.err set) aborts the worker.
async fn fetch_confirmed_transaction(
    pool: &RpcPool,
    candidate: &TxCandidate,
) -> Result<(EncodedConfirmedTransactionWithStatusMeta, VersionedTransaction)> {
    let deadline = Instant::now() + TX_FETCH_BUDGET;

    // Start on the endpoint whose subscription saw the log; it is the most
    // likely to already index the transaction.
    let mut handle: ClientHandle = match pool.named(&candidate.origin) {
        Some(handle) => handle,
        None => pool.next_client().await,
    };

    let config = RpcTransactionConfig {
        encoding: Some(UiTransactionEncoding::Base64),
        commitment: Some(CommitmentConfig::confirmed()),
        max_supported_transaction_version: Some(1),
    };

    loop {
        if Instant::now() >= deadline {
            bail!("transaction fetch budget exhausted");
        }

        match timeout(
            TX_FETCH_SLICE,
            handle
                .client
                .get_transaction_with_config(&candidate.signature, config.clone()),
        )
        .await
        {
            Ok(Ok(rpc_tx)) => {
                if let Some(err) = rpc_tx.transaction.meta.as_ref().and_then(|m| m.err.clone()) {
                    bail!("transaction failed on-chain: {err:?}");
                }

                let tx = rpc_tx
                    .transaction
                    .transaction
                    .decode()
                    .context("undecodable transaction payload")?;

                return Ok((rpc_tx, tx));
            }
            Ok(Err(e)) => {
                debug!(endpoint = %handle.name, error = %e, "transaction fetch failed; rotating");
                pool.mark_cooldown(&handle.name, RPC_FAILURE_COOLDOWN);
                handle = pool.next_client().await;
            }
            Err(_) => {
                debug!(endpoint = %handle.name, "transaction fetch timed out; rotating");
                handle = pool.next_client().await;
            }
        }
    }
}

/// Market-init path: the market fact, the pool derived from it, and the
/// token metadata, published in that order from this single worker.
async fn analyze_market_init(
    pool: &RpcPool,
    tx: &VersionedTransaction,
    slot: u64,
    block_time: i64,
    out: &FactSender,
) -> Result<()> {
    let market = MarketFact::from_transaction(tx, slot, block_time)
        .context("market extraction failed")?;
    info!(
        token = %market.token_address(),
        market = %market.market,
        "new market initialization found"
    );

    let derived = AmmFact::derive_from_market(&market);
    publish(out, Fact::Market(market.clone())).await?;
    publish(out, Fact::Amm(derived)).await?;

    let token = gather_token_fact(pool, &market)
        .await
        .context("token metadata gathering failed")?;
    publish(out, Fact::Token(token)).await?;

    Ok(())
}

/// Add-liquidity path: the observed pool fact alone.
async fn analyze_add_liquidity(
    tx: &VersionedTransaction,
    payload: &serde_json::Value,
    slot: u64,
    block_time: i64,
    out: &FactSender,
) -> Result<()> {
    let amm =
        AmmFact::from_transaction(tx, payload, slot, block_time).context("pool extraction failed")?;
    info!(token = %amm.token_address(), amm = %amm.amm_id, "new pool initialization found");

    publish(out, Fact::Amm(amm)).await
}

/// Token age, history length, supply, and decimals for the market's base
/// mint.
async fn gather_token_fact(pool: &RpcPool, market: &MarketFact) -> Result<TokenFact> {
    let mint = market.token_address();

    let handle = pool.next_client().await;
    let signatures = timeout(
        TOKEN_QUERY_TIMEOUT,
        handle.client.get_signatures_for_address_with_config(
            &mint,
            GetConfirmedSignaturesForAddress2Config {
                limit: Some(TOKEN_HISTORY_LIMIT),
                ..Default::default()
            },
        ),
    )
    .await
    .context("signature history query timed out")?
    .context("signature history query failed")?;

    let Some(oldest) = signatures.last() else {
        bail!("mint has no visible transaction history");
    };
    let first_block_time = oldest
        .block_time
        .context("oldest mint transaction carries no block time")?;
    let oldest_signature: Signature = oldest
        .signature
        .parse()
        .context("unparsable signature in mint history")?;

    let handle = pool.next_client().await;
    let supply = timeout(
        TOKEN_QUERY_TIMEOUT,
        handle
            .client
            .get_token_supply_with_commitment(&mint, CommitmentConfig::finalized()),
    )
    .await
    .context("token supply query timed out")?
    .context("token supply query failed")?
    .value;

    let total_supply: u64 = supply
        .amount
        .parse()
        .context("unparsable token supply amount")?;

    Ok(TokenFact {
        address: mint,
        oldest_signature,
        first_block_time,
        time_to_market: market.block_time - first_block_time,
        tx_count_to_market: signatures.len() as u64,
        total_supply,
        decimals: supply.decimals,
    })
}

async fn publish(out: &FactSender, fact: Fact) -> Result<()> {
    out.send(fact)
        .await
        .map_err(|_| anyhow!("fact channel closed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::connection::pool::PooledEndpoint;
    use crate::onchain::amm::tests::{build_init_liquidity_tx, init_log_payload};
    use crate::onchain::WSOL_MINT;
    use solana_client::nonblocking::rpc_client::RpcClient;
    use solana_sdk::pubkey::Pubkey;

    fn test_pool() -> Arc<RpcPool> {
        Arc::new(RpcPool::from_endpoints(vec![PooledEndpoint::new(
            "a",
            NodeConfig {
                rpc: "https://a.example.com".to_string(),
                ws: "wss://a.example.com".to_string(),
                observer: true,
            },
            Arc::new(RpcClient::new("https://a.example.com".to_string())),
        )]))
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let mut analyzer = TxAnalyzer::new(test_pool());

        let (fact_tx, _fact_rx) = mpsc::channel(8);
        analyzer.start(fact_tx).unwrap();

        // Second start is rejected while the loop is live.
        let (other_tx, _other_rx) = mpsc::channel(8);
        assert!(analyzer.start(other_tx).is_err());

        analyzer.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_add_liquidity_path_emits_single_observed_fact() {
        let token = Pubkey::new_unique();
        let tx = build_init_liquidity_tx(token, WSOL_MINT);
        let payload = init_log_payload(1_700_000_150, 1000.0, 500_000.0);

        let (fact_tx, mut fact_rx) = mpsc::channel(8);
        analyze_add_liquidity(&tx, &payload, 42, 1_700_000_100, &fact_tx)
            .await
            .unwrap();

        match fact_rx.recv().await.unwrap() {
            Fact::Amm(amm) => {
                assert!(!amm.calculated);
                assert_eq!(amm.token_address(), token);
                assert_eq!(amm.slot, 42);
            }
            other => panic!("unexpected fact: {other:?}"),
        }
        assert!(fact_rx.try_recv().is_err());
    }
}
