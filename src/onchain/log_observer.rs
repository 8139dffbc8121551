//! Per-endpoint log observation.
//!
//! Each observer keeps two log subscriptions alive on a single websocket
//! endpoint: one for mentions of the OpenBook program, one for the Raydium
//! AMM program. Qualifying log entries are translated into [`TxCandidate`]s
//! and handed to the transaction analyzer.

use crate::config::NodeConfig;
use crate::onchain::amm::RAYDIUM_AMM_PROGRAM;
use crate::onchain::market::OPENBOOK_PROGRAM;
use crate::onchain::{TxCandidate, TxCandidateSender};
use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::rpc_config::{RpcTransactionLogsConfig, RpcTransactionLogsFilter};
use solana_client::rpc_response::RpcLogsResponse;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Success line of the system program, preceding the top-level market
/// initialization invoke.
const SYSTEM_PROGRAM_SUCCESS: &str = "Program 11111111111111111111111111111111 success";

/// Top-level invoke line of the OpenBook program.
const MARKET_INIT_INVOKE: &str = "Program srmqPvymJeFKQ4zGQed1GFppgkRHL9kaELCbyksJtPX invoke [1]";

/// Marker preceding the init-liquidity parameters inside the Raydium log.
const INIT_LIQUIDITY_MARKER: &str = " InitializeInstruction2 ";

/// Deadline for each websocket dial attempt.
const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Spacing between reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Process-wide set of signatures already handed off, shared by all
/// observers. Entries are never removed; bounded only by process lifetime.
#[derive(Clone, Default)]
pub struct SeenLogSet {
    inner: Arc<RwLock<HashSet<Signature>>>,
}

impl SeenLogSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, signature: &Signature) -> bool {
        self.inner.read().await.contains(signature)
    }

    /// Returns false if the signature was already present.
    pub async fn insert(&self, signature: Signature) -> bool {
        self.inner.write().await.insert(signature)
    }
}

/// Which of the two programs a subscription watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subscription {
    MarketInit,
    PoolInit,
}

impl Subscription {
    fn program(self) -> Pubkey {
        match self {
            Subscription::MarketInit => OPENBOOK_PROGRAM,
            Subscription::PoolInit => RAYDIUM_AMM_PROGRAM,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Subscription::MarketInit => "openbook",
            Subscription::PoolInit => "raydium",
        }
    }
}

/// Why the live stream ended.
enum StreamEnd {
    Shutdown,
    Lost,
}

pub struct LogObserver {
    name: String,
    node: NodeConfig,
    seen: SeenLogSet,
    running: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    consumers: Vec<JoinHandle<()>>,
}

impl LogObserver {
    pub fn new(name: impl Into<String>, node: NodeConfig, seen: SeenLogSet) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name: name.into(),
            node,
            seen,
            running: Arc::new(AtomicBool::new(false)),
            shutdown,
            consumers: Vec::new(),
        }
    }

    pub fn connection_name(&self) -> &str {
        &self.name
    }

    /// Open both subscriptions and spawn their consumer loops. A second
    /// call while running fails; a dial failure of the second subscription
    /// unwinds the first.
    pub async fn start(&mut self, out: TxCandidateSender) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            bail!("log observer is already running");
        }

        info!(endpoint = %self.name, "subscribing for openbook program logs");
        let openbook_client = match dial(&self.node.ws).await {
            Ok(client) => client,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        info!(endpoint = %self.name, "subscribing for raydium program logs");
        let raydium_client = match dial(&self.node.ws).await {
            Ok(client) => client,
            Err(e) => {
                let _ = openbook_client.shutdown().await;
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        for (client, subscription) in [
            (openbook_client, Subscription::MarketInit),
            (raydium_client, Subscription::PoolInit),
        ] {
            let ctx = ConsumerContext {
                subscription,
                ws_url: self.node.ws.clone(),
                endpoint: self.name.clone(),
                seen: self.seen.clone(),
                out: out.clone(),
                shutdown: self.shutdown.subscribe(),
            };
            self.consumers.push(tokio::spawn(consume_logs(client, ctx)));
        }

        Ok(())
    }

    /// Signal shutdown and wait for both consumer loops to acknowledge.
    pub async fn stop(&mut self, deadline: Duration) -> Result<()> {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            bail!("log observer is not running");
        }

        let _ = self.shutdown.send(true);

        let handles: Vec<JoinHandle<()>> = self.consumers.drain(..).collect();
        timeout(deadline, async move {
            for handle in handles {
                let _ = handle.await;
            }
        })
        .await
        .with_context(|| format!("forced shutdown of log observer on {}", self.name))?;

        Ok(())
    }
}

struct ConsumerContext {
    subscription: Subscription,
    ws_url: String,
    endpoint: String,
    seen: SeenLogSet,
    out: TxCandidateSender,
    shutdown: watch::Receiver<bool>,
}

async fn dial(ws_url: &str) -> Result<PubsubClient> {
    timeout(DIAL_TIMEOUT, PubsubClient::new(ws_url))
        .await
        .context("websocket dial timed out")?
        .context("websocket dial failed")
}

/// One consumer loop per subscription: Subscribing -> Live -> Reconnecting
/// -> Subscribing, until the shutdown signal moves it to Stopped from any
/// state.
async fn consume_logs(mut client: PubsubClient, ctx: ConsumerContext) {
    let ConsumerContext {
        subscription,
        ws_url,
        endpoint,
        seen,
        out,
        mut shutdown,
    } = ctx;

    let filter = RpcTransactionLogsFilter::Mentions(vec![subscription.program().to_string()]);
    let config = RpcTransactionLogsConfig {
        commitment: Some(CommitmentConfig::processed()),
    };

    loop {
        // Subscribing and Live, scoped so the stream's borrow of `client`
        // ends before `client` is reassigned for the next iteration.
        let next_client = 'attempt: loop {
            let subscribe_result = client.logs_subscribe(filter.clone(), config.clone()).await;
            let (mut stream, unsubscribe) = match subscribe_result {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(
                        endpoint = %endpoint,
                        program = subscription.describe(),
                        error = %e,
                        "log subscribe failed; reconnecting"
                    );
                    match reconnect(&ws_url, &mut shutdown).await {
                        Some(fresh) => break 'attempt fresh,
                        None => return,
                    }
                }
            };

            debug!(
                endpoint = %endpoint,
                program = subscription.describe(),
                "log subscription live"
            );

            // Live.
            let end = loop {
                tokio::select! {
                    _ = shutdown.changed() => break StreamEnd::Shutdown,
                    message = stream.next() => match message {
                        Some(response) => {
                            handle_log(response.value, subscription, &endpoint, &seen, &out).await
                        }
                        None => break StreamEnd::Lost,
                    },
                }
            };

            drop(stream);
            unsubscribe().await;

            match end {
                StreamEnd::Shutdown => return,
                StreamEnd::Lost => {
                    warn!(
                        endpoint = %endpoint,
                        program = subscription.describe(),
                        "log stream closed; reconnecting"
                    );
                    match reconnect(&ws_url, &mut shutdown).await {
                        Some(fresh) => break 'attempt fresh,
                        None => return,
                    }
                }
            }
        };

        client = next_client;
    }
}

/// Dial until a fresh connection replaces the lost one, with a fixed delay
/// between attempts. Returns None when shutdown is signalled.
async fn reconnect(ws_url: &str, shutdown: &mut watch::Receiver<bool>) -> Option<PubsubClient> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return None,
            dialed = dial(ws_url) => match dialed {
                Ok(client) => return Some(client),
                Err(e) => warn!(error = %e, "websocket reconnect attempt failed"),
            },
        }

        tokio::select! {
            _ = shutdown.changed() => return None,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

/// Cheap per-message filtering; the log scan itself runs on a detached
/// task so the consumer loop keeps draining the stream.
async fn handle_log(
    value: RpcLogsResponse,
    subscription: Subscription,
    endpoint: &str,
    seen: &SeenLogSet,
    out: &TxCandidateSender,
) {
    if value.err.is_some() || value.logs.is_empty() {
        return;
    }

    let signature: Signature = match value.signature.parse() {
        Ok(sig) => sig,
        Err(e) => {
            debug!(error = %e, "unparsable signature in log record");
            return;
        }
    };

    if seen.contains(&signature).await {
        return;
    }

    let endpoint = endpoint.to_string();
    let seen = seen.clone();
    let out = out.clone();
    let logs = value.logs;

    tokio::spawn(scan_and_publish(
        subscription,
        endpoint,
        signature,
        logs,
        seen,
        out,
    ));
}

/// Scan the log lines, publish a candidate on a hit, and record the
/// signature as seen exactly once.
async fn scan_and_publish(
    subscription: Subscription,
    endpoint: String,
    signature: Signature,
    logs: Vec<String>,
    seen: SeenLogSet,
    out: TxCandidateSender,
) {
    let candidate = match subscription {
        Subscription::MarketInit => {
            mentions_market_init(&logs).then(|| TxCandidate {
                signature,
                origin: endpoint.clone(),
                payload: None,
            })
        }
        Subscription::PoolInit => extract_init_liquidity_payload(&logs).map(|payload| TxCandidate {
            signature,
            origin: endpoint.clone(),
            payload: Some(payload),
        }),
    };

    if let Some(candidate) = candidate {
        info!(
            endpoint = %endpoint,
            program = subscription.describe(),
            signature = %signature,
            "interesting transaction spotted"
        );
        if out.send(candidate).await.is_err() {
            warn!("candidate channel closed; dropping transaction");
        }
    }

    seen.insert(signature).await;
}

/// A market initialization shows up as the system program succeeding,
/// immediately followed by a top-level OpenBook invoke.
fn mentions_market_init(logs: &[String]) -> bool {
    for (i, line) in logs.iter().enumerate() {
        if !line.contains(SYSTEM_PROGRAM_SUCCESS) {
            continue;
        }

        let Some(next) = logs.get(i + 1) else {
            return false;
        };

        if next.contains(MARKET_INIT_INVOKE) {
            return true;
        }
    }

    false
}

/// Raydium logs its init-liquidity parameters as a debug-formatted struct
/// after the instruction name. Quote the bare keys and the remainder parses
/// as JSON.
fn extract_init_liquidity_payload(logs: &[String]) -> Option<serde_json::Value> {
    for line in logs {
        let Some((_, after)) = line.split_once(INIT_LIQUIDITY_MARKER) else {
            continue;
        };

        let rewritten = after
            .split(' ')
            .map(|token| {
                if token.contains(':') {
                    format!("\"{}\":", &token[..token.len() - 1])
                } else {
                    token.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ");

        if let Ok(payload) = serde_json::from_str::<serde_json::Value>(&rewritten) {
            return Some(payload);
        }
    }

    None
}
