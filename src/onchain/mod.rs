//! On-chain discovery pipeline.
//!
//! Three long-lived components wired leaves-first: log observers surface
//! interesting transaction signatures, the transaction analyzer turns them
//! into structured facts, and the pair collector joins those facts into
//! consolidated pair records.
//!
//! Data flow: `LogObserver -> TxAnalyzer -> PairCollector -> downstream`.

pub mod amm;
pub mod log_observer;
pub mod market;
pub mod pair;
pub mod pair_collector;
pub mod token;
pub mod tx_analyzer;

pub use amm::{AmmFact, LiveInfo, RAYDIUM_AMM_AUTHORITY, RAYDIUM_AMM_PROGRAM};
pub use log_observer::{LogObserver, SeenLogSet};
pub use market::{MarketFact, OPENBOOK_PROGRAM};
pub use pair::PairRecord;
pub use pair_collector::PairCollector;
pub use token::TokenFact;
pub use tx_analyzer::TxAnalyzer;

use solana_sdk::pubkey;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use tokio::sync::mpsc;

/// The chain's canonical wrapped-SOL mint; every tracked pair quotes
/// against it.
pub const WSOL_MINT: Pubkey = pubkey!("So11111111111111111111111111111111111111112");

/// Capacity of the channels between pipeline stages.
pub const STAGE_CHANNEL_CAPACITY: usize = 32;

/// A transaction surfaced by a log observer, addressed by signature.
///
/// A present payload marks an AMM init-liquidity candidate and carries the
/// JSON parsed out of the instruction log; an absent payload marks a
/// market-init candidate.
#[derive(Debug, Clone)]
pub struct TxCandidate {
    pub signature: Signature,
    /// Name of the endpoint whose subscription saw the log.
    pub origin: String,
    pub payload: Option<serde_json::Value>,
}

/// A structured fact extracted from one transaction, keyed by base token.
///
/// The collector matches exhaustively on this enum; an unknown fact kind is
/// a compile-time impossibility.
#[derive(Debug, Clone)]
pub enum Fact {
    Market(MarketFact),
    Amm(AmmFact),
    Token(TokenFact),
}

impl Fact {
    /// The base-token mint this fact is about; the collector's join key.
    pub fn token_address(&self) -> Pubkey {
        match self {
            Fact::Market(market) => market.token_address(),
            Fact::Amm(amm) => amm.token_address(),
            Fact::Token(token) => token.address,
        }
    }
}

pub type TxCandidateSender = mpsc::Sender<TxCandidate>;
pub type TxCandidateReceiver = mpsc::Receiver<TxCandidate>;

pub type FactSender = mpsc::Sender<Fact>;
pub type FactReceiver = mpsc::Receiver<Fact>;

pub type PairSender = mpsc::Sender<PairRecord>;
pub type PairReceiver = mpsc::Receiver<PairRecord>;
