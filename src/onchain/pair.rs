//! The consolidated pair record.

use crate::onchain::amm::AmmFact;
use crate::onchain::market::MarketFact;
use crate::onchain::token::TokenFact;
use chrono::{DateTime, Utc};
use solana_sdk::pubkey::Pubkey;

/// Join of everything known about a newly created pair, keyed by the
/// base-token mint. Created when the first fact arrives, mutated in place
/// as the rest arrive, emitted downstream exactly once when complete.
#[derive(Debug, Clone, Default)]
pub struct PairRecord {
    pub market: MarketFact,
    pub token: TokenFact,
    /// The pool as observed in the init-liquidity instruction.
    pub observed_amm: AmmFact,
    /// The pool as derived from the market; authoritative for the vault
    /// identities.
    pub derived_amm: AmmFact,
    /// Wall-clock time the pair became tradable from our point of view.
    pub readiness: Option<DateTime<Utc>>,
}

impl PairRecord {
    pub fn token_address(&self) -> Pubkey {
        self.market.token_address()
    }

    /// The pair is complete once the market, the observed pool, and the
    /// token metadata are each individually ready. The derived pool is an
    /// oracle only and carries no liveness of its own.
    pub fn ready(&self) -> bool {
        self.market.ready() && self.observed_amm.ready() && self.token.ready()
    }
}
