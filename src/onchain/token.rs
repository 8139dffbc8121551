//! Base-token metadata.
//!
//! Gathered from the mint's visible transaction history and supply data
//! once its market is discovered; tells downstream consumers how old and
//! how active a token was before it became tradable.

use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;

/// How many history entries are requested per mint; counts are capped by
/// this window.
pub const TOKEN_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenFact {
    /// The mint this fact is about.
    pub address: Pubkey,
    /// Oldest transaction visible within the history window.
    pub oldest_signature: Signature,
    /// Block time of that oldest transaction, unix seconds.
    pub first_block_time: i64,
    /// Seconds between the token's first visible transaction and its
    /// market creation.
    pub time_to_market: i64,
    /// Transactions on the mint up to market creation, capped by the
    /// history window.
    pub tx_count_to_market: u64,
    pub total_supply: u64,
    pub decimals: u8,
}

impl TokenFact {
    pub fn ready(&self) -> bool {
        self.time_to_market != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_tracks_time_to_market() {
        let mut fact = TokenFact::default();
        assert!(!fact.ready());

        fact.time_to_market = 90;
        assert!(fact.ready());
    }
}
