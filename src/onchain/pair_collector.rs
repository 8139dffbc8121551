//! Joining heterogeneous facts into pair records.
//!
//! A single-threaded loop owns the in-flight map and the set of already
//! emitted tokens; all correlation state lives inside the loop, so the join
//! itself needs no locks.

use crate::onchain::pair::PairRecord;
use crate::onchain::{
    AmmFact, Fact, FactReceiver, FactSender, MarketFact, PairSender, TokenFact,
    STAGE_CHANNEL_CAPACITY, WSOL_MINT,
};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

pub struct PairCollector {
    fact_tx: Option<FactSender>,
    fact_rx: Option<FactReceiver>,
    join: Option<JoinHandle<()>>,
}

impl Default for PairCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl PairCollector {
    pub fn new() -> Self {
        let (fact_tx, fact_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        Self {
            fact_tx: Some(fact_tx),
            fact_rx: Some(fact_rx),
            join: None,
        }
    }

    /// The input endpoint for the transaction analyzer.
    pub fn channel(&self) -> FactSender {
        self.fact_tx
            .as_ref()
            .expect("collector input already closed")
            .clone()
    }

    /// Start the join loop. Every finished record is sent to each of the
    /// downstream senders.
    pub fn start(&mut self, outputs: Vec<PairSender>) -> Result<()> {
        let Some(mut fact_rx) = self.fact_rx.take() else {
            bail!("pair collector is already running");
        };

        info!("pair collector starting");

        self.join = Some(tokio::spawn(async move {
            let mut state = JoinState::default();

            while let Some(fact) = fact_rx.recv().await {
                if let Some(record) = state.apply(fact) {
                    for out in &outputs {
                        if out.send(record.clone()).await.is_err() {
                            warn!("pair sink closed; record not delivered");
                        }
                    }
                }
            }
        }));

        Ok(())
    }

    /// Close the input and wait for the join loop to drain.
    pub async fn stop(&mut self, deadline: Duration) -> Result<()> {
        drop(self.fact_tx.take());

        if let Some(join) = self.join.take() {
            timeout(deadline, join)
                .await
                .context("forced shutdown of pair collector")?
                .ok();
        }

        Ok(())
    }
}

/// The collector's loop-confined state. `created` only ever grows; a token
/// present there is never present in `pairs`.
#[derive(Default)]
struct JoinState {
    pairs: HashMap<Pubkey, PairRecord>,
    created: HashSet<Pubkey>,
}

impl JoinState {
    /// Fold one fact into the state; returns a record when it just became
    /// ready for emission.
    fn apply(&mut self, fact: Fact) -> Option<PairRecord> {
        let key = fact.token_address();
        if self.created.contains(&key) {
            info!(token = %key, "pair already created for token; dropping fact");
            return None;
        }

        let record_key = match fact {
            Fact::Market(market) => self.apply_market(key, market)?,
            Fact::Token(token) => self.apply_token(key, token)?,
            Fact::Amm(amm) if amm.calculated => self.apply_derived_amm(key, amm)?,
            Fact::Amm(amm) => self.apply_observed_amm(key, amm)?,
        };

        self.evaluate_readiness(record_key)
    }

    fn apply_market(&mut self, key: Pubkey, market: MarketFact) -> Option<Pubkey> {
        if self.pairs.contains_key(&key) {
            warn!(token = %key, "pair already exists for token; dropping duplicate market");
            return None;
        }

        info!(token = %key, block_time = market.block_time, "new market discovered");
        self.pairs.insert(
            key,
            PairRecord {
                market,
                ..Default::default()
            },
        );
        Some(key)
    }

    fn apply_token(&mut self, key: Pubkey, token: TokenFact) -> Option<Pubkey> {
        let Some(record) = self.pairs.get_mut(&key) else {
            warn!(token = %key, "token fact without an in-flight pair; dropping");
            return None;
        };

        record.token = token;
        Some(key)
    }

    fn apply_derived_amm(&mut self, key: Pubkey, amm: AmmFact) -> Option<Pubkey> {
        // A market fact always precedes its derived pool fact; a miss here
        // means the record was already dropped.
        let Some(record) = self.pairs.get_mut(&key) else {
            warn!(token = %key, "derived pool fact without an in-flight pair; dropping");
            return None;
        };

        record.derived_amm = amm;
        Some(key)
    }

    fn apply_observed_amm(
        &mut self,
        key: Pubkey,
        mut amm: AmmFact,
    ) -> Option<Pubkey> {
        // A wrapped-SOL join key means the pool listed the pair in reverse
        // order; the real token is on the currency side.
        let (lookup_key, swapped) = if key == WSOL_MINT {
            (amm.currency_mint, true)
        } else {
            (key, false)
        };

        let Some(record) = self.pairs.get_mut(&lookup_key) else {
            warn!(token = %lookup_key, "observed pool fact without an in-flight pair; dropping");
            return None;
        };

        amm.canonicalize(swapped);

        // The derived addresses are authoritative for the vaults.
        if amm.pool_coin_vault != record.derived_amm.pool_coin_vault {
            warn!(
                token = %lookup_key,
                observed_coin_vault = %amm.pool_coin_vault,
                derived_coin_vault = %record.derived_amm.pool_coin_vault,
                observed_pc_vault = %amm.pool_pc_vault,
                derived_pc_vault = %record.derived_amm.pool_pc_vault,
                "pool vault mismatch; overwriting with derived addresses"
            );
            amm.pool_coin_vault = record.derived_amm.pool_coin_vault;
            amm.pool_pc_vault = record.derived_amm.pool_pc_vault;
        }

        record.observed_amm = amm;
        Some(lookup_key)
    }

    fn evaluate_readiness(&mut self, key: Pubkey) -> Option<PairRecord> {
        let record = self.pairs.get_mut(&key)?;

        if record.observed_amm.signature == Signature::default() {
            return None; // Wait for the observed pool fact.
        }

        if !record.ready() {
            warn!(
                token = %key,
                amm = %record.observed_amm.amm_id,
                "pair got all facts but is not ready; dropping"
            );
            self.pairs.remove(&key);
            return None;
        }

        record.readiness = Some(Utc::now());

        if key != WSOL_MINT {
            info!(
                token = %key,
                amm = %record.observed_amm.amm_id,
                open_time = record.observed_amm.initial_live.update_time,
                "new pair found"
            );
            self.created.insert(key);
            return self.pairs.remove(&key);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onchain::amm::{AmmFact, LiveInfo};
    use crate::onchain::market::tests::build_init_market_tx;
    use crate::onchain::market::MarketFact;
    use crate::onchain::token::TokenFact;

    const MARKET_BLOCK_TIME: i64 = 100;

    fn ready_market(token: Pubkey) -> MarketFact {
        let tx = build_init_market_tx(token, WSOL_MINT);
        MarketFact::from_transaction(&tx, 1234, MARKET_BLOCK_TIME).unwrap()
    }

    fn ready_token_fact(token: Pubkey) -> TokenFact {
        TokenFact {
            address: token,
            oldest_signature: Signature::from([2u8; 64]),
            first_block_time: 10,
            time_to_market: MARKET_BLOCK_TIME - 10,
            tx_count_to_market: 15,
            total_supply: 1_000_000,
            decimals: 6,
        }
    }

    /// An observed pool fact in canonical orientation whose vaults agree
    /// with the derived fact.
    fn ready_observed_amm(token: Pubkey, derived: &AmmFact) -> AmmFact {
        AmmFact {
            amm_id: derived.amm_id,
            open_orders: derived.open_orders,
            lp_mint: derived.lp_mint,
            token_mint: token,
            currency_mint: WSOL_MINT,
            pool_coin_vault: derived.pool_coin_vault,
            pool_pc_vault: derived.pool_pc_vault,
            target_orders: derived.target_orders,
            liquidity_creator: Pubkey::new_unique(),
            caller: Pubkey::new_unique(),
            signature: Signature::from([4u8; 64]),
            slot: 1240,
            block_time: 150,
            discovered_at: Utc::now(),
            initial_live: LiveInfo {
                update_time: 150,
                pooled_native: 1000.0,
                pooled_token: 500_000.0,
                price: 500.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    struct Scenario {
        token: Pubkey,
        market: MarketFact,
        derived: AmmFact,
        token_fact: TokenFact,
        observed: AmmFact,
    }

    fn scenario() -> Scenario {
        let token = Pubkey::new_unique();
        let market = ready_market(token);
        let derived = AmmFact::derive_from_market(&market);
        let token_fact = ready_token_fact(token);
        let observed = ready_observed_amm(token, &derived);
        Scenario {
            token,
            market,
            derived,
            token_fact,
            observed,
        }
    }

    #[test]
    fn test_happy_path_market_first_then_amm() {
        let s = scenario();
        let mut state = JoinState::default();

        assert!(state.apply(Fact::Market(s.market)).is_none());
        assert!(state.apply(Fact::Amm(s.derived)).is_none());
        assert!(state.apply(Fact::Token(s.token_fact)).is_none());

        let record = state.apply(Fact::Amm(s.observed)).unwrap();

        assert_eq!(record.token_address(), s.token);
        assert_eq!(record.observed_amm.initial_live.price, 500.0);
        assert_eq!(record.token.time_to_market, 90);
        assert!(record.ready());
        assert!(record.readiness.is_some());
        assert_eq!(
            record.observed_amm.current_live,
            record.observed_amm.initial_live
        );

        // Emitted exactly once: the token moved from pairs to created.
        assert!(state.pairs.is_empty());
        assert!(state.created.contains(&s.token));
    }

    #[test]
    fn test_swapped_orientation_produces_same_record() {
        let s = scenario();
        let mut state = JoinState::default();

        state.apply(Fact::Market(s.market));
        state.apply(Fact::Amm(s.derived));
        state.apply(Fact::Token(s.token_fact));

        // The pool listed the pair in reverse order: the join key is
        // wrapped SOL and every orientation-sensitive field is flipped.
        let mut swapped = s.observed.clone();
        std::mem::swap(&mut swapped.token_mint, &mut swapped.currency_mint);
        std::mem::swap(&mut swapped.pool_coin_vault, &mut swapped.pool_pc_vault);
        std::mem::swap(
            &mut swapped.initial_live.pooled_token,
            &mut swapped.initial_live.pooled_native,
        );
        swapped.initial_live.price = 1.0 / swapped.initial_live.price;

        let record = state.apply(Fact::Amm(swapped)).unwrap();

        assert_eq!(record.token_address(), s.token);
        assert_eq!(record.observed_amm.token_mint, s.token);
        assert_eq!(record.observed_amm.currency_mint, WSOL_MINT);
        assert_eq!(record.observed_amm.pool_coin_vault, s.observed.pool_coin_vault);
        assert_eq!(record.observed_amm.initial_live.pooled_native, 1000.0);
        assert_eq!(record.observed_amm.initial_live.pooled_token, 500_000.0);
        assert!((record.observed_amm.initial_live.price - 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_vault_mismatch_is_reconciled_from_derived() {
        let s = scenario();
        let mut state = JoinState::default();

        state.apply(Fact::Market(s.market));
        state.apply(Fact::Amm(s.derived.clone()));
        state.apply(Fact::Token(s.token_fact));

        let mut observed = s.observed;
        observed.pool_coin_vault = Pubkey::new_unique();
        observed.pool_pc_vault = Pubkey::new_unique();

        let record = state.apply(Fact::Amm(observed)).unwrap();

        // Derived wins for both vaults.
        assert_eq!(record.observed_amm.pool_coin_vault, s.derived.pool_coin_vault);
        assert_eq!(record.observed_amm.pool_pc_vault, s.derived.pool_pc_vault);
    }

    #[test]
    fn test_duplicate_market_is_dropped() {
        let s = scenario();
        let mut state = JoinState::default();

        state.apply(Fact::Market(s.market.clone()));
        state.apply(Fact::Market(s.market));

        assert_eq!(state.pairs.len(), 1);
    }

    #[test]
    fn test_facts_after_emission_are_dropped() {
        let s = scenario();
        let mut state = JoinState::default();

        state.apply(Fact::Market(s.market.clone()));
        state.apply(Fact::Amm(s.derived));
        state.apply(Fact::Token(s.token_fact));
        assert!(state.apply(Fact::Amm(s.observed.clone())).is_some());

        // At most one record per token: replays do not resurrect it.
        assert!(state.apply(Fact::Market(s.market)).is_none());
        assert!(state.apply(Fact::Amm(s.observed)).is_none());
        assert!(state.pairs.is_empty());
    }

    #[test]
    fn test_orphan_facts_are_dropped() {
        let s = scenario();
        let mut state = JoinState::default();

        assert!(state.apply(Fact::Token(s.token_fact)).is_none());
        assert!(state.apply(Fact::Amm(s.observed)).is_none());
        assert!(state.pairs.is_empty());
        assert!(state.created.is_empty());
    }

    #[test]
    fn test_zero_native_liquidity_drops_record() {
        let s = scenario();
        let mut state = JoinState::default();

        state.apply(Fact::Market(s.market));
        state.apply(Fact::Amm(s.derived));
        state.apply(Fact::Token(s.token_fact));

        let mut observed = s.observed;
        observed.initial_live.pooled_native = 0.0;
        observed.initial_live.price = f64::INFINITY;

        assert!(state.apply(Fact::Amm(observed)).is_none());

        // All facts arrived but the pool never became tradable; the record
        // is gone and nothing was emitted.
        assert!(state.pairs.is_empty());
        assert!(state.created.is_empty());
    }

    #[test]
    fn test_observed_amm_before_token_fact_drops_record() {
        let s = scenario();
        let mut state = JoinState::default();

        state.apply(Fact::Market(s.market));
        state.apply(Fact::Amm(s.derived));

        // Once the observed pool fact lands, the record must be complete;
        // a missing token fact at that point is a correlation failure.
        assert!(state.apply(Fact::Amm(s.observed)).is_none());
        assert!(state.pairs.is_empty());

        assert!(state.apply(Fact::Token(s.token_fact)).is_none());
    }

    #[tokio::test]
    async fn test_collector_lifecycle_emits_through_channels() {
        let s = scenario();

        let mut collector = PairCollector::new();
        let (pair_tx, mut pair_rx) = mpsc::channel(4);
        collector.start(vec![pair_tx]).unwrap();
        assert!(collector.start(Vec::new()).is_err());

        let input = collector.channel();
        input.send(Fact::Market(s.market)).await.unwrap();
        input.send(Fact::Amm(s.derived)).await.unwrap();
        input.send(Fact::Token(s.token_fact)).await.unwrap();
        input.send(Fact::Amm(s.observed)).await.unwrap();
        drop(input);

        let record = pair_rx.recv().await.unwrap();
        assert_eq!(record.token_address(), s.token);
        assert!(record.ready());

        collector.stop(Duration::from_secs(1)).await.unwrap();
    }
}
