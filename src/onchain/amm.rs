//! AMM pool facts.
//!
//! Two sources produce an [`AmmFact`]: the init-liquidity instruction of
//! the Raydium Liquidity Pool V4 program (the observed fact), and
//! deterministic PDA derivation from a freshly discovered market (the
//! calculated fact, used as an oracle to cross-check the observed vaults).

use crate::onchain::market::MarketFact;
use crate::onchain::WSOL_MINT;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use solana_sdk::pubkey;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::VersionedTransaction;
use tracing::info;

/// Raydium Liquidity Pool V4 program id; its init-liquidity instruction
/// creates new pairs.
pub const RAYDIUM_AMM_PROGRAM: Pubkey = pubkey!("675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8");

/// Raydium pool authority; holds the pooled tokens of every V4 pair.
pub const RAYDIUM_AMM_AUTHORITY: Pubkey = pubkey!("5Q544fKrFoe6tsEbD7S8EmxGTJYAKtTVhAW5Q5pge4j1");

/// Minimum account count of the init-liquidity instruction.
const INIT_LIQUIDITY_MIN_ACCOUNTS: usize = 21;

/// Live pool state, either from the init log (initial) or refreshed later.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveInfo {
    /// Pool trading open time, unix seconds.
    pub update_time: i64,
    /// Pooled wrapped SOL.
    pub pooled_native: f64,
    /// Pooled base token.
    pub pooled_token: f64,
    /// Token per native price.
    pub price: f64,
    /// Whether the LP tokens were burned (false = not burned or unknown).
    pub lp_burned: bool,
    /// Whether further minting is disabled (false = enabled or unknown).
    pub mint_disabled: bool,
}

impl LiveInfo {
    pub fn ready(&self) -> bool {
        self.update_time != 0
            && self.pooled_native > 0.0
            && self.pooled_token > 0.0
            && self.price > 0.0
    }
}

/// Numeric fields logged by the init-liquidity instruction.
#[derive(Debug, Deserialize)]
struct InitLiquidityLog {
    #[allow(dead_code)]
    nonce: f64,
    open_time: f64,
    init_pc_amount: f64,
    init_coin_amount: f64,
}

/// Everything captured (or derived) about a freshly created pool.
#[derive(Debug, Clone, PartialEq)]
pub struct AmmFact {
    pub program_id: Pubkey,
    pub amm_id: Pubkey,
    pub authority: Pubkey,
    pub open_orders: Pubkey,
    pub lp_mint: Pubkey,
    pub token_mint: Pubkey,
    /// Always wrapped SOL once canonicalized.
    pub currency_mint: Pubkey,
    pub pool_coin_vault: Pubkey,
    pub pool_pc_vault: Pubkey,
    pub target_orders: Pubkey,
    /// Account receiving the creator's LP tokens.
    pub liquidity_creator: Pubkey,
    /// True when derived from a market via PDA math rather than observed
    /// in an instruction.
    pub calculated: bool,

    pub caller: Pubkey,
    pub signature: Signature,
    pub slot: u64,
    /// On-chain block time, unix seconds.
    pub block_time: i64,
    /// Wall-clock time the transaction was analyzed.
    pub discovered_at: DateTime<Utc>,

    /// State at pool creation, parsed from the instruction log.
    pub initial_live: LiveInfo,
    /// Most recent known state; seeded from `initial_live`.
    pub current_live: LiveInfo,
}

impl Default for AmmFact {
    fn default() -> Self {
        Self {
            program_id: RAYDIUM_AMM_PROGRAM,
            amm_id: Pubkey::default(),
            authority: RAYDIUM_AMM_AUTHORITY,
            open_orders: Pubkey::default(),
            lp_mint: Pubkey::default(),
            token_mint: Pubkey::default(),
            currency_mint: WSOL_MINT,
            pool_coin_vault: Pubkey::default(),
            pool_pc_vault: Pubkey::default(),
            target_orders: Pubkey::default(),
            liquidity_creator: Pubkey::default(),
            calculated: false,
            caller: Pubkey::default(),
            signature: Signature::default(),
            slot: 0,
            block_time: 0,
            discovered_at: DateTime::UNIX_EPOCH,
            initial_live: LiveInfo::default(),
            current_live: LiveInfo::default(),
        }
    }
}

impl AmmFact {
    /// Derive the pool account set a market will get, before the pool
    /// exists on-chain. All six addresses are PDAs of the market under the
    /// AMM program.
    pub fn derive_from_market(market: &MarketFact) -> Self {
        let derive = |seed: &[u8]| -> Pubkey {
            Pubkey::find_program_address(
                &[RAYDIUM_AMM_PROGRAM.as_ref(), market.market.as_ref(), seed],
                &RAYDIUM_AMM_PROGRAM,
            )
            .0
        };

        let mut fact = AmmFact {
            amm_id: derive(b"amm_associated_seed"),
            pool_coin_vault: derive(b"coin_vault_associated_seed"),
            pool_pc_vault: derive(b"pc_vault_associated_seed"),
            lp_mint: derive(b"lp_mint_associated_seed"),
            target_orders: derive(b"target_associated_seed"),
            open_orders: derive(b"open_order_associated_seed"),
            token_mint: market.base_mint,
            currency_mint: market.quote_mint,
            calculated: true,
            signature: market.signature,
            block_time: market.block_time,
            ..Default::default()
        };

        fact.canonicalize(false);
        fact
    }

    /// Extract the observed fact from a decoded init-liquidity transaction
    /// and its parsed instruction log.
    pub fn from_transaction(
        tx: &VersionedTransaction,
        payload: &serde_json::Value,
        slot: u64,
        block_time: i64,
    ) -> Result<Self> {
        let account_keys = tx.message.static_account_keys();
        let safe_key = |idx: u8| -> Pubkey {
            account_keys
                .get(idx as usize)
                .copied()
                .unwrap_or_default()
        };

        for instruction in tx.message.instructions() {
            let Some(program) = account_keys.get(instruction.program_id_index as usize) else {
                continue;
            };
            if *program != RAYDIUM_AMM_PROGRAM {
                continue;
            }
            if instruction.accounts.len() < INIT_LIQUIDITY_MIN_ACCOUNTS {
                continue;
            }

            let log: InitLiquidityLog = serde_json::from_value(payload.clone())
                .context("init-liquidity log payload does not match expected shape")?;

            let initial_live = LiveInfo {
                update_time: log.open_time as i64,
                pooled_native: log.init_pc_amount,
                pooled_token: log.init_coin_amount,
                price: log.init_coin_amount / log.init_pc_amount,
                ..Default::default()
            };

            let fact = AmmFact {
                amm_id: safe_key(instruction.accounts[4]),
                open_orders: safe_key(instruction.accounts[6]),
                lp_mint: safe_key(instruction.accounts[7]),
                token_mint: safe_key(instruction.accounts[8]),
                currency_mint: safe_key(instruction.accounts[9]),
                pool_coin_vault: safe_key(instruction.accounts[10]),
                pool_pc_vault: safe_key(instruction.accounts[11]),
                target_orders: safe_key(instruction.accounts[12]),
                liquidity_creator: safe_key(instruction.accounts[20]),
                caller: account_keys.first().copied().unwrap_or_default(),
                signature: tx.signatures.first().copied().unwrap_or_default(),
                slot,
                block_time,
                discovered_at: Utc::now(),
                initial_live,
                ..Default::default()
            };

            return Ok(fact);
        }

        bail!("no init-liquidity instruction found")
    }

    /// Rewrite the fact into token/WSOL orientation and seed the current
    /// live state from the initial one. Applying the swap twice is the
    /// identity.
    pub fn canonicalize(&mut self, swapped: bool) {
        if swapped {
            info!(
                token = %self.currency_mint,
                currency = %self.token_mint,
                "normalizing reversed pool orientation"
            );
            std::mem::swap(&mut self.token_mint, &mut self.currency_mint);
            std::mem::swap(&mut self.pool_coin_vault, &mut self.pool_pc_vault);
            std::mem::swap(
                &mut self.initial_live.pooled_token,
                &mut self.initial_live.pooled_native,
            );
            self.initial_live.price = 1.0 / self.initial_live.price;
        }

        self.current_live = self.initial_live.clone();
    }

    /// The base-token mint; join key for the pair collector.
    pub fn token_address(&self) -> Pubkey {
        self.token_mint
    }

    /// All fields a downstream consumer relies on are populated and the
    /// pool holds live liquidity.
    pub fn ready(&self) -> bool {
        self.amm_id != Pubkey::default()
            && self.open_orders != Pubkey::default()
            && self.lp_mint != Pubkey::default()
            && self.token_mint != Pubkey::default()
            && self.pool_coin_vault != Pubkey::default()
            && self.pool_pc_vault != Pubkey::default()
            && self.target_orders != Pubkey::default()
            && self.liquidity_creator != Pubkey::default()
            && self.caller != Pubkey::default()
            && self.signature != Signature::default()
            && self.slot != 0
            && self.block_time != 0
            && self.discovered_at != DateTime::UNIX_EPOCH
            && self.initial_live.ready()
            && self.current_live.ready()
    }
}
