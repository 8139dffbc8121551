//! Order-book market facts.
//!
//! Captures the InitializeMarket instruction of the OpenBook DEX program:
//! the market account set, the base/quote mints normalized to the
//! token-versus-wrapped-SOL convention, and the derived vault signer PDA.

use crate::onchain::WSOL_MINT;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use solana_sdk::pubkey;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::VersionedTransaction;

/// The OpenBook DEX program id.
pub const OPENBOOK_PROGRAM: Pubkey = pubkey!("srmqPvymJeFKQ4zGQed1GFppgkRHL9kaELCbyksJtPX");

/// Minimum account count of an InitializeMarket instruction.
const INIT_MARKET_MIN_ACCOUNTS: usize = 10;

/// Everything captured from a market initialization.
///
/// `base_mint` is always the traded token and `quote_mint` always wrapped
/// SOL after extraction; `swapped` records whether the instruction listed
/// them in the reverse orientation.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketFact {
    pub program_id: Pubkey,
    pub market: Pubkey,
    pub request_queue: Pubkey,
    pub event_queue: Pubkey,
    pub bids: Pubkey,
    pub asks: Pubkey,
    pub base_mint: Pubkey,
    pub quote_mint: Pubkey,
    pub base_vault: Pubkey,
    pub quote_vault: Pubkey,

    /// Wallet that signed the initialization.
    pub caller: Pubkey,
    pub signature: Signature,
    pub slot: u64,
    /// On-chain block time, unix seconds.
    pub block_time: i64,
    /// Wall-clock time the transaction was analyzed.
    pub discovered_at: DateTime<Utc>,
    pub swapped: bool,

    /// PDA authorized to move the market vaults.
    pub vault_signer: Pubkey,
}

impl Default for MarketFact {
    fn default() -> Self {
        Self {
            program_id: OPENBOOK_PROGRAM,
            market: Pubkey::default(),
            request_queue: Pubkey::default(),
            event_queue: Pubkey::default(),
            bids: Pubkey::default(),
            asks: Pubkey::default(),
            base_mint: Pubkey::default(),
            quote_mint: Pubkey::default(),
            base_vault: Pubkey::default(),
            quote_vault: Pubkey::default(),
            caller: Pubkey::default(),
            signature: Signature::default(),
            slot: 0,
            block_time: 0,
            discovered_at: DateTime::UNIX_EPOCH,
            swapped: false,
            vault_signer: Pubkey::default(),
        }
    }
}

impl MarketFact {
    /// Extract the market fact from a decoded transaction.
    ///
    /// Scans for the first OpenBook instruction with enough accounts,
    /// rejects markets not quoted in wrapped SOL, and normalizes the
    /// base/quote orientation.
    pub fn from_transaction(tx: &VersionedTransaction, slot: u64, block_time: i64) -> Result<Self> {
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
            if *program != OPENBOOK_PROGRAM {
                continue;
            }
            if instruction.accounts.len() < INIT_MARKET_MIN_ACCOUNTS {
                continue;
            }

            const BASE_MINT_INDEX: usize = 7;
            const QUOTE_MINT_INDEX: usize = 8;

            if safe_key(instruction.accounts[BASE_MINT_INDEX]) != WSOL_MINT
                && safe_key(instruction.accounts[QUOTE_MINT_INDEX]) != WSOL_MINT
            {
                bail!("found market, but not quoted in wrapped SOL");
            }

            let mut fact = MarketFact {
                market: safe_key(instruction.accounts[0]),
                request_queue: safe_key(instruction.accounts[1]),
                event_queue: safe_key(instruction.accounts[2]),
                bids: safe_key(instruction.accounts[3]),
                asks: safe_key(instruction.accounts[4]),
                base_vault: safe_key(instruction.accounts[5]),
                quote_vault: safe_key(instruction.accounts[6]),
                base_mint: safe_key(instruction.accounts[BASE_MINT_INDEX]),
                quote_mint: safe_key(instruction.accounts[QUOTE_MINT_INDEX]),
                ..Default::default()
            };

            // The instruction listed the pair in reverse order; normalize
            // to token/WSOL.
            if fact.base_mint == WSOL_MINT {
                std::mem::swap(&mut fact.base_vault, &mut fact.quote_vault);
                std::mem::swap(&mut fact.base_mint, &mut fact.quote_mint);
                fact.swapped = true;
            }

            fact.caller = account_keys.first().copied().unwrap_or_default();
            fact.signature = tx.signatures.first().copied().unwrap_or_default();

            // InitializeMarket documents vault_signer_nonce at data bytes
            // 5..13, but the extended instruction envelope observed
            // on-chain carries it at 23..31.
            if instruction.data.len() < 31 {
                bail!(
                    "instruction data too short for vault signer nonce: {} bytes",
                    instruction.data.len()
                );
            }
            let nonce = &instruction.data[23..31];
            fact.vault_signer =
                Pubkey::create_program_address(&[fact.market.as_ref(), nonce], &OPENBOOK_PROGRAM)
                    .context("failed to derive vault signer")?;

            fact.slot = slot;
            fact.block_time = block_time;
            fact.discovered_at = Utc::now();

            if !fact.ready() {
                bail!("extracted market fact is incomplete");
            }

            return Ok(fact);
        }

        bail!("no InitializeMarket instruction found")
    }

    /// The traded token; join key for the pair collector.
    pub fn token_address(&self) -> Pubkey {
        self.base_mint
    }

    /// All fields a downstream consumer relies on are populated.
    pub fn ready(&self) -> bool {
        self.market != Pubkey::default()
            && self.event_queue != Pubkey::default()
            && self.bids != Pubkey::default()
            && self.asks != Pubkey::default()
            && self.base_mint != Pubkey::default()
            && self.quote_mint != Pubkey::default()
            && self.base_vault != Pubkey::default()
            && self.quote_vault != Pubkey::default()
            && self.caller != Pubkey::default()
            && self.signature != Signature::default()
            && self.slot != 0
            && self.block_time != 0
            && self.discovered_at != DateTime::UNIX_EPOCH
            && self.vault_signer != Pubkey::default()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use solana_sdk::hash::Hash;
    use solana_sdk::instruction::CompiledInstruction;
    use solana_sdk::message::{Message, MessageHeader, VersionedMessage};

    /// Smallest nonce whose program address derivation succeeds for the
    /// given market, mirroring how vault signers are picked on-chain.
    pub(crate) fn find_vault_signer_nonce(market: &Pubkey) -> u64 {
        (0u64..)
            .find(|nonce| {
                Pubkey::create_program_address(
                    &[market.as_ref(), &nonce.to_le_bytes()],
                    &OPENBOOK_PROGRAM,
                )
                .is_ok()
            })
            .unwrap()
    }

    pub(crate) fn build_init_market_tx(
        base_mint: Pubkey,
        quote_mint: Pubkey,
    ) -> VersionedTransaction {
        let caller = Pubkey::new_unique();
        let market = Pubkey::new_unique();
        let accounts: Vec<Pubkey> = vec![
            caller,
            market,
            Pubkey::new_unique(), // request queue
            Pubkey::new_unique(), // event queue
            Pubkey::new_unique(), // bids
            Pubkey::new_unique(), // asks
            Pubkey::new_unique(), // base vault
            Pubkey::new_unique(), // quote vault
            base_mint,
            quote_mint,
            Pubkey::new_unique(), // rent sysvar
            OPENBOOK_PROGRAM,
        ];

        let mut data = vec![0u8; 39];
        let nonce = find_vault_signer_nonce(&market);
        data[23..31].copy_from_slice(&nonce.to_le_bytes());

        let instruction = CompiledInstruction {
            program_id_index: 11,
            accounts: vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
            data,
        };

        let message = Message {
            header: MessageHeader {
                num_required_signatures: 1,
                num_readonly_signed_accounts: 0,
                num_readonly_unsigned_accounts: 0,
            },
            account_keys: accounts,
            recent_blockhash: Hash::default(),
            instructions: vec![instruction],
        };

        VersionedTransaction {
            signatures: vec![Signature::from([7u8; 64])],
            message: VersionedMessage::Legacy(message),
        }
    }

    #[test]
    fn test_extracts_canonical_orientation() {
        let token = Pubkey::new_unique();
        let tx = build_init_market_tx(token, WSOL_MINT);

        let fact = MarketFact::from_transaction(&tx, 1234, 1_700_000_000).unwrap();

        assert!(!fact.swapped);
        assert_eq!(fact.base_mint, token);
        assert_eq!(fact.quote_mint, WSOL_MINT);
        assert_eq!(fact.token_address(), token);
        assert_eq!(fact.slot, 1234);
        assert_eq!(fact.block_time, 1_700_000_000);
        assert!(fact.ready());
    }

    #[test]
    fn test_normalizes_reversed_orientation() {
        let token = Pubkey::new_unique();
        let tx = build_init_market_tx(WSOL_MINT, token);

        let fact = MarketFact::from_transaction(&tx, 1, 1_700_000_000).unwrap();

        // Exactly one side is wrapped SOL, and after normalization it is
        // the quote side; the vaults moved with their mints.
        assert!(fact.swapped);
        assert_eq!(fact.base_mint, token);
        assert_eq!(fact.quote_mint, WSOL_MINT);

        let keys = tx.message.static_account_keys();
        assert_eq!(fact.base_vault, keys[7]);
        assert_eq!(fact.quote_vault, keys[6]);
    }

    #[test]
    fn test_rejects_market_without_sol_side() {
        let tx = build_init_market_tx(Pubkey::new_unique(), Pubkey::new_unique());

        let err = MarketFact::from_transaction(&tx, 1, 1).unwrap_err();
        assert!(err.to_string().contains("not quoted in wrapped SOL"));
    }

    #[test]
    fn test_rejects_transaction_without_market_instruction() {
        let tx = build_init_market_tx(Pubkey::new_unique(), WSOL_MINT);
        let mut other = tx.clone();
        if let VersionedMessage::Legacy(message) = &mut other.message {
            // Repoint the instruction at a non-OpenBook program.
            message.account_keys[11] = Pubkey::new_unique();
        }

        assert!(MarketFact::from_transaction(&other, 1, 1).is_err());
    }

    #[test]
    fn test_ready_requires_vault_signer() {
        let tx = build_init_market_tx(Pubkey::new_unique(), WSOL_MINT);
        let mut fact = MarketFact::from_transaction(&tx, 1, 1_700_000_000).unwrap();
        assert!(fact.ready());

        fact.vault_signer = Pubkey::default();
        assert!(!fact.ready());
    }
}
