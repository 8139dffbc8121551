//! pairscout - real-time discovery of freshly created Raydium pairs.
//!
//! Watches the chain for new OpenBook market initializations and Raydium
//! pool creations, correlates them per base token, and emits a consolidated
//! record the moment a pair becomes tradable.

pub mod config;
pub mod connection;
pub mod onchain;

// Re-export the main pipeline types for convenience.
pub use onchain::{Fact, LogObserver, PairCollector, PairRecord, SeenLogSet, TxAnalyzer};
