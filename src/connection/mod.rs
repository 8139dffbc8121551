//! RPC connectivity: the health-probed, cooldown-aware client pool shared
//! by the log observers and the transaction analyzer.

pub mod pool;

pub use pool::{ClientHandle, PoolError, PooledEndpoint, RpcPool, MAINNET_RPC};
