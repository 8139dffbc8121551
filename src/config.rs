//! Declarative endpoint configuration.
//!
//! The pipeline is driven by a TOML file listing the RPC endpoints it may
//! use. Endpoints flagged as observers additionally carry the two log
//! subscriptions on their websocket URL.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Config path resolved relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// A single RPC endpoint entry.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// HTTP(S) JSON-RPC URL.
    pub rpc: String,
    /// Websocket URL for log subscriptions.
    pub ws: String,
    /// Whether this endpoint also runs a log observer.
    #[serde(default)]
    pub observer: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Endpoint name -> endpoint entry.
    #[serde(rename = "Nodes")]
    pub nodes: HashMap<String, NodeConfig>,
}

impl Config {
    /// Load and parse the configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file: {}", path.as_ref().display()))?;

        let config: Self =
            toml::from_str(&content).context("failed to parse TOML configuration")?;

        Ok(config)
    }
}
