use std::path::Path;

use config::{Config, ConfigError, File};
use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::consensus::chain::ChainParams;
use crate::consensus::difficulty::DifficultyParams;
use crate::core::address::{Address, AddressError};
use crate::core::block::Block;
use crate::core::transaction::{CoinbaseTx, Transaction};
use crate::crypto::sha2_256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QrldConfig {
    pub version: u32,
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub genesis: GenesisConfig,
    pub mining: MiningConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub api_port: u16,
    pub p2p_port: u16,
    pub db_path: String,
    pub no_network: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub max_peers: usize,
    pub bootstrap_nodes: Vec<String>,
    /// Distinguishes chains: hashed into the genesis prev_headerhash and
    /// checked during the VE handshake.
    pub network_id: String,
    pub receipt_timeout_ms: u64,
    pub ping_interval_secs: u64,
    pub peer_timeout_secs: i64,
    /// Blocks requested per download burst while syncing.
    pub sync_batch: u64,
    /// How far to walk back when recovering from a fork.
    pub fork_backtrack: u64,
}

/// Consensus-critical parameters (MUST match across all nodes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub timestamp: u64,
    pub difficulty: u64,
    pub target_block_time: u64,
    pub adjustment_cap_pct: u64,
    pub min_difficulty: u64,
    pub max_difficulty: u64,
    pub blocks_per_epoch: u64,
    pub fixed_block_reward: u64,
    pub min_stake_balance: u64,
    pub xmss_tree_height: u8,
    pub block_tx_limit: usize,
    pub allocations: Vec<GenesisAllocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisAllocation {
    pub address: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningConfig {
    pub enabled: bool,
    /// Stake selector credited by our coinbases. Empty disables mining.
    pub mining_address: String,
}

/// Node-local limits (can differ between nodes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub pool_size_cap: usize,
    pub orphan_prune_depth: u64,
    pub stale_watchdog_secs: i64,
    pub sync_grace_secs: i64,
    /// Cached gossip payloads kept for serving SFM requests.
    pub receipt_cache_size: usize,
}

impl Default for QrldConfig {
    fn default() -> Self {
        Self {
            version: 1,
            node: NodeConfig {
                api_port: 19009,
                p2p_port: 19000,
                db_path: "./qrld_data".to_string(),
                no_network: false,
            },
            network: NetworkConfig {
                max_peers: 64,
                bootstrap_nodes: Vec::new(),
                network_id: "qrld-mainnet-v1".to_string(),
                receipt_timeout_ms: 10_000,
                ping_interval_secs: 30,
                peer_timeout_secs: 180,
                sync_batch: 50,
                fork_backtrack: 32,
            },
            genesis: GenesisConfig {
                timestamp: 1_530_000_000,
                difficulty: 5_000,
                target_block_time: 60,
                adjustment_cap_pct: 25,
                min_difficulty: 2,
                max_difficulty: u64::MAX,
                blocks_per_epoch: 100,
                fixed_block_reward: 66_750_000_000,
                min_stake_balance: 100_000_000_000,
                xmss_tree_height: 10,
                block_tx_limit: 1_000,
                allocations: Vec::new(),
            },
            mining: MiningConfig { enabled: false, mining_address: String::new() },
            security: SecurityConfig {
                pool_size_cap: 25_000,
                orphan_prune_depth: 64,
                stale_watchdog_secs: 180,
                sync_grace_secs: 20,
                receipt_cache_size: 4_096,
            },
        }
    }
}

impl QrldConfig {
    /// Load from file with `QRLD__`-prefixed environment overrides
    /// (e.g. `QRLD__NODE__API_PORT=4000`).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("QRLD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        config.try_deserialize()
    }

    /// File config (if any) patched by CLI flags.
    pub fn load_with_overrides(
        config_file: Option<String>,
        api_port: Option<u16>,
        p2p_port: Option<u16>,
        db_path: Option<String>,
        bootstrap: Option<String>,
        mine: bool,
        no_network: bool,
    ) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = config_file {
            Self::from_file(path)?
        } else if Path::new("qrld.toml").exists() {
            Self::from_file("qrld.toml")?
        } else {
            Self::default()
        };

        if let Some(port) = api_port {
            config.node.api_port = port;
        }
        if let Some(port) = p2p_port {
            config.node.p2p_port = port;
        }
        if let Some(path) = db_path {
            config.node.db_path = path;
        }
        if let Some(bootstrap_str) = bootstrap {
            config.network.bootstrap_nodes = bootstrap_str
                .split(',')
                .map(|s| s.trim().to_string())
                .collect();
        }
        if mine {
            config.mining.enabled = true;
        }
        if no_network {
            config.node.no_network = true;
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.node.api_port == self.node.p2p_port {
            return Err("API port and p2p port must differ".into());
        }
        if self.genesis.target_block_time == 0 {
            return Err("target block time must be > 0".into());
        }
        if self.genesis.difficulty == 0 || self.genesis.min_difficulty == 0 {
            return Err("difficulty must be > 0".into());
        }
        if self.genesis.min_difficulty > self.genesis.max_difficulty {
            return Err("min difficulty above max difficulty".into());
        }
        if self.genesis.adjustment_cap_pct == 0 || self.genesis.adjustment_cap_pct >= 100 {
            return Err("adjustment cap must be within 1..100 percent".into());
        }
        if self.genesis.block_tx_limit == 0 {
            return Err("block transaction limit must be > 0".into());
        }
        if self.genesis.xmss_tree_height == 0 || self.genesis.xmss_tree_height > 20 {
            return Err("xmss tree height out of range".into());
        }
        if self.security.pool_size_cap == 0 {
            return Err("pool size cap must be > 0".into());
        }
        if self.mining.enabled && self.mining.mining_address.is_empty() {
            return Err("mining enabled without a mining address".into());
        }
        if self.mining.enabled {
            Address::from_qstring(&self.mining.mining_address)
                .map_err(|e| format!("bad mining address: {e}"))?;
        }
        for alloc in &self.genesis.allocations {
            Address::from_qstring(&alloc.address)
                .map_err(|e| format!("bad genesis allocation address: {e}"))?;
        }
        Ok(())
    }

    pub fn difficulty_params(&self) -> DifficultyParams {
        DifficultyParams {
            target_block_time: self.genesis.target_block_time,
            adjustment_cap_pct: self.genesis.adjustment_cap_pct,
            min_difficulty: U256::from(self.genesis.min_difficulty),
            max_difficulty: U256::from(self.genesis.max_difficulty),
        }
    }

    pub fn chain_params(&self) -> ChainParams {
        ChainParams {
            fixed_reward: self.genesis.fixed_block_reward,
            min_stake_balance: self.genesis.min_stake_balance,
            blocks_per_epoch: self.genesis.blocks_per_epoch,
            block_tx_limit: self.genesis.block_tx_limit,
            genesis_difficulty: U256::from(self.genesis.difficulty),
            difficulty: self.difficulty_params(),
            orphan_prune_depth: self.security.orphan_prune_depth,
        }
    }

    /// The genesis prev_headerhash doubles as the network identifier
    /// exchanged in the VE handshake.
    pub fn genesis_prev_headerhash(&self) -> crate::crypto::Hash32 {
        sha2_256(self.network.network_id.as_bytes())
    }

    /// Deterministic genesis block: one coinbase per allocation.
    pub fn genesis_block(&self) -> Result<Block, AddressError> {
        let mut txs = Vec::with_capacity(self.genesis.allocations.len());
        for (i, alloc) in self.genesis.allocations.iter().enumerate() {
            let address = Address::from_qstring(&alloc.address)?;
            txs.push(Transaction::Coinbase(CoinbaseTx::create(
                address,
                alloc.amount,
                i as u64,
            )));
        }
        Ok(Block::create(
            0,
            self.genesis_prev_headerhash(),
            self.genesis.timestamp,
            txs,
        ))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, toml_string)
    }

    /// Dump the effective configuration at startup.
    pub fn print_effective_config(&self) {
        tracing::info!("qrld node configuration (v{})", self.version);
        tracing::info!("node: api={} p2p={} db={}", self.node.api_port, self.node.p2p_port, self.node.db_path);
        tracing::info!(
            "network: id={} max_peers={} bootstrap={:?}",
            self.network.network_id,
            self.network.max_peers,
            self.network.bootstrap_nodes
        );
        tracing::info!(
            "consensus: block_time={}s genesis_diff={} reward={} tx_limit={}",
            self.genesis.target_block_time,
            self.genesis.difficulty,
            self.genesis.fixed_block_reward,
            self.genesis.block_tx_limit
        );
        tracing::info!(
            "mining: enabled={} address={}",
            self.mining.enabled,
            if self.mining.mining_address.is_empty() { "<none>" } else { &self.mining.mining_address }
        );
        tracing::info!(
            "limits: pool_cap={} orphan_prune_depth={} stale_watchdog={}s",
            self.security.pool_size_cap,
            self.security.orphan_prune_depth,
            self.security.stale_watchdog_secs
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        QrldConfig::default().validate().unwrap();
    }

    #[test]
    fn test_port_conflict_rejected() {
        let mut cfg = QrldConfig::default();
        cfg.node.api_port = cfg.node.p2p_port;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_mining_requires_address() {
        let mut cfg = QrldConfig::default();
        cfg.mining.enabled = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_genesis_block_deterministic_and_network_bound() {
        let cfg = QrldConfig::default();
        let a = cfg.genesis_block().unwrap();
        let b = cfg.genesis_block().unwrap();
        assert_eq!(a.header_hash(), b.header_hash());
        assert_eq!(a.prev_headerhash(), cfg.genesis_prev_headerhash());

        let mut other = QrldConfig::default();
        other.network.network_id = "qrld-testnet-v1".to_string();
        assert_ne!(
            other.genesis_block().unwrap().header_hash(),
            a.header_hash()
        );
    }

    #[test]
    fn test_toml_roundtrip() {
        let cfg = QrldConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: QrldConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.node.api_port, cfg.node.api_port);
        assert_eq!(back.genesis.difficulty, cfg.genesis.difficulty);
    }
}
