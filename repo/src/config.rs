//! Top-level configuration for a repository host.
//!
//! This module aggregates configuration for:
//!
//! - the server's own identity (the audience every token must name),
//! - storage (in-memory, or a RocksDB path and creation flags),
//! - request limits and timeouts for the update protocol,
//! - metrics exporter (enable flag + listen address).
//!
//! Binaries build a [`RepoConfig`] from defaults and override fields from
//! their command line or environment.

use std::net::SocketAddr;
use std::time::Duration;

use crate::storage::RocksDbConfig;

/// Where blocks and registry entries live.
#[derive(Clone, Debug)]
pub enum StorageConfig {
    /// Everything is lost on restart.
    Memory,
    RocksDb(RocksDbConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::RocksDb(RocksDbConfig::default())
    }
}

/// Bounds applied to every update request.
#[derive(Clone, Debug)]
pub struct LimitsConfig {
    /// Largest accepted archive, in bytes.
    pub max_archive_bytes: usize,
    /// Most blocks accepted in one archive.
    pub max_blocks: usize,
    /// Largest accepted single block, in bytes.
    pub max_block_bytes: usize,
    /// Deadline for a whole update, from the moment it is accepted.
    pub update_timeout: Duration,
    /// Allowed disagreement between our clock and a token's `nbf`/`exp`.
    pub clock_skew: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_archive_bytes: 16 * 1024 * 1024,
            max_blocks: 100_000,
            max_block_bytes: 1024 * 1024,
            update_timeout: Duration::from_secs(30),
            clock_skew: Duration::from_secs(60),
        }
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Whether to run a `/metrics` HTTP exporter.
    pub enabled: bool,
    /// Address to bind the metrics HTTP server to.
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        let addr: SocketAddr = "127.0.0.1:9898"
            .parse()
            .expect("hard-coded metrics listen address should parse");
        Self {
            enabled: true,
            listen_addr: addr,
        }
    }
}

/// Top-level configuration for a repository host.
#[derive(Clone, Debug)]
pub struct RepoConfig {
    /// DID of this server; tokens must carry it as their audience.
    pub server_did: String,
    pub storage: StorageConfig,
    pub limits: LimitsConfig,
    pub metrics: MetricsConfig,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            server_did: "did:web:localhost".to_string(),
            storage: StorageConfig::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}
