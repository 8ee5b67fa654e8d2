//! API gateway configuration.
//!
//! Every option can be given on the command line or through the
//! environment. [`ApiConfig::repo_config`] turns the parsed options into
//! the library's [`RepoConfig`].

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use repo::{LimitsConfig, MetricsConfig, RepoConfig, RocksDbConfig, StorageConfig};

/// Personal data repository host
#[derive(Parser, Clone, Debug)]
#[command(name = "api-gateway", version, about = "Personal data repository host")]
pub struct ApiConfig {
    /// Address to bind the HTTP API to
    #[arg(long, env = "REPO_LISTEN_ADDR", default_value = "0.0.0.0:2583")]
    pub listen_addr: SocketAddr,

    /// DID of this server; tokens must name it as their audience
    #[arg(long, env = "REPO_SERVER_DID", default_value = "did:web:localhost")]
    pub server_did: String,

    /// RocksDB directory for blocks and the account registry
    #[arg(long, env = "REPO_DATA_DIR", default_value = "data/repo-db")]
    pub data_dir: String,

    /// Keep everything in memory (lost on restart)
    #[arg(long, env = "REPO_IN_MEMORY")]
    pub in_memory: bool,

    /// Largest accepted update archive, in bytes
    #[arg(long, env = "REPO_MAX_ARCHIVE_BYTES", default_value_t = LimitsConfig::default().max_archive_bytes)]
    pub max_archive_bytes: usize,

    /// Seconds an update or export may run before it is abandoned
    #[arg(long, env = "REPO_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Address of the Prometheus `/metrics` listener
    #[arg(long, env = "REPO_METRICS_ADDR", default_value = "127.0.0.1:9898")]
    pub metrics_addr: SocketAddr,

    /// Do not start the metrics listener
    #[arg(long, env = "REPO_NO_METRICS")]
    pub no_metrics: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "REPO_JSON_LOGS")]
    pub json_logs: bool,
}

impl ApiConfig {
    pub fn repo_config(&self) -> RepoConfig {
        let storage = if self.in_memory {
            StorageConfig::Memory
        } else {
            StorageConfig::RocksDb(RocksDbConfig {
                path: self.data_dir.clone(),
                create_if_missing: true,
            })
        };

        RepoConfig {
            server_did: self.server_did.clone(),
            storage,
            limits: LimitsConfig {
                max_archive_bytes: self.max_archive_bytes,
                update_timeout: Duration::from_secs(self.request_timeout_secs),
                ..LimitsConfig::default()
            },
            metrics: MetricsConfig {
                enabled: !self.no_metrics,
                listen_addr: self.metrics_addr,
            },
        }
    }
}
