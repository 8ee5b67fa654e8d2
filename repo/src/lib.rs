//! Repository host library crate.
//!
//! This crate provides the core building blocks of a personal data
//! repository host: users push updated content-addressed graphs, gated by
//! capability tokens, and anyone can fetch an account's current graph.
//!
//! - strongly-typed domain types: CIDs, blocks, DAG-CBOR nodes, account records (`types`),
//! - block storage backends (`storage`),
//! - the CARv1 archive codec (`car`),
//! - graph completeness verification (`graph`),
//! - capability-token authorization (`auth`),
//! - the account registry (`registry`),
//! - the update protocol engine (`protocol`),
//! - Prometheus-based metrics (`metrics`),
//! - and a top-level configuration (`config`).
//!
//! Binaries compose these pieces; see the `api-gateway` crate for the HTTP
//! surface.

pub mod auth;
pub mod car;
pub mod config;
pub mod deadline;
pub mod graph;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod storage;
pub mod types;

// Re-export top-level configuration types.
pub use config::{LimitsConfig, MetricsConfig, RepoConfig, StorageConfig};

// Re-export the protocol surface.
pub use protocol::{
    CancellationToken, Deadline, DropGuard, ProtocolError, RegisterOutcome, RepoEngine, RepoError,
    UpdateOutcome, UpdateRequest,
};

// Re-export authorization entry points.
pub use auth::{AuthError, CapabilityVerifier, Did};

// Re-export storage and registry backends.
pub use registry::{AccountRegistry, MemoryRegistry, RocksDbRegistry, SharedRegistry};
pub use storage::{
    BlockStore, MemoryBlockStore, RocksDbBlockStore, RocksDbConfig, SharedBlockStore, StorageError,
};

// Re-export metrics registry and protocol metrics.
pub use metrics::{MetricsRegistry, RepoMetrics, run_prometheus_http_server};

// Re-export domain types at the crate root for convenience.
pub use types::*;

/// Engine over type-erased stores, as assembled by [`open_engine`].
pub type DefaultRepoEngine = RepoEngine<SharedBlockStore, SharedRegistry>;

/// Builds an engine from configuration.
///
/// With [`StorageConfig::RocksDb`] the block store and registry share one
/// database.
pub fn open_engine(config: &RepoConfig) -> Result<DefaultRepoEngine, OpenError> {
    let server_did = Did::parse(&config.server_did).map_err(OpenError::ServerDid)?;
    let verifier = CapabilityVerifier::new(server_did, config.limits.clock_skew);

    let (durable, registry): (SharedBlockStore, SharedRegistry) = match &config.storage {
        StorageConfig::Memory => (
            std::sync::Arc::new(MemoryBlockStore::new()),
            std::sync::Arc::new(MemoryRegistry::new()),
        ),
        StorageConfig::RocksDb(cfg) => {
            let db = storage::open_db(cfg).map_err(OpenError::Storage)?;
            (
                std::sync::Arc::new(RocksDbBlockStore::new(db.clone())),
                std::sync::Arc::new(RocksDbRegistry::new(db)),
            )
        }
    };

    Ok(RepoEngine::new(
        durable,
        registry,
        verifier,
        config.limits.clone(),
    ))
}

/// Why [`open_engine`] failed.
#[derive(Debug)]
pub enum OpenError {
    ServerDid(auth::DidError),
    Storage(StorageError),
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpenError::ServerDid(e) => write!(f, "invalid server DID: {e}"),
            OpenError::Storage(e) => write!(f, "failed to open storage: {e}"),
        }
    }
}

impl std::error::Error for OpenError {}
