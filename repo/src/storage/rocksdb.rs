//! RocksDB-backed block store.
//!
//! A single RocksDB instance holds all persistent state, split into
//! dedicated column families:
//!
//! - `"blocks"`:     maps the binary CIDv1 -> block bytes,
//! - `"roots"`:      account name -> current root CID (see [`crate::registry`]),
//! - `"identities"`: account name -> owning DID (see [`crate::registry`]).
//!
//! The database is opened with [`open_db`] and shared via `Arc` between the
//! block store and the registry.

use std::{path::Path, sync::Arc};

use bytes::Bytes;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options,
};

use super::{BlockStore, CidIter, StorageError};
use crate::types::{Block, Cid};

/// RocksDB handle type used throughout the crate.
pub type RocksDb = DBWithThreadMode<MultiThreaded>;

pub(crate) const CF_BLOCKS: &str = "blocks";
pub(crate) const CF_ROOTS: &str = "roots";
pub(crate) const CF_IDENTITIES: &str = "identities";

/// Configuration for the RocksDB backends.
#[derive(Clone, Debug)]
pub struct RocksDbConfig {
    /// Filesystem path to the RocksDB database directory.
    pub path: String,
    /// Whether to create the database and missing column families if they
    /// do not yet exist.
    pub create_if_missing: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            path: "data/repo-db".to_string(),
            create_if_missing: true,
        }
    }
}

/// Opens (or creates) the database with every column family the crate uses.
///
/// The `"default"` column family is also created to keep RocksDB happy,
/// but it is not currently used.
pub fn open_db(cfg: &RocksDbConfig) -> Result<Arc<RocksDb>, StorageError> {
    let path = Path::new(&cfg.path);

    let mut opts = Options::default();
    opts.create_if_missing(cfg.create_if_missing);
    opts.create_missing_column_families(cfg.create_if_missing);

    let cfs = vec![
        ColumnFamilyDescriptor::new("default", Options::default()),
        ColumnFamilyDescriptor::new(CF_BLOCKS, Options::default()),
        ColumnFamilyDescriptor::new(CF_ROOTS, Options::default()),
        ColumnFamilyDescriptor::new(CF_IDENTITIES, Options::default()),
    ];

    let db = RocksDb::open_cf_descriptors(&opts, path, cfs)?;
    Ok(Arc::new(db))
}

/// Looks up a column family handle by name.
pub(crate) fn column_family<'a>(
    db: &'a RocksDb,
    name: &'static str,
) -> Result<Arc<BoundColumnFamily<'a>>, StorageError> {
    db.cf_handle(name)
        .ok_or(StorageError::MissingColumnFamily(name))
}

/// RocksDB-backed implementation of [`BlockStore`].
#[derive(Clone)]
pub struct RocksDbBlockStore {
    db: Arc<RocksDb>,
}

impl RocksDbBlockStore {
    /// Wraps an already opened database.
    pub fn new(db: Arc<RocksDb>) -> Self {
        Self { db }
    }

    /// Opens the database at `cfg.path` and wraps it.
    pub fn open(cfg: &RocksDbConfig) -> Result<Self, StorageError> {
        Ok(Self::new(open_db(cfg)?))
    }

    /// Returns the shared database handle, e.g. to build a registry on it.
    pub fn db(&self) -> &Arc<RocksDb> {
        &self.db
    }
}

impl BlockStore for RocksDbBlockStore {
    fn has(&self, cid: &Cid) -> Result<bool, StorageError> {
        let cf = column_family(&self.db, CF_BLOCKS)?;
        Ok(self.db.get_pinned_cf(&cf, cid.to_bytes())?.is_some())
    }

    fn get(&self, cid: &Cid) -> Result<Option<Block>, StorageError> {
        let cf = column_family(&self.db, CF_BLOCKS)?;
        Ok(self
            .db
            .get_cf(&cf, cid.to_bytes())?
            .map(|bytes| Block::from_trusted_parts(*cid, Bytes::from(bytes))))
    }

    fn put(&self, block: Block) -> Result<(), StorageError> {
        let cf = column_family(&self.db, CF_BLOCKS)?;
        // Same key always carries the same bytes, so blind overwrites are safe.
        self.db.put_cf(&cf, block.cid().to_bytes(), block.data())?;
        Ok(())
    }

    fn all_cids(&self) -> CidIter<'_> {
        let cf = match column_family(&self.db, CF_BLOCKS) {
            Ok(cf) => cf,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        Box::new(iter.map(|item| {
            let (key, _) = item?;
            Cid::try_from(&key[..]).map_err(|e| StorageError::Corrupted(format!("block key: {e}")))
        }))
    }
}
