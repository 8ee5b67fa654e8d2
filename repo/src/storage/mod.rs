//! Content-addressed block storage.
//!
//! This module defines the [`BlockStore`] trait shared by the staging store
//! used while ingesting an archive and the durable store that holds every
//! committed graph, together with two backends:
//!
//! - an in-memory store ([`mem::MemoryBlockStore`]) used for staging and tests,
//! - a RocksDB-backed store ([`rocksdb::RocksDbBlockStore`]) for persistent
//!   deployments.
//!
//! Stores take `&self` everywhere: concurrent reads and concurrent writes of
//! distinct (or identical) keys need no external locking, since a key always
//! maps to the same bytes.

use std::fmt;
use std::sync::Arc;

use crate::deadline::{Cancelled, Deadline};
use crate::types::{Block, Cid};

pub mod mem;
pub mod rocksdb;

pub use mem::MemoryBlockStore;
pub use self::rocksdb::{RocksDb, RocksDbBlockStore, RocksDbConfig, open_db};

/// Storage-level error type.
#[derive(Debug)]
pub enum StorageError {
    /// Underlying RocksDB error.
    RocksDb(::rocksdb::Error),
    /// Required column family was not found.
    MissingColumnFamily(&'static str),
    /// Corrupted or malformed persisted data (e.g. a key with the wrong length).
    Corrupted(String),
    /// A lock guarding in-memory state was poisoned by a panicking writer.
    Poisoned(&'static str),
}

impl From<::rocksdb::Error> for StorageError {
    fn from(e: ::rocksdb::Error) -> Self {
        StorageError::RocksDb(e)
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::RocksDb(e) => write!(f, "rocksdb: {e}"),
            StorageError::MissingColumnFamily(name) => write!(f, "missing column family `{name}`"),
            StorageError::Corrupted(msg) => write!(f, "corrupted storage: {msg}"),
            StorageError::Poisoned(what) => write!(f, "{what} lock poisoned"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Lazy sequence of every CID held by a store.
pub type CidIter<'a> = Box<dyn Iterator<Item = Result<Cid, StorageError>> + 'a>;

/// Abstract content-addressed block storage.
///
/// Implementations can be backed by in-memory maps, RocksDB, etc. `put` is
/// idempotent: writing a block whose CID is already present is a no-op.
pub trait BlockStore: Send + Sync {
    /// Returns `true` if a block with this CID is present.
    fn has(&self, cid: &Cid) -> Result<bool, StorageError>;

    /// Fetches a block by CID, if present.
    fn get(&self, cid: &Cid) -> Result<Option<Block>, StorageError>;

    /// Persists a block.
    fn put(&self, block: Block) -> Result<(), StorageError>;

    /// Enumerates every stored CID.
    fn all_cids(&self) -> CidIter<'_>;
}

impl<T: BlockStore + ?Sized> BlockStore for Arc<T> {
    fn has(&self, cid: &Cid) -> Result<bool, StorageError> {
        (**self).has(cid)
    }

    fn get(&self, cid: &Cid) -> Result<Option<Block>, StorageError> {
        (**self).get(cid)
    }

    fn put(&self, block: Block) -> Result<(), StorageError> {
        (**self).put(block)
    }

    fn all_cids(&self) -> CidIter<'_> {
        (**self).all_cids()
    }
}

/// Shared, type-erased block store handle.
pub type SharedBlockStore = Arc<dyn BlockStore>;

/// Why [`copy_all`] stopped.
#[derive(Debug)]
pub enum CopyError {
    Storage(StorageError),
    Cancelled,
}

impl From<StorageError> for CopyError {
    fn from(e: StorageError) -> Self {
        CopyError::Storage(e)
    }
}

impl From<Cancelled> for CopyError {
    fn from(_: Cancelled) -> Self {
        CopyError::Cancelled
    }
}

impl fmt::Display for CopyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyError::Storage(e) => write!(f, "{e}"),
            CopyError::Cancelled => write!(f, "copy cancelled"),
        }
    }
}

impl std::error::Error for CopyError {}

/// Puts every block of `from` into `to`, checking `deadline` before each
/// put. Returns the number of blocks copied.
///
/// Not atomic: on error, blocks copied so far stay in `to`. Since every
/// key maps to fixed bytes, that leaves `to` consistent, only larger.
pub fn copy_all<A, B>(from: &A, to: &B, deadline: &Deadline) -> Result<usize, CopyError>
where
    A: BlockStore + ?Sized,
    B: BlockStore + ?Sized,
{
    let mut copied = 0;
    for cid in from.all_cids() {
        let cid = cid?;
        deadline.check()?;
        if let Some(block) = from.get(&cid)? {
            to.put(block)?;
            copied += 1;
        }
    }
    Ok(copied)
}
