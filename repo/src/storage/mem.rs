//! In-memory block store.
//!
//! Used as the per-request staging area while an archive is ingested, and
//! as the durable store in tests and small deployments. All blocks live in
//! a `HashMap` keyed by [`Cid`] behind an `RwLock` that is held only for a
//! single map operation.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;

use super::{BlockStore, CidIter, StorageError};
use crate::types::{Block, Cid};

/// In-memory implementation of [`BlockStore`].
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<Cid, Bytes>>,
}

impl MemoryBlockStore {
    /// Creates a new, empty in-memory block store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of blocks currently stored.
    pub fn len(&self) -> usize {
        self.blocks.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Returns `true` if no blocks are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockStore for MemoryBlockStore {
    fn has(&self, cid: &Cid) -> Result<bool, StorageError> {
        let blocks = self
            .blocks
            .read()
            .map_err(|_| StorageError::Poisoned("memory block store"))?;
        Ok(blocks.contains_key(cid))
    }

    fn get(&self, cid: &Cid) -> Result<Option<Block>, StorageError> {
        let blocks = self
            .blocks
            .read()
            .map_err(|_| StorageError::Poisoned("memory block store"))?;
        Ok(blocks
            .get(cid)
            .map(|data| Block::from_trusted_parts(*cid, data.clone())))
    }

    fn put(&self, block: Block) -> Result<(), StorageError> {
        let mut blocks = self
            .blocks
            .write()
            .map_err(|_| StorageError::Poisoned("memory block store"))?;
        blocks
            .entry(*block.cid())
            .or_insert_with(|| block.data().clone());
        Ok(())
    }

    fn all_cids(&self) -> CidIter<'_> {
        match self.blocks.read() {
            Ok(blocks) => {
                let snapshot: Vec<Cid> = blocks.keys().copied().collect();
                Box::new(snapshot.into_iter().map(Ok))
            }
            Err(_) => Box::new(std::iter::once(Err(StorageError::Poisoned(
                "memory block store",
            )))),
        }
    }
}
