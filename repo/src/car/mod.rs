//! Archive codec for block graphs.
//!
//! Archives are CARv1 streams, read and written with `iroh-car`: a
//! DAG-CBOR header declaring the roots followed by length-prefixed
//! `cid || bytes` sections. This module adds what the host needs on top of
//! the raw format:
//!
//! - [`ArchiveReader`] bounds the size of each block and recomputes the
//!   digest of every block it yields,
//! - [`write_car`] walks a store from the given roots and emits each
//!   reachable block exactly once, root first.

use std::collections::HashSet;
use std::fmt;

use iroh_car::{CarHeader, CarReader, CarWriter};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::deadline::{Cancelled, Deadline};
use crate::storage::{BlockStore, StorageError};
use crate::types::{Block, BlockError, Cid, NodeError};

/// Default upper bound on the bytes of a single block.
pub const DEFAULT_MAX_BLOCK_BYTES: usize = 1 << 20;

/// Errors produced while reading or writing archives.
#[derive(Debug)]
pub enum CarError {
    /// The stream is not a well-formed CARv1 archive, or the underlying
    /// reader/writer failed.
    Format(iroh_car::Error),
    /// A section carries more block bytes than allowed.
    BlockTooLarge { len: usize, max: usize },
    /// Section bytes do not hash to the section CID.
    Block(BlockError),
    /// Store failure while exporting.
    Storage(StorageError),
    /// A block reachable from an exported root is not in the store.
    MissingBlock(Cid),
    /// A stored block could not be scanned for links while exporting.
    Node(Cid, NodeError),
    /// Export ran past its deadline.
    Cancelled,
}

impl From<iroh_car::Error> for CarError {
    fn from(e: iroh_car::Error) -> Self {
        CarError::Format(e)
    }
}

impl From<StorageError> for CarError {
    fn from(e: StorageError) -> Self {
        CarError::Storage(e)
    }
}

impl From<Cancelled> for CarError {
    fn from(_: Cancelled) -> Self {
        CarError::Cancelled
    }
}

impl fmt::Display for CarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CarError::Format(e) => write!(f, "archive: {e}"),
            CarError::BlockTooLarge { len, max } => {
                write!(f, "archive block of {len} bytes exceeds {max}")
            }
            CarError::Block(e) => write!(f, "archive section: {e}"),
            CarError::Storage(e) => write!(f, "{e}"),
            CarError::MissingBlock(cid) => write!(f, "block {cid} missing from store"),
            CarError::Node(cid, e) => write!(f, "block {cid}: {e}"),
            CarError::Cancelled => write!(f, "archive export cancelled"),
        }
    }
}

impl std::error::Error for CarError {}

/// Lazy, verifying archive decoder.
///
/// The header is read eagerly by [`ArchiveReader::new`] so callers can
/// inspect the declared roots before pulling any block.
pub struct ArchiveReader<R> {
    inner: CarReader<R>,
    max_block_bytes: usize,
}

impl<R: AsyncRead + Send + Unpin> ArchiveReader<R> {
    /// Reads the header, allowing blocks up to [`DEFAULT_MAX_BLOCK_BYTES`].
    pub async fn new(reader: R) -> Result<Self, CarError> {
        Self::with_max_block(reader, DEFAULT_MAX_BLOCK_BYTES).await
    }

    /// Reads the header; blocks larger than `max_block_bytes` are rejected
    /// when reached.
    pub async fn with_max_block(reader: R, max_block_bytes: usize) -> Result<Self, CarError> {
        let inner = CarReader::new(reader).await?;
        Ok(Self {
            inner,
            max_block_bytes,
        })
    }

    pub fn roots(&self) -> &[Cid] {
        self.inner.header().roots()
    }

    /// Reads the next block, verifying its CID. `Ok(None)` at end of stream.
    pub async fn next_block(&mut self) -> Result<Option<Block>, CarError> {
        let Some((cid, data)) = self.inner.next_block().await? else {
            return Ok(None);
        };
        if data.len() > self.max_block_bytes {
            return Err(CarError::BlockTooLarge {
                len: data.len(),
                max: self.max_block_bytes,
            });
        }
        Block::verified(cid, data).map(Some).map_err(CarError::Block)
    }

    /// Reads every remaining block.
    pub async fn collect_blocks(mut self) -> Result<Vec<Block>, CarError> {
        let mut blocks = Vec::new();
        while let Some(block) = self.next_block().await? {
            blocks.push(block);
        }
        Ok(blocks)
    }
}

/// Streaming archive encoder.
pub struct ArchiveWriter<W> {
    inner: CarWriter<W>,
    blocks_written: usize,
}

impl<W: AsyncWrite + Send + Unpin> ArchiveWriter<W> {
    /// Starts an archive declaring `roots`. The header goes out with the
    /// first block.
    pub fn new(out: W, roots: &[Cid]) -> Self {
        Self {
            inner: CarWriter::new(CarHeader::new_v1(roots.to_vec()), out),
            blocks_written: 0,
        }
    }

    pub async fn write_block(&mut self, block: &Block) -> Result<(), CarError> {
        self.inner.write(*block.cid(), block.data()).await?;
        self.blocks_written += 1;
        Ok(())
    }

    pub fn blocks_written(&self) -> usize {
        self.blocks_written
    }

    /// Flushes the sink and returns the number of blocks written.
    pub async fn finish(mut self) -> Result<usize, CarError> {
        self.inner.finish().await?;
        Ok(self.blocks_written)
    }
}

/// Writes an archive of everything reachable from `roots` in `store`.
///
/// Blocks are emitted depth-first, each root before its children, each
/// block at most once. Returns the number of blocks written.
pub async fn write_car<S, W>(
    store: &S,
    roots: &[Cid],
    out: W,
    deadline: &Deadline,
) -> Result<usize, CarError>
where
    S: BlockStore + ?Sized,
    W: AsyncWrite + Send + Unpin,
{
    let mut writer = ArchiveWriter::new(out, roots);
    let mut seen: HashSet<Cid> = HashSet::new();
    let mut stack: Vec<Cid> = roots.iter().rev().copied().collect();

    while let Some(cid) = stack.pop() {
        if !seen.insert(cid) {
            continue;
        }
        deadline.check()?;

        let block = store.get(&cid)?.ok_or(CarError::MissingBlock(cid))?;
        writer.write_block(&block).await?;

        let links = block.links().map_err(|e| CarError::Node(cid, e))?;
        stack.extend(links.into_iter().rev().filter(|l| !seen.contains(l)));
    }

    writer.finish().await
}
