//! Core domain types used by the repository host.
//!
//! Blocks are addressed by CIDv1 identifiers ([`Cid`]) whose multihash is
//! BLAKE3-256. Two block [`Codec`]s are understood: opaque `raw` leaves and
//! DAG-CBOR nodes, whose links are found by decoding them as IPLD. As in the
//! rest of the crate, public APIs take these types rather than naked byte
//! buffers.

use std::fmt;

use bytes::Bytes;
use cid::Version;
use multihash_codetable::{Code, MultihashDigest};
use serde::Serialize;

/// Account records decoded from the root block of a submitted graph.
pub mod account;
/// DAG-CBOR encoding and link scanning.
pub mod node;

pub use account::{AccountRecord, RecordError, empty_posts_node, empty_posts_root};
pub use cid::{Cid, Error as CidError};
pub use node::NodeError;

/// Multihash code of BLAKE3-256, the only hash this host accepts.
pub const BLAKE3_256: u64 = 0x1e;

/// Content type of a block's bytes.
///
/// The codec decides how a block is scanned for outbound links: raw
/// blocks are opaque leaves, DAG-CBOR blocks are decoded as IPLD.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Codec {
    /// Opaque bytes without links (e.g. media attachments).
    Raw,
    /// A DAG-CBOR encoded IPLD node.
    DagCbor,
}

impl Codec {
    /// Multicodec code carried in the [`Cid`].
    pub const fn code(self) -> u64 {
        match self {
            Codec::Raw => 0x55,
            Codec::DagCbor => 0x71,
        }
    }

    /// Inverse of [`Codec::code`].
    pub const fn from_code(code: u64) -> Option<Self> {
        match code {
            0x55 => Some(Codec::Raw),
            0x71 => Some(Codec::DagCbor),
            _ => None,
        }
    }
}

/// Hashes `data` with BLAKE3-256 and returns the CIDv1 addressing it under
/// `codec`.
pub fn compute_cid(codec: Codec, data: &[u8]) -> Cid {
    Cid::new_v1(codec.code(), Code::Blake3_256.digest(data))
}

/// An immutable byte payload together with the CID addressing it.
///
/// Blocks are cheap to clone (the payload is reference-counted) and are
/// never mutated after construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    cid: Cid,
    data: Bytes,
}

impl Block {
    /// Hashes `data` and wraps it as a block of the given codec.
    pub fn new(codec: Codec, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let cid = compute_cid(codec, &data);
        Self { cid, data }
    }

    /// Wraps an untrusted `(cid, data)` pair, recomputing the digest.
    ///
    /// Fails unless the CID is a v1 BLAKE3-256 identifier with a known codec
    /// whose digest matches `data`.
    pub fn verified(cid: Cid, data: impl Into<Bytes>) -> Result<Self, BlockError> {
        if cid.version() != Version::V1 {
            return Err(BlockError::Version(cid));
        }
        let codec = Codec::from_code(cid.codec()).ok_or(BlockError::Codec(cid.codec()))?;
        if cid.hash().code() != BLAKE3_256 {
            return Err(BlockError::Hash(cid.hash().code()));
        }

        let data = data.into();
        let actual = compute_cid(codec, &data);
        if actual != cid {
            return Err(BlockError::DigestMismatch { claimed: cid, actual });
        }
        Ok(Self { cid, data })
    }

    /// Reassembles a block read back from one of our own stores.
    pub(crate) fn from_trusted_parts(cid: Cid, data: Bytes) -> Self {
        Self { cid, data }
    }

    /// Encodes `value` as a DAG-CBOR block.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self, NodeError> {
        Ok(Self::new(Codec::DagCbor, node::encode(value)?))
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    /// Codec named by the CID. Blocks only exist for known codecs.
    pub fn codec(&self) -> Option<Codec> {
        Codec::from_code(self.cid.codec())
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Scans the block for outbound links according to its codec.
    pub fn links(&self) -> Result<Vec<Cid>, NodeError> {
        match self.codec() {
            Some(Codec::DagCbor) => node::links(&self.data),
            Some(Codec::Raw) | None => Ok(Vec::new()),
        }
    }
}

/// Error returned when a block's bytes do not match its claimed CID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    /// Only CIDv1 is accepted.
    Version(Cid),
    /// Unknown multicodec.
    Codec(u64),
    /// Multihash other than BLAKE3-256.
    Hash(u64),
    DigestMismatch { claimed: Cid, actual: Cid },
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::Version(cid) => write!(f, "cid {cid} is not a CIDv1"),
            BlockError::Codec(code) => write!(f, "unsupported codec {code:#x}"),
            BlockError::Hash(code) => write!(f, "unsupported multihash {code:#x}"),
            BlockError::DigestMismatch { claimed, actual } => {
                write!(f, "block bytes hash to {actual} but were sent as {claimed}")
            }
        }
    }
}

impl std::error::Error for BlockError {}
