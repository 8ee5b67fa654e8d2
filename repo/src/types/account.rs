//! Account records.
//!
//! The root block of every submitted graph is a DAG-CBOR map describing one
//! account: its stable name, owning identity, a link to the posts subgraph
//! and a monotonically advancing post counter.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{Block, Cid, Codec, NodeError, node};

/// DAG-CBOR encoding of an empty map.
const EMPTY_MAP: &[u8] = &[0xa0];

/// Decoded root object of an account's graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Stable account name; the registry key.
    pub name: String,
    /// Identity (DID) of the owner.
    pub did: String,
    /// Root of the posts subgraph.
    pub posts: Cid,
    /// Sequence number the next post will receive.
    pub next_post: u64,
}

impl AccountRecord {
    /// The record a freshly registered account starts from.
    pub fn initial(name: impl Into<String>, did: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            did: did.into(),
            posts: empty_posts_root(),
            next_post: 0,
        }
    }

    /// Encodes the record as a DAG-CBOR block.
    ///
    /// # Panics
    ///
    /// Panics if encoding fails. This is considered a programming error,
    /// because every field is a string, a link or an unsigned integer.
    pub fn to_block(&self) -> Block {
        Block::encode(self).expect("AccountRecord should always encode as DAG-CBOR")
    }

    /// Decodes the record held in a root block.
    pub fn from_block(block: &Block) -> Result<Self, RecordError> {
        if block.codec() != Some(Codec::DagCbor) {
            return Err(RecordError::Codec(block.cid().codec()));
        }
        let record: Self = node::decode(block.data()).map_err(RecordError::Node)?;
        if record.name.is_empty() {
            return Err(RecordError::Field("name"));
        }
        Ok(record)
    }
}

/// The canonical empty posts subgraph.
pub fn empty_posts_node() -> Block {
    Block::new(Codec::DagCbor, Bytes::from_static(EMPTY_MAP))
}

/// CID of [`empty_posts_node`]; a deterministic constant.
pub fn empty_posts_root() -> Cid {
    *empty_posts_node().cid()
}

/// Errors produced when a root block is not a valid account record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// Root block is not DAG-CBOR; carries the multicodec found.
    Codec(u64),
    /// Root block does not decode as a record.
    Node(NodeError),
    /// Field present but unacceptable.
    Field(&'static str),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::Codec(code) => write!(f, "account record has codec {code:#x}"),
            RecordError::Node(e) => write!(f, "account record: {e}"),
            RecordError::Field(name) => write!(f, "account record field `{name}` is invalid"),
        }
    }
}

impl std::error::Error for RecordError {}
