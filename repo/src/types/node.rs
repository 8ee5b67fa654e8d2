//! DAG-CBOR node payloads.
//!
//! Structured blocks are DAG-CBOR, decoded into the generic IPLD data model
//! to find their links. Scanning uses an explicit stack, so deeply nested
//! input cannot exhaust the call stack once the decoder has accepted it.

use std::fmt;

use ipld_core::ipld::Ipld;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::Cid;

/// Encodes `value` as DAG-CBOR.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, NodeError> {
    serde_ipld_dagcbor::to_vec(value).map_err(|e| NodeError::Encode(e.to_string()))
}

/// Decodes a DAG-CBOR payload, rejecting trailing bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, NodeError> {
    serde_ipld_dagcbor::from_slice(bytes).map_err(|e| NodeError::Decode(e.to_string()))
}

/// Returns every link in a DAG-CBOR payload, in document order.
pub fn links(bytes: &[u8]) -> Result<Vec<Cid>, NodeError> {
    let root: Ipld = decode(bytes)?;

    let mut out = Vec::new();
    let mut stack = vec![&root];
    while let Some(node) = stack.pop() {
        match node {
            Ipld::Link(cid) => out.push(*cid),
            Ipld::List(items) => stack.extend(items.iter().rev()),
            Ipld::Map(entries) => stack.extend(entries.values().rev()),
            _ => {}
        }
    }
    Ok(out)
}

/// Errors produced when encoding or decoding a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    Encode(String),
    /// Bytes are not valid DAG-CBOR.
    Decode(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Encode(msg) => write!(f, "cannot encode node: {msg}"),
            NodeError::Decode(msg) => write!(f, "malformed node: {msg}"),
        }
    }
}

impl std::error::Error for NodeError {}

/// A DAG-CBOR list of links, the smallest interior node.
#[cfg(test)]
pub(crate) fn link_list(links: &[Cid]) -> super::Block {
    let list = Ipld::List(links.iter().copied().map(Ipld::Link).collect());
    super::Block::encode(&list).expect("links always encode")
}
