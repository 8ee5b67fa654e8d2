//! Graph completeness verification.
//!
//! Before a submitted graph is committed, every block reachable from its
//! root must be resolvable either from the staging store (the batch that
//! was just received) or from the durable store. [`verify_completeness`]
//! walks the graph with an explicit worklist:
//!
//! - a CID already present in the durable store is known-good, and its
//!   subtree is **not** descended into (committed history is immutable),
//! - otherwise the block must come from staging, and its links are queued,
//! - a CID absent from both stores fails the walk immediately.
//!
//! Each CID is visited at most once, so the walk terminates on any input and
//! its state is bounded by the size of the staged batch plus one durable
//! lookup per distinct link.

use std::collections::HashSet;
use std::fmt;

use crate::deadline::{Cancelled, Deadline};
use crate::storage::{BlockStore, StorageError};
use crate::types::{Cid, NodeError};

/// Successful verification result.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Completeness {
    /// Staged blocks reachable from the root that the durable store does
    /// not have yet, in visit order.
    pub introduced: Vec<Cid>,
    /// Number of distinct CIDs resolved by the durable store.
    pub durable_hits: usize,
}

/// Reasons a walk can fail.
#[derive(Debug)]
pub enum VerifyError {
    /// A reachable block is in neither store.
    Missing(Cid),
    /// A staged block could not be scanned for links.
    Malformed(Cid, NodeError),
    /// Store failure.
    Storage(StorageError),
    /// The caller's deadline fired.
    Cancelled,
}

impl From<StorageError> for VerifyError {
    fn from(e: StorageError) -> Self {
        VerifyError::Storage(e)
    }
}

impl From<Cancelled> for VerifyError {
    fn from(_: Cancelled) -> Self {
        VerifyError::Cancelled
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::Missing(cid) => write!(f, "graph incomplete: block {cid} is missing"),
            VerifyError::Malformed(cid, e) => write!(f, "block {cid}: {e}"),
            VerifyError::Storage(e) => write!(f, "{e}"),
            VerifyError::Cancelled => write!(f, "verification cancelled"),
        }
    }
}

impl std::error::Error for VerifyError {}

/// Checks that everything reachable from `root` resolves from `staging` or
/// `durable`.
///
/// Read-only: neither store is mutated, whatever the outcome.
pub fn verify_completeness<A, B>(
    root: &Cid,
    staging: &A,
    durable: &B,
    deadline: &Deadline,
) -> Result<Completeness, VerifyError>
where
    A: BlockStore + ?Sized,
    B: BlockStore + ?Sized,
{
    let mut visited: HashSet<Cid> = HashSet::new();
    let mut stack: Vec<Cid> = vec![*root];
    let mut result = Completeness::default();

    while let Some(cid) = stack.pop() {
        if !visited.insert(cid) {
            continue;
        }
        deadline.check()?;

        if durable.has(&cid)? {
            result.durable_hits += 1;
            continue;
        }

        let block = staging.get(&cid)?.ok_or(VerifyError::Missing(cid))?;
        result.introduced.push(cid);

        let links = block
            .links()
            .map_err(|e| VerifyError::Malformed(cid, e))?;
        stack.extend(links.into_iter().rev().filter(|l| !visited.contains(l)));
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CidIter, MemoryBlockStore};
    use crate::types::node::link_list;
    use crate::types::{Block, Codec};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Wraps a store and counts `get` calls.
    struct CountingStore {
        inner: MemoryBlockStore,
        gets: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: MemoryBlockStore::new(),
                gets: AtomicUsize::new(0),
            }
        }

        fn gets(&self) -> usize {
            self.gets.load(Ordering::SeqCst)
        }
    }

    impl BlockStore for CountingStore {
        fn has(&self, cid: &Cid) -> Result<bool, StorageError> {
            self.inner.has(cid)
        }

        fn get(&self, cid: &Cid) -> Result<Option<Block>, StorageError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(cid)
        }

        fn put(&self, block: Block) -> Result<(), StorageError> {
            self.inner.put(block)
        }

        fn all_cids(&self) -> CidIter<'_> {
            self.inner.all_cids()
        }
    }

    fn node(links: Vec<Cid>) -> Block {
        link_list(&links)
    }

    /// root -> {mid -> {leaf_a, leaf_b}, leaf_c}
    fn tree() -> (Block, Block, Vec<Block>) {
        let a = Block::new(Codec::Raw, &b"a"[..]);
        let b = Block::new(Codec::Raw, &b"b"[..]);
        let c = Block::new(Codec::Raw, &b"c"[..]);
        let mid = node(vec![*a.cid(), *b.cid()]);
        let root = node(vec![*mid.cid(), *c.cid()]);
        (root, mid, vec![a, b, c])
    }

    #[test]
    fn fully_staged_graph_is_complete() {
        let (root, mid, leaves) = tree();
        let staging = MemoryBlockStore::new();
        let durable = MemoryBlockStore::new();
        for block in [root.clone(), mid].into_iter().chain(leaves) {
            staging.put(block).unwrap();
        }

        let out = verify_completeness(root.cid(), &staging, &durable, &Deadline::none()).unwrap();
        assert_eq!(out.introduced.len(), 5);
        assert_eq!(out.introduced[0], *root.cid());
        assert_eq!(out.durable_hits, 0);
    }

    #[test]
    fn single_missing_block_is_named() {
        let (root, mid, leaves) = tree();
        let staging = MemoryBlockStore::new();
        let durable = MemoryBlockStore::new();
        let missing = *leaves[1].cid();
        for block in [root.clone(), mid].into_iter().chain(leaves) {
            if *block.cid() != missing {
                staging.put(block).unwrap();
            }
        }

        let err = verify_completeness(root.cid(), &staging, &durable, &Deadline::none()).unwrap_err();
        assert!(matches!(err, VerifyError::Missing(cid) if cid == missing));
        assert!(durable.is_empty());
    }

    #[test]
    fn durable_subtree_is_not_redescended() {
        let (root, mid, leaves) = tree();
        let staging = CountingStore::new();
        let durable = MemoryBlockStore::new();

        // `mid` and its leaves were committed earlier, but the client
        // resent them anyway.
        durable.put(mid.clone()).unwrap();
        durable.put(leaves[0].clone()).unwrap();
        durable.put(leaves[1].clone()).unwrap();
        for block in [root.clone(), mid].into_iter().chain(leaves.clone()) {
            staging.put(block).unwrap();
        }

        let out = verify_completeness(root.cid(), &staging, &durable, &Deadline::none()).unwrap();

        // Only root and leaf_c come from staging.
        assert_eq!(staging.gets(), 2);
        assert_eq!(out.introduced, vec![*root.cid(), *leaves[2].cid()]);
        assert_eq!(out.durable_hits, 1);
    }

    #[test]
    fn durable_root_succeeds_with_empty_batch() {
        let (root, mid, leaves) = tree();
        let staging = CountingStore::new();
        let durable = MemoryBlockStore::new();
        for block in [root.clone(), mid].into_iter().chain(leaves) {
            durable.put(block).unwrap();
        }

        let out = verify_completeness(root.cid(), &staging, &durable, &Deadline::none()).unwrap();
        assert!(out.introduced.is_empty());
        assert_eq!(staging.gets(), 0);
    }

    #[test]
    fn shared_children_are_visited_once() {
        let leaf = Block::new(Codec::Raw, &b"shared"[..]);
        let left = node(vec![*leaf.cid()]);
        let right = node(vec![*leaf.cid(), *leaf.cid()]);
        let root = node(vec![*left.cid(), *right.cid(), *leaf.cid()]);

        let staging = CountingStore::new();
        for block in [root.clone(), left, right, leaf] {
            staging.put(block).unwrap();
        }

        let out = verify_completeness(root.cid(), &staging, &MemoryBlockStore::new(), &Deadline::none())
            .unwrap();
        assert_eq!(out.introduced.len(), 4);
        assert_eq!(staging.gets(), 4);
    }

    #[test]
    fn malformed_staged_node_fails() {
        let bogus = Block::new(Codec::DagCbor, &b"\xff\xffnot a node"[..]);
        let root = node(vec![*bogus.cid()]);
        let staging = MemoryBlockStore::new();
        staging.put(root.clone()).unwrap();
        staging.put(bogus.clone()).unwrap();

        let err = verify_completeness(root.cid(), &staging, &MemoryBlockStore::new(), &Deadline::none())
            .unwrap_err();
        assert!(matches!(err, VerifyError::Malformed(cid, _) if cid == *bogus.cid()));
    }

    #[test]
    fn expired_deadline_stops_the_walk() {
        let (root, _, _) = tree();
        let staging = MemoryBlockStore::new();
        staging.put(root.clone()).unwrap();

        let deadline = Deadline::at(std::time::Instant::now());
        let err = verify_completeness(root.cid(), &staging, &MemoryBlockStore::new(), &deadline)
            .unwrap_err();
        assert!(matches!(err, VerifyError::Cancelled));
    }
}
