//! Error types for the update protocol.

use std::fmt;
use std::io;

use crate::auth::AuthError;
use crate::car::CarError;
use crate::deadline::Cancelled;
use crate::graph::VerifyError;
use crate::storage::{CopyError, StorageError};
use crate::types::{Cid, RecordError};

/// The request is well-authenticated but not acceptable as sent.
#[derive(Debug)]
pub enum ProtocolError {
    /// The archive must declare exactly one root.
    RootCount(usize),
    /// The root block is not a valid account record.
    BadAccountRecord(RecordError),
    /// Account names are 1-64 characters of `[a-z0-9._-]`.
    InvalidName(String),
    /// The record names a different owner than the account's bound identity.
    IdentityMismatch { account: String },
    /// `next_post` went backwards.
    CounterRegressed { current: u64, submitted: u64 },
    /// The archive does not decode.
    Archive(CarError),
    ArchiveTooLarge { limit: usize },
    TooManyBlocks { limit: usize },
    BlockTooLarge { limit: usize },
}

impl ProtocolError {
    /// `true` for rejections caused by a configured size bound.
    pub fn exceeds_limit(&self) -> bool {
        matches!(
            self,
            ProtocolError::ArchiveTooLarge { .. }
                | ProtocolError::TooManyBlocks { .. }
                | ProtocolError::BlockTooLarge { .. }
        )
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::RootCount(n) => {
                write!(f, "archive must declare exactly one root, found {n}")
            }
            ProtocolError::BadAccountRecord(e) => write!(f, "{e}"),
            ProtocolError::InvalidName(name) => write!(f, "invalid account name {name:?}"),
            ProtocolError::IdentityMismatch { account } => {
                write!(f, "account record did does not match the owner of {account}")
            }
            ProtocolError::CounterRegressed { current, submitted } => {
                write!(f, "next_post went from {current} back to {submitted}")
            }
            ProtocolError::Archive(e) => write!(f, "{e}"),
            ProtocolError::ArchiveTooLarge { limit } => {
                write!(f, "archive exceeds {limit} bytes")
            }
            ProtocolError::TooManyBlocks { limit } => {
                write!(f, "archive holds more than {limit} blocks")
            }
            ProtocolError::BlockTooLarge { limit } => {
                write!(f, "archive holds a block larger than {limit} bytes")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Any failure of a [`RepoEngine`](super::RepoEngine) operation.
#[derive(Debug)]
pub enum RepoError {
    Auth(AuthError),
    Protocol(ProtocolError),
    /// No such account.
    NotFound(String),
    /// A block reachable from the submitted root is in neither the batch
    /// nor the durable store.
    Integrity { missing: Cid },
    /// The account's root moved since it was observed.
    Conflict {
        account: String,
        current: Option<Cid>,
    },
    Storage(StorageError),
    /// Writing an export failed.
    Io(io::Error),
    /// The deadline passed or the caller went away.
    Cancelled,
}

impl RepoError {
    /// Short, stable label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            RepoError::Auth(_) => "auth",
            RepoError::Protocol(e) if e.exceeds_limit() => "limit",
            RepoError::Protocol(_) => "protocol",
            RepoError::NotFound(_) => "not_found",
            RepoError::Integrity { .. } => "integrity",
            RepoError::Conflict { .. } => "conflict",
            RepoError::Storage(_) | RepoError::Io(_) => "storage",
            RepoError::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepoError::Auth(e) => write!(f, "not authorized: {e}"),
            RepoError::Protocol(e) => write!(f, "{e}"),
            RepoError::NotFound(name) => write!(f, "account {name} not found"),
            RepoError::Integrity { missing } => {
                write!(f, "graph incomplete: block {missing} is missing")
            }
            RepoError::Conflict {
                account,
                current: Some(cid),
            } => write!(f, "root of {account} moved; current root is {cid}"),
            RepoError::Conflict {
                account,
                current: None,
            } => write!(f, "root of {account} moved; account has no root"),
            RepoError::Storage(e) => write!(f, "storage: {e}"),
            RepoError::Io(e) => write!(f, "i/o: {e}"),
            RepoError::Cancelled => write!(f, "operation cancelled or deadline exceeded"),
        }
    }
}

impl std::error::Error for RepoError {}

impl From<AuthError> for RepoError {
    fn from(e: AuthError) -> Self {
        RepoError::Auth(e)
    }
}

impl From<ProtocolError> for RepoError {
    fn from(e: ProtocolError) -> Self {
        RepoError::Protocol(e)
    }
}

impl From<StorageError> for RepoError {
    fn from(e: StorageError) -> Self {
        RepoError::Storage(e)
    }
}

impl From<Cancelled> for RepoError {
    fn from(_: Cancelled) -> Self {
        RepoError::Cancelled
    }
}

impl From<CopyError> for RepoError {
    fn from(e: CopyError) -> Self {
        match e {
            CopyError::Storage(e) => RepoError::Storage(e),
            CopyError::Cancelled => RepoError::Cancelled,
        }
    }
}

impl From<VerifyError> for RepoError {
    fn from(e: VerifyError) -> Self {
        match e {
            VerifyError::Missing(cid) => RepoError::Integrity { missing: cid },
            VerifyError::Malformed(cid, e) => RepoError::Protocol(ProtocolError::Archive(
                CarError::Node(cid, e),
            )),
            VerifyError::Storage(e) => RepoError::Storage(e),
            VerifyError::Cancelled => RepoError::Cancelled,
        }
    }
}
