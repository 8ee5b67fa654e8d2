//! Account registry.
//!
//! Maps each account name to the identity that owns it and to the CID of
//! the account's current root block. Two rules hold for every backend:
//!
//! - an identity binding is written once; re-binding the same identity is
//!   a no-op and binding a different one fails,
//! - a root only moves through [`AccountRegistry::advance`], a
//!   compare-and-swap against the root the caller last observed.
//!
//! Backends:
//! - [`mem::MemoryRegistry`] for tests and ephemeral deployments,
//! - [`rocksdb::RocksDbRegistry`] sharing the block store's database.

use std::fmt;
use std::sync::Arc;

use crate::auth::Did;
use crate::storage::StorageError;
use crate::types::Cid;

pub mod mem;
pub mod rocksdb;

pub use mem::MemoryRegistry;
pub use self::rocksdb::RocksDbRegistry;

/// Result of [`AccountRegistry::bind`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindOutcome {
    /// The name was free and is now bound.
    Created,
    /// The name was already bound to the same identity.
    AlreadyBound,
}

#[derive(Debug)]
pub enum RegistryError {
    /// The name has no bound identity.
    UnknownAccount(String),
    /// The name is bound to a different identity.
    NameTaken { name: String, bound: Did },
    /// The root moved since the caller observed it.
    Conflict { current: Option<Cid> },
    Storage(StorageError),
}

impl From<StorageError> for RegistryError {
    fn from(e: StorageError) -> Self {
        RegistryError::Storage(e)
    }
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::UnknownAccount(name) => write!(f, "unknown account {name}"),
            RegistryError::NameTaken { name, bound } => {
                write!(f, "account {name} is bound to {bound}")
            }
            RegistryError::Conflict { current: Some(cid) } => {
                write!(f, "root moved concurrently; current root is {cid}")
            }
            RegistryError::Conflict { current: None } => {
                write!(f, "root moved concurrently; account has no root")
            }
            RegistryError::Storage(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Name -> (identity, current root) mapping.
pub trait AccountRegistry: Send + Sync {
    /// Current root of `name`, if it has one.
    fn lookup(&self, name: &str) -> Result<Option<Cid>, RegistryError>;

    /// Identity bound to `name`, if any.
    fn identity(&self, name: &str) -> Result<Option<Did>, RegistryError>;

    /// Binds `name` to `identity` unless it is already bound.
    fn bind(&self, name: &str, identity: &Did) -> Result<BindOutcome, RegistryError>;

    /// Sets the root of `name` to `new` if its current root equals
    /// `expected` (`None` meaning "no root yet").
    fn advance(&self, name: &str, expected: Option<&Cid>, new: Cid) -> Result<(), RegistryError>;
}

impl<T: AccountRegistry + ?Sized> AccountRegistry for Arc<T> {
    fn lookup(&self, name: &str) -> Result<Option<Cid>, RegistryError> {
        (**self).lookup(name)
    }

    fn identity(&self, name: &str) -> Result<Option<Did>, RegistryError> {
        (**self).identity(name)
    }

    fn bind(&self, name: &str, identity: &Did) -> Result<BindOutcome, RegistryError> {
        (**self).bind(name, identity)
    }

    fn advance(&self, name: &str, expected: Option<&Cid>, new: Cid) -> Result<(), RegistryError> {
        (**self).advance(name, expected, new)
    }
}

pub type SharedRegistry = Arc<dyn AccountRegistry>;
