//! RocksDB-backed registry.
//!
//! Uses the `"identities"` (name -> DID string) and `"roots"` (name ->
//! binary CIDv1) column families of the shared database. RocksDB has
//! no compare-and-swap, so writes to one name are serialized through a
//! fixed set of lock stripes selected by a randomly keyed hash of the name.

use std::hash::{BuildHasher, RandomState};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{AccountRegistry, BindOutcome, RegistryError};
use crate::auth::Did;
use crate::storage::rocksdb::{CF_IDENTITIES, CF_ROOTS, column_family};
use crate::storage::{RocksDb, StorageError};
use crate::types::Cid;

const LOCK_STRIPES: usize = 64;

pub struct RocksDbRegistry {
    db: Arc<RocksDb>,
    stripes: Box<[Mutex<()>]>,
    hasher: RandomState,
}

impl RocksDbRegistry {
    pub fn new(db: Arc<RocksDb>) -> Self {
        Self {
            db,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn lock(&self, name: &str) -> Result<MutexGuard<'_, ()>, RegistryError> {
        let index = (self.hasher.hash_one(name) % LOCK_STRIPES as u64) as usize;
        self.stripes[index]
            .lock()
            .map_err(|_| RegistryError::Storage(StorageError::Poisoned("registry stripe")))
    }
}

impl AccountRegistry for RocksDbRegistry {
    fn lookup(&self, name: &str) -> Result<Option<Cid>, RegistryError> {
        let cf = column_family(&self.db, CF_ROOTS)?;
        let Some(bytes) = self.db.get_pinned_cf(&cf, name).map_err(StorageError::from)? else {
            return Ok(None);
        };
        let cid = Cid::try_from(&bytes[..])
            .map_err(|e| StorageError::Corrupted(format!("root of {name}: {e}")))?;
        Ok(Some(cid))
    }

    fn identity(&self, name: &str) -> Result<Option<Did>, RegistryError> {
        let cf = column_family(&self.db, CF_IDENTITIES)?;
        let Some(bytes) = self.db.get_pinned_cf(&cf, name).map_err(StorageError::from)? else {
            return Ok(None);
        };
        let did = std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| Did::parse(s).ok())
            .ok_or_else(|| StorageError::Corrupted(format!("identity of {name}")))?;
        Ok(Some(did))
    }

    fn bind(&self, name: &str, identity: &Did) -> Result<BindOutcome, RegistryError> {
        let _guard = self.lock(name)?;
        match self.identity(name)? {
            Some(bound) if bound == *identity => Ok(BindOutcome::AlreadyBound),
            Some(bound) => Err(RegistryError::NameTaken {
                name: name.to_string(),
                bound,
            }),
            None => {
                let cf = column_family(&self.db, CF_IDENTITIES)?;
                self.db
                    .put_cf(&cf, name, identity.as_str())
                    .map_err(StorageError::from)?;
                Ok(BindOutcome::Created)
            }
        }
    }

    fn advance(&self, name: &str, expected: Option<&Cid>, new: Cid) -> Result<(), RegistryError> {
        let _guard = self.lock(name)?;
        if self.identity(name)?.is_none() {
            return Err(RegistryError::UnknownAccount(name.to_string()));
        }
        let current = self.lookup(name)?;
        if current.as_ref() != expected {
            return Err(RegistryError::Conflict { current });
        }
        let cf = column_family(&self.db, CF_ROOTS)?;
        self.db
            .put_cf(&cf, name, new.to_bytes())
            .map_err(StorageError::from)?;
        Ok(())
    }
}
