use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{AccountRegistry, BindOutcome, RegistryError};
use crate::auth::Did;
use crate::types::Cid;

#[derive(Clone, Debug)]
struct AccountEntry {
    identity: Did,
    root: Option<Cid>,
}

/// In-memory registry. Each entry is updated under its shard lock, so
/// `advance` is atomic per name.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    accounts: DashMap<String, AccountEntry>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl AccountRegistry for MemoryRegistry {
    fn lookup(&self, name: &str) -> Result<Option<Cid>, RegistryError> {
        Ok(self.accounts.get(name).and_then(|e| e.root))
    }

    fn identity(&self, name: &str) -> Result<Option<Did>, RegistryError> {
        Ok(self.accounts.get(name).map(|e| e.identity.clone()))
    }

    fn bind(&self, name: &str, identity: &Did) -> Result<BindOutcome, RegistryError> {
        match self.accounts.entry(name.to_string()) {
            Entry::Occupied(e) if e.get().identity == *identity => Ok(BindOutcome::AlreadyBound),
            Entry::Occupied(e) => Err(RegistryError::NameTaken {
                name: name.to_string(),
                bound: e.get().identity.clone(),
            }),
            Entry::Vacant(e) => {
                e.insert(AccountEntry {
                    identity: identity.clone(),
                    root: None,
                });
                Ok(BindOutcome::Created)
            }
        }
    }

    fn advance(&self, name: &str, expected: Option<&Cid>, new: Cid) -> Result<(), RegistryError> {
        let mut entry = self
            .accounts
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownAccount(name.to_string()))?;
        if entry.root.as_ref() != expected {
            return Err(RegistryError::Conflict {
                current: entry.root,
            });
        }
        entry.root = Some(new);
        Ok(())
    }
}
