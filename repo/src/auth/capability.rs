//! Resources, abilities, and the rule deciding whether an attenuation
//! covers a requested action.
//!
//! A resource names what a capability applies to. The only resource kind
//! the repository understands is `account:<name>`; anything else parses
//! as [`Resource::Unknown`] and never matches. An ability is
//! `<namespace>/<action>`, where the action `*` covers every action in the
//! namespace. Abilities compare case-insensitively, account names exactly.

use std::fmt;

use super::token::AttenuationClaim;

const ACCOUNT_SCHEME: &str = "account:";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resource {
    Account(String),
    Unknown(String),
}

impl Resource {
    pub fn parse(s: &str) -> Self {
        match s.strip_prefix(ACCOUNT_SCHEME) {
            Some(name) if !name.is_empty() => Resource::Account(name.to_string()),
            _ => Resource::Unknown(s.to_string()),
        }
    }

    pub fn account(name: &str) -> Self {
        Resource::Account(name.to_string())
    }

    fn names_account(&self, account: &str) -> bool {
        matches!(self, Resource::Account(name) if name == account)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Account(name) => write!(f, "{ACCOUNT_SCHEME}{name}"),
            Resource::Unknown(raw) => f.write_str(raw),
        }
    }
}

/// Actions the repository authorizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    /// Replace an account's root.
    PostUpdate,
}

impl Action {
    pub fn namespace(self) -> &'static str {
        match self {
            Action::PostUpdate => "post",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Action::PostUpdate => "update",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace(), self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ability {
    namespace: String,
    action: Option<String>,
}

impl Ability {
    /// Parses `<namespace>/<action>`. `None` if either part is empty.
    pub fn parse(s: &str) -> Option<Self> {
        let (namespace, action) = s.split_once('/')?;
        if namespace.is_empty() || action.is_empty() {
            return None;
        }
        let action = (action != "*").then(|| action.to_ascii_lowercase());
        Some(Self {
            namespace: namespace.to_ascii_lowercase(),
            action,
        })
    }

    pub fn covers(&self, action: Action) -> bool {
        self.namespace == action.namespace()
            && self.action.as_deref().is_none_or(|a| a == action.name())
    }
}

/// One (resource, ability) grant carried by a token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attenuation {
    pub resource: Resource,
    /// `None` when the ability string was unparseable; such a grant covers
    /// nothing.
    pub ability: Option<Ability>,
}

impl Attenuation {
    pub fn covers(&self, account: &str, action: Action) -> bool {
        self.resource.names_account(account)
            && self.ability.as_ref().is_some_and(|a| a.covers(action))
    }
}

impl From<&AttenuationClaim> for Attenuation {
    fn from(claim: &AttenuationClaim) -> Self {
        Self {
            resource: Resource::parse(&claim.with),
            ability: Ability::parse(&claim.can),
        }
    }
}
