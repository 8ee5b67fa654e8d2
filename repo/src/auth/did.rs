//! Decentralized identifiers.
//!
//! Token issuers are `did:key` identities wrapping an Ed25519 public key:
//! `did:key:z` followed by the base58btc encoding of the multicodec prefix
//! `0xed 0x01` and the 32 raw key bytes. The server's own identity (the
//! token audience) may be any DID and is only ever compared as a string.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{PUBLIC_KEY_LENGTH, VerifyingKey};
use serde::{Deserialize, Serialize};

const DID_PREFIX: &str = "did:";
const DID_KEY_PREFIX: &str = "did:key:z";
const ED25519_PUB_MULTICODEC: [u8; 2] = [0xed, 0x01];

/// A decentralized identifier string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Did(String);

impl Did {
    /// Validates the generic `did:<method>:<id>` shape.
    pub fn parse(s: &str) -> Result<Self, DidError> {
        let rest = s.strip_prefix(DID_PREFIX).ok_or(DidError::NotADid)?;
        match rest.split_once(':') {
            Some((method, id)) if !method.is_empty() && !id.is_empty() => Ok(Self(s.to_string())),
            _ => Err(DidError::NotADid),
        }
    }

    /// Derives the `did:key` identity of an Ed25519 public key.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let mut bytes = Vec::with_capacity(2 + PUBLIC_KEY_LENGTH);
        bytes.extend_from_slice(&ED25519_PUB_MULTICODEC);
        bytes.extend_from_slice(key.as_bytes());
        Self(format!("{DID_KEY_PREFIX}{}", bs58::encode(bytes).into_string()))
    }

    /// Extracts the Ed25519 key of a `did:key` identity.
    pub fn verifying_key(&self) -> Result<VerifyingKey, DidError> {
        let encoded = self
            .0
            .strip_prefix(DID_KEY_PREFIX)
            .ok_or(DidError::NotDidKey)?;
        let bytes = bs58::decode(encoded)
            .into_vec()
            .map_err(|_| DidError::Encoding)?;
        let key_bytes = bytes
            .strip_prefix(&ED25519_PUB_MULTICODEC[..])
            .ok_or(DidError::UnsupportedKeyType)?;
        let key: [u8; PUBLIC_KEY_LENGTH] = key_bytes
            .try_into()
            .map_err(|_| DidError::KeyLength(key_bytes.len()))?;
        VerifyingKey::from_bytes(&key).map_err(|_| DidError::InvalidKey)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Did {
    type Err = DidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Did {
    type Error = DidError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Did> for String {
    fn from(did: Did) -> Self {
        did.0
    }
}

/// Errors produced while parsing or resolving a DID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DidError {
    /// Not of the form `did:<method>:<id>`.
    NotADid,
    /// A `did:key` was required.
    NotDidKey,
    /// The key part is not valid base58btc.
    Encoding,
    /// The multicodec prefix is not Ed25519.
    UnsupportedKeyType,
    /// The key has the wrong number of bytes.
    KeyLength(usize),
    /// The bytes are not a valid Ed25519 point.
    InvalidKey,
}

impl fmt::Display for DidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DidError::NotADid => write!(f, "not a DID"),
            DidError::NotDidKey => write!(f, "not a did:key identity"),
            DidError::Encoding => write!(f, "did:key is not valid base58btc"),
            DidError::UnsupportedKeyType => write!(f, "did:key is not an Ed25519 key"),
            DidError::KeyLength(len) => write!(f, "did:key has {len} key bytes"),
            DidError::InvalidKey => write!(f, "did:key is not a valid Ed25519 key"),
        }
    }
}

impl std::error::Error for DidError {}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    #[test]
    fn did_key_roundtrips_the_public_key() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let did = Did::from_verifying_key(&key.verifying_key());

        assert!(did.as_str().starts_with("did:key:z6Mk"));
        assert_eq!(did.verifying_key().unwrap(), key.verifying_key());
        assert_eq!(did.as_str().parse::<Did>().unwrap(), did);
    }

    #[test]
    fn non_key_dids_parse_but_have_no_key() {
        let did = Did::parse("did:web:repo.example.com").unwrap();
        assert_eq!(did.verifying_key().unwrap_err(), DidError::NotDidKey);
    }

    #[test]
    fn malformed_identifiers_are_rejected() {
        assert_eq!(Did::parse("alice").unwrap_err(), DidError::NotADid);
        assert_eq!(Did::parse("did:key").unwrap_err(), DidError::NotADid);
        assert_eq!(Did::parse("did::x").unwrap_err(), DidError::NotADid);

        let bad_base58 = Did::parse("did:key:z0OIl").unwrap();
        assert_eq!(bad_base58.verifying_key().unwrap_err(), DidError::Encoding);

        let wrong_codec = Did::parse(&format!(
            "did:key:z{}",
            bs58::encode([0x12u8, 0x00, 1, 2, 3]).into_string()
        ))
        .unwrap();
        assert_eq!(
            wrong_codec.verifying_key().unwrap_err(),
            DidError::UnsupportedKeyType
        );

        let short = Did::parse(&format!(
            "did:key:z{}",
            bs58::encode([0xedu8, 0x01, 1, 2, 3]).into_string()
        ))
        .unwrap();
        assert_eq!(short.verifying_key().unwrap_err(), DidError::KeyLength(3));
    }
}
