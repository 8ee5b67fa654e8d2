//! Capability-token authorization.
//!
//! Two phases, run at different points of a request:
//!
//! 1. [`CapabilityVerifier::verify`] checks what can be checked without
//!    knowing the target account: token shape, signature, audience, and
//!    validity window. It runs before any request body is read.
//! 2. [`CapabilityVerifier::authorize`] checks that the token grants the
//!    requested action on the named account and that its issuer is the
//!    identity bound to that account.

pub mod capability;
pub mod did;
pub mod token;
pub mod verifier;

use std::fmt;

pub use capability::{Ability, Action, Attenuation, Resource};
pub use did::{Did, DidError};
pub use token::{AttenuationClaim, CapabilityToken, TokenClaims, issue};
pub use verifier::{CapabilityVerifier, VerifiedToken};

const BEARER_PREFIX: &str = "Bearer ";

/// Extracts the token from an `Authorization` header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let value = header.ok_or(AuthError::MissingToken)?;
    let token = value
        .strip_prefix(BEARER_PREFIX)
        .ok_or(AuthError::Malformed("authorization is not a bearer token"))?
        .trim();
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    Ok(token)
}

/// Why a request was not authorized.
///
/// Callers report every variant to clients the same way; the detail is for
/// logs.
#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    Malformed(&'static str),
    UnsupportedAlgorithm(String),
    BadIssuer(DidError),
    BadSignature,
    NotYetValid,
    Expired,
    AudienceMismatch { expected: String, found: String },
    MissingAttenuation { account: String, action: Action },
    IssuerMismatch { account: String },
    /// The account does not exist, reported as an auth failure on update.
    UnknownAccount(String),
    /// The name is already bound to a different identity.
    NameTaken(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::MissingToken => write!(f, "no capability token presented"),
            AuthError::Malformed(why) => write!(f, "malformed token: {why}"),
            AuthError::UnsupportedAlgorithm(alg) => write!(f, "unsupported token algorithm {alg}"),
            AuthError::BadIssuer(e) => write!(f, "bad token issuer: {e}"),
            AuthError::BadSignature => write!(f, "token signature does not verify"),
            AuthError::NotYetValid => write!(f, "token is not valid yet"),
            AuthError::Expired => write!(f, "token has expired"),
            AuthError::AudienceMismatch { expected, found } => {
                write!(f, "token audience {found} is not {expected}")
            }
            AuthError::MissingAttenuation { account, action } => {
                write!(f, "token does not grant {action} on account:{account}")
            }
            AuthError::IssuerMismatch { account } => {
                write!(f, "token issuer is not the identity bound to {account}")
            }
            AuthError::UnknownAccount(name) => write!(f, "unknown account {name}"),
            AuthError::NameTaken(name) => write!(f, "name {name} is bound to another identity"),
        }
    }
}

impl std::error::Error for AuthError {}
