//! Capability tokens in compact JWS form.
//!
//! `base64url(header) "." base64url(claims) "." base64url(signature)`, with
//! `alg = EdDSA` and the signature made by the issuer's `did:key` over the
//! ASCII bytes of the first two segments. Claims:
//!
//! ```json
//! { "iss": "did:key:z6Mk...", "aud": "did:web:repo.example",
//!   "nbf": 1700000000, "exp": 1700003600,
//!   "att": [{ "with": "account:alice", "can": "post/update" }],
//!   "prf": [] }
//! ```
//!
//! `nbf`/`exp` are Unix seconds and optional. `prf` is carried but not
//! followed; only the token's own attenuations grant anything.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{SIGNATURE_LENGTH, Signature, Signer, SigningKey};
use serde::{Deserialize, Serialize};

use super::AuthError;
use super::did::Did;

pub const ALG_EDDSA: &str = "EdDSA";
const TYP_JWT: &str = "JWT";

/// Longest encoded token accepted.
pub const MAX_TOKEN_BYTES: usize = 16 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenHeader {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttenuationClaim {
    pub with: String,
    pub can: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    pub aud: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(default)]
    pub att: Vec<AttenuationClaim>,
    #[serde(default)]
    pub prf: Vec<String>,
}

impl TokenClaims {
    pub fn new(iss: &Did, aud: &Did) -> Self {
        Self {
            iss: iss.to_string(),
            aud: aud.to_string(),
            nbf: None,
            exp: None,
            att: Vec::new(),
            prf: Vec::new(),
        }
    }

    pub fn with_attenuation(mut self, with: impl Into<String>, can: impl Into<String>) -> Self {
        self.att.push(AttenuationClaim {
            with: with.into(),
            can: can.into(),
        });
        self
    }

    pub fn valid_between(mut self, nbf: Option<u64>, exp: Option<u64>) -> Self {
        self.nbf = nbf;
        self.exp = exp;
        self
    }
}

/// A decoded token whose signature has not been checked yet.
#[derive(Clone, Debug)]
pub struct CapabilityToken {
    header: TokenHeader,
    claims: TokenClaims,
    signing_input: String,
    signature: Signature,
}

impl CapabilityToken {
    /// Decodes the three segments. Does not check the signature.
    pub fn parse(encoded: &str) -> Result<Self, AuthError> {
        if encoded.len() > MAX_TOKEN_BYTES {
            return Err(AuthError::Malformed("token too long"));
        }

        let mut parts = encoded.split('.');
        let (h_b64, p_b64, sig_b64) = match (parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(p), Some(s)) => (h, p, s),
            _ => return Err(AuthError::Malformed("expected three segments")),
        };
        if parts.next().is_some() {
            return Err(AuthError::Malformed("expected three segments"));
        }

        let header_bytes = URL_SAFE_NO_PAD
            .decode(h_b64)
            .map_err(|_| AuthError::Malformed("header is not base64url"))?;
        let payload_bytes = URL_SAFE_NO_PAD
            .decode(p_b64)
            .map_err(|_| AuthError::Malformed("claims are not base64url"))?;
        let sig_bytes = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| AuthError::Malformed("signature is not base64url"))?;

        let header: TokenHeader = serde_json::from_slice(&header_bytes)
            .map_err(|_| AuthError::Malformed("header is not valid JSON"))?;
        if header.alg != ALG_EDDSA {
            return Err(AuthError::UnsupportedAlgorithm(header.alg));
        }
        let claims: TokenClaims = serde_json::from_slice(&payload_bytes)
            .map_err(|_| AuthError::Malformed("claims are not valid JSON"))?;

        if sig_bytes.len() != SIGNATURE_LENGTH {
            return Err(AuthError::BadSignature);
        }
        let signature = Signature::from_slice(&sig_bytes).map_err(|_| AuthError::BadSignature)?;

        Ok(Self {
            header,
            claims,
            signing_input: format!("{h_b64}.{p_b64}"),
            signature,
        })
    }

    pub fn header(&self) -> &TokenHeader {
        &self.header
    }

    pub fn claims(&self) -> &TokenClaims {
        &self.claims
    }

    /// Checks the signature against the issuer's `did:key` and returns the
    /// issuer.
    pub fn verify_signature(&self) -> Result<Did, AuthError> {
        let issuer = Did::parse(&self.claims.iss).map_err(AuthError::BadIssuer)?;
        let key = issuer.verifying_key().map_err(AuthError::BadIssuer)?;
        key.verify_strict(self.signing_input.as_bytes(), &self.signature)
            .map_err(|_| AuthError::BadSignature)?;
        Ok(issuer)
    }
}

/// Encodes and signs `claims` with `key`.
///
/// The caller is responsible for `claims.iss` naming `key`'s `did:key`.
pub fn issue(key: &SigningKey, claims: &TokenClaims) -> Result<String, serde_json::Error> {
    let header = TokenHeader {
        alg: ALG_EDDSA.to_string(),
        typ: Some(TYP_JWT.to_string()),
    };
    let h_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
    let p_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let signing_input = format!("{h_b64}.{p_b64}");
    let signature = key.sign(signing_input.as_bytes());
    Ok(format!(
        "{signing_input}.{}",
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}
