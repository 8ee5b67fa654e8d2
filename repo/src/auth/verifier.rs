use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::AuthError;
use super::capability::{Action, Attenuation};
use super::did::Did;
use super::token::{CapabilityToken, TokenClaims};

/// A token whose signature, audience and validity window have been checked.
#[derive(Clone, Debug)]
pub struct VerifiedToken {
    issuer: Did,
    claims: TokenClaims,
    attenuations: Vec<Attenuation>,
}

impl VerifiedToken {
    pub fn issuer(&self) -> &Did {
        &self.issuer
    }

    pub fn claims(&self) -> &TokenClaims {
        &self.claims
    }

    pub fn grants(&self, account: &str, action: Action) -> bool {
        self.attenuations.iter().any(|a| a.covers(account, action))
    }
}

/// Checks capability tokens presented to this server.
#[derive(Clone, Debug)]
pub struct CapabilityVerifier {
    server_did: Did,
    clock_skew: Duration,
}

impl CapabilityVerifier {
    pub fn new(server_did: Did, clock_skew: Duration) -> Self {
        Self {
            server_did,
            clock_skew,
        }
    }

    pub fn server_did(&self) -> &Did {
        &self.server_did
    }

    /// Account-independent checks: well-formed, signed by its issuer,
    /// addressed to this server, and inside its validity window.
    pub fn verify(&self, encoded: &str) -> Result<VerifiedToken, AuthError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.verify_at(encoded, now)
    }

    /// [`verify`](Self::verify) against an explicit Unix time.
    pub fn verify_at(&self, encoded: &str, now: u64) -> Result<VerifiedToken, AuthError> {
        let token = CapabilityToken::parse(encoded)?;
        let issuer = token.verify_signature()?;
        let claims = token.claims();

        if claims.aud != self.server_did.as_str() {
            return Err(AuthError::AudienceMismatch {
                expected: self.server_did.to_string(),
                found: claims.aud.clone(),
            });
        }

        let skew = self.clock_skew.as_secs();
        if let Some(nbf) = claims.nbf {
            if nbf > now.saturating_add(skew) {
                return Err(AuthError::NotYetValid);
            }
        }
        if let Some(exp) = claims.exp {
            if exp.saturating_add(skew) < now {
                return Err(AuthError::Expired);
            }
        }

        Ok(VerifiedToken {
            issuer,
            attenuations: claims.att.iter().map(Attenuation::from).collect(),
            claims: claims.clone(),
        })
    }

    /// Account-scoped checks: the token grants `action` on `account`, and
    /// its issuer is the identity bound to that account.
    pub fn authorize(
        &self,
        token: &VerifiedToken,
        account: &str,
        action: Action,
        bound_identity: &Did,
    ) -> Result<(), AuthError> {
        if !token.grants(account, action) {
            return Err(AuthError::MissingAttenuation {
                account: account.to_string(),
                action,
            });
        }
        if token.issuer() != bound_identity {
            return Err(AuthError::IssuerMismatch {
                account: account.to_string(),
            });
        }
        Ok(())
    }
}
