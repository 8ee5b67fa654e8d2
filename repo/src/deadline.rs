//! Caller-supplied deadlines and cancellation.
//!
//! Every potentially slow step of the update protocol (ingesting a block,
//! resolving a CID during verification, merging, writing an export) calls
//! [`Deadline::check`] first. A deadline can carry an expiry instant, a
//! [`CancellationToken`], both, or neither.

use std::fmt;
use std::time::{Duration, Instant};

pub use tokio_util::sync::{CancellationToken, DropGuard};

/// Bound on how long an operation may keep running.
#[derive(Clone, Debug, Default)]
pub struct Deadline {
    expires_at: Option<Instant>,
    token: Option<CancellationToken>,
}

impl Deadline {
    /// A deadline that never fires.
    pub fn none() -> Self {
        Self::default()
    }

    /// Expires `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    pub fn at(expires_at: Instant) -> Self {
        Self {
            expires_at: Some(expires_at),
            token: None,
        }
    }

    /// Also fires once `token` is cancelled.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Attaches a fresh token and returns a guard that cancels it when
    /// dropped.
    ///
    /// The HTTP layer holds the guard inside the request future, so a
    /// client disconnect cancels the blocking work it started. Call
    /// [`DropGuard::disarm`] once the work has finished.
    pub fn cancel_on_drop(self) -> (Self, DropGuard) {
        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();
        (self.with_token(token), guard)
    }

    /// Returns `Err(Cancelled)` once the deadline has passed or the token
    /// was cancelled.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.token.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(Cancelled);
        }
        if self.expires_at.is_some_and(|at| Instant::now() >= at) {
            return Err(Cancelled);
        }
        Ok(())
    }

    /// Time left before expiry, if an expiry is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// The operation was cancelled or ran past its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation cancelled or deadline exceeded")
    }
}

impl std::error::Error for Cancelled {}
