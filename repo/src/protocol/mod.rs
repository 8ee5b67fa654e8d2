//! Repository update protocol.
//!
//! [`RepoEngine`] ties the pieces together: it authenticates a capability
//! token, ingests an archive into a per-request staging store, checks the
//! submitted graph for completeness against the durable store, merges the
//! batch and advances the account root with a compare-and-swap. It also
//! handles registration and export.

pub mod engine;
pub mod error;

pub use crate::deadline::{CancellationToken, Cancelled, Deadline, DropGuard};
pub use engine::{
    RegisterOutcome, RepoEngine, UpdateOutcome, UpdateRequest, UpdateState, validate_account_name,
};
pub use error::{ProtocolError, RepoError};
