//! Pool error taxonomy.
//!
//! Exhaustion and invalid-request failures are recoverable values returned
//! from allocation entry points; structural violations indicate caller
//! misuse and should be treated as hard errors.

use crate::store::NodeId;

/// Errors produced by pool operations and the persistence substrate.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No subnet of the requested size is available in the pool.
    #[error("unable to satisfy address allocation request for /{prefix_length} from '{pool}'")]
    Exhausted { prefix_length: u8, pool: String },

    /// A specific requested subnet cannot be carved out of the pool.
    #[error("unable to satisfy address allocation request for {subnet} from '{pool}'")]
    SubnetUnavailable { subnet: String, pool: String },

    /// The request itself is malformed or outside the pool's configured
    /// bounds. Surfaces identically to exhaustion but is kept distinct
    /// for diagnostics.
    #[error("invalid allocation request: {0}")]
    InvalidRequest(String),

    /// A programming-contract violation, e.g. freeing a non-full or
    /// non-leaf block. Never returned for ordinary exhaustion.
    #[error("structural violation: {0}")]
    StructuralViolation(String),

    /// Lock acquisition or commit failure from the persistence substrate.
    /// The core performs no retry; retry policy belongs to the caller.
    #[error("concurrency conflict: {0}")]
    Conflict(String),

    /// A referenced block does not exist in the store.
    #[error("address block {0} not found")]
    NotFound(NodeId),

    /// State snapshot could not be read or written.
    #[error("snapshot error: {0}")]
    Snapshot(String),
}

impl PoolError {
    /// Returns true if this failure means the request could not be
    /// satisfied but the pool itself is healthy.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PoolError::Exhausted { .. }
                | PoolError::SubnetUnavailable { .. }
                | PoolError::InvalidRequest(_)
        )
    }
}
