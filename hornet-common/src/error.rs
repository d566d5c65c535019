//! Shared error model for cross-crate APIs.

use thiserror::Error;

use crate::ids::{PartitionId, TxnId};

/// Unified result type used by all public interfaces in `hornet`.
pub type HornetResult<T> = Result<T, HornetError>;

/// Error categories surfaced by the transaction core.
///
/// The abort variants mirror the transaction outcome kinds: a `Rejected`
/// transaction is restartable by its coordinator, a `UserAbort` is
/// client-visible, a `ConflictAbort` is an internal speculative rollback,
/// and `Unexpected` is fatal to the transaction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HornetError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// The partition lock queue refused this transaction because a
    /// smaller-id transaction already holds the order slot.
    #[error("transaction rejected at partition {partition} by blocker txn {blocker}")]
    Rejected {
        /// Partition whose queue emitted the rejection.
        partition: PartitionId,
        /// Transaction id the rejected transaction must wait out.
        blocker: TxnId,
    },

    /// Stored procedure raised an abort; visible to the client.
    #[error("user abort: {0}")]
    UserAbort(String),

    /// Speculative execution was rolled back because its holder aborted.
    #[error("speculative conflict abort")]
    ConflictAbort,

    /// Init acknowledgments did not arrive inside the configured window.
    #[error("transaction init timed out")]
    InitTimeout,

    /// Engine or deserialization failure; fatal to the transaction.
    #[error("unexpected fault: {0}")]
    Unexpected(String),

    /// Wire payload is malformed or semantically invalid.
    #[error("codec error: {0}")]
    Codec(String),
}

impl HornetError {
    /// Returns whether the coordinator may transparently restart the
    /// transaction after this error.
    #[must_use]
    pub fn is_restartable(&self) -> bool {
        matches!(
            self,
            Self::Rejected { .. } | Self::ConflictAbort | Self::InitTimeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::HornetError;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn rejection_and_conflict_are_restartable() {
        assert_that!(
            HornetError::Rejected {
                partition: 0,
                blocker: 99
            }
            .is_restartable(),
            eq(true)
        );
        assert_that!(HornetError::ConflictAbort.is_restartable(), eq(true));
        assert_that!(HornetError::InitTimeout.is_restartable(), eq(true));
        assert_that!(
            HornetError::UserAbort("constraint".to_owned()).is_restartable(),
            eq(false)
        );
    }
}
