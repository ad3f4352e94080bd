use thiserror::Error;

use crate::PoolId;

/// Errors that can occur when allocating from or releasing into a pool.
///
/// Variants fall into four groups:
///
/// * Resource exhaustion: [`ResourceExhausted`][Self::ResourceExhausted] and
///   [`SizeClassExhausted`][Self::SizeClassExhausted].
/// * Usage-contract violations: [`OutOfBounds`][Self::OutOfBounds],
///   [`DoubleFree`][Self::DoubleFree], [`VacantSlot`][Self::VacantSlot],
///   [`UnboundHandle`][Self::UnboundHandle] and [`ForeignHandle`][Self::ForeignHandle].
///   A pool that reports one of these has not mutated any of its bookkeeping.
/// * Invariant violations: [`InvariantViolation`][Self::InvariantViolation] means the
///   occupancy bookkeeping is corrupt and the pool must not be used further.
/// * Caller mistakes that are detected up front: [`NotPacked`][Self::NotPacked] and
///   [`InvalidConfiguration`][Self::InvalidConfiguration].
///
/// None of the operations in this crate retry on failure.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The backing memory block could not be allocated, either because the allocator refused
    /// or because the requested size does not fit in the address space. If this happened while
    /// growing, the previous block is still in place and remains authoritative.
    #[error("could not allocate a block of {capacity} slots of {element_size} bytes each")]
    ResourceExhausted {
        /// Number of slots the block was supposed to hold.
        capacity: usize,

        /// Size of a single slot in bytes.
        element_size: usize,
    },

    /// No configured size class can hold an object of the given layout.
    #[error(
        "no size class can hold {size} bytes aligned to {align} (largest class is {largest_class} bytes)"
    )]
    SizeClassExhausted {
        /// Size of the requested type in bytes.
        size: usize,

        /// Alignment of the requested type in bytes.
        align: usize,

        /// The largest configured size class.
        largest_class: usize,
    },

    /// The handle refers to a slot outside the current object region of the pool.
    #[error("slot {index} is out of bounds of a pool with capacity {capacity}")]
    OutOfBounds {
        /// The slot index carried by the handle.
        index: usize,

        /// The current capacity of the pool.
        capacity: usize,
    },

    /// The slot was already free when a release was requested.
    #[error("slot {index} is already free")]
    DoubleFree {
        /// The slot index carried by the handle.
        index: usize,
    },

    /// The slot does not hold an object, so there is nothing to access.
    #[error("slot {index} does not hold an object")]
    VacantSlot {
        /// The slot index carried by the handle.
        index: usize,
    },

    /// The handle is the unbound "no object" handle.
    #[error("handle is not bound to any object")]
    UnboundHandle,

    /// The handle was issued by a different pool.
    #[error("handle belongs to pool {actual}, not to pool {expected}")]
    ForeignHandle {
        /// Identity of the pool the operation was performed on.
        expected: PoolId,

        /// Identity of the pool that issued the handle.
        actual: PoolId,
    },

    /// Fast iteration was requested on a pool that has vacant slots.
    #[error(
        "fast iteration requires a fully packed pool but only {len} of {capacity} slots are occupied"
    )]
    NotPacked {
        /// Number of occupied slots.
        len: usize,

        /// Number of slots in the pool.
        capacity: usize,
    },

    /// The occupancy bitmap has no vacant slot even though the occupied count says there
    /// should be one. The pool is corrupt.
    #[error(
        "occupancy bitmap has no vacant slot although only {len} of {capacity} slots are occupied"
    )]
    InvariantViolation {
        /// Number of occupied slots according to the bookkeeping.
        len: usize,

        /// Number of slots in the pool.
        capacity: usize,
    },

    /// A pool or allocator was configured with values it cannot work with.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// A human-readable description of the problem.
        reason: String,
    },
}

impl Error {
    /// Whether the error was caused by the caller breaking the usage contract of a handle
    /// (freeing twice, freeing out of bounds, mixing up pools and so on).
    #[must_use]
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::OutOfBounds { .. }
                | Self::DoubleFree { .. }
                | Self::VacantSlot { .. }
                | Self::UnboundHandle
                | Self::ForeignHandle { .. }
        )
    }

    pub(crate) fn invalid_configuration(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }
}

/// A specialized `Result` type for pool operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn contract_violations_are_classified() {
        assert!(Error::DoubleFree { index: 3 }.is_contract_violation());
        assert!(
            Error::OutOfBounds {
                index: 9,
                capacity: 8
            }
            .is_contract_violation()
        );
        assert!(Error::UnboundHandle.is_contract_violation());

        assert!(
            !Error::ResourceExhausted {
                capacity: 8,
                element_size: 4
            }
            .is_contract_violation()
        );
        assert!(
            !Error::InvariantViolation {
                len: 3,
                capacity: 8
            }
            .is_contract_violation()
        );
    }

    #[test]
    fn messages_name_the_slot() {
        let message = Error::DoubleFree { index: 42 }.to_string();
        assert!(message.contains("42"), "{message}");

        let message = Error::SizeClassExhausted {
            size: 300,
            align: 4,
            largest_class: 256,
        }
        .to_string();
        assert!(message.contains("300"), "{message}");
        assert!(message.contains("256"), "{message}");
    }
}
