use std::fmt;
use std::num::NonZero;
use std::sync::atomic::{self, AtomicU64};

/// Process-unique identity of a memory block.
///
/// A [`SlotHandle`][crate::SlotHandle] records the identity of the pool that issued it, so a
/// pool can recognize handles that belong to somebody else. The identity is assigned when the
/// block is created and does not change when the block grows.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PoolId(NonZero<u64>);

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

impl PoolId {
    pub(crate) fn next() -> Self {
        // We only need uniqueness, not ordering with respect to any other memory operation.
        let raw = NEXT_POOL_ID.fetch_add(1, atomic::Ordering::Relaxed);

        Self(NonZero::new(raw).expect(
            "pool identities start at 1 and a 64-bit counter does not wrap within a process lifetime",
        ))
    }

    /// The numeric value of the identity.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
