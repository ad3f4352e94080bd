use std::alloc::Layout;
use std::sync::OnceLock;

use foldhash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use tracing::debug;

use crate::size_classes::class_align;
use crate::{Error, FixedLayoutAllocator, GrowthPolicy, Result};

static GLOBAL: OnceLock<FixedSizeRegistry> = OnceLock::new();

/// A set of thread-safe, type-erased pools, one per distinct `(slot size, capacity)`
/// combination.
///
/// Every pool is created up front by the builder; nothing is created lazily on first use. A
/// registry can be used as an ordinary value or installed once as the process-wide registry,
/// after which [`global()`][Self::global] returns it from anywhere in the process.
///
/// Slots are aligned like the size classes of a
/// [`GeneralPurposeAllocator`][crate::GeneralPurposeAllocator]: to the largest power of two
/// that divides the slot size, at most 4096.
///
/// # Example
///
/// ```
/// use bitmap_pool::FixedSizeRegistry;
///
/// let registry = FixedSizeRegistry::builder()
///     .pool(32, 1024)
///     .pool(64, 256)
///     .build()
///     .unwrap();
///
/// let handle = registry
///     .with_pool(32, 1024, |pool| pool.insert([5_u8; 32]))
///     .expect("pool is registered")
///     .unwrap();
///
/// assert!(handle.is_bound());
/// assert!(registry.with_pool(48, 1024, |_| ()).is_none());
/// ```
#[derive(Debug)]
pub struct FixedSizeRegistry {
    /// Keyed by slot size and initial capacity.
    pools: HashMap<(usize, usize), Mutex<FixedLayoutAllocator>>,
}

impl FixedSizeRegistry {
    /// Starts building a registry.
    pub fn builder() -> FixedSizeRegistryBuilder {
        FixedSizeRegistryBuilder::new()
    }

    /// Makes this registry the process-wide registry returned by [`global()`][Self::global].
    ///
    /// The registry lives until the process exits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if a process-wide registry has already been
    /// installed. The registry passed in is dropped in that case.
    pub fn install(self) -> Result<&'static Self> {
        GLOBAL.set(self).map_err(|_rejected| {
            Error::invalid_configuration("a process-wide registry is already installed")
        })?;

        Ok(GLOBAL
            .get()
            .expect("we just installed the registry and it can never be uninstalled"))
    }

    /// The process-wide registry, if one has been [installed][Self::install].
    #[must_use]
    pub fn global() -> Option<&'static Self> {
        GLOBAL.get()
    }

    /// Calls `f` with the pool registered for `(size, capacity)` while that pool is locked, or
    /// returns `None` if no such pool is registered.
    ///
    /// `capacity` is the capacity the pool was registered with, not its current capacity.
    pub fn with_pool<R>(
        &self,
        size: usize,
        capacity: usize,
        f: impl FnOnce(&mut FixedLayoutAllocator) -> R,
    ) -> Option<R> {
        let mut pool = self.pools.get(&(size, capacity))?.lock();
        Some(f(&mut pool))
    }

    /// Whether a pool is registered for `(size, capacity)`.
    #[must_use]
    pub fn contains(&self, size: usize, capacity: usize) -> bool {
        self.pools.contains_key(&(size, capacity))
    }

    /// The registered `(size, capacity)` combinations, in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.pools.keys().copied()
    }

    /// Number of registered pools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Whether no pool is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

/// Builder for creating an instance of [`FixedSizeRegistry`].
#[derive(Debug)]
#[must_use]
pub struct FixedSizeRegistryBuilder {
    pools: Vec<(usize, usize)>,
    growth_policy: GrowthPolicy,
}

impl FixedSizeRegistryBuilder {
    fn new() -> Self {
        Self {
            pools: Vec::new(),
            growth_policy: GrowthPolicy::default(),
        }
    }

    /// Registers a pool with slots of `size` bytes and an initial capacity of `capacity`
    /// slots. The capacity must be a non-zero multiple of 8.
    pub fn pool(mut self, size: usize, capacity: usize) -> Self {
        self.pools.push((size, capacity));
        self
    }

    /// Sets the [growth policy][GrowthPolicy] of every registered pool.
    pub fn growth_policy(mut self, policy: GrowthPolicy) -> Self {
        self.growth_policy = policy;
        self
    }

    /// Creates the registry and all of its pools.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if a combination is registered twice, a size is
    /// zero or a capacity is invalid. Returns [`Error::ResourceExhausted`] if a pool could not
    /// be allocated.
    pub fn build(self) -> Result<FixedSizeRegistry> {
        let mut pools = HashMap::with_capacity(self.pools.len());

        for (size, capacity) in self.pools {
            if size == 0 {
                return Err(Error::invalid_configuration(
                    "registry pools must not be zero-sized",
                ));
            }

            if pools.contains_key(&(size, capacity)) {
                return Err(Error::invalid_configuration(format!(
                    "pool of size {size} with capacity {capacity} is registered twice"
                )));
            }

            let layout = Layout::from_size_align(size, class_align(size)).map_err(|_| {
                Error::invalid_configuration(format!("registry pool size {size} is too large"))
            })?;

            let pool = FixedLayoutAllocator::new(layout, capacity, self.growth_policy)?;

            debug!(size, capacity, pool = %pool.pool_id(), "registry pool created");

            pools.insert((size, capacity), Mutex::new(pool));
        }

        Ok(FixedSizeRegistry { pools })
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "test code, we assume safety is considered"
)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(FixedSizeRegistry: Send, Sync);

    #[test]
    fn pools_are_created_up_front() {
        let registry = FixedSizeRegistry::builder()
            .pool(16, 8)
            .pool(16, 64)
            .pool(48, 8)
            .build()
            .unwrap();

        assert_eq!(registry.len(), 3);
        assert!(registry.contains(16, 8));
        assert!(registry.contains(16, 64));
        assert!(registry.contains(48, 8));
        assert!(!registry.contains(48, 64));

        let mut keys = registry.keys().collect::<Vec<_>>();
        keys.sort_unstable();
        assert_eq!(keys, vec![(16, 8), (16, 64), (48, 8)]);

        let layout = registry
            .with_pool(48, 8, |pool| pool.element_layout())
            .unwrap();
        assert_eq!(layout, Layout::from_size_align(48, 16).unwrap());
    }

    #[test]
    fn same_key_is_the_same_pool() {
        let registry = FixedSizeRegistry::builder().pool(8, 8).build().unwrap();

        let first = registry.with_pool(8, 8, |pool| pool.pool_id()).unwrap();
        let second = registry.with_pool(8, 8, |pool| pool.pool_id()).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn duplicates_are_rejected() {
        let result = FixedSizeRegistry::builder().pool(8, 8).pool(8, 8).build();
        assert!(matches!(result, Err(Error::InvalidConfiguration { .. })));
    }

    #[test]
    fn invalid_pools_are_rejected() {
        let result = FixedSizeRegistry::builder().pool(0, 8).build();
        assert!(matches!(result, Err(Error::InvalidConfiguration { .. })));

        let result = FixedSizeRegistry::builder().pool(8, 3).build();
        assert!(matches!(result, Err(Error::InvalidConfiguration { .. })));
    }

    #[test]
    fn growth_policy_applies_to_all_pools() {
        let registry = FixedSizeRegistry::builder()
            .pool(8, 8)
            .growth_policy(GrowthPolicy::Fixed)
            .build()
            .unwrap();

        registry.with_pool(8, 8, |pool| {
            for value in 0..8_u64 {
                assert!(pool.insert(value).unwrap().is_bound());
            }

            assert!(!pool.insert(8_u64).unwrap().is_bound());
        });
    }

    #[test]
    fn shared_between_threads() {
        let registry = Arc::new(FixedSizeRegistry::builder().pool(8, 8).build().unwrap());

        let workers = (0..4_u64)
            .map(|worker| {
                let registry = Arc::clone(&registry);

                thread::spawn(move || {
                    for value in 0..50 {
                        let mut handle = registry
                            .with_pool(8, 8, |pool| pool.insert(worker * 100 + value))
                            .unwrap()
                            .unwrap();

                        let stored = registry
                            .with_pool(8, 8, |pool| unsafe { pool.remove(&mut handle) })
                            .unwrap()
                            .unwrap();

                        assert_eq!(stored, worker * 100 + value);
                    }
                })
            })
            .collect::<Vec<_>>();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(registry.with_pool(8, 8, |pool| pool.len()), Some(0));
    }
}
