use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;

use crate::fixed_type::GrowthCallback;
use crate::{DropPolicy, FixedTypeAllocator, GrowthPolicy, Result, SyncFixedTypeAllocator};

pub(crate) const DEFAULT_FIXED_TYPE_CAPACITY: usize = 1024;

/// Builder for creating an instance of [`FixedTypeAllocator`] or [`SyncFixedTypeAllocator`].
///
/// You only need to use this builder if you want to customize the pool configuration.
/// The default configuration used by [`FixedTypeAllocator::new()`][1] is sufficient for
/// many use cases.
///
/// The terminal call decides whether the pool is thread-safe: [`build()`][Self::build] creates
/// a [`FixedTypeAllocator`], [`build_sync()`][Self::build_sync] a [`SyncFixedTypeAllocator`].
///
/// # Examples
///
/// ```
/// use bitmap_pool::{DropPolicy, FixedTypeAllocator, GrowthPolicy};
///
/// let pool = FixedTypeAllocator::<u32>::builder()
///     .capacity(4096)
///     .growth_policy(GrowthPolicy::Fixed)
///     .drop_policy(DropPolicy::MustNotDropItems)
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.capacity(), 4096);
/// ```
///
/// [1]: FixedTypeAllocator::new
#[must_use]
pub struct FixedTypeAllocatorBuilder<T> {
    capacity: usize,
    growth_policy: GrowthPolicy,
    drop_policy: DropPolicy,
    on_grow: Option<GrowthCallback>,

    _item: PhantomData<T>,
}

impl<T> fmt::Debug for FixedTypeAllocatorBuilder<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedTypeAllocatorBuilder")
            .field("item_type", &format_args!("{}", type_name::<T>()))
            .field("capacity", &self.capacity)
            .field("growth_policy", &self.growth_policy)
            .field("drop_policy", &self.drop_policy)
            .field("on_grow", &self.on_grow.as_ref().map(|_| "callback"))
            .finish()
    }
}

impl<T> FixedTypeAllocatorBuilder<T> {
    pub(crate) fn new() -> Self {
        Self {
            capacity: DEFAULT_FIXED_TYPE_CAPACITY,
            growth_policy: GrowthPolicy::default(),
            drop_policy: DropPolicy::default(),
            on_grow: None,
            _item: PhantomData,
        }
    }

    /// Sets the initial number of slots. Must be a non-zero multiple of 8. Defaults to 1024.
    ///
    /// The value is validated when the pool is built.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the [growth policy][GrowthPolicy], which governs what happens when an object is
    /// allocated from a full pool.
    pub fn growth_policy(mut self, policy: GrowthPolicy) -> Self {
        self.growth_policy = policy;
        self
    }

    /// Sets the [drop policy][DropPolicy] for the pool. This governs how
    /// to treat remaining objects in the pool when the pool is dropped.
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Registers a callback that is called every time the pool grows. It runs right after
    /// growth, before the object that triggered the growth is stored.
    ///
    /// For the thread-safe variant, the callback is called while the pool is locked, so it must
    /// not access the same pool.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    ///
    /// use bitmap_pool::FixedTypeAllocator;
    ///
    /// let growths = Arc::new(AtomicUsize::new(0));
    ///
    /// let mut pool = FixedTypeAllocator::<u8>::builder()
    ///     .capacity(8)
    ///     .on_grow({
    ///         let growths = Arc::clone(&growths);
    ///         move || {
    ///             growths.fetch_add(1, Ordering::Relaxed);
    ///         }
    ///     })
    ///     .build()
    ///     .unwrap();
    ///
    /// for value in 0..9 {
    ///     pool.insert(value).unwrap();
    /// }
    ///
    /// assert_eq!(growths.load(Ordering::Relaxed), 1);
    /// ```
    pub fn on_grow(mut self, callback: impl FnMut() + Send + 'static) -> Self {
        self.on_grow = Some(Box::new(callback));
        self
    }

    /// Builds a pool that is not thread-safe.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`][crate::Error::InvalidConfiguration] if the
    /// capacity is zero or not a multiple of 8 or if `T` is zero-sized. Returns
    /// [`Error::ResourceExhausted`][crate::Error::ResourceExhausted] if the memory block could
    /// not be allocated.
    pub fn build(self) -> Result<FixedTypeAllocator<T>> {
        FixedTypeAllocator::new_inner(
            self.capacity,
            self.growth_policy,
            self.drop_policy,
            self.on_grow,
        )
    }

    /// Builds a pool that can be shared between threads.
    ///
    /// # Errors
    ///
    /// As for [`build()`][Self::build].
    pub fn build_sync(self) -> Result<SyncFixedTypeAllocator<T>> {
        SyncFixedTypeAllocator::new_inner(
            self.capacity,
            self.growth_policy,
            self.drop_policy,
            self.on_grow,
        )
    }
}
