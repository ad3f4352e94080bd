use crate::{
    DropPolicy, GeneralPurposeAllocator, GrowthPolicy, Result, SizeClasses,
    SyncGeneralPurposeAllocator,
};

pub(crate) const DEFAULT_CLASS_CAPACITY: usize = 128;

/// Builder for creating an instance of [`GeneralPurposeAllocator`] or
/// [`SyncGeneralPurposeAllocator`].
///
/// The terminal call decides whether the allocator is thread-safe: [`build()`][Self::build]
/// creates a [`GeneralPurposeAllocator`], [`build_sync()`][Self::build_sync] a
/// [`SyncGeneralPurposeAllocator`].
///
/// # Examples
///
/// ```
/// use bitmap_pool::{GeneralPurposeAllocator, GrowthPolicy};
///
/// let allocator = GeneralPurposeAllocator::builder()
///     .size_classes([16, 48, 96])
///     .capacity(64)
///     .growth_policy(GrowthPolicy::Fixed)
///     .build()
///     .unwrap();
///
/// assert_eq!(allocator.class_for::<[u8; 40]>().unwrap(), 48);
/// ```
#[derive(Debug)]
#[must_use]
pub struct GeneralPurposeAllocatorBuilder {
    size_classes: Option<Vec<usize>>,
    capacity: usize,
    growth_policy: GrowthPolicy,
    drop_policy: DropPolicy,
}

impl GeneralPurposeAllocatorBuilder {
    pub(crate) fn new() -> Self {
        Self {
            size_classes: None,
            capacity: DEFAULT_CLASS_CAPACITY,
            growth_policy: GrowthPolicy::default(),
            drop_policy: DropPolicy::default(),
        }
    }

    /// Sets the slot sizes of the size classes, in strictly ascending order. Defaults to
    /// 8, 16, 32, 64, 128 and 256 bytes.
    ///
    /// The sizes are validated when the allocator is built.
    pub fn size_classes(mut self, sizes: impl IntoIterator<Item = usize>) -> Self {
        self.size_classes = Some(sizes.into_iter().collect());
        self
    }

    /// Sets the initial number of slots of every size class. Must be a non-zero multiple of 8.
    /// Defaults to 128.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the [growth policy][GrowthPolicy] of every size class.
    pub fn growth_policy(mut self, policy: GrowthPolicy) -> Self {
        self.growth_policy = policy;
        self
    }

    /// Sets the [drop policy][DropPolicy] of the allocator. This governs how
    /// to treat remaining objects when the allocator is dropped.
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Builds an allocator that is not thread-safe.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`][crate::Error::InvalidConfiguration] if the size
    /// classes or the capacity are invalid. Returns
    /// [`Error::ResourceExhausted`][crate::Error::ResourceExhausted] if a class pool could not
    /// be allocated.
    pub fn build(self) -> Result<GeneralPurposeAllocator> {
        let classes = self.classes()?;

        GeneralPurposeAllocator::new_inner(
            classes,
            self.capacity,
            self.growth_policy,
            self.drop_policy,
        )
    }

    /// Builds an allocator that can be shared between threads.
    ///
    /// # Errors
    ///
    /// As for [`build()`][Self::build].
    pub fn build_sync(self) -> Result<SyncGeneralPurposeAllocator> {
        let classes = self.classes()?;

        SyncGeneralPurposeAllocator::new_inner(
            classes,
            self.capacity,
            self.growth_policy,
            self.drop_policy,
        )
    }

    fn classes(&self) -> Result<SizeClasses> {
        self.size_classes.as_ref().map_or_else(
            || Ok(SizeClasses::default()),
            |sizes| SizeClasses::new(sizes.iter().copied()),
        )
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::Error;

    assert_impl_all!(GeneralPurposeAllocatorBuilder: Send, Sync);

    #[test]
    fn defaults_are_applied() {
        let allocator = GeneralPurposeAllocator::builder().build().unwrap();

        assert_eq!(allocator.size_classes(), &SizeClasses::default());
        assert_eq!(allocator.drop_policy(), DropPolicy::MayDropItems);

        let pool = allocator.class_pool(8).unwrap();
        assert_eq!(pool.capacity(), DEFAULT_CLASS_CAPACITY);
        assert_eq!(pool.growth_policy(), GrowthPolicy::Doubling);
    }

    #[test]
    fn custom_classes_are_applied() {
        let allocator = GeneralPurposeAllocator::builder()
            .size_classes([24, 48])
            .capacity(16)
            .growth_policy(GrowthPolicy::Fixed)
            .build_sync()
            .unwrap();

        assert_eq!(allocator.class_sizes().collect::<Vec<_>>(), vec![24, 48]);
        assert_eq!(
            allocator.with_class_pool(24, |pool| (pool.capacity(), pool.growth_policy())),
            Some((16, GrowthPolicy::Fixed))
        );
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let result = GeneralPurposeAllocator::builder()
            .size_classes([32, 16])
            .build();
        assert!(matches!(result, Err(Error::InvalidConfiguration { .. })));

        let result = GeneralPurposeAllocator::builder().capacity(100).build();
        assert!(matches!(result, Err(Error::InvalidConfiguration { .. })));

        let result = GeneralPurposeAllocator::builder()
            .size_classes([])
            .build_sync();
        assert!(matches!(result, Err(Error::InvalidConfiguration { .. })));
    }
}
