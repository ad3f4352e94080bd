use std::alloc::Layout;
use std::thread;

use foldhash::{HashMap, HashMapExt};
use tracing::debug;

use crate::{
    DropPolicy, FixedLayoutAllocator, GeneralPurposeAllocatorBuilder, GrowthPolicy, Result,
    SizeClasses, SlotHandle,
};

/// An allocator for objects of any type, routed by size and alignment into a fixed set of size
/// classes.
///
/// Each size class is a [`FixedLayoutAllocator`] created when the allocator is created. An
/// object is stored in the smallest class that fits it (see [`SizeClasses`]) and is referred to
/// by a [`SlotHandle`] issued by that class.
///
/// The allocator does not remember which type is stored in which slot, so reading and deleting
/// objects is `unsafe`: the caller vouches that the handle still refers to the object it was
/// issued for. Storing objects is safe.
///
/// Objects that are still stored when the allocator is dropped are leaked: their memory is
/// released but their destructors do not run. With [`DropPolicy::MustNotDropItems`] the
/// allocator panics instead.
///
/// This variant is not thread-safe. See
/// [`SyncGeneralPurposeAllocator`][crate::SyncGeneralPurposeAllocator] for one that can be
/// shared between threads.
///
/// # Example
///
/// ```
/// use bitmap_pool::GeneralPurposeAllocator;
///
/// struct Message {
///     id: u64,
///     payload: [u8; 40],
/// }
///
/// let mut allocator = GeneralPurposeAllocator::new().unwrap();
///
/// assert_eq!(allocator.class_for::<Message>().unwrap(), 64);
///
/// let mut handle = allocator
///     .insert(Message {
///         id: 7,
///         payload: [0; 40],
///     })
///     .unwrap();
///
/// // SAFETY: The handle was issued for a Message and has not been deleted.
/// assert_eq!(unsafe { allocator.get(&handle) }.unwrap().id, 7);
///
/// // SAFETY: As above.
/// unsafe { allocator.delete(&mut handle) }.unwrap();
/// assert!(allocator.is_empty());
/// ```
#[derive(Debug)]
pub struct GeneralPurposeAllocator {
    classes: SizeClasses,

    /// One pool per class, keyed by class size.
    pools: HashMap<usize, FixedLayoutAllocator>,

    drop_policy: DropPolicy,
}

impl GeneralPurposeAllocator {
    /// Creates an allocator with the default configuration: size classes of 8, 16, 32, 64, 128
    /// and 256 bytes with 128 slots each, doubling growth.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`][crate::Error::ResourceExhausted] if a class pool
    /// could not be allocated.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Starts building an allocator with a custom configuration.
    pub fn builder() -> GeneralPurposeAllocatorBuilder {
        GeneralPurposeAllocatorBuilder::new()
    }

    pub(crate) fn new_inner(
        classes: SizeClasses,
        capacity: usize,
        growth_policy: GrowthPolicy,
        drop_policy: DropPolicy,
    ) -> Result<Self> {
        let mut pools = HashMap::with_capacity(classes.len());

        for layout in classes.as_slice() {
            pools.insert(
                layout.size(),
                FixedLayoutAllocator::new(*layout, capacity, growth_policy)?,
            );
        }

        debug!(
            classes = ?classes.sizes().collect::<Vec<_>>(),
            capacity,
            "general purpose allocator created"
        );

        Ok(Self {
            classes,
            pools,
            drop_policy,
        })
    }

    /// Size of the class that objects of type `T` are stored in.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeClassExhausted`][crate::Error::SizeClassExhausted] if no class can
    /// hold a `T`.
    pub fn class_for<T>(&self) -> Result<usize> {
        self.classes.route(Layout::new::<T>())
    }

    /// Stores `T::default()` in the class that `T` is routed to.
    ///
    /// Returns an unbound handle if the class is full and not allowed to grow.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeClassExhausted`][crate::Error::SizeClassExhausted] if no class can
    /// hold a `T`, plus the errors of [`FixedLayoutAllocator::claim()`].
    pub fn allocate<T>(&mut self) -> Result<SlotHandle<T>>
    where
        T: Default + Send,
    {
        self.pool_for_mut::<T>()?.insert(T::default())
    }

    /// Stores `value` in the class that `T` is routed to.
    ///
    /// Returns an unbound handle (and drops `value`) if the class is full and not allowed to
    /// grow.
    ///
    /// # Errors
    ///
    /// As for [`allocate()`][Self::allocate].
    pub fn insert<T>(&mut self, value: T) -> Result<SlotHandle<T>>
    where
        T: Send,
    {
        self.pool_for_mut::<T>()?.insert(value)
    }

    /// Drops the object the handle refers to, releases its slot and turns `handle` into an
    /// unbound handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeClassExhausted`][crate::Error::SizeClassExhausted] if no class can
    /// hold a `T`. Returns [`Error::ForeignHandle`][crate::Error::ForeignHandle] if the handle
    /// was issued by a different class or allocator, plus the errors of
    /// [`FixedLayoutAllocator::remove()`]. Neither the allocator nor the handle is modified in
    /// those cases.
    ///
    /// # Safety
    ///
    /// If the slot is occupied, it must hold the `T` the handle was issued for. This is the case
    /// unless the object was deleted through another copy of the handle and the slot reused.
    /// Any lifetimes within `T` must still be valid.
    pub unsafe fn delete<T>(&mut self, handle: &mut SlotHandle<T>) -> Result<()> {
        let pool = self.pool_for_mut::<T>()?;

        // SAFETY: Forwarding the caller's guarantee.
        let value = unsafe { pool.remove(handle) }?;

        drop(value);

        Ok(())
    }

    /// Returns a reference to the object the handle refers to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeClassExhausted`][crate::Error::SizeClassExhausted] if no class can
    /// hold a `T`, plus the errors of [`FixedLayoutAllocator::get()`].
    ///
    /// # Safety
    ///
    /// As for [`delete()`][Self::delete].
    pub unsafe fn get<T>(&self, handle: &SlotHandle<T>) -> Result<&T> {
        let pool = self.pool_for::<T>()?;

        // SAFETY: Forwarding the caller's guarantee.
        unsafe { pool.get(handle) }
    }

    /// Returns an exclusive reference to the object the handle refers to.
    ///
    /// # Errors
    ///
    /// As for [`get()`][Self::get].
    ///
    /// # Safety
    ///
    /// As for [`delete()`][Self::delete].
    pub unsafe fn get_mut<T>(&mut self, handle: &SlotHandle<T>) -> Result<&mut T> {
        let pool = self.pool_for_mut::<T>()?;

        // SAFETY: Forwarding the caller's guarantee.
        unsafe { pool.get_mut(handle) }
    }

    /// The pool of the class with the given size, if such a class exists.
    ///
    /// Handles issued by the allocator resolve against the pool of their class.
    #[must_use]
    pub fn class_pool(&self, size: usize) -> Option<&FixedLayoutAllocator> {
        self.pools.get(&size)
    }

    /// Sizes of all classes, in ascending order.
    pub fn class_sizes(&self) -> impl Iterator<Item = usize> + '_ {
        self.classes.sizes()
    }

    /// The size classes of the allocator.
    #[must_use]
    pub fn size_classes(&self) -> &SizeClasses {
        &self.classes
    }

    /// Number of live objects across all classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.values().map(FixedLayoutAllocator::len).sum()
    }

    /// Whether no class holds any object.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.values().all(FixedLayoutAllocator::is_empty)
    }

    /// The drop policy the allocator was created with.
    #[must_use]
    pub fn drop_policy(&self) -> DropPolicy {
        self.drop_policy
    }

    fn pool_for<T>(&self) -> Result<&FixedLayoutAllocator> {
        let size = self.class_for::<T>()?;

        Ok(self
            .pools
            .get(&size)
            .expect("every size class has a pool from the moment the allocator is created"))
    }

    fn pool_for_mut<T>(&mut self) -> Result<&mut FixedLayoutAllocator> {
        let size = self.class_for::<T>()?;

        Ok(self
            .pools
            .get_mut(&size)
            .expect("every size class has a pool from the moment the allocator is created"))
    }
}

impl Drop for GeneralPurposeAllocator {
    fn drop(&mut self) {
        // The class pools release their memory when dropped. Destructors of remaining objects
        // cannot run because their types are unknown.

        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was, leading to debug difficulties.
        if self.drop_policy == DropPolicy::MustNotDropItems && !thread::panicking() {
            assert!(
                self.is_empty(),
                "dropped a non-empty general purpose allocator with a policy that says it must be empty when dropped"
            );
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "test code, we assume safety is considered"
)]
mod tests {
    use std::cell::Cell;
    use std::sync::Arc;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::Error;

    assert_impl_all!(GeneralPurposeAllocator: Send);
    assert_not_impl_any!(GeneralPurposeAllocator: Sync);

    #[derive(Default)]
    struct Twenty {
        bytes: [u8; 20],
    }

    #[test]
    fn creates_one_pool_per_class() {
        let allocator = GeneralPurposeAllocator::new().unwrap();

        assert_eq!(
            allocator.class_sizes().collect::<Vec<_>>(),
            vec![8, 16, 32, 64, 128, 256]
        );

        for size in allocator.class_sizes() {
            let pool = allocator.class_pool(size).unwrap();
            assert_eq!(pool.capacity(), 128);
            assert_eq!(pool.element_layout().size(), size);
        }

        assert!(allocator.class_pool(24).is_none());
    }

    #[test]
    fn routes_by_size() {
        let mut allocator = GeneralPurposeAllocator::new().unwrap();

        assert_eq!(allocator.class_for::<Twenty>().unwrap(), 32);

        let handle = allocator.allocate::<Twenty>().unwrap();

        let pool = allocator.class_pool(32).unwrap();
        assert_eq!(handle.pool_id(), Some(pool.pool_id()));
        assert_eq!(pool.len(), 1);
        assert_eq!(allocator.len(), 1);
    }

    #[test]
    fn oversized_type_is_exhausted() {
        let mut allocator = GeneralPurposeAllocator::new().unwrap();

        let result = allocator.insert([0_u8; 300]);

        assert!(matches!(
            result,
            Err(Error::SizeClassExhausted {
                size: 300,
                largest_class: 256,
                ..
            })
        ));
        assert!(allocator.is_empty());
    }

    #[test]
    fn insert_get_delete_round_trip() {
        let mut allocator = GeneralPurposeAllocator::new().unwrap();

        let mut handle = allocator
            .insert(Twenty {
                bytes: [3; 20],
            })
            .unwrap();

        unsafe {
            allocator.get_mut(&handle).unwrap().bytes[0] = 9;
        }

        let stored = unsafe { allocator.get(&handle) }.unwrap();
        assert_eq!(stored.bytes[0], 9);
        assert_eq!(stored.bytes[1], 3);

        unsafe { allocator.delete(&mut handle) }.unwrap();

        assert!(!handle.is_bound());
        assert!(allocator.is_empty());
    }

    #[test]
    fn delete_runs_destructor() {
        let tracker = Arc::new(());
        let mut allocator = GeneralPurposeAllocator::new().unwrap();

        let mut handle = allocator.insert(Arc::clone(&tracker)).unwrap();
        assert_eq!(Arc::strong_count(&tracker), 2);

        unsafe { allocator.delete(&mut handle) }.unwrap();
        assert_eq!(Arc::strong_count(&tracker), 1);
    }

    #[test]
    fn double_delete_is_detected() {
        let mut allocator = GeneralPurposeAllocator::new().unwrap();

        let mut handle = allocator.insert(5_u64).unwrap();
        let mut copy = handle;

        unsafe { allocator.delete(&mut handle) }.unwrap();
        let result = unsafe { allocator.delete(&mut copy) };

        assert!(matches!(result, Err(Error::DoubleFree { .. })));
    }

    #[test]
    fn handle_from_other_class_is_foreign() {
        let mut allocator = GeneralPurposeAllocator::new().unwrap();

        let handle = allocator.insert(5_u64).unwrap();
        let mut misrouted = SlotHandle::<Twenty>::from_parts(handle.pool_id().unwrap(), 0);

        let result = unsafe { allocator.delete(&mut misrouted) };

        assert!(matches!(result, Err(Error::ForeignHandle { .. })));
        assert_eq!(allocator.len(), 1);
    }

    #[test]
    fn objects_of_different_types_share_a_class() {
        let mut allocator = GeneralPurposeAllocator::new().unwrap();

        let a = allocator.insert(1_u32).unwrap();
        let b = allocator.insert(2_u64).unwrap();
        let c = allocator.insert(Cell::new(3_u16)).unwrap();

        assert_eq!(a.pool_id(), b.pool_id());
        assert_eq!(b.pool_id(), c.pool_id());

        unsafe {
            assert_eq!(*allocator.get(&a).unwrap(), 1);
            assert_eq!(*allocator.get(&b).unwrap(), 2);
            assert_eq!(allocator.get(&c).unwrap().get(), 3);
        }
    }

    #[test]
    fn handles_resolve_with_class_stride_after_growth() {
        let mut allocator = GeneralPurposeAllocator::builder()
            .capacity(8)
            .build()
            .unwrap();

        let handles = (0..20_u32)
            .map(|value| {
                allocator
                    .insert(Twenty {
                        bytes: [u8::try_from(value).unwrap(); 20],
                    })
                    .unwrap()
            })
            .collect::<Vec<_>>();

        let pool = allocator.class_pool(32).unwrap();
        assert_eq!(pool.capacity(), 32);

        for (value, handle) in (0..20_u8).zip(&handles) {
            let resolved = unsafe { handle.resolve(pool).as_ref() };
            assert_eq!(resolved.bytes, [value; 20]);
        }
    }

    #[test]
    fn full_fixed_class_returns_unbound() {
        let mut allocator = GeneralPurposeAllocator::builder()
            .capacity(8)
            .growth_policy(GrowthPolicy::Fixed)
            .build()
            .unwrap();

        for value in 0..8_u64 {
            assert!(allocator.insert(value).unwrap().is_bound());
        }

        assert!(!allocator.insert(8_u64).unwrap().is_bound());

        // Other classes are unaffected.
        assert!(allocator.insert([0_u8; 16]).unwrap().is_bound());
    }

    #[test]
    fn drop_with_live_objects_leaks_them() {
        let tracker = Arc::new(());

        {
            let mut allocator = GeneralPurposeAllocator::new().unwrap();
            allocator.insert(Arc::clone(&tracker)).unwrap();
        }

        // The destructor did not run, so the clone is leaked.
        assert_eq!(Arc::strong_count(&tracker), 2);
    }

    #[test]
    #[should_panic]
    fn drop_item_with_forbidden_to_drop_policy_panics() {
        let mut allocator = GeneralPurposeAllocator::builder()
            .drop_policy(DropPolicy::MustNotDropItems)
            .build()
            .unwrap();

        allocator.insert(1_u8).unwrap();
    }
}
