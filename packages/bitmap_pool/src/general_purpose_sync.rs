use std::alloc::Layout;
use std::thread;

use foldhash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    DropPolicy, FixedLayoutAllocator, GeneralPurposeAllocatorBuilder, GrowthPolicy, Result,
    SizeClasses, SlotHandle,
};

/// A thread-safe allocator for objects of any type, routed by size and alignment into a fixed
/// set of size classes.
///
/// Behaves like [`GeneralPurposeAllocator`][crate::GeneralPurposeAllocator] but every method
/// takes `&self`. Each size class has its own lock, so threads working with objects of
/// different classes do not contend with each other.
///
/// Values are constructed before the class lock is taken and dropped after it is released.
/// References to stored objects are only handed out inside closures that run while the class is
/// locked, because the class may grow at any time on another thread.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use bitmap_pool::GeneralPurposeAllocator;
///
/// let allocator = Arc::new(GeneralPurposeAllocator::builder().build_sync().unwrap());
///
/// let handle = thread::spawn({
///     let allocator = Arc::clone(&allocator);
///     move || allocator.insert([1_u32; 4]).unwrap()
/// })
/// .join()
/// .unwrap();
///
/// // SAFETY: The handle was issued for a [u32; 4] and has not been deleted.
/// let sum = unsafe { allocator.with(&handle, |values| values.iter().sum::<u32>()) }.unwrap();
/// assert_eq!(sum, 4);
/// ```
#[derive(Debug)]
pub struct SyncGeneralPurposeAllocator {
    classes: SizeClasses,

    /// One pool per class, keyed by class size. The map itself never changes after
    /// construction, only the pools behind the locks do.
    pools: HashMap<usize, Mutex<FixedLayoutAllocator>>,

    drop_policy: DropPolicy,
}

impl SyncGeneralPurposeAllocator {
    /// Creates an allocator with the default configuration: size classes of 8, 16, 32, 64, 128
    /// and 256 bytes with 128 slots each, doubling growth.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`][crate::Error::ResourceExhausted] if a class pool
    /// could not be allocated.
    pub fn new() -> Result<Self> {
        GeneralPurposeAllocatorBuilder::new().build_sync()
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
                Mutex::new(FixedLayoutAllocator::new(*layout, capacity, growth_policy)?),
            );
        }

        debug!(
            classes = ?classes.sizes().collect::<Vec<_>>(),
            capacity,
            "thread-safe general purpose allocator created"
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
    pub fn allocate<T>(&self) -> Result<SlotHandle<T>>
    where
        T: Default + Send,
    {
        self.insert(T::default())
    }

    /// Stores `value` in the class that `T` is routed to.
    ///
    /// Returns an unbound handle if the class is full and not allowed to grow. The value is
    /// dropped after the class lock is released in that case, as it is on error.
    ///
    /// # Errors
    ///
    /// As for [`allocate()`][Self::allocate].
    pub fn insert<T>(&self, value: T) -> Result<SlotHandle<T>>
    where
        T: Send,
    {
        let mut pool = self.pool_for::<T>()?.lock();

        let claim = match pool.check_fits::<T>().and_then(|()| pool.claim()) {
            Ok(Some(claim)) => claim,
            rejected => {
                drop(pool);
                drop(value);

                return rejected.map(|_| SlotHandle::unbound());
            }
        };

        // SAFETY: The slot was just claimed from this pool and `check_fits()` passed.
        Ok(unsafe { pool.write_claimed(claim, value) })
    }

    /// Releases the slot the handle refers to, turns `handle` into an unbound handle and drops
    /// the object after the class lock has been released.
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
    pub unsafe fn delete<T>(&self, handle: &mut SlotHandle<T>) -> Result<()> {
        let pool = self.pool_for::<T>()?;

        // SAFETY: Forwarding the caller's guarantee.
        let value = unsafe { pool.lock().remove(handle) }?;

        drop(value);

        Ok(())
    }

    /// Calls `f` with a reference to the object the handle refers to, while its class is locked.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeClassExhausted`][crate::Error::SizeClassExhausted] if no class can
    /// hold a `T`, plus the errors of [`FixedLayoutAllocator::get()`].
    ///
    /// # Safety
    ///
    /// As for [`delete()`][Self::delete].
    pub unsafe fn with<T, R>(&self, handle: &SlotHandle<T>, f: impl FnOnce(&T) -> R) -> Result<R> {
        let pool = self.pool_for::<T>()?.lock();

        // SAFETY: Forwarding the caller's guarantee.
        let item = unsafe { pool.get(handle) }?;

        Ok(f(item))
    }

    /// Calls `f` with an exclusive reference to the object the handle refers to, while its class
    /// is locked.
    ///
    /// # Errors
    ///
    /// As for [`with()`][Self::with].
    ///
    /// # Safety
    ///
    /// As for [`delete()`][Self::delete].
    pub unsafe fn with_mut<T, R>(
        &self,
        handle: &SlotHandle<T>,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R> {
        let mut pool = self.pool_for::<T>()?.lock();

        // SAFETY: Forwarding the caller's guarantee.
        let item = unsafe { pool.get_mut(handle) }?;

        Ok(f(item))
    }

    /// Calls `f` with the pool of the class with the given size while the class is locked, or
    /// returns `None` if there is no such class.
    pub fn with_class_pool<R>(
        &self,
        size: usize,
        f: impl FnOnce(&FixedLayoutAllocator) -> R,
    ) -> Option<R> {
        let pool = self.pools.get(&size)?.lock();
        Some(f(&pool))
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
    ///
    /// Classes are locked one after another, so the result may be stale by the time it is
    /// returned if other threads are using the allocator.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.values().map(|pool| pool.lock().len()).sum()
    }

    /// Whether no class holds any object. Subject to the same staleness as [`len()`][Self::len].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.values().all(|pool| pool.lock().is_empty())
    }

    /// The drop policy the allocator was created with.
    #[must_use]
    pub fn drop_policy(&self) -> DropPolicy {
        self.drop_policy
    }

    fn pool_for<T>(&self) -> Result<&Mutex<FixedLayoutAllocator>> {
        let size = self.class_for::<T>()?;

        Ok(self
            .pools
            .get(&size)
            .expect("every size class has a pool from the moment the allocator is created"))
    }
}

impl Drop for SyncGeneralPurposeAllocator {
    fn drop(&mut self) {
        let is_empty = self
            .pools
            .values_mut()
            .all(|pool| pool.get_mut().is_empty());

        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was, leading to debug difficulties.
        if self.drop_policy == DropPolicy::MustNotDropItems && !thread::panicking() {
            assert!(
                is_empty,
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, OnceLock, Weak};
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{Error, GeneralPurposeAllocator};

    assert_impl_all!(SyncGeneralPurposeAllocator: Send, Sync);

    fn allocator() -> SyncGeneralPurposeAllocator {
        GeneralPurposeAllocator::builder().build_sync().unwrap()
    }

    #[test]
    fn round_trip() {
        let allocator = allocator();

        let mut handle = allocator.insert([7_u8; 20]).unwrap();
        assert_eq!(allocator.class_for::<[u8; 20]>().unwrap(), 32);

        unsafe { allocator.with_mut(&handle, |bytes| bytes[0] = 1) }.unwrap();
        let first = unsafe { allocator.with(&handle, |bytes| bytes[0]) }.unwrap();
        assert_eq!(first, 1);

        unsafe { allocator.delete(&mut handle) }.unwrap();
        assert!(!handle.is_bound());
        assert!(allocator.is_empty());
    }

    #[test]
    fn allocate_uses_default() {
        let allocator = allocator();

        let handle = allocator.allocate::<u64>().unwrap();

        assert_eq!(unsafe { allocator.with(&handle, |value| *value) }.unwrap(), 0);
        assert_eq!(allocator.len(), 1);
    }

    #[test]
    fn oversized_type_is_exhausted() {
        let allocator = allocator();

        assert!(matches!(
            allocator.insert([0_u8; 300]),
            Err(Error::SizeClassExhausted { size: 300, .. })
        ));
    }

    #[test]
    fn double_delete_is_detected() {
        let allocator = allocator();

        let mut handle = allocator.insert(1_u16).unwrap();
        let mut copy = handle;

        unsafe { allocator.delete(&mut handle) }.unwrap();

        assert!(matches!(
            unsafe { allocator.delete(&mut copy) },
            Err(Error::DoubleFree { .. })
        ));
    }

    #[test]
    fn class_pool_is_observable() {
        let allocator = allocator();
        let handle = allocator.insert(9_u64).unwrap();

        let (id, len) = allocator
            .with_class_pool(8, |pool| (pool.pool_id(), pool.len()))
            .unwrap();

        assert_eq!(handle.pool_id(), Some(id));
        assert_eq!(len, 1);
        assert!(allocator.with_class_pool(9, |_| ()).is_none());
    }

    #[test]
    fn concurrent_use_from_many_threads() {
        let allocator = Arc::new(allocator());
        let all_inserted = Arc::new(Barrier::new(4));

        let workers = (0..4_u64)
            .map(|worker| {
                let allocator = Arc::clone(&allocator);
                let all_inserted = Arc::clone(&all_inserted);

                thread::spawn(move || {
                    let mut handles = (0..200)
                        .map(|value| allocator.insert(worker * 1000 + value).unwrap())
                        .collect::<Vec<_>>();

                    for (value, handle) in (0..200).zip(&handles) {
                        let stored = unsafe { allocator.with(handle, |stored| *stored) }.unwrap();
                        assert_eq!(stored, worker * 1000 + value);
                    }

                    // All 800 objects are live at once before any of them is deleted.
                    all_inserted.wait();

                    for handle in &mut handles {
                        unsafe { allocator.delete(handle) }.unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();

        for worker in workers {
            worker.join().unwrap();
        }

        assert!(allocator.is_empty());
        assert!(allocator.with_class_pool(8, FixedLayoutAllocator::capacity).unwrap() >= 800);
    }

    struct ReadsAllocatorOnDrop {
        allocator: Arc<OnceLock<Weak<SyncGeneralPurposeAllocator>>>,
        len_seen_on_drop: Arc<AtomicUsize>,
    }

    impl Drop for ReadsAllocatorOnDrop {
        fn drop(&mut self) {
            if let Some(allocator) = self.allocator.get().and_then(Weak::upgrade) {
                // This locks every class, so it would deadlock if called while one is locked.
                self.len_seen_on_drop.store(allocator.len(), Ordering::Relaxed);
            }
        }
    }

    #[test]
    fn rejected_value_is_dropped_outside_the_lock() {
        let slot = Arc::new(OnceLock::new());
        let len_seen_on_drop = Arc::new(AtomicUsize::new(usize::MAX));

        let allocator = Arc::new(
            GeneralPurposeAllocator::builder()
                .capacity(8)
                .growth_policy(GrowthPolicy::Fixed)
                .build_sync()
                .unwrap(),
        );
        slot.set(Arc::downgrade(&allocator)).unwrap();

        assert_eq!(allocator.class_for::<ReadsAllocatorOnDrop>().unwrap(), 16);

        for value in 0..8_u64 {
            allocator.insert([value; 2]).unwrap();
        }

        let handle = allocator
            .insert(ReadsAllocatorOnDrop {
                allocator: Arc::clone(&slot),
                len_seen_on_drop: Arc::clone(&len_seen_on_drop),
            })
            .unwrap();

        assert!(!handle.is_bound());
        assert_eq!(len_seen_on_drop.load(Ordering::Relaxed), 8);
    }
}
