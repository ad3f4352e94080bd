use std::alloc::Layout;
use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::thread;

use parking_lot::Mutex;

use crate::fixed_type::{GrowthCallback, claim_in, for_each_in};
use crate::{
    DropPolicy, Error, FixedLayoutAllocator, FixedTypeAllocatorBuilder, GrowthPolicy,
    IterationMode, PoolId, Result, SlotHandle,
};

/// A thread-safe pool of objects of type `T`.
///
/// Behaves like [`FixedTypeAllocator`][crate::FixedTypeAllocator] but every method takes
/// `&self`, so the pool can be shared between threads (for example in an `Arc`). All state is
/// protected by a single lock per pool.
///
/// Constructing and dropping objects happens outside the lock: [`insert()`][Self::insert]
/// receives an already constructed value and only moves it into its slot while locked, and
/// [`free()`][Self::free] moves the object out of its slot while locked and drops it after the
/// lock is released. Growth and the growth callback run while the pool is locked.
///
/// Because the pool may grow at any time on another thread, references to objects are only
/// handed out inside closures ([`with()`][Self::with], [`with_mut()`][Self::with_mut]) that run
/// while the pool is locked.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use bitmap_pool::FixedTypeAllocator;
///
/// let pool = Arc::new(FixedTypeAllocator::<u64>::builder().build_sync().unwrap());
///
/// let workers = (0..4)
///     .map(|worker| {
///         let pool = Arc::clone(&pool);
///         thread::spawn(move || {
///             let mut handle = pool.insert(worker).unwrap();
///             pool.with_mut(&handle, |value| *value *= 10).unwrap();
///             let value = pool.with(&handle, |value| *value).unwrap();
///             pool.free(&mut handle).unwrap();
///             value
///         })
///     })
///     .collect::<Vec<_>>();
///
/// let total: u64 = workers.into_iter().map(|w| w.join().unwrap()).sum();
/// assert_eq!(total, 60);
/// assert!(pool.is_empty());
/// ```
pub struct SyncFixedTypeAllocator<T> {
    core: Mutex<Core>,

    // Immutable after construction, so readable without the lock.
    pool_id: PoolId,
    drop_policy: DropPolicy,

    // The pool owns `T`s and hands them to one thread at a time, just like a mutex.
    _owns: PhantomData<Mutex<T>>,
}

struct Core {
    pool: FixedLayoutAllocator,
    on_grow: Option<GrowthCallback>,
}

impl<T> SyncFixedTypeAllocator<T> {
    /// Creates a pool with the default configuration: 1024 slots, doubling growth, remaining
    /// objects dropped with the pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if `T` is zero-sized and
    /// [`Error::ResourceExhausted`] if the memory block could not be allocated.
    pub fn new() -> Result<Self> {
        FixedTypeAllocatorBuilder::new().build_sync()
    }

    pub(crate) fn new_inner(
        capacity: usize,
        growth_policy: GrowthPolicy,
        drop_policy: DropPolicy,
        on_grow: Option<GrowthCallback>,
    ) -> Result<Self> {
        if size_of::<T>() == 0 {
            return Err(Error::invalid_configuration(format!(
                "{} is zero-sized and cannot be pooled",
                type_name::<T>()
            )));
        }

        let pool = FixedLayoutAllocator::new(Layout::new::<T>(), capacity, growth_policy)?;

        Ok(Self {
            pool_id: pool.pool_id(),
            core: Mutex::new(Core { pool, on_grow }),
            drop_policy,
            _owns: PhantomData,
        })
    }

    /// Registers a callback that is called every time the pool grows, replacing any previous
    /// callback.
    ///
    /// The callback runs while the pool is locked, so it must not access the same pool.
    pub fn set_on_grow(&self, callback: impl FnMut() + Send + 'static) {
        self.core.lock().on_grow = Some(Box::new(callback));
    }

    /// Constructs `T::default()` and moves it into a vacant slot.
    ///
    /// Returns an unbound handle if the pool is full and not allowed to grow.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] if the pool needed to grow but could not, and
    /// [`Error::InvariantViolation`] if the occupancy bookkeeping is corrupt.
    pub fn allocate(&self) -> Result<SlotHandle<T>>
    where
        T: Default,
    {
        self.insert(T::default())
    }

    /// Moves `value` into a vacant slot.
    ///
    /// Returns an unbound handle if the pool is full and not allowed to grow. The value is
    /// dropped after the lock is released in that case, as it is on error.
    ///
    /// # Errors
    ///
    /// As for [`allocate()`][Self::allocate].
    pub fn insert(&self, value: T) -> Result<SlotHandle<T>> {
        let mut guard = self.core.lock();
        let core = &mut *guard;

        let claim = match claim_in(&mut core.pool, &mut core.on_grow) {
            Ok(Some(claim)) => claim,
            rejected => {
                drop(guard);
                drop(value);

                return rejected.map(|_| SlotHandle::unbound());
            }
        };

        // SAFETY: The slot was just claimed from this pool, which was created with the layout
        // of `T`.
        Ok(unsafe { core.pool.write_claimed(claim, value) })
    }

    /// Releases the slot the handle refers to, turns `handle` into an unbound handle and drops
    /// the object after the lock has been released.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnboundHandle`] for an unbound handle, [`Error::ForeignHandle`] for a
    /// handle issued by another pool, [`Error::OutOfBounds`] if the slot index is not below the
    /// capacity and [`Error::DoubleFree`] if the slot is already vacant. Neither the pool nor the
    /// handle is modified in those cases.
    pub fn free(&self, handle: &mut SlotHandle<T>) -> Result<()> {
        let value = {
            let mut core = self.core.lock();

            let index = core.pool.check_release(handle)?;
            core.pool.release(index)?;

            // SAFETY: The index was bounds-checked above and the pool was created for `T`.
            let slot = unsafe { core.pool.typed_slot_unchecked::<T>(index) };

            // SAFETY: The slot was occupied until just now, so it holds an initialized `T`. We
            // take ownership of it here and the vacant slot is never read before it is
            // overwritten.
            unsafe { slot.read() }
        };

        handle.zero_out();
        drop(value);

        Ok(())
    }

    /// Calls `f` with a reference to the object the handle refers to, while the pool is locked.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnboundHandle`], [`Error::ForeignHandle`] or [`Error::OutOfBounds`] if
    /// the handle does not fit this pool and [`Error::VacantSlot`] if the slot holds no object.
    pub fn with<R>(&self, handle: &SlotHandle<T>, f: impl FnOnce(&T) -> R) -> Result<R> {
        let core = self.core.lock();

        // SAFETY: Every occupied slot of this pool holds a `T`.
        let item = unsafe { core.pool.get(handle) }?;

        Ok(f(item))
    }

    /// Calls `f` with an exclusive reference to the object the handle refers to, while the pool
    /// is locked.
    ///
    /// # Errors
    ///
    /// As for [`with()`][Self::with].
    pub fn with_mut<R>(&self, handle: &SlotHandle<T>, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut core = self.core.lock();

        // SAFETY: Every occupied slot of this pool holds a `T`.
        let item = unsafe { core.pool.get_mut(handle) }?;

        Ok(f(item))
    }

    /// Calls `f` with the current address of the object the handle refers to, while the pool is
    /// locked. The address must not be used after `f` returns.
    ///
    /// # Panics
    ///
    /// Panics if the handle is unbound or was issued by another pool.
    pub fn with_resolved<R>(&self, handle: &SlotHandle<T>, f: impl FnOnce(NonNull<T>) -> R) -> R {
        let core = self.core.lock();
        f(handle.resolve(&core.pool))
    }

    /// Calls `f` for objects in the pool, selected by `mode`, while the pool is locked.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotPacked`] without calling `f` if `mode` is [`IterationMode::Fast`]
    /// and the pool has vacant slots.
    pub fn for_each(&self, mode: IterationMode, f: impl FnMut(&mut T)) -> Result<()> {
        let mut core = self.core.lock();

        // SAFETY: Every occupied slot of this pool holds a `T`.
        unsafe { for_each_in(&mut core.pool, mode, f) }
    }

    /// Calls `f` for every slot in the pool without consulting the occupancy bitmap, while the
    /// pool is locked.
    ///
    /// # Safety
    ///
    /// Every slot must be occupied, i.e. `len() == capacity()`, for the whole duration of the
    /// call.
    pub unsafe fn for_each_unchecked(&self, f: impl FnMut(&mut T)) {
        let mut core = self.core.lock();

        // SAFETY: Forwarding the caller's guarantee that every slot holds a `T`.
        unsafe { core.pool.for_each_slot_as::<T>(f) };
    }

    /// Identity of the pool, shared by every handle it issues.
    #[must_use]
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// Number of slots in the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.core.lock().pool.capacity()
    }

    /// Number of live objects in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.core.lock().pool.len()
    }

    /// Whether the pool holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.core.lock().pool.is_empty()
    }

    /// Whether every slot holds an object.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.core.lock().pool.is_full()
    }

    /// Whether the slot with the given index holds an object.
    #[must_use]
    pub fn is_occupied(&self, index: usize) -> bool {
        self.core.lock().pool.is_occupied(index)
    }

    /// Layout of a single slot.
    #[must_use]
    pub fn element_layout(&self) -> Layout {
        self.core.lock().pool.element_layout()
    }

    /// The growth policy the pool was created with.
    #[must_use]
    pub fn growth_policy(&self) -> GrowthPolicy {
        self.core.lock().pool.growth_policy()
    }

    /// The drop policy the pool was created with.
    #[must_use]
    pub fn drop_policy(&self) -> DropPolicy {
        self.drop_policy
    }
}

impl<T> fmt::Debug for SyncFixedTypeAllocator<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("pool_id", &self.pool_id)
            .field("drop_policy", &self.drop_policy)
            .finish_non_exhaustive()
    }
}

impl<T> Drop for SyncFixedTypeAllocator<T> {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        let was_empty = core.pool.is_empty();

        // SAFETY: Every occupied slot holds a `T`. The pool is going away, so nothing will
        // observe the dropped objects.
        unsafe {
            core.pool.drop_occupied_as::<T>();
        }

        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was, leading to debug difficulties.
        if self.drop_policy == DropPolicy::MustNotDropItems && !thread::panicking() {
            assert!(
                was_empty,
                "dropped a non-empty pool of {} with a policy that says it must be empty when dropped",
                type_name::<T>()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, OnceLock, Weak};

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::FixedTypeAllocator;

    assert_impl_all!(SyncFixedTypeAllocator<u32>: Send, Sync, fmt::Debug);
    assert_impl_all!(SyncFixedTypeAllocator<Cell<u32>>: Send, Sync);
    assert_not_impl_any!(SyncFixedTypeAllocator<Rc<u32>>: Send, Sync);

    fn sync_pool<T>(capacity: usize, growth_policy: GrowthPolicy) -> SyncFixedTypeAllocator<T> {
        FixedTypeAllocator::builder()
            .capacity(capacity)
            .growth_policy(growth_policy)
            .build_sync()
            .unwrap()
    }

    #[test]
    fn insert_with_free_round_trip() {
        let pool = sync_pool::<String>(8, GrowthPolicy::Fixed);

        let mut handle = pool.insert("pooled".to_string()).unwrap();
        assert_eq!(pool.len(), 1);

        let length = pool.with(&handle, String::len).unwrap();
        assert_eq!(length, 6);

        pool.with_mut(&handle, |value| value.push('!')).unwrap();
        assert_eq!(pool.with(&handle, Clone::clone).unwrap(), "pooled!");

        pool.free(&mut handle).unwrap();
        assert!(!handle.is_bound());
        assert!(pool.is_empty());
    }

    #[test]
    fn allocate_uses_default() {
        let pool = sync_pool::<u64>(8, GrowthPolicy::Fixed);

        let handle = pool.allocate().unwrap();

        assert_eq!(pool.with(&handle, |value| *value).unwrap(), 0);
    }

    #[test]
    fn full_fixed_pool_returns_unbound() {
        let pool = sync_pool::<u64>(8, GrowthPolicy::Fixed);

        for value in 0..8 {
            assert!(pool.insert(value).unwrap().is_bound());
        }

        assert!(!pool.allocate().unwrap().is_bound());
        assert!(pool.is_full());
    }

    #[test]
    fn growth_calls_callback_and_keeps_values() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = sync_pool::<u64>(8, GrowthPolicy::Doubling);

        pool.set_on_grow({
            let calls = Arc::clone(&calls);
            move || {
                calls.fetch_add(1, Ordering::Relaxed);
            }
        });

        let handles = (0..9_u64)
            .map(|value| pool.insert(value).unwrap())
            .collect::<Vec<_>>();

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(pool.capacity(), 16);

        for (value, handle) in (0..9_u64).zip(&handles) {
            assert_eq!(pool.with(handle, |stored| *stored).unwrap(), value);

            // SAFETY: The address is only used while the pool is locked.
            let resolved = pool.with_resolved(handle, |ptr| unsafe { *ptr.as_ref() });
            assert_eq!(resolved, value);
        }
    }

    #[test]
    fn contract_violations_are_reported() {
        let pool = sync_pool::<u64>(8, GrowthPolicy::Fixed);

        let mut handle = pool.insert(1).unwrap();
        let mut copy = handle;
        pool.free(&mut handle).unwrap();

        assert!(matches!(pool.free(&mut copy), Err(Error::DoubleFree { .. })));
        assert!(matches!(pool.free(&mut handle), Err(Error::UnboundHandle)));

        let mut out_of_range = SlotHandle::from_parts(pool.pool_id(), 64);
        assert!(matches!(
            pool.free(&mut out_of_range),
            Err(Error::OutOfBounds {
                index: 64,
                capacity: 8
            })
        ));
    }

    #[test]
    fn iteration_modes() {
        let pool = sync_pool::<u32>(8, GrowthPolicy::Fixed);

        for value in 0..8 {
            pool.insert(value).unwrap();
        }

        let mut sum = 0;
        pool.for_each(IterationMode::Fast, |value| sum += *value)
            .unwrap();
        assert_eq!(sum, 28);

        let mut handle = SlotHandle::from_parts(pool.pool_id(), 3);
        pool.free(&mut handle).unwrap();

        assert!(matches!(
            pool.for_each(IterationMode::Fast, |_| {}),
            Err(Error::NotPacked { len: 7, .. })
        ));

        let mut count = 0;
        pool.for_each(IterationMode::Active, |_| count += 1)
            .unwrap();
        assert_eq!(count, 7);
    }

    struct ReadsPoolOnDrop {
        pool: Arc<OnceLock<Weak<SyncFixedTypeAllocator<ReadsPoolOnDrop>>>>,
        len_seen_on_drop: Arc<AtomicUsize>,
    }

    impl Drop for ReadsPoolOnDrop {
        fn drop(&mut self) {
            if let Some(pool) = self.pool.get().and_then(Weak::upgrade) {
                // This locks the pool, so it would deadlock if called while the pool is locked.
                self.len_seen_on_drop.store(pool.len(), Ordering::Relaxed);
            }
        }
    }

    #[test]
    fn free_drops_value_outside_the_lock() {
        let slot = Arc::new(OnceLock::new());
        let len_seen_on_drop = Arc::new(AtomicUsize::new(usize::MAX));

        let pool = Arc::new(sync_pool::<ReadsPoolOnDrop>(8, GrowthPolicy::Fixed));
        slot.set(Arc::downgrade(&pool)).unwrap();

        let mut handle = pool
            .insert(ReadsPoolOnDrop {
                pool: Arc::clone(&slot),
                len_seen_on_drop: Arc::clone(&len_seen_on_drop),
            })
            .unwrap();

        pool.free(&mut handle).unwrap();

        assert_eq!(len_seen_on_drop.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn rejected_insert_drops_value_outside_the_lock() {
        let slot = Arc::new(OnceLock::new());
        let len_seen_on_drop = Arc::new(AtomicUsize::new(usize::MAX));

        let pool = Arc::new(sync_pool::<ReadsPoolOnDrop>(8, GrowthPolicy::Fixed));
        slot.set(Arc::downgrade(&pool)).unwrap();

        let new_value = || ReadsPoolOnDrop {
            pool: Arc::clone(&slot),
            len_seen_on_drop: Arc::clone(&len_seen_on_drop),
        };

        let mut handles = (0..8)
            .map(|_| pool.insert(new_value()).unwrap())
            .collect::<Vec<_>>();

        let rejected = pool.insert(new_value()).unwrap();

        assert!(!rejected.is_bound());
        assert_eq!(len_seen_on_drop.load(Ordering::Relaxed), 8);

        for handle in &mut handles {
            pool.free(handle).unwrap();
        }
    }

    #[test]
    fn drop_runs_remaining_destructors() {
        let tracker = Arc::new(());

        {
            let pool = sync_pool::<Arc<()>>(8, GrowthPolicy::Fixed);
            pool.insert(Arc::clone(&tracker)).unwrap();
            assert_eq!(Arc::strong_count(&tracker), 2);
        }

        assert_eq!(Arc::strong_count(&tracker), 1);
    }

    #[test]
    #[should_panic]
    fn drop_item_with_forbidden_to_drop_policy_panics() {
        let pool = FixedTypeAllocator::<u32>::builder()
            .drop_policy(DropPolicy::MustNotDropItems)
            .build_sync()
            .unwrap();

        pool.insert(123).unwrap();
    }

    #[test]
    fn zero_sized_type_is_rejected() {
        let result = SyncFixedTypeAllocator::<()>::new();
        assert!(matches!(result, Err(Error::InvalidConfiguration { .. })));
    }
}
