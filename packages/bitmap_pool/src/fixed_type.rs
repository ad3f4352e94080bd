use std::alloc::Layout;
use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::thread;

use tracing::warn;

use crate::{
    Claim, DropPolicy, Error, FixedLayoutAllocator, FixedTypeAllocatorBuilder, GrowthPolicy,
    PoolId, Result, SlotHandle, SlotSource,
};

pub(crate) type GrowthCallback = Box<dyn FnMut() + Send>;

/// Selects which slots [`FixedTypeAllocator::for_each()`] visits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum IterationMode {
    /// Visits only occupied slots, in ascending slot order. Always valid.
    Active,

    /// Visits every slot without consulting the occupancy bitmap. Only valid if the pool is
    /// fully packed, which is checked before any slot is visited.
    Fast,
}

/// A pool of objects of type `T`, stored in a single contiguous memory block and tracked by an
/// occupancy bitmap.
///
/// Objects are referred to by [`SlotHandle`]s, which stay valid when the pool grows. The pool
/// owns its objects: they live until they are [freed][Self::free] or the pool is dropped.
///
/// This variant is not thread-safe; it can be moved to another thread (if `T: Send`) but
/// not shared. See [`SyncFixedTypeAllocator`][crate::SyncFixedTypeAllocator] for a variant that
/// can be shared between threads.
///
/// # Growth
///
/// With [`GrowthPolicy::Doubling`] (the default), a full pool doubles its capacity on the next
/// allocation. Every object moves to the new memory block, so addresses obtained from
/// [`SlotHandle::resolve()`] before growth must not be used afterwards. An optional callback
/// registered with [`set_on_grow()`][Self::set_on_grow] or the builder is called right after
/// each growth, before the object that triggered it is stored.
///
/// With [`GrowthPolicy::Fixed`], an allocation from a full pool returns an unbound handle.
///
/// # Example
///
/// ```
/// use bitmap_pool::{FixedTypeAllocator, IterationMode};
///
/// #[derive(Default)]
/// struct Particle {
///     position: f32,
///     velocity: f32,
/// }
///
/// let mut pool = FixedTypeAllocator::<Particle>::builder()
///     .capacity(8)
///     .build()
///     .unwrap();
///
/// let first = pool.allocate().unwrap();
/// let mut second = pool.allocate().unwrap();
///
/// pool.get_mut(&first).unwrap().velocity = 1.5;
/// pool.free(&mut second).unwrap();
///
/// pool.for_each(IterationMode::Active, |particle| {
///     particle.position += particle.velocity;
/// })
/// .unwrap();
///
/// assert_eq!(pool.get(&first).unwrap().position, 1.5);
/// ```
pub struct FixedTypeAllocator<T> {
    inner: FixedLayoutAllocator,
    on_grow: Option<GrowthCallback>,
    drop_policy: DropPolicy,

    // The pool owns the objects stored in it.
    _owns: PhantomData<T>,
}

impl<T> FixedTypeAllocator<T> {
    /// Creates a pool with the default configuration: 1024 slots, doubling growth, remaining
    /// objects dropped with the pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if `T` is zero-sized and
    /// [`Error::ResourceExhausted`] if the memory block could not be allocated.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Starts building a pool with a custom configuration.
    pub fn builder() -> FixedTypeAllocatorBuilder<T> {
        FixedTypeAllocatorBuilder::new()
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

        Ok(Self {
            inner: FixedLayoutAllocator::new(Layout::new::<T>(), capacity, growth_policy)?,
            on_grow,
            drop_policy,
            _owns: PhantomData,
        })
    }

    /// Registers a callback that is called every time the pool grows, replacing any previous
    /// callback.
    pub fn set_on_grow(&mut self, callback: impl FnMut() + Send + 'static) {
        self.on_grow = Some(Box::new(callback));
    }

    /// Allocates a slot and fills it with `T::default()`.
    ///
    /// Returns an unbound handle if the pool is full and not allowed to grow.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] if the pool needed to grow but could not, and
    /// [`Error::InvariantViolation`] if the occupancy bookkeeping is corrupt.
    pub fn allocate(&mut self) -> Result<SlotHandle<T>>
    where
        T: Default,
    {
        if self.is_full_and_fixed() {
            return Ok(SlotHandle::unbound());
        }

        self.insert(T::default())
    }

    /// Moves `value` into a vacant slot.
    ///
    /// Returns an unbound handle (and drops `value`) if the pool is full and not allowed to grow.
    ///
    /// # Errors
    ///
    /// As for [`allocate()`][Self::allocate].
    pub fn insert(&mut self, value: T) -> Result<SlotHandle<T>> {
        // SAFETY: The closure initializes the value and cannot panic.
        unsafe {
            self.insert_with(|uninit: &mut MaybeUninit<T>| {
                uninit.write(value);
            })
        }
    }

    /// Claims a vacant slot and lets `f` initialize the object in place.
    ///
    /// Returns an unbound handle without calling `f` if the pool is full and not allowed to grow.
    ///
    /// # Errors
    ///
    /// As for [`allocate()`][Self::allocate].
    ///
    /// # Safety
    ///
    /// The closure must fully initialize the `MaybeUninit<T>` and must not panic.
    pub unsafe fn insert_with(
        &mut self,
        f: impl FnOnce(&mut MaybeUninit<T>),
    ) -> Result<SlotHandle<T>> {
        let Some(claim) = claim_in(&mut self.inner, &mut self.on_grow)? else {
            return Ok(SlotHandle::unbound());
        };

        // SAFETY: The slot was just claimed so it is in bounds, and the pool was created with
        // the layout of `T`.
        let mut slot = unsafe {
            self.inner
                .typed_slot_unchecked::<MaybeUninit<T>>(claim.index())
        };

        // SAFETY: The claimed slot is not referenced by anything else and `MaybeUninit` is
        // valid for any content.
        f(unsafe { slot.as_mut() });

        Ok(SlotHandle::bound(self.inner.pool_id(), claim.index()))
    }

    /// Drops the object the handle refers to, releases its slot and turns `handle` into an
    /// unbound handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnboundHandle`] for an unbound handle, [`Error::ForeignHandle`] for a
    /// handle issued by another pool, [`Error::OutOfBounds`] if the slot index is not below the
    /// capacity and [`Error::DoubleFree`] if the slot is already vacant. Neither the pool nor the
    /// handle is modified in those cases.
    pub fn free(&mut self, handle: &mut SlotHandle<T>) -> Result<()> {
        let index = self.inner.check_release(handle)?;

        self.inner.release(index)?;
        handle.zero_out();

        // SAFETY: The index was bounds-checked above and the pool was created for `T`.
        let slot = unsafe { self.inner.typed_slot_unchecked::<T>(index) };

        // SAFETY: The slot was occupied until just now, so it holds an initialized `T`, and
        // nothing will read it again until it is claimed and overwritten.
        unsafe {
            slot.drop_in_place();
        }

        Ok(())
    }

    /// Returns a reference to the object the handle refers to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnboundHandle`], [`Error::ForeignHandle`] or [`Error::OutOfBounds`] if
    /// the handle does not fit this pool and [`Error::VacantSlot`] if the slot holds no object.
    pub fn get(&self, handle: &SlotHandle<T>) -> Result<&T> {
        // SAFETY: Every occupied slot of this pool holds a `T`.
        unsafe { self.inner.get(handle) }
    }

    /// Returns an exclusive reference to the object the handle refers to.
    ///
    /// # Errors
    ///
    /// As for [`get()`][Self::get].
    pub fn get_mut(&mut self, handle: &SlotHandle<T>) -> Result<&mut T> {
        // SAFETY: Every occupied slot of this pool holds a `T`.
        unsafe { self.inner.get_mut(handle) }
    }

    /// Calls `f` for objects in the pool, selected by `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotPacked`] without calling `f` if `mode` is [`IterationMode::Fast`]
    /// and the pool has vacant slots.
    pub fn for_each(&mut self, mode: IterationMode, f: impl FnMut(&mut T)) -> Result<()> {
        // SAFETY: Every occupied slot of this pool holds a `T`.
        unsafe { for_each_in(&mut self.inner, mode, f) }
    }

    /// Calls `f` for every slot in the pool without consulting the occupancy bitmap.
    ///
    /// # Safety
    ///
    /// Every slot must be occupied, i.e. `len() == capacity()`.
    pub unsafe fn for_each_unchecked(&mut self, f: impl FnMut(&mut T)) {
        // SAFETY: Forwarding the caller's guarantee that every slot holds a `T`.
        unsafe { self.inner.for_each_slot_as::<T>(f) };
    }

    /// Identity of the pool, shared by every handle it issues.
    #[must_use]
    pub fn pool_id(&self) -> PoolId {
        self.inner.pool_id()
    }

    /// Number of slots in the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Number of live objects in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the pool holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Whether every slot holds an object.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }

    /// Whether the slot with the given index holds an object.
    #[must_use]
    pub fn is_occupied(&self, index: usize) -> bool {
        self.inner.is_occupied(index)
    }

    /// Address of slot 0. Changes whenever the pool grows.
    #[must_use]
    pub fn object_base(&self) -> NonNull<u8> {
        self.inner.object_base()
    }

    /// Layout of a single slot.
    #[must_use]
    pub fn element_layout(&self) -> Layout {
        self.inner.element_layout()
    }

    /// The growth policy the pool was created with.
    #[must_use]
    pub fn growth_policy(&self) -> GrowthPolicy {
        self.inner.growth_policy()
    }

    /// The drop policy the pool was created with.
    #[must_use]
    pub fn drop_policy(&self) -> DropPolicy {
        self.drop_policy
    }

    fn is_full_and_fixed(&self) -> bool {
        self.inner.is_full() && self.inner.growth_policy() == GrowthPolicy::Fixed
    }
}

/// Claims a slot, calling `on_grow` right after the pool grows and before the slot is claimed.
///
/// Shared by the typed allocators.
pub(crate) fn claim_in(
    pool: &mut FixedLayoutAllocator,
    on_grow: &mut Option<GrowthCallback>,
) -> Result<Option<Claim>> {
    let Some(grew) = pool.ensure_vacancy()? else {
        return Ok(None);
    };

    if grew {
        if let Some(on_grow) = on_grow.as_mut() {
            on_grow();
        }
    }

    pool.claim()
}

/// Shared by the typed allocators.
///
/// # Safety
///
/// Every occupied slot of `pool` must hold a `T`.
pub(crate) unsafe fn for_each_in<T>(
    pool: &mut FixedLayoutAllocator,
    mode: IterationMode,
    f: impl FnMut(&mut T),
) -> Result<()> {
    match mode {
        IterationMode::Active => {
            // SAFETY: Forwarding the caller's guarantee.
            unsafe { pool.for_each_occupied_as::<T>(f) };
        }
        IterationMode::Fast => {
            if !pool.is_full() {
                warn!(
                    pool = %pool.pool_id(),
                    len = pool.len(),
                    capacity = pool.capacity(),
                    "fast iteration requested on a pool with vacant slots"
                );

                return Err(Error::NotPacked {
                    len: pool.len(),
                    capacity: pool.capacity(),
                });
            }

            // SAFETY: Every slot is occupied, as checked above, and the caller guarantees that
            // occupied slots hold a `T`.
            unsafe { pool.for_each_slot_as::<T>(f) };
        }
    }

    Ok(())
}

impl<T> SlotSource for FixedTypeAllocator<T> {
    fn pool_id(&self) -> PoolId {
        self.inner.pool_id()
    }

    fn object_base(&self) -> NonNull<u8> {
        self.inner.object_base()
    }

    fn slot_stride(&self) -> usize {
        self.inner.slot_stride()
    }
}

impl<T> fmt::Debug for FixedTypeAllocator<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("inner", &self.inner)
            .field("on_grow", &self.on_grow.as_ref().map(|_| "callback"))
            .field("drop_policy", &self.drop_policy)
            .finish()
    }
}

impl<T> Drop for FixedTypeAllocator<T> {
    fn drop(&mut self) {
        let was_empty = self.inner.is_empty();

        // SAFETY: Every occupied slot holds a `T`. The pool is going away, so nothing will
        // observe the dropped objects.
        unsafe {
            self.inner.drop_occupied_as::<T>();
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
    use std::panic::{self, AssertUnwindSafe};
    use std::rc::Rc;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(FixedTypeAllocator<u32>: Send, fmt::Debug);
    assert_not_impl_any!(FixedTypeAllocator<u32>: Sync);
    assert_not_impl_any!(FixedTypeAllocator<Rc<u32>>: Send, Sync);
    assert_impl_all!(FixedTypeAllocator<Cell<u32>>: Send);

    fn fixed_pool<T>(capacity: usize) -> FixedTypeAllocator<T> {
        FixedTypeAllocator::builder()
            .capacity(capacity)
            .growth_policy(GrowthPolicy::Fixed)
            .build()
            .unwrap()
    }

    #[test]
    fn default_configuration() {
        let pool = FixedTypeAllocator::<u64>::new().unwrap();

        assert_eq!(pool.capacity(), 1024);
        assert_eq!(pool.growth_policy(), GrowthPolicy::Doubling);
        assert_eq!(pool.drop_policy(), DropPolicy::MayDropItems);
        assert!(pool.is_empty());
    }

    #[test]
    fn zero_sized_type_is_rejected() {
        let result = FixedTypeAllocator::<()>::new();
        assert!(matches!(result, Err(Error::InvalidConfiguration { .. })));
    }

    #[test]
    fn sequential_fill_then_unbound() {
        let mut pool = fixed_pool::<u32>(16);

        for expected in 0..16 {
            let handle = pool.allocate().unwrap();
            assert!(handle.is_bound());
            assert_eq!(handle.index(), expected);
        }

        assert!(pool.is_full());
        assert!(!pool.allocate().unwrap().is_bound());
        assert!(!pool.insert(5).unwrap().is_bound());
        assert_eq!(pool.len(), 16);
        assert_eq!(pool.capacity(), 16);
    }

    #[test]
    fn allocate_uses_default() {
        let mut pool = fixed_pool::<String>(8);

        let handle = pool.allocate().unwrap();

        assert_eq!(pool.get(&handle).unwrap(), "");
    }

    #[test]
    fn allocate_free_allocate_reuses_slot() {
        let mut pool = fixed_pool::<u32>(8);

        let mut handle = pool.insert(1).unwrap();
        let index = handle.index();
        pool.free(&mut handle).unwrap();

        let again = pool.insert(2).unwrap();

        assert_eq!(again.index(), index);
        assert_eq!(*pool.get(&again).unwrap(), 2);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn free_zeroes_handle_and_drops_value() {
        let tracker = Rc::new(());
        let mut pool = fixed_pool::<Rc<()>>(8);

        let mut handle = pool.insert(Rc::clone(&tracker)).unwrap();
        assert_eq!(Rc::strong_count(&tracker), 2);

        pool.free(&mut handle).unwrap();

        assert!(!handle.is_bound());
        assert_eq!(Rc::strong_count(&tracker), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn free_through_zeroed_handle_is_unbound_error() {
        let mut pool = fixed_pool::<u32>(8);

        let mut handle = pool.insert(1).unwrap();
        pool.free(&mut handle).unwrap();

        assert!(matches!(pool.free(&mut handle), Err(Error::UnboundHandle)));
    }

    #[test]
    fn double_free_through_copy_is_detected() {
        let mut pool = fixed_pool::<u32>(8);

        let mut handle = pool.insert(1).unwrap();
        let _other = pool.insert(2).unwrap();
        let mut copy = handle;

        pool.free(&mut handle).unwrap();
        let result = pool.free(&mut copy);

        assert!(matches!(result, Err(Error::DoubleFree { .. })));
        assert!(copy.is_bound());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn out_of_range_handle_is_rejected_without_mutation() {
        let mut pool = fixed_pool::<u32>(8);
        let _live = pool.insert(1).unwrap();

        let mut handle = SlotHandle::from_parts(pool.pool_id(), 9);
        let result = pool.free(&mut handle);

        assert!(matches!(
            result,
            Err(Error::OutOfBounds {
                index: 9,
                capacity: 8
            })
        ));
        assert!(handle.is_bound());
        assert_eq!(pool.len(), 1);
        assert!(pool.get(&handle).is_err());
    }

    #[test]
    fn foreign_handle_is_rejected() {
        let mut first = fixed_pool::<u32>(8);
        let mut second = fixed_pool::<u32>(8);

        let mut handle = first.insert(1).unwrap();
        let _other = second.insert(2).unwrap();

        assert!(matches!(
            second.free(&mut handle),
            Err(Error::ForeignHandle { .. })
        ));
        assert_eq!(second.len(), 1);
        assert_eq!(*first.get(&handle).unwrap(), 1);
    }

    #[test]
    fn get_vacant_slot_is_error() {
        let pool = fixed_pool::<u32>(8);
        let handle = SlotHandle::from_parts(pool.pool_id(), 0);

        assert!(matches!(pool.get(&handle), Err(Error::VacantSlot { index: 0 })));
    }

    #[test]
    fn growth_preserves_values_and_handles() {
        let mut pool = FixedTypeAllocator::<u64>::builder()
            .capacity(8)
            .build()
            .unwrap();

        let handles = (0..8_u64)
            .map(|value| pool.insert(value + 100).unwrap())
            .collect::<Vec<_>>();

        let extra = pool.insert(999).unwrap();

        assert_eq!(pool.capacity(), 16);
        assert_eq!(extra.index(), 8);

        for (value, handle) in (0..8_u64).zip(&handles) {
            assert_eq!(*pool.get(handle).unwrap(), value + 100);

            // SAFETY: The handle is live and the pool is not mutated while the address is used.
            let resolved = unsafe { *handle.resolve(&pool).as_ref() };
            assert_eq!(resolved, value + 100);
        }
    }

    #[test]
    fn on_grow_is_called_per_growth() {
        let calls = Arc::new(AtomicUsize::new(0));

        let mut pool = FixedTypeAllocator::<u32>::builder()
            .capacity(8)
            .on_grow({
                let calls = Arc::clone(&calls);
                move || {
                    calls.fetch_add(1, Ordering::Relaxed);
                }
            })
            .build()
            .unwrap();

        for value in 0..8 {
            pool.insert(value).unwrap();
        }
        assert_eq!(calls.load(Ordering::Relaxed), 0);

        pool.insert(8).unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        for value in 9..17 {
            pool.insert(value).unwrap();
        }
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(pool.capacity(), 32);
    }

    #[test]
    fn on_grow_runs_before_the_new_object_is_stored() {
        let tracker = Arc::new(());

        let mut pool = FixedTypeAllocator::<Arc<()>>::builder()
            .capacity(8)
            .on_grow(|| panic!("growth observed"))
            .build()
            .unwrap();

        for _ in 0..8 {
            pool.insert(Arc::clone(&tracker)).unwrap();
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| pool.insert(Arc::clone(&tracker))));
        assert!(result.is_err());

        // The pool grew but the object that triggered the growth never took a slot.
        assert_eq!(pool.len(), 8);
        assert_eq!(pool.capacity(), 16);
        assert_eq!(Arc::strong_count(&tracker), 9);

        drop(pool);
        assert_eq!(Arc::strong_count(&tracker), 1);
    }

    #[test]
    fn set_on_grow_replaces_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pool = FixedTypeAllocator::<u32>::builder()
            .capacity(8)
            .build()
            .unwrap();

        pool.set_on_grow({
            let calls = Arc::clone(&calls);
            move || {
                calls.fetch_add(1, Ordering::Relaxed);
            }
        });

        for value in 0..9 {
            pool.insert(value).unwrap();
        }

        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn active_iteration_skips_freed_slots() {
        let mut pool = fixed_pool::<u32>(16);

        let mut handles = (0..10).map(|value| pool.insert(value).unwrap()).collect::<Vec<_>>();

        pool.free(&mut handles[2]).unwrap();
        pool.free(&mut handles[5]).unwrap();

        let mut seen = Vec::new();
        pool.for_each(IterationMode::Active, |value| seen.push(*value))
            .unwrap();

        assert_eq!(seen, vec![0, 1, 3, 4, 6, 7, 8, 9]);
    }

    #[test]
    fn fast_iteration_requires_packed_pool() {
        let mut pool = fixed_pool::<u32>(8);

        for value in 0..7 {
            pool.insert(value).unwrap();
        }

        let mut visits = 0;
        let result = pool.for_each(IterationMode::Fast, |_| visits += 1);

        assert!(matches!(
            result,
            Err(Error::NotPacked {
                len: 7,
                capacity: 8
            })
        ));
        assert_eq!(visits, 0);
    }

    #[test]
    fn fast_and_active_agree_on_packed_pool() {
        let mut pool = fixed_pool::<u32>(8);

        for value in 0..8 {
            pool.insert(value * 2).unwrap();
        }

        let mut active = Vec::new();
        pool.for_each(IterationMode::Active, |value| active.push(*value))
            .unwrap();

        let mut fast = Vec::new();
        pool.for_each(IterationMode::Fast, |value| fast.push(*value))
            .unwrap();

        let mut unchecked = Vec::new();
        // SAFETY: The pool is full.
        unsafe { pool.for_each_unchecked(|value| unchecked.push(*value)) };

        assert_eq!(active, fast);
        assert_eq!(active, unchecked);
        assert_eq!(active.len(), 8);
    }

    #[test]
    fn for_each_can_mutate() {
        let mut pool = fixed_pool::<u32>(8);
        let handle = pool.insert(10).unwrap();

        pool.for_each(IterationMode::Active, |value| *value += 1)
            .unwrap();

        assert_eq!(*pool.get(&handle).unwrap(), 11);
    }

    #[test]
    fn insert_with_initializes_in_place() {
        let mut pool = fixed_pool::<[u64; 4]>(8);

        // SAFETY: The closure fully initializes the array and does not panic.
        let handle = unsafe {
            pool.insert_with(|uninit| {
                uninit.write([1, 2, 3, 4]);
            })
        }
        .unwrap();

        assert_eq!(pool.get(&handle).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn drop_runs_remaining_destructors() {
        let tracker = Rc::new(());

        {
            let mut pool = fixed_pool::<Rc<()>>(8);
            pool.insert(Rc::clone(&tracker)).unwrap();
            pool.insert(Rc::clone(&tracker)).unwrap();
            assert_eq!(Rc::strong_count(&tracker), 3);
        }

        assert_eq!(Rc::strong_count(&tracker), 1);
    }

    #[test]
    #[should_panic]
    fn drop_item_with_forbidden_to_drop_policy_panics() {
        let mut pool = FixedTypeAllocator::<u32>::builder()
            .drop_policy(DropPolicy::MustNotDropItems)
            .build()
            .unwrap();

        pool.insert(123).unwrap();
    }

    #[test]
    fn drop_itemless_with_forbidden_to_drop_policy_ok() {
        let mut pool = FixedTypeAllocator::<u32>::builder()
            .drop_policy(DropPolicy::MustNotDropItems)
            .build()
            .unwrap();

        let mut handle = pool.insert(123).unwrap();
        pool.free(&mut handle).unwrap();
    }
}
