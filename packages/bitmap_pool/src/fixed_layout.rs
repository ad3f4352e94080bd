use std::alloc::Layout;
use std::any::type_name;
use std::ptr::{self, NonNull};

use tracing::{error, trace, warn};

use crate::{Error, GrowthPolicy, MemoryBlock, PoolId, Result, SlotHandle, SlotSource};

/// A pool of equally sized slots that does not know the type of the objects stored in it.
///
/// This is the building block of the size classes of a
/// [`GeneralPurposeAllocator`][crate::GeneralPurposeAllocator] and of the pools in a
/// [`FixedSizeRegistry`][crate::FixedSizeRegistry]. Objects of any type whose layout fits into
/// a slot can be stored, and objects of different types can share one pool.
///
/// Because the pool does not remember which type is stored in which slot, reading or removing
/// an object is `unsafe`: the caller vouches for the type. Storing an object is safe.
///
/// Dropping the pool releases the memory of every remaining object without running destructors.
///
/// # Example
///
/// ```
/// use std::alloc::Layout;
///
/// use bitmap_pool::{FixedLayoutAllocator, GrowthPolicy};
///
/// let mut pool =
///     FixedLayoutAllocator::new(Layout::new::<u64>(), 8, GrowthPolicy::Doubling).unwrap();
///
/// let mut handle = pool.insert(42_u64).unwrap();
///
/// // SAFETY: The handle was issued for a u64 and has not been removed yet.
/// assert_eq!(*unsafe { pool.get(&handle) }.unwrap(), 42);
///
/// // SAFETY: As above.
/// let value = unsafe { pool.remove(&mut handle) }.unwrap();
/// assert_eq!(value, 42);
/// assert!(!handle.is_bound());
/// ```
#[derive(Debug)]
pub struct FixedLayoutAllocator {
    block: MemoryBlock,
    growth_policy: GrowthPolicy,
}

/// The outcome of claiming a slot from a [`FixedLayoutAllocator`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Claim {
    index: usize,
    grew: bool,
}

impl Claim {
    /// Index of the claimed slot.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether the pool had to grow to satisfy the claim.
    #[must_use]
    pub fn grew(&self) -> bool {
        self.grew
    }
}

impl FixedLayoutAllocator {
    /// Creates a pool with `capacity` slots, each able to hold a value of `layout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the layout is zero-sized or the capacity is
    /// zero or not a multiple of 8. Returns [`Error::ResourceExhausted`] if the backing memory
    /// could not be allocated.
    pub fn new(layout: Layout, capacity: usize, growth_policy: GrowthPolicy) -> Result<Self> {
        Ok(Self {
            block: MemoryBlock::new(layout, capacity)?,
            growth_policy,
        })
    }

    /// Claims the lowest vacant slot, growing the pool first if it is full and the growth policy
    /// allows it.
    ///
    /// The slot is marked as occupied but its memory is left as it is. The caller is responsible
    /// for writing an object into it before the slot is read.
    ///
    /// Returns `Ok(None)` if the pool is full and not allowed to grow.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] if growth was needed but failed, and
    /// [`Error::InvariantViolation`] if the occupancy bookkeeping is corrupt.
    pub fn claim(&mut self) -> Result<Option<Claim>> {
        let Some(grew) = self.ensure_vacancy()? else {
            return Ok(None);
        };

        let Some(index) = self.block.first_vacant() else {
            error!(
                pool = %self.pool_id(),
                len = self.len(),
                capacity = self.capacity(),
                "occupancy bitmap has no vacant slot although the pool is not full"
            );

            return Err(Error::InvariantViolation {
                len: self.len(),
                capacity: self.capacity(),
            });
        };

        self.block.occupy(index);

        #[cfg(debug_assertions)]
        self.block.integrity_check();

        trace!(pool = %self.pool_id(), index, "slot claimed");

        Ok(Some(Claim { index, grew }))
    }

    /// Grows the pool if it is full and the growth policy allows it.
    ///
    /// Returns `None` if the pool is full and not allowed to grow, otherwise whether it grew.
    pub(crate) fn ensure_vacancy(&mut self) -> Result<Option<bool>> {
        if !self.block.is_full() {
            return Ok(Some(false));
        }

        match self.growth_policy {
            GrowthPolicy::Fixed => Ok(None),
            GrowthPolicy::Doubling => {
                self.block.grow()?;
                Ok(Some(true))
            }
        }
    }

    /// Marks an occupied slot as vacant. The memory of the slot is left as it is; dropping the
    /// object stored there, if any, is up to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if the index is not below the capacity and
    /// [`Error::DoubleFree`] if the slot is already vacant. The pool is not modified in either
    /// case.
    pub fn release(&mut self, index: usize) -> Result<()> {
        self.block.vacate(index).inspect_err(|error| {
            warn!(pool = %self.block.id(), index, %error, "rejected slot release");
        })?;

        #[cfg(debug_assertions)]
        self.block.integrity_check();

        trace!(pool = %self.pool_id(), index, "slot released");

        Ok(())
    }

    /// Moves `value` into a vacant slot and returns a handle to it.
    ///
    /// Returns an unbound handle (and drops `value`) if the pool is full and not allowed to grow.
    ///
    /// The pool can be sent to other threads, so the object must be [`Send`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeClassExhausted`] if the layout of `T` does not fit into a slot, plus
    /// the errors of [`claim()`][Self::claim].
    pub fn insert<T>(&mut self, value: T) -> Result<SlotHandle<T>>
    where
        T: Send,
    {
        self.check_fits::<T>()?;

        let Some(claim) = self.claim()? else {
            return Ok(SlotHandle::unbound());
        };

        // SAFETY: The slot was just claimed and `check_fits()` passed.
        Ok(unsafe { self.write_claimed(claim, value) })
    }

    /// Returns a reference to the object the handle refers to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnboundHandle`], [`Error::ForeignHandle`] or [`Error::OutOfBounds`] if
    /// the handle does not fit this pool and [`Error::VacantSlot`] if the slot holds no object.
    ///
    /// # Safety
    ///
    /// If the slot is occupied, it must hold a `T`. This is the case if the handle (or the handle
    /// it was copied from) was returned by [`insert()`][Self::insert] and the object has not been
    /// removed since through another copy of the handle.
    pub unsafe fn get<T>(&self, handle: &SlotHandle<T>) -> Result<&T> {
        let index = self.occupied_index(handle)?;

        // SAFETY: The index was bounds-checked and the caller guarantees the slot holds a `T`.
        let slot = unsafe { self.typed_slot_unchecked::<T>(index) };

        // SAFETY: The slot is occupied by a `T`. The shared borrow of the pool keeps the object
        // from being removed or moved while referenced.
        Ok(unsafe { slot.as_ref() })
    }

    /// Returns an exclusive reference to the object the handle refers to.
    ///
    /// # Errors
    ///
    /// As for [`get()`][Self::get].
    ///
    /// # Safety
    ///
    /// As for [`get()`][Self::get].
    pub unsafe fn get_mut<T>(&mut self, handle: &SlotHandle<T>) -> Result<&mut T> {
        let index = self.occupied_index(handle)?;

        // SAFETY: The index was bounds-checked and the caller guarantees the slot holds a `T`.
        let mut slot = unsafe { self.typed_slot_unchecked::<T>(index) };

        // SAFETY: The slot is occupied by a `T`. The exclusive borrow of the pool guarantees
        // that no other reference to the object exists.
        Ok(unsafe { slot.as_mut() })
    }

    /// Moves the object out of the pool, releases its slot and turns `handle` into an unbound
    /// handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnboundHandle`], [`Error::ForeignHandle`] or [`Error::OutOfBounds`] if
    /// the handle does not fit this pool and [`Error::DoubleFree`] if the slot is already vacant.
    /// Neither the pool nor the handle is modified in those cases.
    ///
    /// # Safety
    ///
    /// As for [`get()`][Self::get].
    pub unsafe fn remove<T>(&mut self, handle: &mut SlotHandle<T>) -> Result<T> {
        let index = self.check_release(handle)?;

        self.release(index)?;

        // SAFETY: The index was bounds-checked and the caller guarantees the slot holds a `T`.
        let slot = unsafe { self.typed_slot_unchecked::<T>(index) };

        // SAFETY: The slot was occupied until just now. Releasing it does not touch its memory
        // and we take ownership of the object here, so it is read exactly once.
        let value = unsafe { slot.read() };

        handle.zero_out();

        Ok(value)
    }

    /// Identity of the pool, shared by every handle it issues.
    #[must_use]
    pub fn pool_id(&self) -> PoolId {
        self.block.id()
    }

    /// Layout of a single slot.
    #[must_use]
    pub fn element_layout(&self) -> Layout {
        self.block.element_layout()
    }

    /// The growth policy the pool was created with.
    #[must_use]
    pub fn growth_policy(&self) -> GrowthPolicy {
        self.growth_policy
    }

    /// Number of slots in the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.block.capacity()
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.block.len()
    }

    /// Whether no slot is occupied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.block.is_empty()
    }

    /// Whether every slot is occupied.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.block.is_full()
    }

    /// Whether the slot with the given index holds an object.
    #[must_use]
    pub fn is_occupied(&self, index: usize) -> bool {
        self.block.is_occupied(index)
    }

    /// Address of slot 0. Changes whenever the pool grows.
    #[must_use]
    pub fn object_base(&self) -> NonNull<u8> {
        self.block.object_base()
    }

    /// Address of the slot with the given index, or `None` if the index is out of bounds.
    #[must_use]
    pub fn slot_ptr(&self, index: usize) -> Option<NonNull<u8>> {
        self.block.slot_ptr(index)
    }

    /// Validates that the handle was issued by this pool and is within bounds, returning its
    /// slot index. Occupancy is not checked.
    pub(crate) fn check_handle<T>(&self, handle: &SlotHandle<T>) -> Result<usize> {
        let Some(actual) = handle.pool_id() else {
            return Err(Error::UnboundHandle);
        };

        let expected = self.pool_id();

        if actual != expected {
            return Err(Error::ForeignHandle { expected, actual });
        }

        let index = handle.index();
        let capacity = self.capacity();

        if index >= capacity {
            return Err(Error::OutOfBounds { index, capacity });
        }

        Ok(index)
    }

    /// As [`check_handle()`][Self::check_handle], for handles that are about to be released.
    /// Rejected handles are logged.
    pub(crate) fn check_release<T>(&self, handle: &SlotHandle<T>) -> Result<usize> {
        self.check_handle(handle).inspect_err(|error| {
            warn!(pool = %self.pool_id(), %error, "rejected release of a handle");
        })
    }

    /// As [`check_handle()`][Self::check_handle] but additionally requires the slot to be
    /// occupied.
    pub(crate) fn occupied_index<T>(&self, handle: &SlotHandle<T>) -> Result<usize> {
        let index = self.check_handle(handle)?;

        if !self.block.is_occupied(index) {
            return Err(Error::VacantSlot { index });
        }

        Ok(index)
    }

    /// Checks that an object of type `T` can be stored in a slot of this pool.
    pub(crate) fn check_fits<T>(&self) -> Result<()> {
        let slot = self.element_layout();
        let item = Layout::new::<T>();

        if item.size() > slot.size() || item.align() > slot.align() {
            return Err(Error::SizeClassExhausted {
                size: item.size(),
                align: item.align(),
                largest_class: slot.size(),
            });
        }

        Ok(())
    }

    /// Moves `value` into a slot returned by [`claim()`][Self::claim].
    ///
    /// # Safety
    ///
    /// The claim must come from this pool, no object may have been written into the slot since
    /// and [`check_fits::<T>()`][Self::check_fits] must have passed.
    pub(crate) unsafe fn write_claimed<T>(&mut self, claim: Claim, value: T) -> SlotHandle<T> {
        // SAFETY: A claimed slot is in bounds and the caller guarantees that a `T` fits.
        let slot = unsafe { self.typed_slot_unchecked::<T>(claim.index) };

        // SAFETY: The slot holds no object that could be overwritten and is sufficiently
        // aligned for a `T`.
        unsafe {
            slot.write(value);
        }

        SlotHandle::bound(self.pool_id(), claim.index)
    }

    /// # Safety
    ///
    /// The caller must guarantee that `index < self.capacity()` and that a `T` fits into a slot.
    pub(crate) unsafe fn typed_slot_unchecked<T>(&self, index: usize) -> NonNull<T> {
        debug_assert!(
            self.check_fits::<T>().is_ok(),
            "{} does not fit into a slot of {:?}",
            type_name::<T>(),
            self.element_layout()
        );

        // SAFETY: Forwarding the caller's guarantee that the index is in bounds.
        unsafe { self.block.slot_ptr_unchecked(index) }.cast::<T>()
    }

    /// Calls `f` for every occupied slot, in ascending slot order.
    ///
    /// # Safety
    ///
    /// Every occupied slot must hold an initialized `T`.
    pub(crate) unsafe fn for_each_occupied_as<T>(&mut self, mut f: impl FnMut(&mut T)) {
        for index in self.block.occupied_indices() {
            // SAFETY: The index came from the bitmap so it is in bounds; the caller guarantees
            // that the slot holds a `T`.
            let mut slot = unsafe { self.typed_slot_unchecked::<T>(index) };

            // SAFETY: We hold an exclusive borrow of the pool, so no other reference to the
            // object exists. The bitmap is a separate region of the block and is only read.
            f(unsafe { slot.as_mut() });
        }
    }

    /// Calls `f` for every slot in the pool without consulting the bitmap.
    ///
    /// # Safety
    ///
    /// Every slot must hold an initialized `T`.
    pub(crate) unsafe fn for_each_slot_as<T>(&mut self, mut f: impl FnMut(&mut T)) {
        for index in 0..self.capacity() {
            // SAFETY: The index is below capacity; the caller guarantees that the slot holds
            // a `T`.
            let mut slot = unsafe { self.typed_slot_unchecked::<T>(index) };

            // SAFETY: We hold an exclusive borrow of the pool, so no other reference to the
            // object exists.
            f(unsafe { slot.as_mut() });
        }
    }

    /// Drops the object in every occupied slot. The slots remain marked as occupied, so this is
    /// only meant to be called right before the pool itself is dropped.
    ///
    /// # Safety
    ///
    /// Every occupied slot must hold an initialized `T`.
    pub(crate) unsafe fn drop_occupied_as<T>(&mut self) {
        let drop_item = |item: &mut T| {
            // SAFETY: The object is initialized and this is the last time it is touched.
            unsafe { ptr::drop_in_place(item) }
        };

        // SAFETY: Forwarding the caller's guarantee.
        unsafe { self.for_each_occupied_as::<T>(drop_item) };
    }
}

impl SlotSource for FixedLayoutAllocator {
    fn pool_id(&self) -> PoolId {
        self.block.id()
    }

    fn object_base(&self) -> NonNull<u8> {
        self.block.object_base()
    }

    fn slot_stride(&self) -> usize {
        self.block.element_layout().size()
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "test code, we assume safety is considered"
)]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(FixedLayoutAllocator: Send);
    assert_not_impl_any!(FixedLayoutAllocator: Sync);

    fn pool(capacity: usize, growth_policy: GrowthPolicy) -> FixedLayoutAllocator {
        FixedLayoutAllocator::new(Layout::new::<u64>(), capacity, growth_policy).unwrap()
    }

    #[test]
    fn claims_are_sequential_from_empty() {
        let mut pool = pool(8, GrowthPolicy::Fixed);

        for expected in 0..8 {
            let claim = pool.claim().unwrap().unwrap();
            assert_eq!(claim.index(), expected);
            assert!(!claim.grew());
        }

        assert!(pool.is_full());
        assert_eq!(pool.claim().unwrap(), None);
    }

    #[test]
    fn claim_grows_when_full() {
        let mut pool = pool(8, GrowthPolicy::Doubling);

        for _ in 0..8 {
            pool.claim().unwrap();
        }

        let claim = pool.claim().unwrap().unwrap();

        assert_eq!(claim.index(), 8);
        assert!(claim.grew());
        assert_eq!(pool.capacity(), 16);
        assert_eq!(pool.len(), 9);
    }

    #[test]
    fn claim_reuses_lowest_released_slot() {
        let mut pool = pool(16, GrowthPolicy::Fixed);

        for _ in 0..10 {
            pool.claim().unwrap();
        }

        pool.release(6).unwrap();
        pool.release(2).unwrap();

        assert_eq!(pool.claim().unwrap().unwrap().index(), 2);
        assert_eq!(pool.claim().unwrap().unwrap().index(), 6);
        assert_eq!(pool.claim().unwrap().unwrap().index(), 10);
    }

    #[test]
    fn release_errors_leave_pool_untouched() {
        let mut pool = pool(8, GrowthPolicy::Fixed);
        pool.claim().unwrap();

        assert!(matches!(pool.release(1), Err(Error::DoubleFree { index: 1 })));
        assert!(matches!(
            pool.release(8),
            Err(Error::OutOfBounds {
                index: 8,
                capacity: 8
            })
        ));

        assert_eq!(pool.len(), 1);
        assert!(pool.is_occupied(0));
    }

    #[test]
    fn insert_get_remove_round_trip() {
        let mut pool = pool(8, GrowthPolicy::Fixed);

        let mut handle = pool.insert(1234_u64).unwrap();
        assert!(handle.is_bound());
        assert_eq!(handle.pool_id(), Some(pool.pool_id()));

        unsafe {
            *pool.get_mut(&handle).unwrap() += 1;
        }
        assert_eq!(unsafe { *pool.get(&handle).unwrap() }, 1235);

        let value = unsafe { pool.remove(&mut handle) }.unwrap();

        assert_eq!(value, 1235);
        assert!(!handle.is_bound());
        assert!(pool.is_empty());
    }

    #[test]
    fn smaller_types_share_a_slot_size() {
        let mut pool = pool(8, GrowthPolicy::Fixed);

        let a = pool.insert(7_u8).unwrap();
        let b = pool.insert(9_u32).unwrap();

        assert_eq!(unsafe { *pool.get(&a).unwrap() }, 7);
        assert_eq!(unsafe { *pool.get(&b).unwrap() }, 9);
    }

    #[test]
    fn insert_rejects_oversized_type() {
        let mut pool = pool(8, GrowthPolicy::Fixed);

        let result = pool.insert([0_u8; 9]);

        assert!(matches!(
            result,
            Err(Error::SizeClassExhausted {
                size: 9,
                largest_class: 8,
                ..
            })
        ));
        assert!(pool.is_empty());
    }

    #[test]
    fn insert_into_full_fixed_pool_is_unbound() {
        let mut pool = pool(8, GrowthPolicy::Fixed);

        for value in 0..8_u64 {
            assert!(pool.insert(value).unwrap().is_bound());
        }

        assert!(!pool.insert(99_u64).unwrap().is_bound());
        assert_eq!(pool.len(), 8);
    }

    #[test]
    fn remove_twice_through_copy_is_double_free() {
        let mut pool = pool(8, GrowthPolicy::Fixed);

        let mut handle = pool.insert(5_u64).unwrap();
        let mut copy = handle;

        unsafe { pool.remove(&mut handle) }.unwrap();
        let result = unsafe { pool.remove(&mut copy) };

        assert!(matches!(result, Err(Error::DoubleFree { .. })));
        assert!(copy.is_bound());
    }

    #[test]
    fn foreign_and_unbound_handles_are_rejected() {
        let mut first = pool(8, GrowthPolicy::Fixed);
        let second = pool(8, GrowthPolicy::Fixed);

        let handle = first.insert(1_u64).unwrap();

        assert!(matches!(
            unsafe { second.get(&handle) },
            Err(Error::ForeignHandle { .. })
        ));
        assert!(matches!(
            unsafe { first.get(&SlotHandle::<u64>::unbound()) },
            Err(Error::UnboundHandle)
        ));
    }

    #[test]
    fn get_vacant_slot_is_error() {
        let pool = pool(8, GrowthPolicy::Fixed);
        let handle = SlotHandle::<u64>::from_parts(pool.pool_id(), 3);

        assert!(matches!(
            unsafe { pool.get(&handle) },
            Err(Error::VacantSlot { index: 3 })
        ));
    }

    #[test]
    fn handles_resolve_after_growth() {
        let mut pool = pool(8, GrowthPolicy::Doubling);

        let handles = (0..20_u64)
            .map(|value| pool.insert(value * 3).unwrap())
            .collect::<Vec<_>>();

        assert_eq!(pool.capacity(), 32);

        for (value, handle) in (0..20_u64).zip(&handles) {
            let resolved = unsafe { *handle.resolve(&pool).as_ref() };
            assert_eq!(resolved, value * 3);
        }
    }

    #[test]
    fn drop_occupied_runs_destructors() {
        use std::sync::Arc;

        let tracker = Arc::new(());

        let mut pool =
            FixedLayoutAllocator::new(Layout::new::<Arc<()>>(), 8, GrowthPolicy::Fixed).unwrap();

        pool.insert(Arc::clone(&tracker)).unwrap();
        pool.insert(Arc::clone(&tracker)).unwrap();
        assert_eq!(Arc::strong_count(&tracker), 3);

        unsafe {
            pool.drop_occupied_as::<Arc<()>>();
        }

        assert_eq!(Arc::strong_count(&tracker), 1);
    }
}
