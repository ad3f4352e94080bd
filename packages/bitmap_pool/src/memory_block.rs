use std::alloc::{self, Layout};
use std::num::NonZero;
use std::ptr::{self, NonNull};
use std::{mem, slice};

use new_zealand::nz;
use num_integer::Integer;
use tracing::debug;

use crate::{Error, PoolId, Result, SlotSource};

/// Number of slots tracked by a single byte of the occupancy bitmap.
const SLOTS_PER_BITMAP_BYTE: usize = 8;

/// A single contiguous allocation that is split into an occupancy bitmap followed by an array
/// of equally sized slots.
///
/// Bit `i` of the bitmap (bit `i % 8` of byte `i / 8`) is set if and only if slot `i` holds a
/// live object. The block itself never constructs or drops objects; it only tracks which slots
/// are claimed and hands out pointers to them. Typed allocators built on top of it take care
/// of object lifetimes.
///
/// # Growth
///
/// [`grow()`][Self::grow] doubles the capacity by allocating a new block, copying the bitmap and
/// the object region into the prefixes of the new block and then releasing the old block. Slot
/// indices keep their meaning across growth but the address of every slot changes, so raw
/// pointers obtained before growth must not be used afterwards. Resolve slot handles against
/// the block again instead.
///
/// # Layout
///
/// The bitmap occupies the first `capacity / 8` bytes. The object region follows at the
/// first offset that satisfies the element alignment; when the bitmap length is already a
/// multiple of the alignment, the object region follows immediately. The whole block is
/// zero-initialized when allocated.
#[derive(Debug)]
pub struct MemoryBlock {
    id: PoolId,

    /// Layout of a single slot, padded so that its size is the stride between slots.
    element_layout: Layout,

    /// Always a multiple of `SLOTS_PER_BITMAP_BYTE`, so the bitmap has no partial bytes.
    capacity: NonZero<usize>,

    /// Number of set bits in the bitmap.
    len: usize,

    layout: BlockLayout,

    /// Start of the allocation, which is also the start of the bitmap.
    base: NonNull<u8>,
}

/// Precalculated offsets within a block of a given capacity.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct BlockLayout {
    bitmap_len: usize,

    /// Byte offset from the start of the allocation to the first slot.
    object_offset: usize,

    object_region_len: usize,

    /// Layout of the entire allocation.
    total: Layout,
}

impl BlockLayout {
    fn calculate(element_layout: Layout, capacity: NonZero<usize>) -> Result<Self> {
        let exhausted = || Error::ResourceExhausted {
            capacity: capacity.get(),
            element_size: element_layout.size(),
        };

        let bitmap_len = Integer::div_floor(&capacity.get(), &SLOTS_PER_BITMAP_BYTE);
        let bitmap = Layout::array::<u8>(bitmap_len).map_err(|_| exhausted())?;

        let object_region_len = element_layout
            .size()
            .checked_mul(capacity.get())
            .ok_or_else(exhausted)?;
        let objects = Layout::from_size_align(object_region_len, element_layout.align())
            .map_err(|_| exhausted())?;

        let (total, object_offset) = bitmap.extend(objects).map_err(|_| exhausted())?;

        Ok(Self {
            bitmap_len,
            object_offset,
            object_region_len,
            total: total.pad_to_align(),
        })
    }
}

impl MemoryBlock {
    /// Allocates a zero-initialized block with room for `capacity` slots of `element_layout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the layout is zero-sized or the capacity is
    /// zero or not a multiple of 8. Returns [`Error::ResourceExhausted`] if the memory could
    /// not be allocated.
    pub fn new(element_layout: Layout, capacity: usize) -> Result<Self> {
        if element_layout.size() == 0 {
            return Err(Error::invalid_configuration(
                "element layout must not be zero-sized",
            ));
        }

        let capacity = validate_capacity(capacity)?;
        let element_layout = element_layout.pad_to_align();
        let layout = BlockLayout::calculate(element_layout, capacity)?;
        let base = allocate_zeroed(layout.total, capacity, element_layout)?;

        Ok(Self {
            id: PoolId::next(),
            element_layout,
            capacity,
            len: 0,
            layout,
            base,
        })
    }

    /// The identity of the block. It does not change when the block grows.
    #[must_use]
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Layout of a single slot. Its size is the distance between consecutive slots.
    #[must_use]
    pub fn element_layout(&self) -> Layout {
        self.element_layout
    }

    /// Number of slots in the block.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Number of occupied slots.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Can be mutated to infinitely growing memory use.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no slot is occupied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether every slot is occupied.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len == self.capacity.get()
    }

    /// Address of slot 0, which is the root of all slot address arithmetic.
    ///
    /// The address changes whenever the block grows.
    #[must_use]
    pub fn object_base(&self) -> NonNull<u8> {
        // SAFETY: The object region is a non-empty part of the allocation that starts at
        // `object_offset`, as calculated by `BlockLayout::calculate()`.
        unsafe { self.base.add(self.layout.object_offset) }
    }

    /// Address of the slot with the given index, or `None` if the index is out of bounds.
    ///
    /// The slot may or may not hold an object.
    #[must_use]
    pub fn slot_ptr(&self, index: usize) -> Option<NonNull<u8>> {
        if index >= self.capacity.get() {
            return None;
        }

        // SAFETY: Guarded by the bounds check above.
        Some(unsafe { self.slot_ptr_unchecked(index) })
    }

    /// # Safety
    ///
    /// The caller must guarantee that `index < self.capacity()`.
    pub(crate) unsafe fn slot_ptr_unchecked(&self, index: usize) -> NonNull<u8> {
        debug_assert!(
            index < self.capacity.get(),
            "slot {index} out of bounds in block of capacity {}",
            self.capacity
        );

        // Cannot overflow because the whole object region fits in the address space.
        let offset = index.wrapping_mul(self.element_layout.size());

        // SAFETY: The caller guarantees the index is in bounds, so the offset stays within the
        // object region.
        unsafe { self.object_base().add(offset) }
    }

    /// Whether the slot with the given index holds an object. Out of bounds slots do not.
    #[must_use]
    pub fn is_occupied(&self, index: usize) -> bool {
        if index >= self.capacity.get() {
            return false;
        }

        let (byte_index, mask) = bit_position(index);

        self.bitmap()
            .get(byte_index)
            .is_some_and(|byte| byte & mask != 0)
    }

    /// Finds the lowest vacant slot by scanning the bitmap byte by byte.
    pub(crate) fn first_vacant(&self) -> Option<usize> {
        self.bitmap()
            .iter()
            .enumerate()
            .find(|(_, byte)| **byte != u8::MAX)
            .map(|(byte_index, byte)| {
                // Cannot overflow because the result is a slot index below capacity.
                byte_index
                    .wrapping_mul(SLOTS_PER_BITMAP_BYTE)
                    .wrapping_add(byte.trailing_ones() as usize)
            })
    }

    /// Indexes of all occupied slots, in ascending order.
    pub(crate) fn occupied_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.bitmap()
            .iter()
            .enumerate()
            .filter(|(_, byte)| **byte != 0)
            .flat_map(|(byte_index, &byte)| {
                (0..SLOTS_PER_BITMAP_BYTE)
                    .filter(move |bit_index| byte & (1_u8 << *bit_index) != 0)
                    .map(move |bit_index| {
                        // Cannot overflow because the result is a slot index below capacity.
                        byte_index
                            .wrapping_mul(SLOTS_PER_BITMAP_BYTE)
                            .wrapping_add(bit_index)
                    })
            })
    }

    /// Marks a vacant slot as occupied.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds or the slot is already occupied.
    pub(crate) fn occupy(&mut self, index: usize) {
        let (byte_index, mask) = bit_position(index);

        let byte = self
            .bitmap_mut()
            .get_mut(byte_index)
            .unwrap_or_else(|| panic!("slot {index} is out of bounds of the occupancy bitmap"));

        assert!(*byte & mask == 0, "slot {index} is already occupied");

        *byte |= mask;

        // Cannot overflow because at most `capacity` slots can be occupied.
        self.len = self.len.wrapping_add(1);
    }

    /// Marks an occupied slot as vacant.
    ///
    /// Nothing is modified if an error is returned.
    pub(crate) fn vacate(&mut self, index: usize) -> Result<()> {
        let capacity = self.capacity.get();

        if index >= capacity {
            return Err(Error::OutOfBounds { index, capacity });
        }

        let (byte_index, mask) = bit_position(index);

        let byte = self
            .bitmap_mut()
            .get_mut(byte_index)
            .expect("guarded by bounds check above");

        if *byte & mask == 0 {
            return Err(Error::DoubleFree { index });
        }

        *byte &= !mask;

        self.len = self
            .len
            .checked_sub(1)
            .expect("we found an occupied slot above so the count must be non-zero");

        Ok(())
    }

    /// Doubles the capacity of the block.
    ///
    /// The bitmap and the object region are copied byte for byte into a new allocation and the
    /// old allocation is released. Slot indices keep their meaning; slot addresses do not.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] if the new block could not be allocated. The block
    /// is left unchanged in that case.
    pub fn grow(&mut self) -> Result<()> {
        let old_capacity = self.capacity;

        let new_capacity = old_capacity
            .checked_mul(nz!(2))
            .ok_or(Error::ResourceExhausted {
                capacity: usize::MAX,
                element_size: self.element_layout.size(),
            })?;

        let new_layout = BlockLayout::calculate(self.element_layout, new_capacity)?;
        let new_base = allocate_zeroed(new_layout.total, new_capacity, self.element_layout)?;

        // SAFETY: Both allocations are live and distinct. The new bitmap is longer than the
        // old one because the new capacity is larger.
        unsafe {
            ptr::copy_nonoverlapping(
                self.base.as_ptr(),
                new_base.as_ptr(),
                self.layout.bitmap_len,
            );
        }

        // SAFETY: The object region of the new layout lies within the new allocation.
        let new_object_base = unsafe { new_base.add(new_layout.object_offset) };

        // SAFETY: Both allocations are live and distinct. The new object region is longer than
        // the old one because the new capacity is larger. Objects are moved bitwise, which is
        // a valid move for every Rust type that is not pinned, and the pool never pins.
        unsafe {
            ptr::copy_nonoverlapping(
                self.object_base().as_ptr(),
                new_object_base.as_ptr(),
                self.layout.object_region_len,
            );
        }

        let old_base = mem::replace(&mut self.base, new_base);
        let old_layout = mem::replace(&mut self.layout, new_layout);
        self.capacity = new_capacity;

        // SAFETY: The old allocation was made with this layout and is no longer referenced.
        unsafe {
            alloc::dealloc(old_base.as_ptr(), old_layout.total);
        }

        debug!(
            pool = %self.id,
            old_capacity = old_capacity.get(),
            new_capacity = new_capacity.get(),
            element_size = self.element_layout.size(),
            "memory block grew"
        );

        Ok(())
    }

    fn bitmap(&self) -> &[u8] {
        // SAFETY: The bitmap is the zero-initialized prefix of the allocation. It is only ever
        // written through `bitmap_mut()`, which requires exclusive access to the block, and no
        // references into the bitmap are ever handed out beyond the block itself.
        unsafe { slice::from_raw_parts(self.base.as_ptr(), self.layout.bitmap_len) }
    }

    fn bitmap_mut(&mut self) -> &mut [u8] {
        // SAFETY: As in `bitmap()`, plus we hold an exclusive reference to the block.
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr(), self.layout.bitmap_len) }
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(debug_assertions)]
    pub(crate) fn integrity_check(&self) {
        let observed_len: usize = self
            .bitmap()
            .iter()
            .map(|byte| byte.count_ones() as usize)
            .sum();

        assert!(
            observed_len == self.len,
            "occupied count {} does not match the {} set bits in the bitmap of pool {}",
            self.len,
            observed_len,
            self.id
        );
    }
}

impl SlotSource for MemoryBlock {
    fn pool_id(&self) -> PoolId {
        self.id
    }

    fn object_base(&self) -> NonNull<u8> {
        Self::object_base(self)
    }

    fn slot_stride(&self) -> usize {
        self.element_layout.size()
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        // SAFETY: The allocation was made with this layout and nothing references it once the
        // block is dropped. Bitmap and object region are one allocation, released together.
        unsafe {
            alloc::dealloc(self.base.as_ptr(), self.layout.total);
        }
    }
}

// SAFETY: The block exclusively owns its allocation and keeps no thread-specific state. It
// never touches the objects stored in it, so it can move between threads freely. Typed
// allocators restrict themselves to `T: Send` where it matters.
unsafe impl Send for MemoryBlock {}

fn validate_capacity(capacity: usize) -> Result<NonZero<usize>> {
    let capacity = NonZero::new(capacity)
        .ok_or_else(|| Error::invalid_configuration("capacity must not be zero"))?;

    if !Integer::is_multiple_of(&capacity.get(), &SLOTS_PER_BITMAP_BYTE) {
        return Err(Error::invalid_configuration(format!(
            "capacity {capacity} is not a multiple of {SLOTS_PER_BITMAP_BYTE}"
        )));
    }

    Ok(capacity)
}

fn allocate_zeroed(
    layout: Layout,
    capacity: NonZero<usize>,
    element_layout: Layout,
) -> Result<NonNull<u8>> {
    // SAFETY: The layout is not zero-sized because both the capacity and the element size
    // are non-zero, so the object region alone has a non-zero size.
    let ptr = unsafe { alloc::alloc_zeroed(layout) };

    NonNull::new(ptr).ok_or(Error::ResourceExhausted {
        capacity: capacity.get(),
        element_size: element_layout.size(),
    })
}

fn bit_position(index: usize) -> (usize, u8) {
    let (byte_index, bit_index) = index.div_rem(&SLOTS_PER_BITMAP_BYTE);
    (byte_index, 1_u8 << bit_index)
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

    assert_impl_all!(MemoryBlock: Send);
    assert_not_impl_any!(MemoryBlock: Sync);

    fn block_of<T>(capacity: usize) -> MemoryBlock {
        MemoryBlock::new(Layout::new::<T>(), capacity).unwrap()
    }

    #[test]
    fn new_block_is_empty_and_zeroed() {
        let block = block_of::<u64>(16);

        assert_eq!(block.capacity(), 16);
        assert_eq!(block.len(), 0);
        assert!(block.is_empty());
        assert!(!block.is_full());

        for index in 0..16 {
            assert!(!block.is_occupied(index));

            let value = unsafe { block.slot_ptr(index).unwrap().cast::<u64>().read() };
            assert_eq!(value, 0);
        }
    }

    #[test]
    fn rejects_zero_capacity() {
        let result = MemoryBlock::new(Layout::new::<u32>(), 0);
        assert!(matches!(result, Err(Error::InvalidConfiguration { .. })));
    }

    #[test]
    fn rejects_capacity_not_multiple_of_eight() {
        let result = MemoryBlock::new(Layout::new::<u32>(), 12);
        assert!(matches!(result, Err(Error::InvalidConfiguration { .. })));
    }

    #[test]
    fn rejects_zero_sized_layout() {
        let result = MemoryBlock::new(Layout::new::<()>(), 8);
        assert!(matches!(result, Err(Error::InvalidConfiguration { .. })));
    }

    #[test]
    fn object_region_follows_bitmap() {
        // 64 slots need an 8-byte bitmap, which is already 8-aligned.
        let block = block_of::<u64>(64);

        let offset = block.object_base().as_ptr() as usize - block.base.as_ptr() as usize;
        assert_eq!(offset, 8);
    }

    #[test]
    fn object_region_is_aligned() {
        #[repr(align(64))]
        struct Aligned(#[allow(dead_code, reason = "only the layout matters")] u8);

        let block = block_of::<Aligned>(8);

        assert_eq!(block.object_base().as_ptr() as usize % 64, 0);
        assert_eq!(block.element_layout().size(), 64);
    }

    #[test]
    fn slot_ptr_is_none_out_of_bounds() {
        let block = block_of::<u32>(8);

        assert!(block.slot_ptr(7).is_some());
        assert!(block.slot_ptr(8).is_none());
        assert!(!block.is_occupied(8));
    }

    #[test]
    fn slots_are_spaced_by_stride() {
        let block = block_of::<[u8; 12]>(8);

        let first = block.slot_ptr(0).unwrap().as_ptr() as usize;
        let third = block.slot_ptr(2).unwrap().as_ptr() as usize;

        assert_eq!(third - first, 24);
        assert_eq!(block.slot_stride(), 12);
    }

    #[test]
    fn first_vacant_is_first_fit() {
        let mut block = block_of::<u32>(16);

        assert_eq!(block.first_vacant(), Some(0));

        for index in 0..10 {
            block.occupy(index);
        }

        assert_eq!(block.first_vacant(), Some(10));

        block.vacate(3).unwrap();
        assert_eq!(block.first_vacant(), Some(3));

        block.vacate(9).unwrap();
        assert_eq!(block.first_vacant(), Some(3));
    }

    #[test]
    fn first_vacant_is_none_when_full() {
        let mut block = block_of::<u32>(8);

        for index in 0..8 {
            block.occupy(index);
        }

        assert!(block.is_full());
        assert_eq!(block.first_vacant(), None);
    }

    #[test]
    fn occupied_indices_skip_holes() {
        let mut block = block_of::<u32>(24);

        for index in [0, 1, 7, 8, 15, 23] {
            block.occupy(index);
        }

        let occupied = block.occupied_indices().collect::<Vec<_>>();
        assert_eq!(occupied, vec![0, 1, 7, 8, 15, 23]);
    }

    #[test]
    fn vacate_out_of_bounds_is_error() {
        let mut block = block_of::<u32>(8);
        block.occupy(0);

        let result = block.vacate(8);

        assert!(matches!(
            result,
            Err(Error::OutOfBounds {
                index: 8,
                capacity: 8
            })
        ));
        assert_eq!(block.len(), 1);
        assert!(block.is_occupied(0));
    }

    #[test]
    fn vacate_twice_is_double_free() {
        let mut block = block_of::<u32>(8);
        block.occupy(5);

        block.vacate(5).unwrap();
        let result = block.vacate(5);

        assert!(matches!(result, Err(Error::DoubleFree { index: 5 })));
        assert_eq!(block.len(), 0);
    }

    #[test]
    #[should_panic]
    fn occupy_twice_panics() {
        let mut block = block_of::<u32>(8);
        block.occupy(2);
        block.occupy(2);
    }

    #[test]
    fn grow_doubles_capacity_and_preserves_contents() {
        let mut block = block_of::<u64>(8);

        for index in 0..8 {
            block.occupy(index);
            unsafe {
                block
                    .slot_ptr(index)
                    .unwrap()
                    .cast::<u64>()
                    .write(index as u64 * 100);
            }
        }

        block.vacate(4).unwrap();
        let id_before = block.id();

        block.grow().unwrap();

        assert_eq!(block.capacity(), 16);
        assert_eq!(block.len(), 7);
        assert_eq!(block.id(), id_before);

        for index in 0..8 {
            assert_eq!(block.is_occupied(index), index != 4);

            if index != 4 {
                let value = unsafe { block.slot_ptr(index).unwrap().cast::<u64>().read() };
                assert_eq!(value, index as u64 * 100);
            }
        }

        for index in 8..16 {
            assert!(!block.is_occupied(index));
        }

        assert_eq!(block.first_vacant(), Some(4));

        #[cfg(debug_assertions)]
        block.integrity_check();
    }

    #[test]
    fn grow_keeps_object_region_aligned() {
        #[repr(align(32))]
        struct Aligned(#[allow(dead_code, reason = "only the layout matters")] u8);

        let mut block = block_of::<Aligned>(8);
        block.grow().unwrap();
        block.grow().unwrap();

        assert_eq!(block.capacity(), 32);
        assert_eq!(block.object_base().as_ptr() as usize % 32, 0);
    }
}
