use std::any::type_name;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::PoolId;

/// Something that owns an array of slots and can be used to turn a [`SlotHandle`] into an
/// address.
///
/// Implemented by every pool in this crate. The address of slot `i` is
/// `object_base() + i * slot_stride()`.
pub trait SlotSource {
    /// Identity of the pool. Handles issued by the pool carry the same identity.
    fn pool_id(&self) -> PoolId;

    /// Address of slot 0. Changes whenever the pool grows.
    fn object_base(&self) -> NonNull<u8>;

    /// Distance in bytes between consecutive slots.
    fn slot_stride(&self) -> usize;
}

/// A stable reference to an object in a pool, expressed as the identity of the pool plus a slot
/// index instead of as a memory address.
///
/// Because it does not hold an address, a handle survives pool growth: resolving it after the
/// pool has moved to a bigger memory block yields the new address of the same object.
///
/// A handle is a plain value. It can be copied freely, and copying it does not copy or share the
/// object. It does not keep the object alive either; the pool owns the object until the handle
/// is passed back to the pool to free it.
///
/// # Unbound handles
///
/// The [`unbound()`][Self::unbound] handle (also the [`Default`]) refers to no object. Pools
/// return it when they are full and not allowed to grow, and freeing a handle through a pool
/// turns the caller's copy into an unbound handle.
///
/// # Example
///
/// ```
/// use bitmap_pool::FixedTypeAllocator;
///
/// let mut pool = FixedTypeAllocator::<String>::new().unwrap();
///
/// let mut handle = pool.insert("hello".to_string()).unwrap();
/// assert!(handle.is_bound());
///
/// assert_eq!(pool.get(&handle).unwrap(), "hello");
///
/// pool.free(&mut handle).unwrap();
/// assert!(!handle.is_bound());
/// ```
pub struct SlotHandle<T> {
    pool: Option<PoolId>,
    index: usize,

    // The handle never owns a `T`, so it is `Send` and `Sync` regardless of `T`. Whoever
    // dereferences it goes through the pool, which carries the real bounds.
    _type: PhantomData<fn() -> T>,
}

impl<T> SlotHandle<T> {
    /// A handle that refers to no object.
    #[must_use]
    pub const fn unbound() -> Self {
        Self {
            pool: None,
            index: 0,
            _type: PhantomData,
        }
    }

    /// Assembles a handle from a pool identity and a slot index.
    ///
    /// This is mostly useful for handles that were taken apart for storage or transport.
    /// Nothing is validated here: pools validate handles when they are used, and will report
    /// [`Error::OutOfBounds`][crate::Error::OutOfBounds] or
    /// [`Error::ForeignHandle`][crate::Error::ForeignHandle] for handles that do not fit.
    #[must_use]
    pub const fn from_parts(pool: PoolId, index: usize) -> Self {
        Self {
            pool: Some(pool),
            index,
            _type: PhantomData,
        }
    }

    pub(crate) const fn bound(pool: PoolId, index: usize) -> Self {
        Self::from_parts(pool, index)
    }

    /// Whether the handle refers to an object.
    #[must_use]
    pub const fn is_bound(&self) -> bool {
        self.pool.is_some()
    }

    /// Identity of the pool that issued the handle, or `None` for an unbound handle.
    #[must_use]
    pub const fn pool_id(&self) -> Option<PoolId> {
        self.pool
    }

    /// Slot index of the object within its pool. Zero for an unbound handle.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Turns the handle into the unbound handle.
    pub fn zero_out(&mut self) {
        *self = Self::unbound();
    }

    /// Computes the current address of the object the handle refers to.
    ///
    /// The address is only valid until the pool grows or the object is freed. Keep the handle,
    /// not the address.
    ///
    /// This performs no occupancy or bounds check. Use the checked accessors of the pools
    /// (`get()`, `with()` and friends) unless you need the raw address.
    ///
    /// # Panics
    ///
    /// Panics if the handle is unbound or if it was issued by a different pool.
    #[must_use]
    pub fn resolve<S>(&self, source: &S) -> NonNull<T>
    where
        S: SlotSource + ?Sized,
    {
        let Some(pool) = self.pool else {
            panic!("cannot resolve an unbound handle to a {}", type_name::<T>());
        };

        let source_id = source.pool_id();
        assert!(
            pool == source_id,
            "handle issued by pool {pool} cannot be resolved through pool {source_id}"
        );

        let offset = self
            .index
            .checked_mul(source.slot_stride())
            .expect("slot offset does not fit in the address space");

        // The address is only meaningful if the index is in bounds, which is why this uses
        // wrapping arithmetic and leaves the bounds to the caller.
        let address = source
            .object_base()
            .as_ptr()
            .wrapping_add(offset)
            .cast::<T>();

        NonNull::new(address)
            .expect("offsetting a slot base within the address space never yields null")
    }
}

impl<T> Clone for SlotHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SlotHandle<T> {}

impl<T> PartialEq for SlotHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.pool == other.pool && self.index == other.index
    }
}

impl<T> Eq for SlotHandle<T> {}

impl<T> Hash for SlotHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pool.hash(state);
        self.index.hash(state);
    }
}

impl<T> Default for SlotHandle<T> {
    fn default() -> Self {
        Self::unbound()
    }
}

impl<T> fmt::Debug for SlotHandle<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("pool", &self.pool)
            .field("index", &self.index)
            .finish()
    }
}
