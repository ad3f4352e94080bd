/// Determines how a pool treats objects that are still live when the pool itself is dropped.
///
/// By default, the pool will drop its remaining objects when it is dropped.
///
/// # Examples
///
/// ```
/// use bitmap_pool::{DropPolicy, FixedTypeAllocator};
///
/// // The drop policy is set at pool creation time.
/// let pool = FixedTypeAllocator::<u32>::builder()
///     .drop_policy(DropPolicy::MustNotDropItems)
///     .build()
///     .unwrap();
/// # drop(pool);
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// Remaining objects are dropped together with the pool. This is the default.
    ///
    /// Type-erased pools (the size classes of a general purpose allocator and the pools of a
    /// [`FixedSizeRegistry`][crate::FixedSizeRegistry]) do not know the types of their objects,
    /// so they release the memory without running destructors.
    #[default]
    MayDropItems,

    /// The pool will panic if it still contains objects when it is dropped.
    ///
    /// This may be valuable if there are external requirements before the objects can be
    /// dropped, for example when every allocation is expected to be paired with a free.
    MustNotDropItems,
}
