/// Determines what a pool does when an allocation is requested while every slot is occupied.
///
/// # Examples
///
/// ```
/// use bitmap_pool::{FixedTypeAllocator, GrowthPolicy};
///
/// let mut pool = FixedTypeAllocator::<u64>::builder()
///     .capacity(8)
///     .growth_policy(GrowthPolicy::Fixed)
///     .build()
///     .unwrap();
///
/// for _ in 0..8 {
///     assert!(pool.allocate().unwrap().is_bound());
/// }
///
/// // The ninth allocation does not fit and the pool is not allowed to grow.
/// assert!(!pool.allocate().unwrap().is_bound());
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum GrowthPolicy {
    /// The pool doubles its capacity when full, moving all objects into a new memory block.
    /// Slot handles remain valid; raw pointers into the old block do not. This is the default.
    #[default]
    Doubling,

    /// The pool never grows. An allocation from a full pool returns an unbound handle.
    Fixed,
}
