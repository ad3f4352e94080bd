//! Fixed-size object pools backed by a single contiguous memory block, with an occupancy bitmap
//! and relocation-safe slot handles.
//!
//! Every pool in this crate is built on a [`MemoryBlock`]: one allocation that starts with a
//! bitmap (one bit per slot) and continues with an array of equally sized slots. Allocation
//! claims the lowest vacant slot, freeing clears its bit. When a pool is full it can double its
//! capacity, which moves every object into a new block.
//!
//! Because objects move when a pool grows, they are referred to by [`SlotHandle`]s instead of
//! pointers. A handle holds the identity of the pool that issued it plus a slot index, and is
//! resolved against the pool on every access.
//!
//! # Key Features
//!
//! - **Typed pools**: [`FixedTypeAllocator<T>`] stores objects of one type and owns them,
//!   dropping them when they are freed or when the pool is dropped.
//! - **Thread-safe variants**: [`SyncFixedTypeAllocator<T>`] and
//!   [`SyncGeneralPurposeAllocator`] can be shared between threads. Objects are constructed and
//!   dropped outside the lock.
//! - **Size classes**: [`GeneralPurposeAllocator`] routes objects of any type into the smallest
//!   fitting size class by size and alignment.
//! - **Growth control**: [`GrowthPolicy::Doubling`] grows full pools and notifies an optional
//!   callback, [`GrowthPolicy::Fixed`] hands out unbound handles instead.
//! - **Checked usage contract**: freeing twice, freeing out of bounds and mixing up pools are
//!   reported as [`Error`]s and leave the pool untouched.
//! - **Dense iteration**: visit only live objects, or every slot of a fully packed pool.
//! - **Process-wide pools**: [`FixedSizeRegistry`] holds one pool per `(size, capacity)`
//!   combination, created explicitly at startup.
//!
//! # Examples
//!
//! ## Typed pool
//!
//! ```rust
//! use bitmap_pool::{FixedTypeAllocator, IterationMode};
//!
//! let mut pool = FixedTypeAllocator::<u64>::builder()
//!     .capacity(8)
//!     .build()
//!     .unwrap();
//!
//! let handles = (0..10).map(|n| pool.insert(n).unwrap()).collect::<Vec<_>>();
//!
//! // The pool grew to make room for the last two objects; handles remain valid.
//! assert_eq!(pool.capacity(), 16);
//! assert_eq!(*pool.get(&handles[9]).unwrap(), 9);
//!
//! let mut sum = 0;
//! pool.for_each(IterationMode::Active, |n| sum += *n).unwrap();
//! assert_eq!(sum, 45);
//! ```
//!
//! ## General purpose allocator
//!
//! ```rust
//! use bitmap_pool::GeneralPurposeAllocator;
//!
//! let mut allocator = GeneralPurposeAllocator::new().unwrap();
//!
//! let mut small = allocator.insert(1_u8).unwrap();
//! let mut large = allocator.insert([0_u64; 12]).unwrap();
//!
//! assert_eq!(allocator.class_for::<u8>().unwrap(), 8);
//! assert_eq!(allocator.class_for::<[u64; 12]>().unwrap(), 128);
//!
//! // SAFETY: Both handles were issued for these types and have not been deleted.
//! unsafe {
//!     allocator.delete(&mut small).unwrap();
//!     allocator.delete(&mut large).unwrap();
//! }
//! ```

mod builder;
mod drop_policy;
mod error;
mod fixed_layout;
mod fixed_type;
mod fixed_type_sync;
mod general_purpose;
mod general_purpose_builder;
mod general_purpose_sync;
mod growth_policy;
mod memory_block;
mod pool_id;
mod registry;
mod size_classes;
mod slot_handle;

pub use builder::*;
pub use drop_policy::*;
pub use error::*;
pub use fixed_layout::*;
pub use fixed_type::{FixedTypeAllocator, IterationMode};
pub use fixed_type_sync::*;
pub use general_purpose::*;
pub use general_purpose_builder::*;
pub use general_purpose_sync::*;
pub use growth_policy::*;
pub use memory_block::MemoryBlock;
pub use pool_id::*;
pub use registry::*;
pub use size_classes::{DEFAULT_SIZE_CLASSES, SizeClasses};
pub use slot_handle::*;
