use std::alloc::Layout;

use crate::{Error, Result};

/// The size classes used by a [`GeneralPurposeAllocator`][crate::GeneralPurposeAllocator] when
/// no others are configured.
pub const DEFAULT_SIZE_CLASSES: [usize; 6] = [8, 16, 32, 64, 128, 256];

/// Slot alignment is capped at a typical page size.
const MAX_CLASS_ALIGN: usize = 4096;

/// An ascending list of slot sizes that objects are routed into by their layout.
///
/// Each class has a slot alignment equal to the largest power of two that divides the class
/// size (at most 4096), so a 24-byte class has 8-byte aligned slots and a 64-byte class has
/// 64-byte aligned slots.
///
/// An object is routed to the smallest class that is at least as large as the object and whose
/// slot alignment is at least the alignment of the object. The object then occupies a whole slot
/// of that class.
///
/// # Example
///
/// ```
/// use std::alloc::Layout;
///
/// use bitmap_pool::SizeClasses;
///
/// let classes = SizeClasses::default();
///
/// assert_eq!(classes.route(Layout::new::<[u8; 20]>()).unwrap(), 32);
/// assert!(classes.route(Layout::new::<[u8; 300]>()).is_err());
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SizeClasses {
    /// Strictly ascending by size.
    classes: Vec<Layout>,
}

impl SizeClasses {
    /// Creates a set of size classes from slot sizes in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if no sizes are given, if any size is zero or
    /// if the sizes are not strictly ascending.
    pub fn new(sizes: impl IntoIterator<Item = usize>) -> Result<Self> {
        let sizes = sizes.into_iter().collect::<Vec<_>>();

        if sizes.is_empty() {
            return Err(Error::invalid_configuration(
                "at least one size class is required",
            ));
        }

        if sizes.contains(&0) {
            return Err(Error::invalid_configuration(
                "size classes must not be zero-sized",
            ));
        }

        if let Some(pair) = sizes.windows(2).find(|pair| pair.first() >= pair.last()) {
            return Err(Error::invalid_configuration(format!(
                "size classes must be strictly ascending but found {pair:?}"
            )));
        }

        let classes = sizes
            .into_iter()
            .map(|size| {
                Layout::from_size_align(size, class_align(size)).map_err(|_| {
                    Error::invalid_configuration(format!("size class {size} is too large"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { classes })
    }

    /// Returns the size of the class that an object with the given layout is routed to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeClassExhausted`] if no class is large enough or sufficiently
    /// aligned.
    pub fn route(&self, layout: Layout) -> Result<usize> {
        self.classes
            .iter()
            .find(|class| class.size() >= layout.size() && class.align() >= layout.align())
            .map(Layout::size)
            .ok_or(Error::SizeClassExhausted {
                size: layout.size(),
                align: layout.align(),
                largest_class: self.largest(),
            })
    }

    /// The slot layout of the class with the given size, if such a class exists.
    #[must_use]
    pub fn layout_of(&self, size: usize) -> Option<Layout> {
        self.classes
            .iter()
            .find(|class| class.size() == size)
            .copied()
    }

    /// Slot layouts of all classes, in ascending order.
    #[must_use]
    pub fn as_slice(&self) -> &[Layout] {
        &self.classes
    }

    /// Sizes of all classes, in ascending order.
    pub fn sizes(&self) -> impl Iterator<Item = usize> + '_ {
        self.classes.iter().map(Layout::size)
    }

    /// Size of the largest class.
    #[must_use]
    pub fn largest(&self) -> usize {
        self.classes
            .last()
            .map(Layout::size)
            .expect("construction guarantees at least one class")
    }

    /// Number of classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Always `false`; a set of size classes is never empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl Default for SizeClasses {
    fn default() -> Self {
        Self::new(DEFAULT_SIZE_CLASSES).expect("default size classes are valid")
    }
}

/// The largest power of two that divides `size`, capped at `MAX_CLASS_ALIGN`.
pub(crate) fn class_align(size: usize) -> usize {
    debug_assert!(size != 0);

    // Isolates the lowest set bit.
    let lowest_set_bit = size & size.wrapping_neg();

    lowest_set_bit.min(MAX_CLASS_ALIGN)
}
