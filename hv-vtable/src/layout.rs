use core::mem;

use crate::error::LayoutError;

/// A size and alignment pair, laid out identically to the `{ size_t size; size_t align; }` struct
/// other languages use on the far side of a vtable boundary.
///
/// Unlike [`core::alloc::Layout`], this type upholds no invariants of its own; it is plain data
/// which a dispatch table hands back so that memory can be released after the type which described
/// it has been erased.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Layout {
    /// The size in bytes.
    pub size: usize,
    /// The alignment in bytes. Must be a power of two for the layout to be usable.
    pub align: usize,
}

impl Layout {
    /// The layout of `T`.
    pub const fn new<T>() -> Self {
        Self {
            size: mem::size_of::<T>(),
            align: mem::align_of::<T>(),
        }
    }

    /// The layout of the value behind `value`.
    pub fn for_value<T: ?Sized>(value: &T) -> Self {
        Self {
            size: mem::size_of_val(value),
            align: mem::align_of_val(value),
        }
    }

    /// Round `size` up to the next multiple of `align`.
    pub(crate) const fn pad_to_align(self) -> Self {
        debug_assert!(self.align.is_power_of_two());
        let mask = self.align - 1;
        Self {
            size: (self.size + mask) & !mask,
            align: self.align,
        }
    }
}

impl From<core::alloc::Layout> for Layout {
    fn from(layout: core::alloc::Layout) -> Self {
        Self {
            size: layout.size(),
            align: layout.align(),
        }
    }
}

impl TryFrom<Layout> for core::alloc::Layout {
    type Error = LayoutError;

    fn try_from(layout: Layout) -> Result<Self, Self::Error> {
        core::alloc::Layout::from_size_align(layout.size, layout.align).map_err(|_| LayoutError {
            size: layout.size,
            align: layout.align,
        })
    }
}

static_assertions::assert_eq_size!(Layout, [usize; 2]);
static_assertions::assert_eq_align!(Layout, usize);
