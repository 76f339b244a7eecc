use crate::Layout;

/// Errors reported by the fallible constructors [`VRc::try_new`](crate::VRc::try_new) and
/// [`VBox::try_new`](crate::VBox::try_new).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// The global allocator returned null for the given layout.
    #[error("failed to allocate {} bytes aligned to {}", .0.size, .0.align)]
    OutOfMemory(Layout),

    /// The payload sits further from the start of its allocation header than the header's `u16`
    /// offset field can record. Only reachable with absurdly over-aligned payloads.
    #[error("payload offset {0} does not fit in the allocation header")]
    OffsetOverflow(usize),
}

/// A [`Layout`] which is not a valid Rust [`core::alloc::Layout`]: either the alignment is not a
/// power of two, or the size overflows when rounded up to the alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid layout (size {size}, align {align})")]
pub struct LayoutError {
    /// The offending size.
    pub size: usize,
    /// The offending alignment.
    pub align: usize,
}
