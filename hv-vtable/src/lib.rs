//! Heavy VTable - dynamic dispatch and shared ownership with a layout that holds still across
//! language and compiler boundaries.
//!
//! Rust's `dyn Trait` vtables have no stable layout, so they can't be handed to (or received from)
//! code that wasn't compiled by the same `rustc` in the same build. This crate replaces them with
//! *explicit* vtables: plain `#[repr(C)]` structs of `extern "C"` function pointers, one static
//! instance per concrete type. On top of those it provides:
//!
//! - [`Layout`], a `#[repr(C)]` size/alignment pair, used to free memory once the type which
//!   described it has been erased.
//! - [`VRef`], [`VRefMut`] and [`VBox`], fat pointers made of a vtable pointer and an instance
//!   pointer. The first two borrow, [`VBox`] owns.
//! - [`VOffset`], a vtable pointer plus a byte offset, for finding a field with a known vtable
//!   inside a base object (see [`voffset!`]).
//! - [`VRc`] and [`VWeak`], an intrusive, non-atomic strong/weak reference-counted pointer pair.
//!   A `VRc<VT, X>` knows its payload type `X`; [`VRc::into_dyn`] erases it to a `VRc<VT, Dyn>`
//!   which can still drop and free the payload through its vtable.
//!
//! # Vtables
//!
//! A vtable participating in reference counting must implement [`VTableDrop`], which is how this
//! crate reaches the vtable's `drop_in_place` and `dealloc` entries. For the common case of a
//! vtable struct with fields of exactly those names, [`impl_vtable_drop!`] writes the impl, and the
//! generic [`drop_in_place`] and [`dealloc`] functions can be stored as the entries. Each concrete
//! type then names its static vtable through [`HasStaticVTable`].
//!
//! ```
//! use hv_vtable::{HasStaticVTable, Layout, VRc, VRef, VRefMut};
//!
//! #[repr(C)]
//! pub struct ShapeVTable {
//!     pub area: unsafe extern "C" fn(VRef<'_, ShapeVTable>) -> f64,
//!     pub drop_in_place: unsafe extern "C" fn(VRefMut<'_, ShapeVTable>) -> Layout,
//!     pub dealloc: unsafe extern "C" fn(&ShapeVTable, *mut u8, Layout),
//! }
//!
//! hv_vtable::impl_vtable_drop!(ShapeVTable);
//!
//! struct Square(f64);
//!
//! unsafe extern "C" fn square_area(this: VRef<'_, ShapeVTable>) -> f64 {
//!     let square = this.as_ptr().cast::<Square>().as_ref();
//!     square.0 * square.0
//! }
//!
//! static SQUARE_VTABLE: ShapeVTable = ShapeVTable {
//!     area: square_area,
//!     drop_in_place: hv_vtable::drop_in_place::<ShapeVTable, Square>,
//!     dealloc: hv_vtable::dealloc::<ShapeVTable>,
//! };
//!
//! unsafe impl HasStaticVTable<ShapeVTable> for Square {
//!     fn static_vtable() -> &'static ShapeVTable {
//!         &SQUARE_VTABLE
//!     }
//! }
//!
//! let square: VRc<ShapeVTable, Square> = VRc::new(Square(3.0));
//! let shape = VRc::into_dyn(square.clone());
//! let this = VRc::borrow(&shape);
//! assert_eq!(unsafe { (this.vtable().area)(this) }, 9.0);
//! assert_eq!(VRc::strong_count(&square), 2);
//! ```
//!
//! # Threads
//!
//! None of the pointer types here are `Send` or `Sync`. Reference counts are plain integers, and
//! sharing a [`VRc`] or [`VWeak`] between threads needs an external lock around every handle to
//! the same block.

#![no_std]
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

extern crate alloc;

mod error;
mod layout;
mod offset;
mod rc;
mod refs;

pub use crate::{
    error::{AllocError, LayoutError},
    layout::Layout,
    offset::VOffset,
    rc::{Dyn, VRc, VRcInner, VWeak},
    refs::{VBox, VRef, VRefMut},
};

// Used by `voffset!`.
#[doc(hidden)]
pub use core::mem::offset_of;

/// Access to the two entries of a vtable which the owning pointers ([`VBox`], [`VRc`], [`VWeak`])
/// need in order to destroy a value and free its memory without knowing its type.
///
/// Usually implemented with [`impl_vtable_drop!`].
///
/// # Safety
///
/// `drop_in_place` must drop the value behind the pointer exactly as the concrete type's destructor
/// would and return that type's [`Layout`]. `dealloc` must release memory obtained from the global
/// allocator with the given layout, and must do nothing for a zero-sized layout.
pub unsafe trait VTableDrop: Sized + 'static {
    /// Drop the value behind `ptr` in place and return its layout.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live value of a type whose vtable is `self`. The value must not be
    /// used again afterwards.
    unsafe fn drop_in_place(&self, ptr: VRefMut<'_, Self>) -> Layout;

    /// Free memory previously allocated through the global allocator.
    ///
    /// # Safety
    ///
    /// `ptr` and `layout` must describe a live allocation of the global allocator, or `layout` must
    /// be zero-sized.
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout);
}

/// Implemented by concrete types to name the one static vtable instance describing them.
///
/// # Safety
///
/// The returned vtable must describe `Self` and must not be returned for any other type; pointer
/// identity of the vtable is how [`VRef::downcast`] and [`VRc::downcast`] recover the type.
pub unsafe trait HasStaticVTable<VT: 'static> {
    /// The vtable for `Self`.
    fn static_vtable() -> &'static VT;
}

/// A `drop_in_place` vtable entry for values of type `X`.
///
/// # Safety
///
/// `ptr` must point to a live `X`. A panic in `X`'s destructor aborts, since it would have to
/// unwind across an `extern "C"` boundary.
pub unsafe extern "C" fn drop_in_place<VT: 'static, X>(ptr: VRefMut<'_, VT>) -> Layout {
    core::ptr::drop_in_place(ptr.as_ptr().cast::<X>().as_ptr());
    Layout::new::<X>()
}

/// A `dealloc` vtable entry backed by the global allocator. Zero-sized layouts are ignored.
///
/// # Safety
///
/// See [`VTableDrop::dealloc`].
pub unsafe extern "C" fn dealloc<VT: 'static>(_vtable: &VT, ptr: *mut u8, layout: Layout) {
    if layout.size == 0 {
        return;
    }

    debug_assert!(core::alloc::Layout::try_from(layout).is_ok());
    alloc::alloc::dealloc(
        ptr,
        core::alloc::Layout::from_size_align_unchecked(layout.size, layout.align),
    );
}

/// Implement [`VTableDrop`] for a vtable struct which has `drop_in_place` and `dealloc` fields of
/// types `unsafe extern "C" fn(VRefMut<'_, Self>) -> Layout` and `unsafe extern "C" fn(&Self, *mut
/// u8, Layout)` respectively.
#[macro_export]
macro_rules! impl_vtable_drop {
    ($vtable:ty) => {
        unsafe impl $crate::VTableDrop for $vtable {
            unsafe fn drop_in_place(&self, ptr: $crate::VRefMut<'_, Self>) -> $crate::Layout {
                (self.drop_in_place)(ptr)
            }

            unsafe fn dealloc(&self, ptr: *mut u8, layout: $crate::Layout) {
                (self.dealloc)(self, ptr, layout)
            }
        }
    };
}
