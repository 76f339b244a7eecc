//! Fat pointers: a vtable pointer next to an instance pointer, laid out as two plain pointers.

use core::{fmt, marker::PhantomData, mem::ManuallyDrop, ptr::NonNull};

use alloc::alloc::{alloc, handle_alloc_error};

use crate::{AllocError, HasStaticVTable, VTableDrop};

/// A shared reference to a value which is only known through its vtable `VT`.
#[repr(C)]
pub struct VRef<'a, VT: 'static> {
    vtable: NonNull<VT>,
    ptr: NonNull<u8>,
    _phantom: PhantomData<&'a ()>,
}

impl<VT: 'static> Clone for VRef<'_, VT> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<VT: 'static> Copy for VRef<'_, VT> {}

impl<'a, VT: 'static> VRef<'a, VT> {
    /// Borrow a concrete value as a `VRef`, using its static vtable.
    pub fn new<X: HasStaticVTable<VT>>(value: &'a X) -> Self {
        Self {
            vtable: NonNull::from(X::static_vtable()),
            ptr: NonNull::from(value).cast(),
            _phantom: PhantomData,
        }
    }

    /// Create a `VRef` from its raw parts.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a value described by `vtable`, which is valid for shared access for
    /// `'a`, and `vtable` must outlive `'a`.
    pub unsafe fn from_raw(vtable: NonNull<VT>, ptr: NonNull<u8>) -> Self {
        Self {
            vtable,
            ptr,
            _phantom: PhantomData,
        }
    }

    /// The vtable of the referenced value.
    pub fn vtable(&self) -> &'a VT {
        unsafe { self.vtable.as_ref() }
    }

    /// The untyped pointer to the referenced value.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Recover a typed reference if the referenced value is an `X`, judged by vtable identity.
    pub fn downcast<X: HasStaticVTable<VT>>(&self) -> Option<&'a X> {
        core::ptr::eq(self.vtable.as_ptr(), X::static_vtable())
            .then(|| unsafe { self.ptr.cast::<X>().as_ref() })
    }
}

impl<VT: 'static> fmt::Debug for VRef<'_, VT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VRef")
            .field("vtable", &self.vtable)
            .field("ptr", &self.ptr)
            .finish()
    }
}

/// A unique reference to a value which is only known through its vtable `VT`.
#[repr(C)]
pub struct VRefMut<'a, VT: 'static> {
    vtable: NonNull<VT>,
    ptr: NonNull<u8>,
    _phantom: PhantomData<&'a mut ()>,
}

impl<'a, VT: 'static> VRefMut<'a, VT> {
    /// Mutably borrow a concrete value as a `VRefMut`, using its static vtable.
    pub fn new<X: HasStaticVTable<VT>>(value: &'a mut X) -> Self {
        Self {
            vtable: NonNull::from(X::static_vtable()),
            ptr: NonNull::from(value).cast(),
            _phantom: PhantomData,
        }
    }

    /// Create a `VRefMut` from its raw parts.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a value described by `vtable`, which is valid for unique access for
    /// `'a`, and `vtable` must outlive `'a`.
    pub unsafe fn from_raw(vtable: NonNull<VT>, ptr: NonNull<u8>) -> Self {
        Self {
            vtable,
            ptr,
            _phantom: PhantomData,
        }
    }

    /// The vtable of the referenced value.
    pub fn vtable(&self) -> &'a VT {
        unsafe { self.vtable.as_ref() }
    }

    /// The untyped pointer to the referenced value.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Reborrow as a shared [`VRef`].
    pub fn borrow(&self) -> VRef<'_, VT> {
        unsafe { VRef::from_raw(self.vtable, self.ptr) }
    }

    /// Reborrow for a shorter lifetime.
    pub fn borrow_mut(&mut self) -> VRefMut<'_, VT> {
        unsafe { VRefMut::from_raw(self.vtable, self.ptr) }
    }

    /// Downgrade into a shared [`VRef`] for the whole lifetime `'a`.
    pub fn into_ref(self) -> VRef<'a, VT> {
        unsafe { VRef::from_raw(self.vtable, self.ptr) }
    }

    /// Recover a typed shared reference if the referenced value is an `X`.
    pub fn downcast<X: HasStaticVTable<VT>>(&self) -> Option<&X> {
        core::ptr::eq(self.vtable.as_ptr(), X::static_vtable())
            .then(|| unsafe { self.ptr.cast::<X>().as_ref() })
    }

    /// Recover a typed unique reference if the referenced value is an `X`.
    pub fn downcast_mut<X: HasStaticVTable<VT>>(&mut self) -> Option<&mut X> {
        core::ptr::eq(self.vtable.as_ptr(), X::static_vtable())
            .then(|| unsafe { self.ptr.cast::<X>().as_mut() })
    }
}

impl<VT: 'static> fmt::Debug for VRefMut<'_, VT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VRefMut")
            .field("vtable", &self.vtable)
            .field("ptr", &self.ptr)
            .finish()
    }
}

/// A uniquely owned, heap-allocated value which is only known through its vtable `VT`.
///
/// Dropping a `VBox` destroys the value and frees its memory through the vtable's
/// [`VTableDrop`] entries.
#[repr(C)]
pub struct VBox<VT: VTableDrop> {
    vtable: NonNull<VT>,
    ptr: NonNull<u8>,
}

impl<VT: VTableDrop> VBox<VT> {
    /// Move `value` to the heap. Aborts through [`handle_alloc_error`] if allocation fails.
    pub fn new<X: HasStaticVTable<VT>>(value: X) -> Self {
        match Self::try_new(value) {
            Ok(this) => this,
            Err(_) => handle_alloc_error(core::alloc::Layout::new::<X>()),
        }
    }

    /// Move `value` to the heap, reporting allocation failure instead of aborting.
    pub fn try_new<X: HasStaticVTable<VT>>(value: X) -> Result<Self, AllocError> {
        let layout = core::alloc::Layout::new::<X>();
        let ptr = if layout.size() == 0 {
            NonNull::<X>::dangling()
        } else {
            NonNull::new(unsafe { alloc(layout) }.cast::<X>())
                .ok_or(AllocError::OutOfMemory(layout.into()))?
        };

        unsafe { ptr.as_ptr().write(value) };

        Ok(Self {
            vtable: NonNull::from(X::static_vtable()),
            ptr: ptr.cast(),
        })
    }

    /// Take ownership of a value from its raw parts, as produced by [`VBox::into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live value described by `vtable`, allocated so that the vtable's
    /// `dealloc` entry can free it with the layout its `drop_in_place` entry returns, and nothing
    /// else may own it.
    pub unsafe fn from_raw(vtable: NonNull<VT>, ptr: NonNull<u8>) -> Self {
        Self { vtable, ptr }
    }

    /// Give up ownership, returning the vtable and instance pointers without dropping anything.
    pub fn into_raw(self) -> (NonNull<VT>, NonNull<u8>) {
        let this = ManuallyDrop::new(self);
        (this.vtable, this.ptr)
    }

    /// The vtable of the owned value.
    pub fn vtable(&self) -> &VT {
        unsafe { self.vtable.as_ref() }
    }

    /// Borrow the owned value as a [`VRef`].
    pub fn borrow(&self) -> VRef<'_, VT> {
        unsafe { VRef::from_raw(self.vtable, self.ptr) }
    }

    /// Borrow the owned value as a [`VRefMut`].
    pub fn borrow_mut(&mut self) -> VRefMut<'_, VT> {
        unsafe { VRefMut::from_raw(self.vtable, self.ptr) }
    }

    /// Recover a typed shared reference if the owned value is an `X`.
    pub fn downcast_ref<X: HasStaticVTable<VT>>(&self) -> Option<&X> {
        self.borrow().downcast::<X>()
    }

    /// Recover a typed unique reference if the owned value is an `X`.
    pub fn downcast_mut<X: HasStaticVTable<VT>>(&mut self) -> Option<&mut X> {
        core::ptr::eq(self.vtable.as_ptr(), X::static_vtable())
            .then(|| unsafe { self.ptr.cast::<X>().as_mut() })
    }
}

impl<VT: VTableDrop> Drop for VBox<VT> {
    fn drop(&mut self) {
        unsafe {
            let vtable = self.vtable.as_ref();
            let layout = vtable.drop_in_place(VRefMut::from_raw(self.vtable, self.ptr));
            vtable.dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

impl<VT: VTableDrop> fmt::Debug for VBox<VT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VBox")
            .field("vtable", &self.vtable)
            .field("ptr", &self.ptr)
            .finish()
    }
}

static_assertions::assert_eq_size!(VRef<'static, ()>, [usize; 2]);
static_assertions::assert_eq_size!(VRefMut<'static, ()>, [usize; 2]);
static_assertions::assert_eq_size!(Option<VRef<'static, ()>>, [usize; 2]);
static_assertions::assert_not_impl_any!(VRef<'static, ()>: Send, Sync);
static_assertions::assert_not_impl_any!(VRefMut<'static, ()>: Send, Sync);
