//! Intrusive, non-atomic strong/weak reference counting for values known through a vtable.
//!
//! One heap block ([`VRcInner`]) holds the vtable pointer, both counts, the offset of the payload,
//! and the payload itself. Once the last [`VRc`] goes away the payload is dropped through the
//! vtable, and the block's [`Layout`] is written into the storage the payload used to occupy; the
//! block itself is only freed when the last [`VWeak`] goes away too. This way a block can always be
//! freed correctly even when every remaining handle to it is type-erased.

use core::{
    cell::Cell,
    fmt,
    marker::PhantomData,
    mem::{self, ManuallyDrop},
    ops::Deref,
    ptr::{self, NonNull},
};

use alloc::alloc::{alloc, handle_alloc_error};

use crate::{AllocError, HasStaticVTable, Layout, VRef, VRefMut, VTableDrop};

/// Stand-in payload type for [`VRc`]s and [`VWeak`]s whose concrete type has been erased.
///
/// Never instantiated; it only fixes the shape of the block header so that the count and offset
/// fields can be found without knowing the payload type.
pub struct Dyn(PhantomData<*mut u8>);

impl fmt::Debug for Dyn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Dyn")
    }
}

/// The payload while any strong handle exists; the block's own layout afterwards.
#[repr(C)]
union Slot<X> {
    data: ManuallyDrop<X>,
    layout: Layout,
}

/// The heap block shared by every [`VRc`] and [`VWeak`] pointing at the same value.
///
/// The field order and `#[repr(C)]` are part of the ABI: the vtable pointer, the strong count, the
/// weak count (which includes one extra tick for as long as the strong count is nonzero), the byte
/// offset of the payload from the start of the block, then the payload.
#[repr(C)]
pub struct VRcInner<VT: VTableDrop, X> {
    vtable: &'static VT,
    strong_ref: Cell<u32>,
    weak_ref: Cell<u32>,
    data_offset: u16,
    slot: Slot<X>,
}

impl<VT: VTableDrop, X> VRcInner<VT, X> {
    /// # Safety
    ///
    /// `this` must point to a live block.
    unsafe fn data_ptr(this: NonNull<Self>) -> NonNull<u8> {
        let offset = (*this.as_ptr()).data_offset;
        this.cast::<u8>().add(offset as usize)
    }

    /// Release one strong tick, dropping the payload if it was the last.
    ///
    /// # Safety
    ///
    /// `this` must point to a live block whose strong count includes a tick owned by the caller.
    unsafe fn release_strong(this: NonNull<Self>) {
        let inner = this.as_ptr();
        let strong = (*inner).strong_ref.get();
        debug_assert!(strong > 0);
        (*inner).strong_ref.set(strong - 1);
        if strong != 1 {
            return;
        }

        let vtable = (*inner).vtable;
        let data = Self::data_ptr(this);
        let payload = vtable.drop_in_place(VRefMut::from_raw(NonNull::from(vtable), data));
        let layout = block_layout::<VT>(payload, (*inner).data_offset);
        data.cast::<Layout>().as_ptr().write(layout);

        // The strong handles collectively own one weak tick.
        Self::release_weak(this);
    }

    /// Release one weak tick, freeing the block if it was the last.
    ///
    /// # Safety
    ///
    /// `this` must point to a live block whose weak count includes a tick owned by the caller.
    unsafe fn release_weak(this: NonNull<Self>) {
        let inner = this.as_ptr();
        let weak = (*inner).weak_ref.get();
        debug_assert!(weak > 0);
        (*inner).weak_ref.set(weak - 1);
        if weak != 1 {
            return;
        }

        debug_assert_eq!((*inner).strong_ref.get(), 0);
        let vtable = (*inner).vtable;
        let layout = Self::data_ptr(this).cast::<Layout>().as_ptr().read();
        log::trace!("freeing {}-byte VRc block at {:p}", layout.size, inner);
        vtable.dealloc(inner.cast::<u8>(), layout);
    }
}

impl<VT: VTableDrop, X> fmt::Debug for VRcInner<VT, X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VRcInner")
            .field("vtable", &(self.vtable as *const VT))
            .field("strong_ref", &self.strong_ref.get())
            .field("weak_ref", &self.weak_ref.get())
            .field("data_offset", &self.data_offset)
            .finish_non_exhaustive()
    }
}

/// Recover the layout of a whole `VRcInner<VT, X>` from the layout of `X` and the block's recorded
/// payload offset.
fn block_layout<VT: VTableDrop>(payload: Layout, data_offset: u16) -> Layout {
    let slot = Layout {
        size: payload.size.max(mem::size_of::<Layout>()),
        align: payload.align.max(mem::align_of::<Layout>()),
    }
    .pad_to_align();

    Layout {
        size: data_offset as usize + slot.size,
        align: slot.align.max(mem::align_of::<VRcInner<VT, Dyn>>()),
    }
    .pad_to_align()
}

fn increment(count: &Cell<u32>) {
    match count.get().checked_add(1) {
        Some(n) => count.set(n),
        None => panic!("VRc reference count overflow"),
    }
}

/// A strong, single-threaded reference-counted pointer to a value known through the vtable `VT`.
///
/// With `X` a concrete type implementing [`HasStaticVTable<VT>`], the `VRc` dereferences to `X`.
/// With `X` left as [`Dyn`], the payload is only reachable through [`VRc::borrow`] and its vtable.
///
/// Like [`alloc::rc::Rc`], operations on a `VRc` are associated functions (`VRc::borrow(&rc)`)
/// so they never shadow methods of the payload.
#[repr(transparent)]
pub struct VRc<VT: VTableDrop, X = Dyn> {
    inner: NonNull<VRcInner<VT, X>>,
    _phantom: PhantomData<X>,
}

impl<VT: VTableDrop, X: HasStaticVTable<VT>> VRc<VT, X> {
    /// Move `value` into a new reference-counted block. Aborts through [`handle_alloc_error`] if
    /// allocation fails.
    pub fn new(value: X) -> Self {
        match Self::try_new(value) {
            Ok(this) => this,
            Err(AllocError::OutOfMemory(_)) => {
                handle_alloc_error(core::alloc::Layout::new::<VRcInner<VT, X>>())
            }
            Err(err) => panic!("{}", err),
        }
    }

    /// Move `value` into a new reference-counted block, reporting failure instead of aborting.
    pub fn try_new(value: X) -> Result<Self, AllocError> {
        let offset = mem::offset_of!(VRcInner<VT, X>, slot);
        let data_offset = u16::try_from(offset).map_err(|_| AllocError::OffsetOverflow(offset))?;

        let layout = core::alloc::Layout::new::<VRcInner<VT, X>>();
        let inner = NonNull::new(unsafe { alloc(layout) }.cast::<VRcInner<VT, X>>())
            .ok_or(AllocError::OutOfMemory(layout.into()))?;

        unsafe {
            inner.as_ptr().write(VRcInner {
                vtable: X::static_vtable(),
                strong_ref: Cell::new(1),
                weak_ref: Cell::new(1),
                data_offset,
                slot: Slot {
                    data: ManuallyDrop::new(value),
                },
            });
        }

        log::trace!(
            "allocated {}-byte VRc block at {:p} for {}",
            layout.size(),
            inner,
            core::any::type_name::<X>()
        );

        Ok(Self {
            inner,
            _phantom: PhantomData,
        })
    }

    /// Erase the payload type. The returned handle shares the block and its counts.
    pub fn into_dyn(this: Self) -> VRc<VT, Dyn> {
        let this = ManuallyDrop::new(this);
        VRc {
            inner: this.inner.cast(),
            _phantom: PhantomData,
        }
    }
}

impl<VT: VTableDrop> VRc<VT, Dyn> {
    /// Recover the payload type, if the block's vtable is `X`'s static vtable. Gives the handle
    /// back unchanged otherwise.
    pub fn downcast<X: HasStaticVTable<VT>>(this: Self) -> Result<VRc<VT, X>, Self> {
        if ptr::eq(Self::vtable(&this), X::static_vtable()) {
            let this = ManuallyDrop::new(this);
            Ok(VRc {
                inner: this.inner.cast(),
                _phantom: PhantomData,
            })
        } else {
            Err(this)
        }
    }
}

impl<VT: VTableDrop, X> VRc<VT, X> {
    /// A fat reference to the payload, usable with the vtable's entries.
    pub fn borrow(this: &Self) -> VRef<'_, VT> {
        unsafe {
            VRef::from_raw(
                NonNull::from(Self::vtable(this)),
                VRcInner::data_ptr(this.inner),
            )
        }
    }

    /// A unique fat reference to the payload, if no other `VRc` or [`VWeak`] shares the block.
    pub fn get_mut(this: &mut Self) -> Option<VRefMut<'_, VT>> {
        let inner = this.inner.as_ptr();
        let unique = unsafe { (*inner).strong_ref.get() == 1 && (*inner).weak_ref.get() == 1 };
        unique.then(|| unsafe {
            VRefMut::from_raw(
                NonNull::from((*inner).vtable),
                VRcInner::data_ptr(this.inner),
            )
        })
    }

    /// The vtable of the payload.
    pub fn vtable(this: &Self) -> &'static VT {
        unsafe { (*this.inner.as_ptr()).vtable }
    }

    /// Create a [`VWeak`] pointing at the same block.
    pub fn downgrade(this: &Self) -> VWeak<VT, X> {
        unsafe { increment(&(*this.inner.as_ptr()).weak_ref) };
        VWeak {
            inner: Some(this.inner),
            _phantom: PhantomData,
        }
    }

    /// The number of `VRc`s pointing at this block.
    pub fn strong_count(this: &Self) -> usize {
        unsafe { (*this.inner.as_ptr()).strong_ref.get() as usize }
    }

    /// The number of [`VWeak`]s pointing at this block.
    pub fn weak_count(this: &Self) -> usize {
        unsafe { (*this.inner.as_ptr()).weak_ref.get() as usize - 1 }
    }

    /// Whether both handles point at the same block.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.inner == other.inner
    }
}

impl<VT: VTableDrop, X: HasStaticVTable<VT>> Deref for VRc<VT, X> {
    type Target = X;

    fn deref(&self) -> &X {
        unsafe { &*(*self.inner.as_ptr()).slot.data }
    }
}

impl<VT: VTableDrop, X> Clone for VRc<VT, X> {
    fn clone(&self) -> Self {
        unsafe { increment(&(*self.inner.as_ptr()).strong_ref) };
        Self {
            inner: self.inner,
            _phantom: PhantomData,
        }
    }

    fn clone_from(&mut self, source: &Self) {
        if !Self::ptr_eq(self, source) {
            *self = source.clone();
        }
    }
}

impl<VT: VTableDrop, X> Drop for VRc<VT, X> {
    fn drop(&mut self) {
        unsafe { VRcInner::release_strong(self.inner) };
    }
}

impl<VT: VTableDrop, X> fmt::Debug for VRc<VT, X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VRc")
            .field("ptr", &self.inner)
            .field("strong", &Self::strong_count(self))
            .field("weak", &Self::weak_count(self))
            .finish()
    }
}

/// A weak counterpart to [`VRc`]: keeps the block allocated but not the payload alive.
///
/// A `VWeak` may also be empty, pointing at no block at all; [`VWeak::new`] and [`Default`] create
/// one.
#[repr(transparent)]
pub struct VWeak<VT: VTableDrop, X = Dyn> {
    inner: Option<NonNull<VRcInner<VT, X>>>,
    _phantom: PhantomData<X>,
}

impl<VT: VTableDrop, X> VWeak<VT, X> {
    /// An empty `VWeak`, which never upgrades.
    pub const fn new() -> Self {
        Self {
            inner: None,
            _phantom: PhantomData,
        }
    }

    /// A new strong handle to the payload, unless it has already been dropped or this `VWeak` is
    /// empty.
    pub fn upgrade(&self) -> Option<VRc<VT, X>> {
        let inner = self.inner?;
        let strong = unsafe { &(*inner.as_ptr()).strong_ref };
        if strong.get() == 0 {
            return None;
        }

        increment(strong);
        Some(VRc {
            inner,
            _phantom: PhantomData,
        })
    }

    /// The number of [`VRc`]s pointing at this block; zero if the payload is gone or this `VWeak`
    /// is empty.
    pub fn strong_count(&self) -> usize {
        self.inner.map_or(0, |inner| unsafe {
            (*inner.as_ptr()).strong_ref.get() as usize
        })
    }

    /// The number of `VWeak`s pointing at this block, including this one; zero if empty.
    pub fn weak_count(&self) -> usize {
        self.inner.map_or(0, |inner| unsafe {
            let inner = inner.as_ptr();
            let strong_tick = ((*inner).strong_ref.get() > 0) as u32;
            ((*inner).weak_ref.get() - strong_tick) as usize
        })
    }

    /// Whether both handles point at the same block, or are both empty.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl<VT: VTableDrop, X: HasStaticVTable<VT>> VWeak<VT, X> {
    /// Erase the payload type. The returned handle shares the block and its counts.
    pub fn into_dyn(self) -> VWeak<VT, Dyn> {
        let this = ManuallyDrop::new(self);
        VWeak {
            inner: this.inner.map(NonNull::cast),
            _phantom: PhantomData,
        }
    }
}

impl<VT: VTableDrop, X> Default for VWeak<VT, X> {
    fn default() -> Self {
        Self::new()
    }
}

impl<VT: VTableDrop, X> From<&VRc<VT, X>> for VWeak<VT, X> {
    fn from(rc: &VRc<VT, X>) -> Self {
        VRc::downgrade(rc)
    }
}

impl<VT: VTableDrop, X> Clone for VWeak<VT, X> {
    fn clone(&self) -> Self {
        if let Some(inner) = self.inner {
            unsafe { increment(&(*inner.as_ptr()).weak_ref) };
        }

        Self {
            inner: self.inner,
            _phantom: PhantomData,
        }
    }

    fn clone_from(&mut self, source: &Self) {
        if !self.ptr_eq(source) {
            *self = source.clone();
        }
    }
}

impl<VT: VTableDrop, X> Drop for VWeak<VT, X> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner {
            unsafe { VRcInner::release_weak(inner) };
        }
    }
}

impl<VT: VTableDrop, X> fmt::Debug for VWeak<VT, X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VWeak")
            .field("ptr", &self.inner)
            .field("strong", &self.strong_count())
            .field("weak", &self.weak_count())
            .finish()
    }
}
