use core::{fmt, marker::PhantomData, ptr::NonNull};

use crate::{VRef, VRefMut};

/// Locates a field described by the vtable `VT` inside a `Base`, so that code which only knows the
/// base can hand out fat references to the field.
///
/// Build one with [`voffset!`](crate::voffset).
#[repr(C)]
pub struct VOffset<Base, VT: 'static> {
    vtable: &'static VT,
    offset: usize,
    _phantom: PhantomData<fn(&Base)>,
}

impl<Base, VT: 'static> Clone for VOffset<Base, VT> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Base, VT: 'static> Copy for VOffset<Base, VT> {}

impl<Base, VT: 'static> VOffset<Base, VT> {
    /// Create a `VOffset` from a vtable and a byte offset.
    ///
    /// # Safety
    ///
    /// Every `Base` must contain, `offset` bytes from its start, a field whose type is described by
    /// `vtable`.
    pub const unsafe fn from_raw(vtable: &'static VT, offset: usize) -> Self {
        Self {
            vtable,
            offset,
            _phantom: PhantomData,
        }
    }

    /// The vtable of the field.
    pub fn vtable(self) -> &'static VT {
        self.vtable
    }

    /// The byte offset of the field from the start of `Base`.
    pub fn offset(self) -> usize {
        self.offset
    }

    /// Borrow the field out of `base`.
    pub fn apply(self, base: &Base) -> VRef<'_, VT> {
        unsafe {
            VRef::from_raw(
                NonNull::from(self.vtable),
                NonNull::from(base).cast::<u8>().add(self.offset),
            )
        }
    }

    /// Mutably borrow the field out of `base`.
    pub fn apply_mut(self, base: &mut Base) -> VRefMut<'_, VT> {
        unsafe {
            VRefMut::from_raw(
                NonNull::from(self.vtable),
                NonNull::from(base).cast::<u8>().add(self.offset),
            )
        }
    }
}

impl<Base, VT: 'static> fmt::Debug for VOffset<Base, VT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VOffset")
            .field("vtable", &(self.vtable as *const VT))
            .field("offset", &self.offset)
            .finish()
    }
}

/// Build a [`VOffset`](crate::VOffset) for the field `$field` of type `$field_ty` inside `$base`.
/// The field's vtable is `$field_ty`'s [`HasStaticVTable`](crate::HasStaticVTable) vtable, chosen
/// by inference from the surrounding context.
///
/// ```
/// # use hv_vtable::{HasStaticVTable, Layout, VOffset, VRefMut};
/// # #[repr(C)]
/// # pub struct CounterVTable {
/// #     pub drop_in_place: unsafe extern "C" fn(VRefMut<'_, CounterVTable>) -> Layout,
/// #     pub dealloc: unsafe extern "C" fn(&CounterVTable, *mut u8, Layout),
/// # }
/// # struct Counter(u32);
/// # static COUNTER_VTABLE: CounterVTable = CounterVTable {
/// #     drop_in_place: hv_vtable::drop_in_place::<CounterVTable, Counter>,
/// #     dealloc: hv_vtable::dealloc::<CounterVTable>,
/// # };
/// # unsafe impl HasStaticVTable<CounterVTable> for Counter {
/// #     fn static_vtable() -> &'static CounterVTable { &COUNTER_VTABLE }
/// # }
/// struct Window {
///     title: &'static str,
///     clicks: Counter,
/// }
///
/// let offset: VOffset<Window, CounterVTable> = hv_vtable::voffset!(Window, clicks: Counter);
/// let window = Window { title: "main", clicks: Counter(3) };
/// assert_eq!(offset.apply(&window).downcast::<Counter>().unwrap().0, 3);
/// ```
#[macro_export]
macro_rules! voffset {
    ($base:ty, $field:ident : $field_ty:ty) => {{
        let _: fn(&$base) -> &$field_ty = |base| &base.$field;
        #[allow(unused_unsafe)]
        unsafe {
            $crate::VOffset::<$base, _>::from_raw(
                <$field_ty as $crate::HasStaticVTable<_>>::static_vtable(),
                $crate::offset_of!($base, $field),
            )
        }
    }};
}

static_assertions::assert_eq_size!(VOffset<(), ()>, [usize; 2]);
