use std::cell::{Cell, RefCell};

use hv_vtable::{AllocError, Dyn, HasStaticVTable, Layout, VRc, VRef, VRefMut, VWeak};

#[repr(C)]
pub struct ValueVTable {
    pub get: unsafe extern "C" fn(VRef<'_, ValueVTable>) -> i64,
    pub drop_in_place: unsafe extern "C" fn(VRefMut<'_, ValueVTable>) -> Layout,
    pub dealloc: unsafe extern "C" fn(&ValueVTable, *mut u8, Layout),
}

hv_vtable::impl_vtable_drop!(ValueVTable);

thread_local! {
    static DROPPED: Cell<usize> = Cell::new(0);
    static FREED: Cell<usize> = Cell::new(0);
}

fn dropped() -> usize {
    DROPPED.with(Cell::get)
}

fn freed() -> usize {
    FREED.with(Cell::get)
}

unsafe extern "C" fn counting_drop<X>(ptr: VRefMut<'_, ValueVTable>) -> Layout {
    DROPPED.with(|n| n.set(n.get() + 1));
    hv_vtable::drop_in_place::<ValueVTable, X>(ptr)
}

unsafe extern "C" fn counting_dealloc(vtable: &ValueVTable, ptr: *mut u8, layout: Layout) {
    FREED.with(|n| n.set(n.get() + 1));
    hv_vtable::dealloc(vtable, ptr, layout)
}

unsafe extern "C" fn int_get(this: VRef<'_, ValueVTable>) -> i64 {
    i64::from(*this.as_ptr().cast::<i32>().as_ref())
}

static INT_VTABLE: ValueVTable = ValueVTable {
    get: int_get,
    drop_in_place: counting_drop::<i32>,
    dealloc: counting_dealloc,
};

unsafe impl HasStaticVTable<ValueVTable> for i32 {
    fn static_vtable() -> &'static ValueVTable {
        &INT_VTABLE
    }
}

/// Owns a heap buffer, so the payload destructor has real work to do.
struct Total(Vec<i64>);

unsafe extern "C" fn total_get(this: VRef<'_, ValueVTable>) -> i64 {
    this.as_ptr().cast::<Total>().as_ref().0.iter().sum()
}

static TOTAL_VTABLE: ValueVTable = ValueVTable {
    get: total_get,
    drop_in_place: counting_drop::<Total>,
    dealloc: counting_dealloc,
};

unsafe impl HasStaticVTable<ValueVTable> for Total {
    fn static_vtable() -> &'static ValueVTable {
        &TOTAL_VTABLE
    }
}

#[repr(align(32))]
struct Wide(u8);

unsafe extern "C" fn wide_get(this: VRef<'_, ValueVTable>) -> i64 {
    i64::from(this.as_ptr().cast::<Wide>().as_ref().0)
}

static WIDE_VTABLE: ValueVTable = ValueVTable {
    get: wide_get,
    drop_in_place: counting_drop::<Wide>,
    dealloc: counting_dealloc,
};

unsafe impl HasStaticVTable<ValueVTable> for Wide {
    fn static_vtable() -> &'static ValueVTable {
        &WIDE_VTABLE
    }
}

fn get<X>(rc: &VRc<ValueVTable, X>) -> i64 {
    let this = VRc::borrow(rc);
    unsafe { (this.vtable().get)(this) }
}

static_assertions::assert_eq_size!(VWeak<ValueVTable>, usize);
static_assertions::assert_eq_size!(VRc<ValueVTable>, usize);
static_assertions::assert_eq_size!(Option<VRc<ValueVTable>>, usize);
static_assertions::assert_not_impl_any!(VRc<ValueVTable>: Send, Sync);
static_assertions::assert_not_impl_any!(VWeak<ValueVTable, i32>: Send, Sync);

#[test]
fn last_strong_drops_then_last_weak_frees() {
    let (dropped0, freed0) = (dropped(), freed());

    let a: VRc<ValueVTable, i32> = VRc::new(42);
    let b = a.clone();
    assert_eq!(VRc::strong_count(&b), 2);

    drop(a);
    assert_eq!(VRc::strong_count(&b), 1);
    assert_eq!(*b, 42);

    let w = VRc::downgrade(&b);
    assert_eq!(VRc::weak_count(&b), 1);
    assert_eq!(w.strong_count(), 1);

    drop(b);
    assert_eq!(dropped(), dropped0 + 1);
    assert_eq!(freed(), freed0);
    assert_eq!(w.strong_count(), 0);
    assert_eq!(w.weak_count(), 1);
    assert!(w.upgrade().is_none());

    drop(w);
    assert_eq!(dropped(), dropped0 + 1);
    assert_eq!(freed(), freed0 + 1);
}

#[test]
fn upgrade_shares_the_block() {
    let freed0 = freed();

    let a: VRc<ValueVTable, i32> = VRc::new(7);
    let w = VWeak::from(&a);
    let upgraded = w.upgrade().unwrap();
    assert!(VRc::ptr_eq(&a, &upgraded));
    assert_eq!(VRc::strong_count(&a), 2);
    assert_eq!(*upgraded, 7);

    drop(upgraded);
    assert_eq!(VRc::strong_count(&a), 1);
    assert_eq!(freed(), freed0);
    assert_eq!(*a, 7);

    drop((a, w));
    assert_eq!(freed(), freed0 + 1);
}

#[test]
fn into_dyn_keeps_pointers_and_counts() {
    let typed: VRc<ValueVTable, Total> = VRc::new(Total(vec![1, 2, 3]));
    let before = VRc::borrow(&typed);
    let (vtable, ptr) = (before.vtable() as *const ValueVTable, before.as_ptr());

    let erased: VRc<ValueVTable> = VRc::into_dyn(typed.clone());
    let after = VRc::borrow(&erased);
    assert!(std::ptr::eq(after.vtable(), vtable));
    assert_eq!(after.as_ptr(), ptr);
    assert!(std::ptr::eq(VRc::vtable(&erased), &TOTAL_VTABLE));

    assert_eq!(VRc::strong_count(&typed), 2);
    assert_eq!(VRc::strong_count(&erased), 2);
    assert_eq!(get(&erased), 6);

    let weak: VWeak<ValueVTable> = VRc::downgrade(&typed).into_dyn();
    assert_eq!(VRc::weak_count(&erased), 1);
    drop(typed);
    assert_eq!(weak.strong_count(), 1);
    assert_eq!(get(&weak.upgrade().unwrap()), 6);
}

#[test]
fn erased_handles_drop_and_free_through_the_vtable() {
    let (dropped0, freed0) = (dropped(), freed());

    let values: Vec<VRc<ValueVTable, Dyn>> = vec![
        VRc::into_dyn(VRc::new(5i32)),
        VRc::into_dyn(VRc::new(Total(vec![10, 20]))),
        VRc::into_dyn(VRc::new(Wide(9))),
    ];
    let weaks: Vec<VWeak<ValueVTable>> = values.iter().map(VRc::downgrade).collect();
    assert_eq!(values.iter().map(get).collect::<Vec<_>>(), [5, 30, 9]);

    drop(values);
    assert_eq!(dropped(), dropped0 + 3);
    assert_eq!(freed(), freed0);
    assert!(weaks.iter().all(|w| w.upgrade().is_none()));

    drop(weaks);
    assert_eq!(freed(), freed0 + 3);
}

#[test]
fn downcast_checks_vtable_identity() {
    let erased = VRc::into_dyn(VRc::<ValueVTable, Total>::new(Total(vec![4])));
    let erased = match VRc::downcast::<i32>(erased) {
        Ok(_) => panic!("a Total is not an i32"),
        Err(erased) => erased,
    };
    assert_eq!(VRc::strong_count(&erased), 1);

    let total = VRc::downcast::<Total>(erased).unwrap();
    assert_eq!(total.0, [4]);
    assert_eq!(VRc::borrow(&total).downcast::<Total>().unwrap().0, [4]);
    assert!(VRc::borrow(&total).downcast::<Wide>().is_none());
}

#[test]
fn clone_from_self_keeps_counts() {
    let dropped0 = dropped();

    let mut a: VRc<ValueVTable, i32> = VRc::new(1);
    let weak = VRc::downgrade(&a);
    let same = a.clone();

    a.clone_from(&same);
    assert_eq!(VRc::strong_count(&a), 2);
    assert_eq!(VRc::weak_count(&a), 1);
    assert_eq!(*a, 1);
    assert_eq!(dropped(), dropped0);

    let other: VRc<ValueVTable, i32> = VRc::new(2);
    a.clone_from(&other);
    assert_eq!(*a, 2);
    assert_eq!(VRc::strong_count(&same), 1);
    assert_eq!(VRc::strong_count(&other), 2);
    assert_eq!(weak.strong_count(), 1);
}

#[test]
fn empty_weak_never_upgrades() {
    let freed0 = freed();

    let empty: VWeak<ValueVTable, i32> = VWeak::new();
    assert!(empty.upgrade().is_none());
    assert_eq!(empty.strong_count(), 0);
    assert_eq!(empty.weak_count(), 0);
    assert!(empty.ptr_eq(&VWeak::default()));

    let copy = empty.clone();
    drop((empty, copy));
    assert_eq!(freed(), freed0);
}

#[test]
fn try_new_succeeds_for_over_aligned_payloads() {
    let wide: VRc<ValueVTable, Wide> = VRc::try_new(Wide(3)).unwrap();
    let addr = VRc::borrow(&wide).as_ptr().as_ptr() as usize;
    assert_eq!(addr % 32, 0);
    assert_eq!(get(&wide), 3);
}

/// Aligned so far that the payload cannot start within `u16::MAX` bytes of its header.
#[repr(align(131072))]
struct Huge(u8);

unsafe extern "C" fn huge_get(this: VRef<'_, ValueVTable>) -> i64 {
    i64::from(this.as_ptr().cast::<Huge>().as_ref().0)
}

static HUGE_VTABLE: ValueVTable = ValueVTable {
    get: huge_get,
    drop_in_place: counting_drop::<Huge>,
    dealloc: counting_dealloc,
};

unsafe impl HasStaticVTable<ValueVTable> for Huge {
    fn static_vtable() -> &'static ValueVTable {
        &HUGE_VTABLE
    }
}

#[test]
fn try_new_rejects_unrecordable_offset() {
    let freed0 = freed();
    let result = VRc::<ValueVTable, Huge>::try_new(Huge(1));
    assert!(matches!(result, Err(AllocError::OffsetOverflow(131072))));
    assert_eq!(freed(), freed0);
}

#[test]
fn get_mut_on_unique_handle() {
    let mut total: VRc<ValueVTable, Total> = VRc::new(Total(vec![1]));
    VRc::get_mut(&mut total)
        .unwrap()
        .downcast_mut::<Total>()
        .unwrap()
        .0
        .push(2);
    assert_eq!(get(&total), 3);

    let weak = VRc::downgrade(&total);
    assert!(VRc::get_mut(&mut total).is_none());
    drop(weak);
    assert!(VRc::get_mut(&mut total).is_some());
}

enum Handle {
    Strong(VRc<ValueVTable, Total>),
    Erased(VRc<ValueVTable>),
    Weak(VWeak<ValueVTable, Total>),
}

impl Handle {
    fn is_strong(&self) -> bool {
        !matches!(self, Handle::Weak(_))
    }
}

fn permutations(n: usize) -> Vec<Vec<usize>> {
    if n == 0 {
        return vec![Vec::new()];
    }

    let mut out = Vec::new();
    for shorter in permutations(n - 1) {
        for at in 0..=shorter.len() {
            let mut order = shorter.clone();
            order.insert(at, n - 1);
            out.push(order);
        }
    }
    out
}

#[test]
fn every_drop_order_drops_and_frees_once() {
    let orders = permutations(5);
    assert_eq!(orders.len(), 120);

    for order in orders {
        let (dropped0, freed0) = (dropped(), freed());

        let first: VRc<ValueVTable, Total> = VRc::new(Total(vec![1, 2]));
        let mut handles = vec![
            Some(Handle::Weak(VRc::downgrade(&first))),
            Some(Handle::Strong(first.clone())),
            Some(Handle::Erased(VRc::into_dyn(first.clone()))),
            Some(Handle::Weak(VRc::downgrade(&first))),
            Some(Handle::Strong(first)),
        ];

        for (step, &index) in order.iter().enumerate() {
            drop(handles[index].take());

            let live_strong = handles.iter().flatten().filter(|h| h.is_strong()).count();
            let all_gone = step + 1 == handles.len();

            assert_eq!(
                dropped(),
                dropped0 + usize::from(live_strong == 0),
                "order {:?}, step {}",
                order,
                step
            );
            assert_eq!(freed(), freed0 + usize::from(all_gone), "order {:?}, step {}", order, step);

            for handle in handles.iter().flatten() {
                if let Handle::Weak(weak) = handle {
                    assert_eq!(weak.strong_count(), live_strong);
                    let upgraded = weak.upgrade();
                    assert_eq!(upgraded.is_some(), live_strong > 0);
                    if let Some(rc) = upgraded {
                        assert_eq!(rc.0, [1, 2]);
                    }
                }
            }
        }
    }
}

thread_local! {
    static UPGRADED_DURING_DROP: Cell<Option<bool>> = Cell::new(None);
}

/// Holds a weak handle to its own block.
struct Cyclic {
    this: RefCell<VWeak<ValueVTable, Cyclic>>,
}

impl Drop for Cyclic {
    fn drop(&mut self) {
        let upgraded = self.this.get_mut().upgrade().is_some();
        UPGRADED_DURING_DROP.with(|u| u.set(Some(upgraded)));
    }
}

unsafe extern "C" fn cyclic_get(this: VRef<'_, ValueVTable>) -> i64 {
    this.as_ptr().cast::<Cyclic>().as_ref().this.borrow().weak_count() as i64
}

static CYCLIC_VTABLE: ValueVTable = ValueVTable {
    get: cyclic_get,
    drop_in_place: counting_drop::<Cyclic>,
    dealloc: counting_dealloc,
};

unsafe impl HasStaticVTable<ValueVTable> for Cyclic {
    fn static_vtable() -> &'static ValueVTable {
        &CYCLIC_VTABLE
    }
}

#[test]
fn payload_holding_its_own_weak_frees_once() {
    let (dropped0, freed0) = (dropped(), freed());

    let rc: VRc<ValueVTable, Cyclic> = VRc::new(Cyclic {
        this: RefCell::new(VWeak::new()),
    });
    *rc.this.borrow_mut() = VRc::downgrade(&rc);
    assert_eq!(get(&rc), 1);
    assert_eq!(VRc::weak_count(&rc), 1);

    let erased = VRc::into_dyn(rc);
    drop(erased);

    assert_eq!(UPGRADED_DURING_DROP.with(Cell::get), Some(false));
    assert_eq!(dropped(), dropped0 + 1);
    assert_eq!(freed(), freed0 + 1);
}
