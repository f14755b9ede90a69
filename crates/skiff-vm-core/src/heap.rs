//! The object heap
//!
//! An index arena with stable identities: every live object occupies one slot
//! and is named by its [`ObjRef`] index for its whole lifetime. Freed slots
//! go on a free list and are reused. All objects are additionally threaded
//! onto a single intrusive list through their headers — the sweep phase walks
//! that list; a second intrusive list holds objects pending script
//! finalization.
//!
//! The heap also carries the collection trigger: a running `bytes_allocated`
//! counter and a budget recomputed after every cycle as
//! `max(min_heap_size, bytes_allocated * (1 + growth_factor))`. The counter
//! is charged the object's accounted size at allocation and credited the same
//! amount at free.

use crate::object::{
    ObjClass, ObjData, ObjFunction, ObjInstance, ObjKind, ObjModule, ObjNativeFn, ObjReference,
    ObjString, ObjWeakRef,
};

/// Stable index of a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjRef(u32);

impl ObjRef {
    /// Create from a raw slot index.
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// The raw slot index.
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }
}

/// GC mark state stored in every object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    /// Not proven reachable (resting state between cycles).
    Unreachable,
    /// Proven reachable during the current mark phase.
    Reachable,
    /// On the pending-finalize list; scripted `dtor` not yet run.
    Finalize,
    /// Scripted `dtor` has run; freed next cycle unless resurrected.
    Finalized,
}

/// Common object header: mark state plus the intrusive all-objects link.
#[derive(Debug)]
pub struct Header {
    /// GC mark.
    pub mark: Mark,
    /// Next object on whichever intrusive list this object is on.
    pub next: Option<ObjRef>,
}

struct Slot {
    header: Header,
    accounted: usize,
    data: ObjData,
}

/// The object arena plus GC bookkeeping state.
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    /// Head of the all-objects intrusive list.
    head: Option<ObjRef>,
    /// Head of the pending-finalize intrusive list.
    pending: Option<ObjRef>,
    bytes_allocated: usize,
    heap_size: usize,
    min_heap_size: usize,
    growth_factor: f64,
    gc_is_running: bool,
}

impl Heap {
    /// Create a heap with the given budget configuration.
    pub fn new(min_heap_size: usize, initial_heap_size: usize, growth_factor: f64) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            pending: None,
            bytes_allocated: 0,
            heap_size: initial_heap_size,
            min_heap_size,
            growth_factor,
            gc_is_running: false,
        }
    }

    /// Bytes currently charged against the budget.
    #[inline]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// The current collection trigger.
    #[inline]
    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    /// Whether a collection cycle (or a finalizer within one) is running.
    #[inline]
    pub fn gc_is_running(&self) -> bool {
        self.gc_is_running
    }

    pub(crate) fn set_gc_running(&mut self, running: bool) {
        self.gc_is_running = running;
    }

    /// Would allocating `size` more bytes cross the budget?
    #[inline]
    pub(crate) fn should_collect(&self, size: usize) -> bool {
        !self.gc_is_running && self.bytes_allocated + size >= self.heap_size
    }

    /// Recompute the trigger after a cycle.
    pub(crate) fn update_budget(&mut self) {
        let grown = self.bytes_allocated + (self.bytes_allocated as f64 * self.growth_factor) as usize;
        self.heap_size = grown.max(self.min_heap_size);
    }

    /// Insert an object, linking it onto the all-objects list with
    /// mark=unreachable, and charge its size against the budget.
    pub(crate) fn insert(&mut self, data: ObjData) -> ObjRef {
        let accounted = data.accounted_size();
        self.bytes_allocated += accounted;
        let slot = Slot {
            header: Header { mark: Mark::Unreachable, next: self.head },
            accounted,
            data,
        };
        let r = match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(slot);
                ObjRef::new(idx)
            }
            None => {
                let idx = self.slots.len() as u32;
                self.slots.push(Some(slot));
                ObjRef::new(idx)
            }
        };
        self.head = Some(r);
        r
    }

    /// Free an object's slot and credit its accounted size back. The caller
    /// must already have unlinked it from whichever list it was on.
    pub(crate) fn free(&mut self, r: ObjRef) -> usize {
        let slot = self.slots[r.index() as usize].take().expect("double free");
        self.bytes_allocated -= slot.accounted;
        self.free.push(r.index());
        slot.accounted
    }

    /// Number of live objects.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Number of slots (live or free); bounds transient mark bitmaps.
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn head(&self) -> Option<ObjRef> {
        self.head
    }

    pub(crate) fn set_head(&mut self, head: Option<ObjRef>) {
        self.head = head;
    }

    pub(crate) fn pending(&self) -> Option<ObjRef> {
        self.pending
    }

    pub(crate) fn set_pending(&mut self, pending: Option<ObjRef>) {
        self.pending = pending;
    }

    /// Push an object onto the all-objects list.
    pub(crate) fn link(&mut self, r: ObjRef) {
        let head = self.head;
        self.header_mut(r).next = head;
        self.head = Some(r);
    }

    /// Push an object onto the pending-finalize list.
    pub(crate) fn link_pending(&mut self, r: ObjRef) {
        let pending = self.pending;
        self.header_mut(r).next = pending;
        self.pending = Some(r);
    }

    fn slot(&self, r: ObjRef) -> &Slot {
        self.slots[r.index() as usize].as_ref().expect("dangling object reference")
    }

    fn slot_mut(&mut self, r: ObjRef) -> &mut Slot {
        self.slots[r.index() as usize].as_mut().expect("dangling object reference")
    }

    /// Is this reference a live object?
    pub fn is_live(&self, r: ObjRef) -> bool {
        (r.index() as usize) < self.slots.len() && self.slots[r.index() as usize].is_some()
    }

    /// The object's header.
    pub fn header(&self, r: ObjRef) -> &Header {
        &self.slot(r).header
    }

    pub(crate) fn header_mut(&mut self, r: ObjRef) -> &mut Header {
        &mut self.slot_mut(r).header
    }

    /// The object's data record.
    pub fn data(&self, r: ObjRef) -> &ObjData {
        &self.slot(r).data
    }

    pub(crate) fn data_mut(&mut self, r: ObjRef) -> &mut ObjData {
        &mut self.slot_mut(r).data
    }

    /// The object's kind.
    pub fn kind(&self, r: ObjRef) -> ObjKind {
        self.data(r).kind()
    }

    /// Typed accessor; panics on kind mismatch (a VM invariant violation).
    pub fn string(&self, r: ObjRef) -> &ObjString {
        match self.data(r) {
            ObjData::String(s) => s,
            other => panic!("expected String, found {:?}", other.kind()),
        }
    }

    /// Typed accessor; panics on kind mismatch.
    pub fn module(&self, r: ObjRef) -> &ObjModule {
        match self.data(r) {
            ObjData::Module(m) => m,
            other => panic!("expected Module, found {:?}", other.kind()),
        }
    }

    pub(crate) fn module_mut(&mut self, r: ObjRef) -> &mut ObjModule {
        match self.data_mut(r) {
            ObjData::Module(m) => m,
            other => panic!("expected Module, found {:?}", other.kind()),
        }
    }

    /// Typed accessor; panics on kind mismatch.
    pub fn class(&self, r: ObjRef) -> &ObjClass {
        match self.data(r) {
            ObjData::Class(c) => c,
            other => panic!("expected Class, found {:?}", other.kind()),
        }
    }

    pub(crate) fn class_mut(&mut self, r: ObjRef) -> &mut ObjClass {
        match self.data_mut(r) {
            ObjData::Class(c) => c,
            other => panic!("expected Class, found {:?}", other.kind()),
        }
    }

    /// Typed accessor; panics on kind mismatch.
    pub fn instance(&self, r: ObjRef) -> &ObjInstance {
        match self.data(r) {
            ObjData::Instance(i) => i,
            other => panic!("expected Instance, found {:?}", other.kind()),
        }
    }

    pub(crate) fn instance_mut(&mut self, r: ObjRef) -> &mut ObjInstance {
        match self.data_mut(r) {
            ObjData::Instance(i) => i,
            other => panic!("expected Instance, found {:?}", other.kind()),
        }
    }

    /// Typed accessor; panics on kind mismatch.
    pub fn function(&self, r: ObjRef) -> &ObjFunction {
        match self.data(r) {
            ObjData::Function(f) => f,
            other => panic!("expected Function, found {:?}", other.kind()),
        }
    }

    pub(crate) fn function_mut(&mut self, r: ObjRef) -> &mut ObjFunction {
        match self.data_mut(r) {
            ObjData::Function(f) => f,
            other => panic!("expected Function, found {:?}", other.kind()),
        }
    }

    /// Typed accessor; panics on kind mismatch.
    pub fn native_fn(&self, r: ObjRef) -> &ObjNativeFn {
        match self.data(r) {
            ObjData::NativeFn(n) => n,
            other => panic!("expected NativeFn, found {:?}", other.kind()),
        }
    }

    pub(crate) fn native_fn_mut(&mut self, r: ObjRef) -> &mut ObjNativeFn {
        match self.data_mut(r) {
            ObjData::NativeFn(n) => n,
            other => panic!("expected NativeFn, found {:?}", other.kind()),
        }
    }

    /// Typed accessor; panics on kind mismatch.
    pub fn reference(&self, r: ObjRef) -> &ObjReference {
        match self.data(r) {
            ObjData::Reference(x) => x,
            other => panic!("expected Reference, found {:?}", other.kind()),
        }
    }

    pub(crate) fn reference_mut(&mut self, r: ObjRef) -> &mut ObjReference {
        match self.data_mut(r) {
            ObjData::Reference(x) => x,
            other => panic!("expected Reference, found {:?}", other.kind()),
        }
    }

    /// Typed accessor; panics on kind mismatch.
    pub fn weak_ref(&self, r: ObjRef) -> &ObjWeakRef {
        match self.data(r) {
            ObjData::WeakRef(w) => w,
            other => panic!("expected WeakRef, found {:?}", other.kind()),
        }
    }

    /// The dispatch class of an instance, reference or weak reference.
    pub fn instance_class(&self, r: ObjRef) -> Option<ObjRef> {
        match self.data(r) {
            ObjData::Instance(i) => Some(i.class),
            ObjData::Reference(x) => x.class,
            ObjData::WeakRef(w) => w.class,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjString;

    fn test_heap() -> Heap {
        Heap::new(1024, 4096, 0.5)
    }

    #[test]
    fn test_insert_links_all_objects_list() {
        let mut heap = test_heap();
        let a = heap.insert(ObjData::String(ObjString::new("a".into())));
        let b = heap.insert(ObjData::String(ObjString::new("b".into())));
        assert_eq!(heap.head(), Some(b));
        assert_eq!(heap.header(b).next, Some(a));
        assert_eq!(heap.header(a).next, None);
        assert_eq!(heap.live_count(), 2);
    }

    #[test]
    fn test_free_reuses_slots() {
        let mut heap = test_heap();
        let a = heap.insert(ObjData::String(ObjString::new("a".into())));
        let before = heap.bytes_allocated();
        assert!(before > 0);
        heap.set_head(None);
        heap.free(a);
        assert_eq!(heap.bytes_allocated(), 0);
        let b = heap.insert(ObjData::String(ObjString::new("b".into())));
        assert_eq!(a.index(), b.index());
    }

    #[test]
    fn test_budget_update_respects_floor() {
        let mut heap = test_heap();
        heap.update_budget();
        assert_eq!(heap.heap_size(), 1024);
        let _ = heap.insert(ObjData::String(ObjString::new("x".repeat(4000))));
        heap.update_budget();
        assert!(heap.heap_size() >= heap.bytes_allocated() * 3 / 2);
    }

    #[test]
    fn test_should_collect_threshold() {
        let mut heap = Heap::new(16, 64, 0.5);
        assert!(!heap.should_collect(0));
        assert!(heap.should_collect(64));
        heap.set_gc_running(true);
        assert!(!heap.should_collect(1 << 20));
    }
}
