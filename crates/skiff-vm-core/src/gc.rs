//! Tracing mark-and-sweep garbage collection
//!
//! A cycle runs entirely inside [`Vm::collect`]:
//!
//! 1. **Mark** — walk every root (API stack, frame functions, module
//!    registry, handles, in-flight compilations, temp roots) and flag every
//!    transitively reachable object.
//! 2. **Pending scan** — objects whose scripted `dtor` ran last cycle are
//!    freed if still unreachable, or rejoined to the live set if they were
//!    resurrected.
//! 3. **Sweep** — unlink every unmarked object from the all-objects list.
//! 4. **Classify** — newly dead instances/references whose class declares a
//!    scripted `dtor` move to the pending-finalize list instead of being
//!    freed; everything they can still reach is kept one more cycle so the
//!    `dtor` never observes a freed field. Host finalizer callbacks run for
//!    each newly dead instance/reference; the rest of the garbage is freed.
//! 5. **Budget** — the next trigger becomes
//!    `max(min_heap_size, live_bytes * (1 + growth_factor))`.
//! 6. **Finalize** — each newly pending object is materialised on the API
//!    stack and its `dtor` invoked through the normal call path.
//!
//! Collection is disabled (`gc_is_running`) for the whole cycle, so
//! finalizer allocations never re-enter the collector.

use crate::heap::{Mark, ObjRef};
use crate::object::ObjData;
use crate::value::Value;
use crate::vm::Vm;

impl Vm {
    /// Force a full collection cycle.
    pub fn collect_garbage(&mut self) {
        self.collect();
    }

    pub(crate) fn collect(&mut self) {
        if self.heap.gc_is_running() {
            return;
        }
        self.heap.set_gc_running(true);

        let mut visited = vec![false; self.heap.slot_count()];
        self.mark_roots(&mut visited);
        self.scan_pending(&visited);
        let garbage = self.sweep(&visited);
        let pending_new = self.classify_garbage(garbage);
        self.heap.update_budget();
        self.run_script_finalizers(&pending_new);

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            live = self.heap.live_count(),
            bytes = self.heap.bytes_allocated(),
            next_trigger = self.heap.heap_size(),
            "gc cycle complete"
        );

        self.heap.set_gc_running(false);
    }

    // ==================== Mark ====================

    fn mark_roots(&mut self, visited: &mut [bool]) {
        let mut worklist: Vec<ObjRef> = Vec::with_capacity(64);

        for &value in &self.stack {
            push_value(&mut worklist, value);
        }
        for frame in &self.frames {
            if let Some(fn_ref) = frame.fn_ref {
                worklist.push(fn_ref);
            }
        }
        for &module in self.modules.values() {
            worklist.push(module);
        }
        worklist.extend(self.live_handle_values().filter_map(|v| v.as_obj()));
        for roots in &self.compile_roots {
            worklist.push(roots.module);
            if let Some(class) = roots.class {
                worklist.push(class);
            }
            for pool in &roots.pools {
                for &value in pool {
                    push_value(&mut worklist, value);
                }
            }
        }
        worklist.extend(self.temp_roots.iter().copied());
        if let Some(native) = self.current_native {
            worklist.push(native);
        }

        self.trace(&mut worklist, visited);
    }

    fn trace(&mut self, worklist: &mut Vec<ObjRef>, visited: &mut [bool]) {
        while let Some(r) = worklist.pop() {
            let idx = r.index() as usize;
            if visited[idx] {
                continue;
            }
            visited[idx] = true;
            if self.heap.header(r).mark == Mark::Unreachable {
                self.heap.header_mut(r).mark = Mark::Reachable;
            }
            push_children(&self.heap, r, worklist);
        }
    }

    // ==================== Pending scan ====================

    /// Objects on the pending list had their `dtor` run last cycle. Still
    /// unreachable ones are freed now; resurrected ones rejoin the live set
    /// keeping their finalized mark so the `dtor` never runs twice.
    fn scan_pending(&mut self, visited: &[bool]) {
        let mut cursor = self.heap.pending();
        self.heap.set_pending(None);
        while let Some(r) = cursor {
            cursor = self.heap.header(r).next;
            if visited[r.index() as usize] {
                self.heap.link(r);
            } else {
                self.heap.free(r);
            }
        }
    }

    // ==================== Sweep ====================

    fn sweep(&mut self, visited: &[bool]) -> Vec<ObjRef> {
        let mut garbage = Vec::new();
        let mut live = Vec::new();
        let mut cursor = self.heap.head();
        while let Some(r) = cursor {
            cursor = self.heap.header(r).next;
            if visited[r.index() as usize] {
                if self.heap.header(r).mark == Mark::Reachable {
                    self.heap.header_mut(r).mark = Mark::Unreachable;
                }
                live.push(r);
            } else {
                garbage.push(r);
            }
        }
        self.heap.set_head(None);
        for &r in live.iter().rev() {
            self.heap.link(r);
        }
        garbage
    }

    // ==================== Classify & free ====================

    fn classify_garbage(&mut self, garbage: Vec<ObjRef>) -> Vec<ObjRef> {
        let slot_count = self.heap.slot_count();
        let mut in_garbage = vec![false; slot_count];
        for &r in &garbage {
            in_garbage[r.index() as usize] = true;
        }

        // Instances and references whose class declares a scripted dtor go
        // to the pending list instead of being freed.
        let dtor_sym = self.dtor_symbol();
        let mut is_pending = vec![false; slot_count];
        let mut pending_new = Vec::new();
        for &r in &garbage {
            if self.heap.header(r).mark == Mark::Finalized {
                continue;
            }
            if !matches!(self.heap.data(r), ObjData::Instance(_) | ObjData::Reference(_)) {
                continue;
            }
            let Some(class) = self.heap.instance_class(r) else { continue };
            let dtor = self
                .heap
                .class(class)
                .symbols
                .get(dtor_sym.index())
                .map(|slot| slot.value)
                .unwrap_or(Value::NULL);
            let is_dtor_fn = dtor
                .as_obj()
                .is_some_and(|f| self.heap.data(f).is_function());
            if is_dtor_fn {
                is_pending[r.index() as usize] = true;
                pending_new.push(r);
            }
        }

        // Everything a pending object can still reach survives one more
        // cycle; its dtor must never observe a freed field.
        let mut rescued = vec![false; slot_count];
        let mut worklist: Vec<ObjRef> = Vec::new();
        for &r in &pending_new {
            push_children(&self.heap, r, &mut worklist);
        }
        while let Some(r) = worklist.pop() {
            let idx = r.index() as usize;
            if !in_garbage[idx] || is_pending[idx] || rescued[idx] {
                continue;
            }
            rescued[idx] = true;
            push_children(&self.heap, r, &mut worklist);
        }

        for &r in &garbage {
            let idx = r.index() as usize;
            if is_pending[idx] {
                self.heap.header_mut(r).mark = Mark::Finalize;
                self.run_host_finalizer(r);
                self.heap.link_pending(r);
            } else if rescued[idx] {
                self.heap.link(r);
            } else {
                let already_finalized = self.heap.header(r).mark == Mark::Finalized;
                if !already_finalized && self.heap.instance_class(r).is_some() {
                    match self.heap.data(r) {
                        ObjData::Instance(_) | ObjData::Reference(_) => self.run_host_finalizer(r),
                        _ => {}
                    }
                }
                self.heap.free(r);
            }
        }

        pending_new
    }

    /// Run the class's host finalizer callback on an instance's or
    /// reference's extra data (native resource release).
    fn run_host_finalizer(&mut self, r: ObjRef) {
        let Some(class) = self.heap.instance_class(r) else { return };
        let Some(finalizer) = self.heap.class(class).finalizer.clone() else { return };
        let mut extra = match self.heap.data_mut(r) {
            ObjData::Instance(i) => std::mem::take(&mut i.extra),
            ObjData::Reference(x) => std::mem::take(&mut x.extra),
            _ => return,
        };
        finalizer(self, &mut extra);
        match self.heap.data_mut(r) {
            ObjData::Instance(i) => i.extra = extra,
            ObjData::Reference(x) => x.extra = extra,
            _ => {}
        }
    }

    // ==================== Scripted dtors ====================

    fn run_script_finalizers(&mut self, pending_new: &[ObjRef]) {
        let dtor_sym = self.dtor_symbol();
        for &r in pending_new {
            let Some(class) = self.heap.instance_class(r) else { continue };
            let dtor = self
                .heap
                .class(class)
                .symbols
                .get(dtor_sym.index())
                .map(|slot| slot.value)
                .unwrap_or(Value::NULL);

            // Materialise the dtor and receiver on the API stack, invoke
            // through the normal call path, then restore the slots.
            self.stack_resize(2);
            let saved = [self.view_slot(0), self.view_slot(1)];
            self.set_view_slot(0, dtor);
            self.set_view_slot(1, Value::from_obj(r));
            if dtor.as_obj().is_some_and(|f| self.heap.data(f).is_function()) {
                let _ = self.call(0, 1, 1);
            }
            self.set_view_slot(0, saved[0]);
            self.set_view_slot(1, saved[1]);

            self.heap.header_mut(r).mark = Mark::Finalized;
        }
    }
}

fn push_value(worklist: &mut Vec<ObjRef>, value: Value) {
    if let Some(r) = value.as_obj() {
        worklist.push(r);
    }
}

/// Tracing rules by kind. A weak reference's raw pointer is never followed.
fn push_children(heap: &crate::heap::Heap, r: ObjRef, worklist: &mut Vec<ObjRef>) {
    match heap.data(r) {
        ObjData::String(_) => {}
        ObjData::Module(m) => {
            for slot in &m.variables {
                push_value(worklist, slot.value);
            }
            if let Some(init) = m.init {
                worklist.push(init);
            }
        }
        ObjData::Class(c) => {
            if let Some(base) = c.base {
                worklist.push(base);
            }
            worklist.push(c.module);
            for slot in &c.symbols {
                push_value(worklist, slot.value);
            }
            for slot in &c.field_initializers {
                push_value(worklist, slot.value);
            }
        }
        ObjData::Instance(i) => {
            worklist.push(i.class);
            for &value in i.fields.values() {
                push_value(worklist, value);
            }
        }
        ObjData::Function(f) => {
            for &value in f.constants.iter() {
                push_value(worklist, value);
            }
            worklist.push(f.module);
        }
        ObjData::NativeFn(n) => {
            for &value in &n.statics {
                push_value(worklist, value);
            }
        }
        ObjData::Reference(x) => {
            if let Some(class) = x.class {
                worklist.push(class);
            }
        }
        ObjData::WeakRef(w) => {
            if let Some(class) = w.class {
                worklist.push(class);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VmError;
    use crate::vm::{Vm, VmParams};
    use std::cell::Cell;
    use std::rc::Rc;

    fn test_vm() -> Vm {
        Vm::new(VmParams::default())
    }

    #[test]
    fn test_unreachable_object_is_freed() {
        let mut vm = test_vm();
        let before = vm.heap().live_count();
        let _dead = vm.new_string("garbage");
        vm.collect_garbage();
        assert_eq!(vm.heap().live_count(), before);
    }

    #[test]
    fn test_stack_and_temp_roots_survive() {
        let mut vm = test_vm();
        vm.stack_resize(1);
        vm.stack_set_string(0, "on the stack");
        let rooted = vm.new_string("temp rooted");
        vm.push_temp_root(rooted);
        vm.collect_garbage();
        assert_eq!(vm.stack_read_string(0), Some("on the stack"));
        assert_eq!(vm.heap().string(rooted).text, "temp rooted");
        vm.pop_temp_root();
    }

    #[test]
    fn test_handle_is_a_root_until_destroyed() {
        let mut vm = test_vm();
        vm.stack_resize(1);
        vm.stack_set_string(0, "pinned");
        let handle = vm.stack_make_handle(0);
        vm.stack_set_nil(0);
        vm.collect_garbage();
        vm.stack_load_handle(0, handle);
        assert_eq!(vm.stack_read_string(0), Some("pinned"));

        vm.stack_set_nil(0);
        vm.stack_destroy_handle(handle);
        let before = vm.heap().live_count();
        vm.collect_garbage();
        assert!(vm.heap().live_count() < before);
    }

    #[test]
    fn test_module_registry_keeps_module_alive() {
        let mut vm = test_vm();
        let module = vm.module_make(Some("keep")).unwrap();
        vm.collect_garbage();
        assert!(vm.heap().is_live(module));

        vm.module_unload("keep");
        vm.collect_garbage();
        assert!(!vm.heap().is_live(module));
    }

    #[test]
    fn test_instance_traces_class_and_fields() {
        let mut vm = test_vm();
        let module = vm.module_make(Some("m")).unwrap();
        let class = vm.new_class(module, "C", None, 0);
        let sym = vm.intern_symbol("C");
        vm.module_set_variable(module, sym, Value::from_obj(class));

        vm.stack_resize(1);
        let inst = vm.new_instance(class);
        let field = vm.intern_symbol("payload");
        let payload = vm.new_string("held by a field");
        let inst_obj = vm.heap.instance_mut(inst);
        inst_obj.fields.insert(field, Value::from_obj(payload));
        vm.set_view_slot(0, Value::from_obj(inst));

        vm.collect_garbage();
        assert!(vm.heap().is_live(payload));
    }

    #[test]
    fn test_host_finalizer_runs_once_per_instance() {
        let mut vm = test_vm();
        let count = Rc::new(Cell::new(0u32));
        let count_in_fin = count.clone();
        let module = vm.module_make(Some("m")).unwrap();
        let class = vm.new_class(module, "Res", None, 4);
        vm.heap.class_mut(class).finalizer =
            Some(Rc::new(move |_vm, _data| count_in_fin.set(count_in_fin.get() + 1)));
        let sym = vm.intern_symbol("Res");
        vm.module_set_variable(module, sym, Value::from_obj(class));

        for _ in 0..1000 {
            let _ = vm.new_instance(class);
        }
        vm.collect_garbage();
        vm.collect_garbage();
        assert_eq!(count.get(), 1000);
    }

    #[test]
    fn test_scripted_dtor_delays_free_one_cycle() {
        let mut vm = test_vm();
        DTOR_HITS.with(|c| c.set(0));

        fn dtor(_vm: &mut Vm, _argc: i32) -> Result<(), VmError> {
            DTOR_HITS.with(|c| c.set(c.get() + 1));
            Ok(())
        }
        thread_local! {
            static DTOR_HITS: Cell<u32> = const { Cell::new(0) };
        }

        let module = vm.module_make(Some("m")).unwrap();
        let class = vm.new_class(module, "D", None, 0);
        let sym = vm.intern_symbol("D");
        vm.module_set_variable(module, sym, Value::from_obj(class));
        let dtor_fn = vm.new_native_fn(dtor, -1, 0, 0);
        let dtor_sym = vm.dtor_symbol();
        vm.class_set_symbol(class, dtor_sym, Value::from_obj(dtor_fn));

        let inst = vm.new_instance(class);
        vm.collect_garbage();
        // dtor ran, object parked on the pending list
        DTOR_HITS.with(|c| assert_eq!(c.get(), 1));
        assert!(vm.heap().is_live(inst));
        assert_eq!(vm.heap().header(inst).mark, Mark::Finalized);

        vm.collect_garbage();
        // still unreachable: freed, dtor not run again
        DTOR_HITS.with(|c| assert_eq!(c.get(), 1));
        assert!(!vm.heap().is_live(inst));
    }

    #[test]
    fn test_budget_grows_after_collection() {
        let mut vm = Vm::new(VmParams {
            min_heap_size: 256,
            initial_heap_size: 512,
            heap_growth_factor: 0.5,
            ..VmParams::default()
        });
        vm.stack_resize(1);
        vm.stack_set_string(0, &"x".repeat(4096));
        vm.collect_garbage();
        let live = vm.bytes_allocated();
        assert!(vm.heap().heap_size() >= live + live / 2);
    }
}
