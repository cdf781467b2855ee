//! Tracing garbage collector
//!
//! Precise, non-moving mark-sweep with a tri-color abstraction: white
//! (unmarked, default), gray (marked, on the worklist, not yet blackened),
//! black (marked, blackened — its own references have been traced). Objects
//! are freed only during sweep; nothing is reference-counted.

use std::cell::Cell;
use std::ptr::NonNull;

use crate::config::VmConfig;
use crate::object::{
    fnv1a, GcObject, GcRef, ObjArray, ObjClosure, ObjFunction, ObjKind, ObjNative, ObjString,
    ObjTable, ObjUpvalue, ReturnTag, UpvalueState,
};
use crate::native::NativeFn;
use crate::table::Table;
use crate::value::Value;

/// Anything that can hand the collector its live roots. The VM and the
/// active compiler chain each implement this so [`Heap::collect`] can be
/// invoked from either context without the heap knowing about either.
pub trait GcRoots {
    /// Push every root `Value`/`GcRef` the caller currently holds onto the
    /// heap's gray worklist via [`Heap::mark_value`] / [`Heap::mark_object`].
    fn mark_roots(&self, heap: &mut Heap);
}

pub struct Heap {
    objects: Option<GcRef>,
    pub strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    heap_growth_factor: f64,
    gray_worklist: Vec<GcRef>,
    pub stress_gc: bool,
    pub log_gc: bool,
}

/// Rough per-kind byte cost, used only to drive the growth heuristic — not
/// an exact accounting of Rust's actual allocator usage.
fn approx_size(kind: &ObjKind) -> usize {
    match kind {
        ObjKind::String(s) => 32 + s.chars.len(),
        ObjKind::Function(_) => 96,
        ObjKind::Closure(c) => 48 + c.upvalues.len() * 8,
        ObjKind::Upvalue(_) => 32,
        ObjKind::Array(a) => 32 + a.values.borrow().len() * 16,
        ObjKind::Table(t) => 32 + t.table.borrow().len() * 32,
        ObjKind::Native(_) => 64,
    }
}

impl Heap {
    pub fn new(config: &VmConfig) -> Self {
        Heap {
            objects: None,
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: config.initial_gc_threshold,
            heap_growth_factor: config.heap_growth_factor,
            gray_worklist: Vec::new(),
            stress_gc: config.stress_gc,
            log_gc: config.log_gc,
        }
    }

    pub fn new_default() -> Self {
        Self::new(&VmConfig::default())
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    fn link(&mut self, object: Box<GcObject>) -> GcRef {
        let size = approx_size(&object.kind);
        self.bytes_allocated += size;
        let ptr = Box::into_raw(object);
        // SAFETY: `Box::into_raw` never returns null.
        let ptr = unsafe { NonNull::new_unchecked(ptr) };
        let ptr = GcRef(ptr);
        ptr.deref().next.set(self.objects);
        self.objects = Some(ptr);
        ptr
    }

    /// Allocates a raw object. Callers must keep the result reachable from a
    /// root (typically by pushing it onto the VM stack immediately) before
    /// allocating anything else, per spec's "allocator safety rule".
    pub fn alloc(&mut self, kind: ObjKind, roots: &dyn GcRoots) -> GcRef {
        if self.stress_gc || self.bytes_allocated > self.next_gc {
            self.collect(roots);
        }
        self.link(Box::new(GcObject {
            marked: Cell::new(false),
            next: Cell::new(None),
            kind,
        }))
    }

    /// Interns `s`, returning the canonical `GcRef` for its content. A
    /// cache hit allocates nothing and runs no collection. A miss inserts a
    /// genuinely new object into `strings`, so it goes through the same
    /// `stress_gc`/`next_gc` check every other allocation does.
    pub fn intern(&mut self, s: &str, roots: &dyn GcRoots) -> GcRef {
        let hash = fnv1a(s.as_bytes());
        if let Some(existing) = self.strings.find_string(s, hash) {
            return existing;
        }
        if self.stress_gc || self.bytes_allocated > self.next_gc {
            self.collect(roots);
        }
        let obj = self.link(Box::new(GcObject {
            marked: Cell::new(false),
            next: Cell::new(None),
            kind: ObjKind::String(ObjString {
                chars: s.to_string(),
                hash,
            }),
        }));
        self.strings.set(obj, Value::Nil);
        obj
    }

    pub fn alloc_function(&mut self, function: ObjFunction, roots: &dyn GcRoots) -> GcRef {
        self.alloc(ObjKind::Function(function), roots)
    }

    pub fn alloc_closure(&mut self, closure: ObjClosure, roots: &dyn GcRoots) -> GcRef {
        self.alloc(ObjKind::Closure(closure), roots)
    }

    pub fn alloc_upvalue(&mut self, slot: usize, roots: &dyn GcRoots) -> GcRef {
        self.alloc(
            ObjKind::Upvalue(ObjUpvalue {
                state: std::cell::RefCell::new(UpvalueState::Open(slot)),
            }),
            roots,
        )
    }

    pub fn alloc_array(&mut self, values: Vec<Value>, roots: &dyn GcRoots) -> GcRef {
        self.alloc(
            ObjKind::Array(ObjArray {
                values: std::cell::RefCell::new(values),
            }),
            roots,
        )
    }

    pub fn alloc_table(&mut self, roots: &dyn GcRoots) -> GcRef {
        self.alloc(
            ObjKind::Table(ObjTable {
                table: std::cell::RefCell::new(Table::new()),
            }),
            roots,
        )
    }

    pub fn alloc_native(
        &mut self,
        name: &str,
        return_tag: ReturnTag,
        func: NativeFn,
        roots: &dyn GcRoots,
    ) -> GcRef {
        self.alloc(
            ObjKind::Native(ObjNative {
                name: name.to_string(),
                return_tag,
                func,
            }),
            roots,
        )
    }

    // -- marking -----------------------------------------------------

    pub fn mark_value(&mut self, value: &Value) {
        if let Value::Object(obj) = value {
            self.mark_object(*obj);
        }
    }

    pub fn mark_object(&mut self, obj: GcRef) {
        if obj.deref().marked.get() {
            return;
        }
        if self.log_gc {
            eprintln!("{:p} mark {}", obj.0.as_ptr(), obj.deref().kind.type_name());
        }
        obj.deref().marked.set(true);
        self.gray_worklist.push(obj);
    }

    fn blacken(&mut self, obj: GcRef) {
        match &obj.deref().kind {
            ObjKind::String(_) | ObjKind::Native(_) => {}
            ObjKind::Function(func) => {
                if let Some(name) = func.name {
                    self.mark_object(name);
                }
                for constant in &func.chunk.constants {
                    self.mark_value(constant);
                }
            }
            ObjKind::Closure(closure) => {
                self.mark_object(closure.function);
                for up in &closure.upvalues {
                    self.mark_object(*up);
                }
            }
            ObjKind::Upvalue(up) => {
                if let UpvalueState::Closed(v) = &*up.state.borrow() {
                    self.mark_value(v);
                }
            }
            ObjKind::Array(arr) => {
                let values = arr.values.borrow().clone();
                for v in &values {
                    self.mark_value(v);
                }
            }
            ObjKind::Table(table) => {
                let entries: Vec<(GcRef, Value)> =
                    table.table.borrow().iter().map(|(k, v)| (k, v.clone())).collect();
                for (k, v) in entries {
                    self.mark_object(k);
                    self.mark_value(&v);
                }
            }
        }
    }

    /// Runs one full collection cycle: mark roots, drain the gray worklist,
    /// drop unmarked string-interning entries, sweep the heap list, then
    /// recompute `next_gc`.
    pub fn collect(&mut self, roots: &dyn GcRoots) {
        if self.log_gc {
            eprintln!("-- gc begin");
        }
        roots.mark_roots(self);
        while let Some(obj) = self.gray_worklist.pop() {
            self.blacken(obj);
        }
        self.strings.retain_keys(|key| key.deref().marked.get());
        self.sweep();
        self.next_gc = ((self.bytes_allocated as f64) * self.heap_growth_factor) as usize;
        if self.log_gc {
            eprintln!("-- gc end");
        }
    }

    fn sweep(&mut self) {
        let mut previous: Option<GcRef> = None;
        let mut current = self.objects;
        while let Some(obj) = current {
            let next = obj.deref().next.get();
            if obj.deref().marked.get() {
                obj.deref().marked.set(false);
                previous = Some(obj);
                current = next;
            } else {
                if let Some(prev) = previous {
                    prev.deref().next.set(next);
                } else {
                    self.objects = next;
                }
                self.bytes_allocated -= approx_size(&obj.deref().kind);
                // SAFETY: `obj` was unlinked above and is reachable from no
                // remaining root (it failed the mark phase), so this is the
                // sole remaining owner.
                unsafe {
                    drop(Box::from_raw(obj.0.as_ptr()));
                }
                current = next;
            }
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut current = self.objects.take();
        while let Some(obj) = current {
            let next = obj.deref().next.get();
            unsafe {
                drop(Box::from_raw(obj.0.as_ptr()));
            }
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoRoots;
    impl GcRoots for NoRoots {
        fn mark_roots(&self, _heap: &mut Heap) {}
    }

    #[test]
    fn interning_is_pointer_identical() {
        let mut heap = Heap::new_default();
        let a = heap.intern("hello", &NoRoots);
        let b = heap.intern("hello", &NoRoots);
        assert_eq!(a, b);
    }

    #[test]
    fn unreachable_objects_are_collected() {
        let mut heap = Heap::new_default();
        let roots = NoRoots;
        let _array = heap.alloc_array(vec![Value::Number(1.0)], &roots);
        let before = heap.bytes_allocated();
        heap.collect(&roots);
        // Nothing marked it as a root, so the sweep freed it.
        assert!(heap.bytes_allocated() < before);
    }

    #[test]
    fn marked_objects_survive_with_cleared_mark_bit() {
        struct OneArray(GcRef);
        impl GcRoots for OneArray {
            fn mark_roots(&self, heap: &mut Heap) {
                heap.mark_object(self.0);
            }
        }
        let mut heap = Heap::new_default();
        let arr = heap.alloc_array(vec![Value::Number(1.0)], &NoRoots);
        let roots = OneArray(arr);
        heap.collect(&roots);
        assert!(!arr.deref().marked.get());
    }

    struct ManyRoots(Vec<GcRef>);
    impl GcRoots for ManyRoots {
        fn mark_roots(&self, heap: &mut Heap) {
            for obj in &self.0 {
                heap.mark_object(*obj);
            }
        }
    }

    proptest::proptest! {
        /// Spec §8 invariant 3: after `collect`, every object reachable from
        /// roots is still allocated and has `marked == false`.
        #[test]
        fn rooted_objects_survive_collection(rooted in proptest::collection::vec(0usize..8, 0..8)) {
            let mut heap = Heap::new_default();
            let arrays: Vec<GcRef> = (0..8)
                .map(|i| heap.alloc_array(vec![Value::Number(i as f64)], &NoRoots))
                .collect();
            let roots = ManyRoots(rooted.iter().map(|&i| arrays[i]).collect());
            let before = heap.bytes_allocated();
            heap.collect(&roots);
            for &i in &rooted {
                assert!(!arrays[i].deref().marked.get());
            }
            if rooted.is_empty() {
                assert!(heap.bytes_allocated() < before);
            }
        }
    }
}
