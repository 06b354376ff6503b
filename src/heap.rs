use crate::object::{Class, Closure, Function, Instance, Obj, StrObj, Upvalue};
use crate::table::Table;
use crate::value::{Value, format_number};

/// Handle into the heap arena. Copying one never copies the object; many
/// values may alias the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjRef(u32);

impl ObjRef {
    pub(crate) fn new(index: u32) -> ObjRef {
        ObjRef(index)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Collection runs once this many bytes have been allocated, then the
/// threshold doubles after every cycle.
const FIRST_GC_BYTES: usize = 1 << 20;
const HEAP_GROW_FACTOR: usize = 2;

/// The allocation arena plus everything the mark-sweep collector needs:
/// a mark bit per slot, the gray work-list, byte accounting, and the string
/// intern table (swept specially so it never keeps a dead string alive).
///
/// The heap never starts a collection on its own. Allocation only grows the
/// byte counter; the VM and the compiler check `should_collect` at safe
/// points and call `collect` with their own root enumeration.
pub struct Heap {
    slots: Vec<Option<Obj>>,
    marks: Vec<bool>,
    /// Bytes charged per slot when it was allocated; sweep subtracts this
    /// same figure so the accounting balances even if the object grew.
    sizes: Vec<usize>,
    free: Vec<u32>,
    gray: Vec<ObjRef>,
    /// Permanent roots, marked at the start of every cycle no matter which
    /// mutator drives the collection.
    pinned: Vec<ObjRef>,
    strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            slots: Vec::new(),
            marks: Vec::new(),
            sizes: Vec::new(),
            free: Vec::new(),
            gray: Vec::new(),
            pinned: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_BYTES,
        }
    }

    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        let size = obj.approx_size();
        self.bytes_allocated += size;
        match self.free.pop() {
            Some(i) => {
                self.slots[i as usize] = Some(obj);
                self.sizes[i as usize] = size;
                ObjRef(i)
            }
            None => {
                self.slots.push(Some(obj));
                self.marks.push(false);
                self.sizes.push(size);
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Root an object for the heap's whole lifetime. The VM pins its host
    /// function objects and the `init` name so collections driven by other
    /// mutators of the same heap cannot sweep them.
    pub fn pin(&mut self, r: ObjRef) {
        self.pinned.push(r);
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        match &self.slots[r.index()] {
            Some(obj) => obj,
            None => unreachable!("use of freed object handle"),
        }
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        match &mut self.slots[r.index()] {
            Some(obj) => obj,
            None => unreachable!("use of freed object handle"),
        }
    }

    // Typed accessors; the compiler and VM only follow handles whose kind
    // they established, so a mismatch is a bug, not an error to propagate.

    pub fn string(&self, r: ObjRef) -> &str {
        match self.get(r) {
            Obj::Str(s) => &s.text,
            other => unreachable!("expected string, found {}", other.kind_name()),
        }
    }

    pub fn string_hash(&self, r: ObjRef) -> u64 {
        match self.get(r) {
            Obj::Str(s) => s.hash,
            other => unreachable!("expected string, found {}", other.kind_name()),
        }
    }

    pub fn function(&self, r: ObjRef) -> &Function {
        match self.get(r) {
            Obj::Function(f) => f,
            other => unreachable!("expected function, found {}", other.kind_name()),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &Closure {
        match self.get(r) {
            Obj::Closure(c) => c,
            other => unreachable!("expected closure, found {}", other.kind_name()),
        }
    }

    pub fn class(&self, r: ObjRef) -> &Class {
        match self.get(r) {
            Obj::Class(c) => c,
            other => unreachable!("expected class, found {}", other.kind_name()),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut Class {
        match self.get_mut(r) {
            Obj::Class(c) => c,
            _ => unreachable!("expected class"),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &Instance {
        match self.get(r) {
            Obj::Instance(i) => i,
            other => unreachable!("expected instance, found {}", other.kind_name()),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut Instance {
        match self.get_mut(r) {
            Obj::Instance(i) => i,
            _ => unreachable!("expected instance"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &Upvalue {
        match self.get(r) {
            Obj::Upvalue(u) => u,
            other => unreachable!("expected upvalue, found {}", other.kind_name()),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut Upvalue {
        match self.get_mut(r) {
            Obj::Upvalue(u) => u,
            _ => unreachable!("expected upvalue"),
        }
    }

    /// Get-or-create the single string object for this content.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        let hash = hash_str(text);
        let slots = &self.slots;
        if let Some(existing) = self.strings.find_key(hash, |k| {
            matches!(&slots[k.index()], Some(Obj::Str(s)) if &*s.text == text)
        }) {
            return existing;
        }
        let r = self.alloc(Obj::Str(StrObj {
            text: text.into(),
            hash,
        }));
        self.strings.set(r, hash, Value::Nil);
        r
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// One full stop-the-world cycle. The caller enumerates its roots
    /// through the closure; tracing and sweeping follow. Returns the number
    /// of objects freed.
    pub fn collect(&mut self, mark_roots: impl FnOnce(&mut Heap)) -> usize {
        for &r in &self.pinned {
            mark_raw(&mut self.marks, &mut self.gray, r);
        }
        mark_roots(self);
        self.trace();
        self.sweep()
    }

    pub fn mark_value(&mut self, v: Value) {
        if let Value::Obj(r) = v {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        mark_raw(&mut self.marks, &mut self.gray, r);
    }

    /// Drain the gray work-list, marking each object's direct references.
    /// Iterative so tracing depth never touches the host call stack.
    fn trace(&mut self) {
        while let Some(r) = self.gray.pop() {
            let Some(obj) = self.slots[r.index()].as_ref() else {
                continue;
            };
            let marks = &mut self.marks;
            let gray = &mut self.gray;
            match obj {
                Obj::Str(_) | Obj::Native(_) => {}
                Obj::Function(f) => {
                    if let Some(name) = f.name {
                        mark_raw(marks, gray, name);
                    }
                    for v in &f.chunk.constants {
                        mark_value_raw(marks, gray, *v);
                    }
                }
                Obj::Closure(c) => {
                    mark_raw(marks, gray, c.function);
                    for up in &c.upvalues {
                        mark_raw(marks, gray, *up);
                    }
                }
                Obj::Upvalue(Upvalue::Closed(v)) => mark_value_raw(marks, gray, *v),
                // An open upvalue's slot is still on the stack, which is a
                // root of its own.
                Obj::Upvalue(Upvalue::Open(_)) => {}
                Obj::Class(c) => {
                    mark_raw(marks, gray, c.name);
                    for (k, v) in c.methods.iter() {
                        mark_raw(marks, gray, k);
                        mark_value_raw(marks, gray, v);
                    }
                }
                Obj::Instance(i) => {
                    mark_raw(marks, gray, i.class);
                    for (k, v) in i.fields.iter() {
                        mark_raw(marks, gray, k);
                        mark_value_raw(marks, gray, v);
                    }
                }
                Obj::BoundMethod(b) => {
                    mark_value_raw(marks, gray, b.receiver);
                    mark_raw(marks, gray, b.method);
                }
            }
        }
    }

    /// Free unmarked objects and clear surviving marks. The intern table is
    /// swept first so an entry alone cannot keep its string alive.
    fn sweep(&mut self) -> usize {
        let marks = &self.marks;
        self.strings.retain_keys(|k| marks[k.index()]);

        let mut freed = 0;
        for i in 0..self.slots.len() {
            if self.slots[i].is_none() {
                continue;
            }
            if self.marks[i] {
                self.marks[i] = false;
                continue;
            }
            self.slots[i] = None;
            self.free.push(i as u32);
            self.bytes_allocated -= self.sizes[i];
            freed += 1;
        }
        self.next_gc = (self.bytes_allocated * HEAP_GROW_FACTOR).max(FIRST_GC_BYTES);
        freed
    }

    /// Human-readable rendering of any value; objects need the heap to
    /// resolve their handles.
    pub fn display(&self, v: Value) -> String {
        match v {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Obj(r) => self.display_obj(r),
            Value::MutableGlobal(_) | Value::ImmutableGlobal(_) => {
                unreachable!("compile-time marker observed at runtime")
            }
        }
    }

    fn display_obj(&self, r: ObjRef) -> String {
        match self.get(r) {
            Obj::Str(s) => s.text.to_string(),
            Obj::Function(f) => self.display_function(f),
            Obj::Closure(c) => self.display_function(self.function(c.function)),
            Obj::Upvalue(_) => "upvalue".to_string(),
            Obj::Class(c) => self.string(c.name).to_string(),
            Obj::Instance(i) => {
                format!("{} instance", self.string(self.class(i.class).name))
            }
            Obj::BoundMethod(b) => self.display_obj(b.method),
            Obj::Native(n) => format!("<native fn {}>", n.name),
        }
    }

    fn display_function(&self, f: &Function) -> String {
        match f.name {
            Some(name) => format!("<fn {}>", self.string(name)),
            None => "<script>".to_string(),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

fn mark_raw(marks: &mut [bool], gray: &mut Vec<ObjRef>, r: ObjRef) {
    if !marks[r.index()] {
        marks[r.index()] = true;
        gray.push(r);
    }
}

fn mark_value_raw(marks: &mut [bool], gray: &mut Vec<ObjRef>, v: Value) {
    if let Value::Obj(r) = v {
        mark_raw(marks, gray, r);
    }
}

/// FNV-1a, the same shape the intern table has always used.
pub fn hash_str(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in s.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.live_objects(), 2);
    }

    #[test]
    fn collect_frees_unreachable_objects() {
        let mut heap = Heap::new();
        let keep = heap.intern("keep");
        let _drop = heap.intern("drop");
        let freed = heap.collect(|h| h.mark_object(keep));
        assert_eq!(freed, 1);
        assert_eq!(heap.live_objects(), 1);
        // The survivor is still interned; re-interning returns it.
        assert_eq!(heap.intern("keep"), keep);
        assert_eq!(heap.live_objects(), 1);
    }

    #[test]
    fn intern_table_does_not_keep_strings_alive() {
        let mut heap = Heap::new();
        let dead = heap.intern("ephemeral");
        heap.collect(|_| {});
        assert_eq!(heap.live_objects(), 0);
        // A fresh intern of the same content must get a fresh object, not a
        // stale table hit.
        let reborn = heap.intern("ephemeral");
        assert_eq!(reborn.index(), dead.index(), "freed slot should be reused");
        assert_eq!(heap.live_objects(), 1);
    }

    #[test]
    fn closed_upvalue_keeps_its_value_alive() {
        let mut heap = Heap::new();
        let s = heap.intern("captured");
        let up = heap.alloc(Obj::Upvalue(Upvalue::Closed(Value::Obj(s))));
        let freed = heap.collect(|h| h.mark_object(up));
        assert_eq!(freed, 0);
        assert_eq!(heap.string(s), "captured");

        // Once nothing references the upvalue, both go.
        let freed = heap.collect(|_| {});
        assert_eq!(freed, 2);
    }

    #[test]
    fn closures_trace_functions_and_constants() {
        let mut heap = Heap::new();
        let name = heap.intern("f");
        let lit = heap.intern("a string constant");
        let mut function = Function::new(Some(name));
        function.chunk.add_constant(Value::Obj(lit));
        let f = heap.alloc(Obj::Function(function));
        let closure = heap.alloc(Obj::Closure(Closure {
            function: f,
            upvalues: Vec::new(),
        }));

        let freed = heap.collect(|h| h.mark_object(closure));
        assert_eq!(freed, 0);
        assert_eq!(heap.string(lit), "a string constant");
    }

    #[test]
    fn pinned_objects_survive_a_rootless_collection() {
        let mut heap = Heap::new();
        let perm = heap.intern("perm");
        heap.pin(perm);
        let _transient = heap.intern("transient");
        let freed = heap.collect(|_| {});
        assert_eq!(freed, 1);
        assert_eq!(heap.string(perm), "perm");
        // Still interned, so re-interning hits the same object.
        assert_eq!(heap.intern("perm"), perm);
    }

    #[test]
    fn sweep_charges_the_size_recorded_at_allocation() {
        let mut heap = Heap::new();
        let name = heap.intern("Bag");
        let class = heap.alloc(Obj::Class(Class {
            name,
            methods: Table::new(),
        }));
        let instance = heap.alloc(Obj::Instance(Instance {
            class,
            fields: Table::new(),
        }));
        // Grow the field table well past its size at allocation time; the
        // growth must not unbalance the byte accounting when it is freed.
        for i in 0..64 {
            let key = heap.intern(&format!("field{i}"));
            let hash = heap.string_hash(key);
            heap.instance_mut(instance)
                .fields
                .set(key, hash, Value::Number(i as f64));
        }
        heap.collect(|_| {});
        assert_eq!(heap.live_objects(), 0);
        assert_eq!(heap.bytes_allocated(), 0);
    }

    #[test]
    fn byte_accounting_shrinks_on_sweep() {
        let mut heap = Heap::new();
        heap.intern("x".repeat(1000).as_str());
        let before = heap.bytes_allocated();
        assert!(before >= 1000);
        heap.collect(|_| {});
        assert!(heap.bytes_allocated() < before);
    }

    #[test]
    fn threshold_grows_after_a_cycle() {
        let mut heap = Heap::new();
        assert!(!heap.should_collect());
        // Pile up strings past the initial threshold.
        for i in 0..2000 {
            heap.intern(&format!("{i}-{}", "pad".repeat(200)));
        }
        assert!(heap.should_collect());
        heap.collect(|_| {});
        assert!(!heap.should_collect());
    }
}
