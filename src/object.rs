use crate::chunk::Chunk;
use crate::heap::ObjRef;
use crate::table::Table;
use crate::value::Value;

/// Every heap allocation is one of these. The arena in `heap.rs` owns them;
/// `Value::Obj` handles are non-owning aliases.
pub enum Obj {
    Str(StrObj),
    Function(Function),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
    Native(Native),
}

/// Immutable, interned. Two strings with equal content are the same object,
/// so equality and table hashing work by handle identity.
pub struct StrObj {
    pub text: Box<str>,
    pub hash: u64,
}

pub struct Function {
    /// `None` for the top-level script.
    pub name: Option<ObjRef>,
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
}

impl Function {
    pub fn new(name: Option<ObjRef>) -> Function {
        Function {
            name,
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
        }
    }
}

pub struct Closure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// A captured variable. `Open` aliases a live stack slot; once the slot is
/// about to be discarded the upvalue flips to `Closed` and owns the value.
/// The transition is one-way and happens exactly once.
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

pub struct Class {
    pub name: ObjRef,
    pub methods: Table,
}

pub struct Instance {
    pub class: ObjRef,
    pub fields: Table,
}

/// Built lazily the first time a property access resolves to a method.
pub struct BoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

pub type NativeFn = fn(&mut crate::vm::Vm, &[Value]) -> Result<Value, String>;

pub struct Native {
    pub name: &'static str,
    pub arity: u8,
    pub function: NativeFn,
}

impl Obj {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Obj::Str(_) => "string",
            Obj::Function(_) => "function",
            Obj::Closure(_) => "function",
            Obj::Upvalue(_) => "upvalue",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "method",
            Obj::Native(_) => "native function",
        }
    }

    /// Rough byte footprint, used only to drive the collection trigger.
    pub fn approx_size(&self) -> usize {
        let payload = match self {
            Obj::Str(s) => s.text.len(),
            Obj::Function(f) => f.chunk.code.len() + f.chunk.constants.len() * size_of::<Value>(),
            Obj::Closure(c) => c.upvalues.len() * size_of::<ObjRef>(),
            Obj::Class(c) => c.methods.len() * size_of::<Value>() * 2,
            Obj::Instance(i) => i.fields.len() * size_of::<Value>() * 2,
            Obj::Upvalue(_) | Obj::BoundMethod(_) | Obj::Native(_) => 0,
        };
        size_of::<Obj>() + payload
    }
}
