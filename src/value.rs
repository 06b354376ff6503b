use crate::heap::ObjRef;

/// Runtime values are small and copied freely; anything bigger lives on the
/// heap behind an `ObjRef` handle.
///
/// The two `*Global` variants never appear on the VM stack. They are the
/// payload the compiler stores in its global symbol table to remember which
/// slot a name was assigned and whether the binding may be reassigned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Obj(ObjRef),
    MutableGlobal(u16),
    ImmutableGlobal(u16),
}

impl Value {
    /// Only `nil` and `false` are falsy. Zero is truthy.
    pub fn is_truthy(self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn as_number(self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_obj(self) -> Option<ObjRef> {
        match self {
            Value::Obj(r) => Some(r),
            _ => None,
        }
    }
}

/// Render a number the way the language prints it: integral values without
/// a trailing `.0`.
pub fn format_number(n: f64) -> String {
    if n == n.trunc() && n.is_finite() {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}
