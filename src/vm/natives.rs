use crate::object::NativeFn;
use crate::value::Value;
use crate::vm::Vm;

/// Host functions installed into the first global slots, in this order.
/// The compiler predeclares the same names, so the slot numbering here and
/// there must agree.
pub const NATIVES: &[(&str, u8, NativeFn)] = &[
    ("clock", 0, clock),
    ("gc", 0, gc),
    ("heap_bytes", 0, heap_bytes),
];

/// Seconds since the interpreter started.
fn clock(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(vm.uptime_seconds()))
}

/// Force a full collection; returns the number of objects freed.
fn gc(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(vm.collect_garbage() as f64))
}

fn heap_bytes(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(vm.heap().bytes_allocated() as f64))
}
