pub mod natives;

use std::fmt;
use std::io::Write;
use std::time::Instant;

use crate::chunk::OpCode;
use crate::compiler::{self, CompileError};
use crate::heap::{Heap, ObjRef};
use crate::object::{BoundMethod, Class, Closure, Instance, Native, NativeFn, Obj, Upvalue};
use crate::table::Table;
use crate::value::Value;

const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * 256;

#[derive(Debug, thiserror::Error)]
pub enum InterpretError {
    #[error("compile error")]
    Compile(Vec<CompileError>),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// A runtime failure plus the call stack at the point it happened,
/// innermost frame first.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub line: u32,
    pub trace: Vec<TraceFrame>,
}

#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub function: String,
    pub line: u32,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime error: {}", self.message)?;
        for frame in &self.trace {
            write!(f, "\n  [line {}] in {}", frame.line, frame.function)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    base: usize,
}

/// What a callee turned out to be, extracted before any mutation so the
/// heap borrow is released.
enum Callee {
    Closure,
    Native(&'static str, u8, NativeFn),
    Class,
    Bound(Value, ObjRef),
    NotCallable,
}

/// The bytecode interpreter. One `Vm` owns one heap; `interpret` may be
/// called repeatedly and a runtime error leaves the machine reusable.
pub struct Vm<'out> {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Vec<Option<Value>>,
    global_names: Vec<String>,
    /// Open upvalues, each aliasing a live stack slot. Unordered; closing
    /// scans for slots at or above the frame base.
    open_upvalues: Vec<ObjRef>,
    native_values: Vec<Value>,
    init_string: ObjRef,
    started: Instant,
    out: &'out mut dyn Write,
}

impl<'out> Vm<'out> {
    pub fn new(out: &'out mut dyn Write) -> Vm<'out> {
        let mut heap = Heap::new();
        // Pinned rather than marked per cycle: the compiler shares this heap
        // and may collect while no VM roots are reachable through it.
        let init_string = heap.intern("init");
        heap.pin(init_string);
        let mut native_values = Vec::new();
        for &(name, arity, function) in natives::NATIVES {
            let r = heap.alloc(Obj::Native(Native {
                name,
                arity,
                function,
            }));
            heap.pin(r);
            native_values.push(Value::Obj(r));
        }
        Vm {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Vec::new(),
            global_names: Vec::new(),
            open_upvalues: Vec::new(),
            native_values,
            init_string,
            started: Instant::now(),
            out,
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Compile and run one source unit. Global bindings do not survive into
    /// the next call; the heap and its intern table do.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let script = compiler::compile(source, &mut self.heap).map_err(InterpretError::Compile)?;

        self.globals = vec![None; script.global_names.len()];
        self.global_names = script.global_names;
        for (slot, value) in self.native_values.clone().into_iter().enumerate() {
            self.globals[slot] = Some(value);
        }

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();

        let closure = self.heap.alloc(Obj::Closure(Closure {
            function: script.function,
            upvalues: Vec::new(),
        }));
        self.push(Value::Obj(closure))?;
        self.call_closure(closure, 0)?;

        let result = self.run();
        if result.is_err() {
            self.stack.clear();
            self.frames.clear();
            self.open_upvalues.clear();
        }
        Ok(result?)
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let op = OpCode::from(self.read_byte());
            match op {
                OpCode::Constant => {
                    let v = self.read_constant(false);
                    self.push(v)?;
                }
                OpCode::ConstantLong => {
                    let v = self.read_constant(true);
                    self.push(v)?;
                }
                OpCode::Nil => self.push(Value::Nil)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::Negate => {
                    let Value::Number(n) = self.peek(0) else {
                        return Err(self.runtime_error("operand must be a number"));
                    };
                    self.pop();
                    self.push(Value::Number(-n))?;
                }
                OpCode::Add => self.add()?,
                OpCode::Subtract
                | OpCode::Multiply
                | OpCode::Divide
                | OpCode::Greater
                | OpCode::Less => self.binary_number_op(op)?,
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(!v.is_truthy()))?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b))?;
                }
                OpCode::Print => {
                    let v = self.pop();
                    let text = self.heap.display(v);
                    if writeln!(self.out, "{text}").is_err() {
                        return Err(self.runtime_error("could not write output"));
                    }
                }
                OpCode::Assert => {
                    let v = self.pop();
                    if !v.is_truthy() {
                        return Err(self.runtime_error("assertion failed"));
                    }
                }
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Dup => {
                    let v = self.peek(0);
                    self.push(v)?;
                }
                OpCode::DefineGlobal => {
                    let slot = self.read_u16() as usize;
                    let v = self.pop();
                    self.globals[slot] = Some(v);
                }
                OpCode::GetGlobal => {
                    let slot = self.read_u16() as usize;
                    match self.globals[slot] {
                        Some(v) => self.push(v)?,
                        None => return Err(self.undefined_variable(slot)),
                    }
                }
                OpCode::SetGlobal => {
                    let slot = self.read_u16() as usize;
                    if self.globals[slot].is_none() {
                        return Err(self.undefined_variable(slot));
                    }
                    // Assignment is an expression; the value stays.
                    self.globals[slot] = Some(self.peek(0));
                }
                OpCode::GetLocal => {
                    let slot = self.read_u16() as usize;
                    let base = self.frame().base;
                    let v = self.stack[base + slot];
                    self.push(v)?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_u16() as usize;
                    let base = self.frame().base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetUpvalue => {
                    let index = self.read_u16() as usize;
                    let closure = self.frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[index];
                    let v = match self.heap.upvalue(upvalue) {
                        Upvalue::Open(slot) => self.stack[*slot],
                        Upvalue::Closed(v) => *v,
                    };
                    self.push(v)?;
                }
                OpCode::SetUpvalue => {
                    let index = self.read_u16() as usize;
                    let closure = self.frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[index];
                    let v = self.peek(0);
                    match self.heap.upvalue_mut(upvalue) {
                        Upvalue::Open(slot) => {
                            let slot = *slot;
                            self.stack[slot] = v;
                        }
                        closed => *closed = Upvalue::Closed(v),
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if !self.peek(0).is_truthy() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }
                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)?;
                }
                OpCode::Closure => {
                    let idx = self.read_u16() as usize;
                    let function = match self.constant_at(idx) {
                        Value::Obj(r) => r,
                        _ => unreachable!("closure operand is a function constant"),
                    };
                    let count = self.heap.function(function).upvalue_count;
                    let mut upvalues = Vec::with_capacity(count);
                    for _ in 0..count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let base = self.frame().base;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            let enclosing = self.frame().closure;
                            upvalues.push(self.heap.closure(enclosing).upvalues[index]);
                        }
                    }
                    self.maybe_gc();
                    let closure = self.heap.alloc(Obj::Closure(Closure { function, upvalues }));
                    self.push(Value::Obj(closure))?;
                }
                OpCode::Class => {
                    let name = self.read_name_constant();
                    self.maybe_gc();
                    let class = self.heap.alloc(Obj::Class(Class {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::Obj(class))?;
                }
                OpCode::Method => {
                    let name = self.read_name_constant();
                    let method = self.peek(0);
                    let class = match self.peek(1) {
                        Value::Obj(r) => r,
                        _ => unreachable!("method defined without a class on the stack"),
                    };
                    let hash = self.heap.string_hash(name);
                    self.heap.class_mut(class).methods.set(name, hash, method);
                    self.pop();
                }
                OpCode::GetProperty => self.get_property()?,
                OpCode::SetProperty => self.set_property()?,
                OpCode::Return => {
                    let result = self.pop();
                    let frame = match self.frames.pop() {
                        Some(frame) => frame,
                        None => unreachable!("return without a frame"),
                    };
                    self.close_upvalues(frame.base);
                    self.stack.truncate(frame.base);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result)?;
                }
            }
        }
    }

    // ---- Instruction decoding ----

    fn frame(&self) -> &CallFrame {
        match self.frames.last() {
            Some(frame) => frame,
            None => unreachable!("no active call frame"),
        }
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        match self.frames.last_mut() {
            Some(frame) => frame,
            None => unreachable!("no active call frame"),
        }
    }

    fn read_byte(&mut self) -> u8 {
        let (closure, ip) = {
            let frame = self.frame();
            (frame.closure, frame.ip)
        };
        let function = self.heap.closure(closure).function;
        let byte = self.heap.function(function).chunk.code[ip];
        self.frame_mut().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte() as u16;
        let low = self.read_byte() as u16;
        (high << 8) | low
    }

    fn constant_at(&self, idx: usize) -> Value {
        let closure = self.frame().closure;
        let function = self.heap.closure(closure).function;
        self.heap.function(function).chunk.constants[idx]
    }

    fn read_constant(&mut self, long: bool) -> Value {
        let idx = if long {
            self.read_u16() as usize
        } else {
            self.read_byte() as usize
        };
        self.constant_at(idx)
    }

    /// Two-byte constant index that must hold an interned name.
    fn read_name_constant(&mut self) -> ObjRef {
        let idx = self.read_u16() as usize;
        match self.constant_at(idx) {
            Value::Obj(r) => r,
            _ => unreachable!("name operand is an interned string constant"),
        }
    }

    // ---- Stack ----

    fn push(&mut self, v: Value) -> Result<(), RuntimeError> {
        if self.stack.len() == STACK_MAX {
            return Err(self.runtime_error("stack overflow"));
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(v) => v,
            None => unreachable!("stack underflow"),
        }
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ---- Operators ----

    fn binary_number_op(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let (Value::Number(a), Value::Number(b)) = (self.peek(1), self.peek(0)) else {
            return Err(self.runtime_error("operands must be numbers"));
        };
        self.pop();
        self.pop();
        let result = match op {
            OpCode::Subtract => Value::Number(a - b),
            OpCode::Multiply => Value::Number(a * b),
            OpCode::Divide => Value::Number(a / b),
            OpCode::Greater => Value::Bool(a > b),
            OpCode::Less => Value::Bool(a < b),
            _ => unreachable!("not a binary numeric opcode"),
        };
        self.push(result)
    }

    /// `+` is numeric addition or string concatenation, nothing else.
    fn add(&mut self) -> Result<(), RuntimeError> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a + b))
            }
            (Value::Obj(a), Value::Obj(b))
                if matches!(self.heap.get(a), Obj::Str(_))
                    && matches!(self.heap.get(b), Obj::Str(_)) =>
            {
                let joined = format!("{}{}", self.heap.string(a), self.heap.string(b));
                self.maybe_gc();
                let r = self.heap.intern(&joined);
                self.pop();
                self.pop();
                self.push(Value::Obj(r))
            }
            _ => Err(self.runtime_error("operands must be two numbers or two strings")),
        }
    }

    // ---- Calls ----

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        let Value::Obj(r) = callee else {
            return Err(self.runtime_error("can only call functions and classes"));
        };
        let kind = match self.heap.get(r) {
            Obj::Closure(_) => Callee::Closure,
            Obj::Native(n) => Callee::Native(n.name, n.arity, n.function),
            Obj::Class(_) => Callee::Class,
            Obj::BoundMethod(b) => Callee::Bound(b.receiver, b.method),
            _ => Callee::NotCallable,
        };
        match kind {
            Callee::Closure => self.call_closure(r, argc),
            Callee::Native(name, arity, function) => {
                if argc != arity as usize {
                    return Err(self.runtime_error(format!(
                        "{name} expects {arity} arguments but got {argc}"
                    )));
                }
                let base = self.stack.len() - argc;
                let args: Vec<Value> = self.stack[base..].to_vec();
                let result = function(self, &args)
                    .map_err(|message| self.runtime_error(message))?;
                self.stack.truncate(base - 1);
                self.push(result)
            }
            Callee::Class => {
                self.maybe_gc();
                let instance = self.heap.alloc(Obj::Instance(Instance {
                    class: r,
                    fields: Table::new(),
                }));
                let receiver_slot = self.stack.len() - argc - 1;
                self.stack[receiver_slot] = Value::Obj(instance);

                let hash = self.heap.string_hash(self.init_string);
                match self.heap.class(r).methods.get(self.init_string, hash) {
                    Some(Value::Obj(init)) => self.call_closure(init, argc),
                    Some(_) => unreachable!("methods are closures"),
                    None if argc == 0 => Ok(()),
                    None => Err(self.runtime_error(format!(
                        "expected 0 arguments but got {argc}"
                    ))),
                }
            }
            Callee::Bound(receiver, method) => {
                let receiver_slot = self.stack.len() - argc - 1;
                self.stack[receiver_slot] = receiver;
                self.call_closure(method, argc)
            }
            Callee::NotCallable => Err(self.runtime_error("can only call functions and classes")),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity as usize;
        if argc != arity {
            return Err(self.runtime_error(format!(
                "expected {arity} arguments but got {argc}"
            )));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("stack overflow"));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: self.stack.len() - argc - 1,
        });
        Ok(())
    }

    // ---- Upvalues ----

    /// Reuse the open upvalue for this slot if one exists, so every closure
    /// over the same variable sees the same storage.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        for &r in &self.open_upvalues {
            if matches!(self.heap.upvalue(r), Upvalue::Open(s) if *s == slot) {
                return r;
            }
        }
        self.maybe_gc();
        let r = self.heap.alloc(Obj::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.push(r);
        r
    }

    /// Close every open upvalue aliasing a slot at or above `from`, moving
    /// the value off the stack into the upvalue.
    fn close_upvalues(&mut self, from: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let r = self.open_upvalues[i];
            let slot = match self.heap.upvalue(r) {
                Upvalue::Open(slot) => *slot,
                Upvalue::Closed(_) => unreachable!("closed upvalue in the open list"),
            };
            if slot >= from {
                let v = self.stack[slot];
                *self.heap.upvalue_mut(r) = Upvalue::Closed(v);
                self.open_upvalues.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    // ---- Properties ----

    /// Fields shadow methods; a miss on both yields nil rather than an
    /// error. Method hits bind the receiver lazily.
    fn get_property(&mut self) -> Result<(), RuntimeError> {
        let name = self.read_name_constant();
        let receiver = self.peek(0);
        let instance = match receiver {
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Instance(_)) => r,
            _ => return Err(self.runtime_error("only instances have properties")),
        };
        let hash = self.heap.string_hash(name);
        if let Some(v) = self.heap.instance(instance).fields.get(name, hash) {
            self.pop();
            return self.push(v);
        }
        let class = self.heap.instance(instance).class;
        match self.heap.class(class).methods.get(name, hash) {
            Some(Value::Obj(method)) => {
                self.maybe_gc();
                let bound = self.heap.alloc(Obj::BoundMethod(BoundMethod {
                    receiver,
                    method,
                }));
                self.pop();
                self.push(Value::Obj(bound))
            }
            Some(_) => unreachable!("methods are closures"),
            None => {
                self.pop();
                self.push(Value::Nil)
            }
        }
    }

    fn set_property(&mut self) -> Result<(), RuntimeError> {
        let name = self.read_name_constant();
        let value = self.peek(0);
        let instance = match self.peek(1) {
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Instance(_)) => r,
            _ => return Err(self.runtime_error("only instances have fields")),
        };
        let hash = self.heap.string_hash(name);
        self.heap.instance_mut(instance).fields.set(name, hash, value);
        self.pop();
        self.pop();
        self.push(value)
    }

    // ---- Garbage collection ----

    fn maybe_gc(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    /// Full collection with the VM's roots: the value stack, call frames,
    /// defined globals, and open upvalues. The natives and the `init` name
    /// are pinned in the heap at construction.
    pub fn collect_garbage(&mut self) -> usize {
        let stack = &self.stack;
        let frames = &self.frames;
        let globals = &self.globals;
        let open_upvalues = &self.open_upvalues;
        self.heap.collect(|heap| {
            for v in stack {
                heap.mark_value(*v);
            }
            for frame in frames {
                heap.mark_object(frame.closure);
            }
            for v in globals.iter().flatten() {
                heap.mark_value(*v);
            }
            for r in open_upvalues {
                heap.mark_object(*r);
            }
        })
    }

    // ---- Errors ----

    fn undefined_variable(&self, slot: usize) -> RuntimeError {
        self.runtime_error(format!("undefined variable '{}'", self.global_names[slot]))
    }

    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = self.heap.closure(frame.closure).function;
            let function = self.heap.function(function);
            let line = function.chunk.line_at(frame.ip.saturating_sub(1));
            let name = match function.name {
                Some(name) => self.heap.string(name).to_string(),
                None => "script".to_string(),
            };
            trace.push(TraceFrame {
                function: name,
                line,
            });
        }
        RuntimeError {
            message: message.into(),
            line: trace.first().map(|f| f.line).unwrap_or(0),
            trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> Result<String, InterpretError> {
        let mut out = Vec::new();
        let mut vm = Vm::new(&mut out);
        let result = vm.interpret(source);
        drop(vm);
        result.map(|()| String::from_utf8_lossy(&out).into_owned())
    }

    fn output(source: &str) -> String {
        match run(source) {
            Ok(text) => text,
            Err(e) => panic!("unexpected failure: {e:?}"),
        }
    }

    fn runtime_error(source: &str) -> RuntimeError {
        match run(source) {
            Err(InterpretError::Runtime(e)) => e,
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn arithmetic_with_precedence_and_unary() {
        assert_eq!(output("print 1 + 2 * 3 - 4 * -5;"), "27\n");
    }

    #[test]
    fn grouping_overrides_precedence() {
        assert_eq!(output("print (1 + 2) * 3;"), "9\n");
    }

    #[test]
    fn number_printing_drops_integral_fraction() {
        assert_eq!(output("print 10 / 4; print 10 / 5;"), "2.5\n2\n");
    }

    #[test]
    fn only_nil_and_false_are_falsy() {
        assert_eq!(
            output("if (0) print \"zero\"; if (\"\") print \"empty\"; if (nil) print \"nil\";"),
            "zero\nempty\n"
        );
        assert_eq!(output("print !nil; print !false; print !0;"), "true\ntrue\nfalse\n");
    }

    #[test]
    fn string_concatenation_and_equality() {
        assert_eq!(output("print \"foo\" + \"bar\";"), "foobar\n");
        assert_eq!(output("print \"foo\" + \"bar\" == \"foobar\";"), "true\n");
    }

    #[test]
    fn logical_operators_short_circuit() {
        assert_eq!(output("print false and missing();"), "false\n");
        assert_eq!(output("print true or missing();"), "true\n");
        assert_eq!(output("print 1 and 2; print nil or 3;"), "2\n3\n");
    }

    #[test]
    fn globals_define_read_assign() {
        assert_eq!(output("var a = 1; a = a + 2; print a;"), "3\n");
    }

    #[test]
    fn undefined_global_read_is_a_runtime_error() {
        let e = runtime_error("print missing;");
        assert!(e.message.contains("undefined variable 'missing'"));
    }

    #[test]
    fn undefined_global_assignment_is_a_runtime_error() {
        let e = runtime_error("missing = 1;");
        assert!(e.message.contains("undefined variable 'missing'"));
    }

    #[test]
    fn locals_shadow_globals() {
        assert_eq!(
            output("var a = \"global\"; { var a = \"local\"; print a; } print a;"),
            "local\nglobal\n"
        );
    }

    #[test]
    fn while_loop_counts() {
        assert_eq!(
            output("var i = 0; while (i < 3) { print i; i = i + 1; }"),
            "0\n1\n2\n"
        );
    }

    #[test]
    fn for_loop_with_all_clauses() {
        assert_eq!(
            output("for (var i = 0; i < 3; i = i + 1) print i;"),
            "0\n1\n2\n"
        );
    }

    #[test]
    fn functions_return_values() {
        assert_eq!(
            output("fun add(a, b) { return a + b; } print add(1, 2);"),
            "3\n"
        );
    }

    #[test]
    fn function_without_return_yields_nil() {
        assert_eq!(output("fun noop() {} print noop();"), "nil\n");
    }

    #[test]
    fn recursion() {
        assert_eq!(
            output("fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);"),
            "55\n"
        );
    }

    #[test]
    fn wrong_arity_is_a_runtime_error() {
        let e = runtime_error("fun f(a) {} f(1, 2);");
        assert!(e.message.contains("expected 1 arguments but got 2"));
    }

    #[test]
    fn unbounded_recursion_overflows_the_frame_stack() {
        let e = runtime_error("fun f() { f(); } f();");
        assert!(e.message.contains("stack overflow"));
    }

    #[test]
    fn closure_shares_mutable_state() {
        assert_eq!(
            output(
                "fun make() { var i = 0; fun inc() { i = i + 1; return i; } return inc; }\n\
                 let c = make();\n\
                 print c(); print c(); print c();"
            ),
            "1\n2\n3\n"
        );
    }

    #[test]
    fn sibling_closures_share_one_upvalue() {
        assert_eq!(
            output(
                "fun pair() {\n\
                   var n = 0;\n\
                   fun set(v) { n = v; }\n\
                   fun get() { return n; }\n\
                   set(41);\n\
                   print get();\n\
                 }\n\
                 pair();"
            ),
            "41\n"
        );
    }

    #[test]
    fn closure_survives_its_scope() {
        assert_eq!(
            output(
                "var saved = nil;\n\
                 { var x = \"kept\"; fun grab() { return x; } saved = grab; }\n\
                 print saved();"
            ),
            "kept\n"
        );
    }

    #[test]
    fn when_dispatches_on_equality_ranges_and_alternation() {
        assert_eq!(
            output(
                "fun classify(n) {\n\
                   when n {\n\
                     1 | 2 -> print \"pair\";\n\
                     3..10 -> print \"range\";\n\
                     nothing -> print \"other\";\n\
                   }\n\
                 }\n\
                 classify(2); classify(3); classify(9); classify(10);"
            ),
            "pair\nrange\nrange\nother\n"
        );
    }

    #[test]
    fn when_inside_counted_loop() {
        assert_eq!(
            output(
                "var low = 0; var high = 0; var other = 0;\n\
                 for (var i = 0; i < 1000; i = i + 1) {\n\
                   when i {\n\
                     0..500 -> low = low + 1;\n\
                     500..999 -> high = high + 1;\n\
                     nothing -> other = other + 1;\n\
                   }\n\
                 }\n\
                 print low; print high; print other;"
            ),
            "500\n499\n1\n"
        );
    }

    #[test]
    fn classes_fields_and_methods() {
        assert_eq!(
            output(
                "class Counter {\n\
                   init() { this.n = 0; }\n\
                   bump() { this.n = this.n + 1; return this.n; }\n\
                 }\n\
                 let c = Counter();\n\
                 c.bump(); c.bump();\n\
                 print c.bump();"
            ),
            "3\n"
        );
    }

    #[test]
    fn fields_shadow_methods_and_misses_yield_nil() {
        assert_eq!(
            output(
                "class Box { tag() { return \"method\"; } }\n\
                 let b = Box();\n\
                 print b.absent;\n\
                 b.tag = \"field\";\n\
                 print b.tag;"
            ),
            "nil\nfield\n"
        );
    }

    #[test]
    fn bound_method_remembers_its_receiver() {
        assert_eq!(
            output(
                "class Greeter {\n\
                   init(name) { this.name = name; }\n\
                   greet() { return \"hi \" + this.name; }\n\
                 }\n\
                 let m = Greeter(\"ada\").greet;\n\
                 print m();"
            ),
            "hi ada\n"
        );
    }

    #[test]
    fn initializer_returns_the_instance() {
        assert_eq!(
            output("class A { init() { this.x = 1; } } print A().x;"),
            "1\n"
        );
    }

    #[test]
    fn class_arity_comes_from_init() {
        let e = runtime_error("class A {} A(1);");
        assert!(e.message.contains("expected 0 arguments but got 1"));
    }

    #[test]
    fn property_access_on_non_instance_is_an_error() {
        let e = runtime_error("var x = 1; print x.field;");
        assert!(e.message.contains("only instances have properties"));
    }

    #[test]
    fn assert_passes_and_fails() {
        assert_eq!(output("assert 1 < 2; print \"ok\";"), "ok\n");
        let e = runtime_error("assert 1 > 2;");
        assert!(e.message.contains("assertion failed"));
    }

    #[test]
    fn type_errors_carry_a_backtrace() {
        let e = runtime_error("fun inner() { return 1 + \"one\"; } fun outer() { return inner(); } outer();");
        assert!(e.message.contains("two numbers or two strings"));
        assert!(!e.trace.is_empty());
        assert_eq!(e.trace[0].function, "inner");
        assert_eq!(e.trace.last().map(|f| f.function.as_str()), Some("script"));
    }

    #[test]
    fn runtime_error_does_not_poison_the_vm() {
        let mut out = Vec::new();
        let mut vm = Vm::new(&mut out);
        assert!(vm.interpret("print -\"not a number\";").is_err());
        assert!(vm.interpret("print 40 + 2;").is_ok());
        drop(vm);
        assert_eq!(String::from_utf8_lossy(&out), "42\n");
    }

    #[test]
    fn concatenation_reuses_interned_strings() {
        let mut out = Vec::new();
        let mut vm = Vm::new(&mut out);
        vm.interpret("let greeting = \"hel\" + \"lo\"; assert greeting == \"hello\";")
            .expect("program runs");
        // Both spellings collapsed to one object.
        let live = vm.heap.live_objects();
        vm.interpret("let again = \"hello\";").expect("program runs");
        assert_eq!(vm.heap.live_objects(), live);
    }

    #[test]
    fn forced_collection_frees_unreachable_objects() {
        let mut out = Vec::new();
        let mut vm = Vm::new(&mut out);
        vm.interpret(
            "var junk = \"j\";\n\
             for (var i = 0; i < 50; i = i + 1) { junk = junk + \"j\"; }\n\
             junk = nil;",
        )
        .expect("program runs");
        let freed = vm.collect_garbage();
        assert!(freed > 0, "intermediate concatenations should be freed");
    }

    #[test]
    fn collection_keeps_closed_upvalue_values() {
        let mut out = Vec::new();
        let mut vm = Vm::new(&mut out);
        vm.interpret(
            "var saved = nil;\n\
             { var s = \"precious\" + \"\"; fun grab() { return s; } saved = grab; }",
        )
        .expect("program runs");
        vm.collect_garbage();
        // The captured string is only reachable through the closed upvalue;
        // if it survived, re-interning the same content is a no-op.
        let live = vm.heap.live_objects();
        vm.heap.intern("precious");
        assert_eq!(vm.heap.live_objects(), live);
    }

    #[test]
    fn open_upvalue_keeps_its_value_across_forced_collection() {
        assert_eq!(
            output(
                "fun outer() {\n\
                   var s = \"only\" + \"here\";\n\
                   fun grab() { return s; }\n\
                   gc();\n\
                   return grab();\n\
                 }\n\
                 print outer();"
            ),
            "onlyhere\n"
        );
    }

    #[test]
    fn division_by_a_string_errors_with_a_backtrace() {
        let e = runtime_error("fun div(a, b) { return a / b; } div(1, \"zero\");");
        assert!(e.message.contains("operands must be numbers"));
        assert!(!e.trace.is_empty());
        assert_eq!(e.trace[0].function, "div");
    }

    #[test]
    fn natives_and_init_survive_a_collection_during_compilation() {
        // A literal bigger than the first collection threshold makes the
        // compiler collect between declarations, while no VM roots reach the
        // heap. The host functions and the initializer name must still be
        // there when the program runs.
        let big = "x".repeat(2 << 20);
        let source = format!(
            "let big = \"{big}\";\n\
             class A {{ init() {{ this.ok = true; }} }}\n\
             assert A().ok;\n\
             print clock() >= 0;"
        );
        assert_eq!(output(&source), "true\n");
    }

    #[test]
    fn native_clock_returns_a_number() {
        assert_eq!(output("print clock() >= 0;"), "true\n");
    }

    #[test]
    fn native_gc_is_callable_from_programs() {
        assert_eq!(output("print gc() >= 0;"), "true\n");
    }

    #[test]
    fn native_heap_bytes_grows_with_allocation() {
        assert_eq!(
            output("let before = heap_bytes(); let s = \"aaaa\" + \"bbbb\"; assert heap_bytes() > before; print \"ok\";"),
            "ok\n"
        );
    }

    #[test]
    fn natives_reject_wrong_arity() {
        let e = runtime_error("clock(1);");
        assert!(e.message.contains("clock expects 0 arguments"));
    }

    #[test]
    fn immutable_globals_cannot_be_reassigned_at_runtime_either() {
        // Compile-time rejection; exercised through the full pipeline.
        let mut out = Vec::new();
        let mut vm = Vm::new(&mut out);
        match vm.interpret("let k = 1; k = 2;") {
            Err(InterpretError::Compile(errors)) => {
                assert!(errors[0].message.contains("immutable"));
            }
            other => panic!("expected compile error, got {other:?}"),
        }
    }
}
