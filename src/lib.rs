//! A small dynamically typed language: a single-pass compiler emitting
//! bytecode straight from the token stream, and a stack machine that runs it
//! over a mark-sweep collected heap with interned strings.

pub mod chunk;
pub mod compiler;
pub mod heap;
pub mod lexer;
pub mod object;
pub mod table;
pub mod value;
pub mod vm;

pub use compiler::CompileError;
pub use vm::{InterpretError, RuntimeError, Vm};

/// Compile and run `source`, returning everything it printed.
///
/// ```
/// let out = quill::eval("print 1 + 2 * 3;").unwrap();
/// assert_eq!(out, "7\n");
/// ```
pub fn eval(source: &str) -> Result<String, InterpretError> {
    let mut out = Vec::new();
    let mut vm = Vm::new(&mut out);
    let result = vm.interpret(source);
    drop(vm);
    result.map(|()| String::from_utf8_lossy(&out).into_owned())
}
