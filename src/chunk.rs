use crate::value::Value;

/// One byte each. The order is load-bearing: `OpCode::from` converts raw
/// instruction bytes back with a transmute.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpCode {
    Constant = 0,
    ConstantLong,
    Nil,
    True,
    False,
    Negate,
    Add,
    Subtract,
    Multiply,
    Divide,
    Not,
    Equal,
    Greater,
    Less,
    Print,
    Assert,
    Pop,
    Dup,
    DefineGlobal,
    GetGlobal,
    SetGlobal,
    GetLocal,
    SetLocal,
    GetUpvalue,
    SetUpvalue,
    CloseUpvalue,
    Jump,
    JumpIfFalse,
    Loop,
    Call,
    Closure,
    Class,
    Method,
    GetProperty,
    SetProperty,
    Return,
}

impl From<u8> for OpCode {
    #[inline(always)]
    fn from(value: u8) -> Self {
        debug_assert!(value <= OpCode::Return as u8);
        // Safety: every emitted instruction byte comes from `OpCode as u8`
        unsafe { std::mem::transmute(value) }
    }
}

/// A compiled function body: raw instruction bytes, the constants they index,
/// and a run-length line table (consecutive instructions usually share a line).
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    lines: Vec<(u32, u32)>,
}

impl Chunk {
    pub fn new() -> Chunk {
        Chunk {
            code: Vec::with_capacity(64),
            constants: Vec::new(),
            lines: Vec::new(),
        }
    }

    pub fn write(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        match self.lines.last_mut() {
            Some((last, times)) if *last == line => *times += 1,
            _ => self.lines.push((line, 1)),
        }
    }

    pub fn write_op(&mut self, op: OpCode, line: u32) {
        self.write(op as u8, line);
    }

    /// Big-endian, always two bytes: slot indices and jump offsets.
    pub fn write_u16(&mut self, value: u16, line: u32) {
        self.write((value >> 8) as u8, line);
        self.write((value & 0xff) as u8, line);
    }

    pub fn add_constant(&mut self, value: Value) -> usize {
        // Literal pools stay small by reusing identical entries.
        if let Some(pos) = self.constants.iter().position(|c| c == &value) {
            return pos;
        }
        self.constants.push(value);
        self.constants.len() - 1
    }

    /// Source line of the instruction at `offset`.
    pub fn line_at(&self, offset: usize) -> u32 {
        let mut covered = 0usize;
        for (line, times) in &self.lines {
            covered += *times as usize;
            if covered > offset {
                return *line;
            }
        }
        0
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Chunk::new()
    }
}

/// Operand byte count that follows each opcode (`Closure` additionally
/// carries a variable-length capture list handled by its reader).
pub fn operand_width(op: OpCode) -> usize {
    match op {
        OpCode::Constant | OpCode::Call => 1,
        OpCode::ConstantLong
        | OpCode::DefineGlobal
        | OpCode::GetGlobal
        | OpCode::SetGlobal
        | OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Jump
        | OpCode::JumpIfFalse
        | OpCode::Loop
        | OpCode::Closure
        | OpCode::Class
        | OpCode::Method
        | OpCode::GetProperty
        | OpCode::SetProperty => 2,
        _ => 0,
    }
}

/// Compact single-line rendering of a chunk's instruction stream, mostly for
/// compiler tests: `Constant(0) Pop Return`. `Closure` needs the heap to know
/// how many capture pairs follow it.
pub fn instructions_to_string(chunk: &Chunk, heap: &crate::heap::Heap) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(chunk.code.len() * 4);
    let mut ip = 0;
    while ip < chunk.code.len() {
        if ip > 0 {
            out.push(' ');
        }
        let op = OpCode::from(chunk.code[ip]);
        write!(out, "{op:?}").expect("write to string");
        ip += 1;
        match operand_width(op) {
            1 => {
                write!(out, "({})", chunk.code[ip]).expect("write to string");
                ip += 1;
            }
            2 => {
                let v = ((chunk.code[ip] as u16) << 8) | chunk.code[ip + 1] as u16;
                write!(out, "({v})").expect("write to string");
                ip += 2;
            }
            _ => {}
        }
        if op == OpCode::Closure {
            let fn_index = ((chunk.code[ip - 2] as usize) << 8) | chunk.code[ip - 1] as usize;
            let captures = match chunk.constants[fn_index] {
                Value::Obj(r) => heap.function(r).upvalue_count,
                _ => 0,
            };
            for _ in 0..captures {
                let is_local = chunk.code[ip] == 1;
                let index = chunk.code[ip + 1];
                ip += 2;
                write!(
                    out,
                    "[{} {index}]",
                    if is_local { "local" } else { "upvalue" }
                )
                .expect("write to string");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_table_is_run_length_encoded() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Pop, 1);
        chunk.write_op(OpCode::Return, 7);
        assert_eq!(chunk.lines.len(), 2);
        assert_eq!(chunk.line_at(0), 1);
        assert_eq!(chunk.line_at(2), 1);
        assert_eq!(chunk.line_at(3), 7);
    }

    #[test]
    fn u16_operands_are_big_endian() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Jump, 1);
        chunk.write_u16(0x1234, 1);
        assert_eq!(chunk.code, vec![OpCode::Jump as u8, 0x12, 0x34]);
    }

    #[test]
    fn identical_constants_are_pooled_once() {
        let mut chunk = Chunk::new();
        let a = chunk.add_constant(Value::Number(1.0));
        let b = chunk.add_constant(Value::Number(2.0));
        let c = chunk.add_constant(Value::Number(1.0));
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(chunk.constants.len(), 2);
    }

    #[test]
    fn opcode_round_trips_through_u8() {
        for op in [OpCode::Constant, OpCode::Dup, OpCode::Closure, OpCode::Return] {
            assert_eq!(OpCode::from(op as u8), op);
        }
    }

    #[test]
    fn render_instruction_stream() {
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Number(3.0));
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(idx as u8, 1);
        chunk.write_op(OpCode::Negate, 1);
        chunk.write_op(OpCode::Return, 1);
        let heap = crate::heap::Heap::new();
        assert_eq!(
            instructions_to_string(&chunk, &heap),
            "Constant(0) Negate Return"
        );
    }
}
