use std::collections::HashSet;

use crate::chunk::{Chunk, OpCode};
use crate::heap::{Heap, ObjRef};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::object::{Function, Obj};
use crate::table::Table;
use crate::value::Value;

#[derive(Debug, Clone, thiserror::Error)]
#[error("[line {line}] error{location}: {message}")]
pub struct CompileError {
    pub line: u32,
    pub location: String,
    pub message: String,
}

/// The compiled top-level script plus the global-slot layout its bytecode
/// assumes. Slot `i` belongs to `global_names[i]`; the first slots are the
/// predeclared native functions.
pub struct Script {
    pub function: ObjRef,
    pub global_names: Vec<String>,
}

/// Single pass: tokens in, bytecode out, no syntax tree in between. On any
/// error the compiler keeps parsing (panic-mode recovery at statement
/// boundaries) and reports every diagnostic it collected.
pub fn compile(source: &str, heap: &mut Heap) -> Result<Script, Vec<CompileError>> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.match_token(&TokenKind::Eof) {
        compiler.declaration();
        compiler.maybe_collect();
    }
    compiler.finish()
}

const MAX_PARAMS: usize = 255;
const MAX_UPVALUES: usize = 255;
const MAX_LOCALS: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Call,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local {
    name: String,
    /// -1 while declared but not yet initialized, so `var a = a;` is caught.
    depth: i32,
    captured: bool,
    mutable: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
    mutable: bool,
}

/// One per function being compiled; the vector is the parent chain, with the
/// innermost function last.
struct FnContext {
    function: Function,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl FnContext {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> FnContext {
        // Slot zero belongs to the callee: the receiver inside methods,
        // unnameable otherwise.
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
                "this".to_string()
            } else {
                String::new()
            },
            depth: 0,
            captured: false,
            mutable: false,
        };
        FnContext {
            function: Function::new(name),
            kind,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct Compiler<'src, 'h> {
    lexer: Lexer<'src>,
    previous: Token,
    current: Token,
    errors: Vec<CompileError>,
    panic_mode: bool,
    contexts: Vec<FnContext>,
    class_depth: usize,
    /// Global symbol table: interned name -> mutability marker carrying the
    /// assigned slot. Never consulted at runtime.
    globals: Table,
    global_names: Vec<String>,
    /// Slots handed out for names that were referenced before being
    /// declared; their mutability is still negotiable.
    implicit_globals: HashSet<u16>,
    heap: &'h mut Heap,
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Compiler<'src, 'h> {
        let mut compiler = Compiler {
            lexer: Lexer::new(source),
            previous: Token::eof(1),
            current: Token::eof(1),
            errors: Vec::new(),
            panic_mode: false,
            contexts: vec![FnContext::new(FunctionKind::Script, None)],
            class_depth: 0,
            globals: Table::new(),
            global_names: Vec::new(),
            implicit_globals: HashSet::new(),
            heap,
        };
        // Native host functions occupy the first global slots; the VM fills
        // them in before running.
        for &(name, _, _) in crate::vm::natives::NATIVES {
            let slot = compiler.new_global_slot(name);
            let key = compiler.heap.intern(name);
            let hash = compiler.heap.string_hash(key);
            compiler.globals.set(key, hash, Value::ImmutableGlobal(slot));
        }
        compiler
    }

    fn finish(mut self) -> Result<Script, Vec<CompileError>> {
        self.emit_return();
        if !self.errors.is_empty() {
            return Err(self.errors);
        }
        let ctx = match self.contexts.pop() {
            Some(ctx) => ctx,
            None => unreachable!("script context always present"),
        };
        let function = self.heap.alloc(Obj::Function(ctx.function));
        Ok(Script {
            function,
            global_names: self.global_names,
        })
    }

    // ---- Token plumbing ----

    fn advance(&mut self) {
        self.previous = std::mem::replace(&mut self.current, Token::eof(0));
        loop {
            self.current = self.lexer.next_token();
            if let TokenKind::Error(message) = &self.current.kind {
                let message = message.clone();
                self.error_at_current(&message);
            } else {
                break;
            }
        }
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current.kind) == std::mem::discriminant(kind)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: &TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn consume_ident(&mut self, message: &str) -> String {
        if let TokenKind::Ident(name) = &self.current.kind {
            let name = name.clone();
            self.advance();
            name
        } else {
            self.error_at_current(message);
            String::new()
        }
    }

    // ---- Error reporting ----

    fn error(&mut self, message: &str) {
        let (line, location) = Self::describe(&self.previous);
        self.report(line, location, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let (line, location) = Self::describe(&self.current);
        self.report(line, location, message);
    }

    fn describe(token: &Token) -> (u32, String) {
        let location = match &token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error(_) => String::new(),
            kind => format!(" at '{}'", lexeme(kind)),
        };
        (token.line, location)
    }

    fn report(&mut self, line: u32, location: String, message: &str) {
        // Panic mode: one diagnostic per cascade, resynchronized at the next
        // statement boundary.
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(CompileError {
            line,
            location,
            message: message.to_string(),
        });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(&TokenKind::Eof) {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::Let
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::When
                | TokenKind::Print
                | TokenKind::Assert
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // ---- Emitters ----

    fn ctx(&mut self) -> &mut FnContext {
        match self.contexts.last_mut() {
            Some(ctx) => ctx,
            None => unreachable!("compiler context stack is never empty"),
        }
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.ctx().function.chunk
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.chunk().write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk().write(byte, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.previous.line;
        self.chunk().write_u16(value, line);
    }

    fn emit_return(&mut self) {
        if self.ctx().kind == FunctionKind::Initializer {
            // `init` implicitly returns the receiver.
            self.emit_op(OpCode::GetLocal);
            self.emit_u16(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u16 {
        let idx = self.chunk().add_constant(value);
        if idx > u16::MAX as usize {
            self.error("too many constants in one chunk");
            return 0;
        }
        idx as u16
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        if idx < 256 {
            self.emit_op(OpCode::Constant);
            self.emit_byte(idx as u8);
        } else {
            self.emit_op(OpCode::ConstantLong);
            self.emit_u16(idx);
        }
    }

    /// Emit a forward jump with a two-byte placeholder; returns the offset
    /// to patch once the target is known.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_u16(0xffff);
        self.chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let distance = self.chunk().code.len() - offset - 2;
        if distance > u16::MAX as usize {
            self.error("too much code to jump over");
            return;
        }
        let code = &mut self.chunk().code;
        code[offset] = (distance >> 8) as u8;
        code[offset + 1] = (distance & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let distance = self.chunk().code.len() - loop_start + 2;
        if distance > u16::MAX as usize {
            self.error("loop body too large");
            self.emit_u16(0);
            return;
        }
        self.emit_u16(distance as u16);
    }

    // ---- Declarations ----

    fn declaration(&mut self) {
        if self.match_token(&TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(&TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(&TokenKind::Var) {
            self.var_declaration(true);
        } else if self.match_token(&TokenKind::Let) {
            self.var_declaration(false);
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self, mutable: bool) {
        let name = self.consume_ident("expected variable name");
        let is_local = self.ctx().scope_depth > 0;
        if is_local {
            self.declare_local(&name, mutable);
        }
        if self.match_token(&TokenKind::Equal) {
            self.expression();
        } else {
            if !mutable {
                self.error("'let' binding requires an initializer");
            }
            self.emit_op(OpCode::Nil);
        }
        self.consume(&TokenKind::Semicolon, "expected ';' after declaration");
        if is_local {
            self.mark_initialized();
        } else {
            let slot = self.declare_global(&name, mutable);
            self.emit_op(OpCode::DefineGlobal);
            self.emit_u16(slot);
        }
    }

    fn fun_declaration(&mut self) {
        let name = self.consume_ident("expected function name");
        let is_local = self.ctx().scope_depth > 0;
        if is_local {
            // Initialized immediately so the body may recurse.
            self.declare_local(&name, false);
            self.mark_initialized();
            self.function_body(FunctionKind::Function, &name);
        } else {
            let slot = self.declare_global(&name, true);
            self.function_body(FunctionKind::Function, &name);
            self.emit_op(OpCode::DefineGlobal);
            self.emit_u16(slot);
        }
    }

    fn class_declaration(&mut self) {
        let name = self.consume_ident("expected class name");
        let name_ref = self.heap.intern(&name);
        let name_const = self.make_constant(Value::Obj(name_ref));

        let is_local = self.ctx().scope_depth > 0;
        if is_local {
            self.declare_local(&name, false);
        }
        self.emit_op(OpCode::Class);
        self.emit_u16(name_const);
        if is_local {
            self.mark_initialized();
        } else {
            let slot = self.declare_global(&name, true);
            self.emit_op(OpCode::DefineGlobal);
            self.emit_u16(slot);
        }

        // Reload the class so method definitions can attach to it.
        self.named_variable(&name, false);
        self.class_depth += 1;
        self.consume(&TokenKind::LBrace, "expected '{' before class body");
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            self.method();
        }
        self.consume(&TokenKind::RBrace, "expected '}' after class body");
        self.emit_op(OpCode::Pop);
        self.class_depth -= 1;
    }

    fn method(&mut self) {
        let name = self.consume_ident("expected method name");
        let name_ref = self.heap.intern(&name);
        let name_const = self.make_constant(Value::Obj(name_ref));
        let kind = if name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function_body(kind, &name);
        self.emit_op(OpCode::Method);
        self.emit_u16(name_const);
    }

    /// Compile a parameter list and body in a fresh function context, then
    /// emit the closure-creation sequence into the enclosing chunk.
    fn function_body(&mut self, kind: FunctionKind, name: &str) {
        let name_ref = self.heap.intern(name);
        self.contexts.push(FnContext::new(kind, Some(name_ref)));
        self.begin_scope();

        self.consume(&TokenKind::LParen, "expected '(' after function name");
        if !self.check(&TokenKind::RParen) {
            loop {
                let arity = self.ctx().function.arity;
                if arity as usize == MAX_PARAMS {
                    self.error_at_current("can't have more than 255 parameters");
                }
                self.ctx().function.arity = arity.wrapping_add(1);
                let param = self.consume_ident("expected parameter name");
                self.declare_local(&param, true);
                self.mark_initialized();
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RParen, "expected ')' after parameters");
        self.consume(&TokenKind::LBrace, "expected '{' before function body");
        self.block();
        self.emit_return();

        let ctx = match self.contexts.pop() {
            Some(ctx) => ctx,
            None => unreachable!("function context just pushed"),
        };
        let upvalues = ctx.upvalues;
        let mut function = ctx.function;
        function.upvalue_count = upvalues.len();
        let function_ref = self.heap.alloc(Obj::Function(function));

        let idx = self.make_constant(Value::Obj(function_ref));
        self.emit_op(OpCode::Closure);
        self.emit_u16(idx);
        for up in upvalues {
            self.emit_byte(up.is_local as u8);
            self.emit_byte(up.index);
        }
    }

    // ---- Statements ----

    fn statement(&mut self) {
        if self.match_token(&TokenKind::Print) {
            self.expression();
            self.consume(&TokenKind::Semicolon, "expected ';' after value");
            self.emit_op(OpCode::Print);
        } else if self.match_token(&TokenKind::Assert) {
            self.expression();
            self.consume(&TokenKind::Semicolon, "expected ';' after assertion");
            self.emit_op(OpCode::Assert);
        } else if self.match_token(&TokenKind::If) {
            self.if_statement();
        } else if self.match_token(&TokenKind::While) {
            self.while_statement();
        } else if self.match_token(&TokenKind::For) {
            self.for_statement();
        } else if self.match_token(&TokenKind::When) {
            self.when_statement();
        } else if self.match_token(&TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(&TokenKind::LBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression();
            self.consume(&TokenKind::Semicolon, "expected ';' after expression");
            self.emit_op(OpCode::Pop);
        }
    }

    fn block(&mut self) {
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            self.declaration();
        }
        self.consume(&TokenKind::RBrace, "expected '}' after block");
    }

    fn if_statement(&mut self) {
        self.consume(&TokenKind::LParen, "expected '(' after 'if'");
        self.expression();
        self.consume(&TokenKind::RParen, "expected ')' after condition");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(&TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().code.len();
        self.consume(&TokenKind::LParen, "expected '(' after 'while'");
        self.expression();
        self.consume(&TokenKind::RParen, "expected ')' after condition");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    /// `for` is sugar for `while` plus an initializer and an increment that
    /// runs after the body, which costs one extra pair of jumps.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(&TokenKind::LParen, "expected '(' after 'for'");
        if self.match_token(&TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(&TokenKind::Var) {
            self.var_declaration(true);
        } else if self.match_token(&TokenKind::Let) {
            self.var_declaration(false);
        } else {
            self.expression();
            self.consume(&TokenKind::Semicolon, "expected ';' after loop initializer");
            self.emit_op(OpCode::Pop);
        }

        let mut loop_start = self.chunk().code.len();
        let mut exit_jump = None;
        if !self.match_token(&TokenKind::Semicolon) {
            self.expression();
            self.consume(&TokenKind::Semicolon, "expected ';' after loop condition");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(&TokenKind::RParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(&TokenKind::RParen, "expected ')' after for clauses");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.ctx().kind == FunctionKind::Script {
            self.error("can't return from top-level code");
        }
        if self.match_token(&TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.ctx().kind == FunctionKind::Initializer {
                self.error("can't return a value from an initializer");
            }
            self.expression();
            self.consume(&TokenKind::Semicolon, "expected ';' after return value");
            self.emit_op(OpCode::Return);
        }
    }

    /// Lower a `when` statement to duplicate-and-compare chains. The subject
    /// stays on the stack while arms are tested; every arm body starts with
    /// both the test result and the subject popped.
    fn when_statement(&mut self) {
        self.expression();
        self.consume(&TokenKind::LBrace, "expected '{' after 'when' subject");

        let mut end_jumps = Vec::new();
        let mut saw_default = false;

        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            if self.match_token(&TokenKind::Nothing) {
                self.consume(&TokenKind::Arrow, "expected '->' after 'nothing'");
                self.emit_op(OpCode::Pop); // subject
                self.statement();
                saw_default = true;
                break;
            }

            self.when_condition();
            while self.match_token(&TokenKind::Pipe) {
                // Alternation short-circuits like `or`.
                let else_jump = self.emit_jump(OpCode::JumpIfFalse);
                let matched_jump = self.emit_jump(OpCode::Jump);
                self.patch_jump(else_jump);
                self.emit_op(OpCode::Pop);
                self.when_condition();
                self.patch_jump(matched_jump);
            }
            self.consume(&TokenKind::Arrow, "expected '->' after 'when' condition");

            let fail_jump = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop); // test result
            self.emit_op(OpCode::Pop); // subject
            self.statement();
            end_jumps.push(self.emit_jump(OpCode::Jump));
            self.patch_jump(fail_jump);
            self.emit_op(OpCode::Pop); // failed test result
        }

        if !saw_default {
            self.error("'when' requires a final 'nothing ->' branch");
        }
        self.consume(&TokenKind::RBrace, "expected '}' after 'when' branches");
        for jump in end_jumps {
            self.patch_jump(jump);
        }
    }

    /// One condition: equality `expr`, or half-open range `lo..hi`.
    /// Leaves `[subject, bool]` on the stack.
    fn when_condition(&mut self) {
        self.emit_op(OpCode::Dup);
        self.parse_precedence(Precedence::Or);
        if self.match_token(&TokenKind::DotDot) {
            // subject >= lo, spelled !(subject < lo)
            self.emit_op(OpCode::Less);
            self.emit_op(OpCode::Not);
            // and-chain into the upper bound
            let fail_jump = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop);
            self.emit_op(OpCode::Dup);
            self.parse_precedence(Precedence::Or);
            self.emit_op(OpCode::Less);
            self.patch_jump(fail_jump);
        } else {
            self.emit_op(OpCode::Equal);
        }
    }

    // ---- Scope and variable resolution ----

    fn begin_scope(&mut self) {
        self.ctx().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.ctx().scope_depth -= 1;
        loop {
            let ctx = match self.contexts.last() {
                Some(ctx) => ctx,
                None => unreachable!("compiler context stack is never empty"),
            };
            match ctx.locals.last() {
                Some(local) if local.depth > ctx.scope_depth => {
                    // Captured locals migrate into their upvalues instead of
                    // being discarded.
                    if local.captured {
                        self.emit_op(OpCode::CloseUpvalue);
                    } else {
                        self.emit_op(OpCode::Pop);
                    }
                    self.ctx().locals.pop();
                }
                _ => break,
            }
        }
    }

    fn declare_local(&mut self, name: &str, mutable: bool) {
        if self.ctx().locals.len() == MAX_LOCALS {
            self.error("too many local variables in function");
            return;
        }
        let depth = self.ctx().scope_depth;
        let shadowing = self
            .ctx()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth == depth)
            .any(|l| l.name == name);
        if shadowing {
            self.error("a variable with this name already exists in this scope");
        }
        self.ctx().locals.push(Local {
            name: name.to_string(),
            depth: -1,
            captured: false,
            mutable,
        });
    }

    fn mark_initialized(&mut self) {
        let depth = self.ctx().scope_depth;
        if let Some(local) = self.ctx().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn new_global_slot(&mut self, name: &str) -> u16 {
        if self.global_names.len() == u16::MAX as usize {
            self.error("too many global variables");
            return 0;
        }
        self.global_names.push(name.to_string());
        (self.global_names.len() - 1) as u16
    }

    /// Declare (or redeclare) a global. Redeclaration with the same
    /// mutability rebinds the same slot; changing mutability is an error.
    fn declare_global(&mut self, name: &str, mutable: bool) -> u16 {
        let key = self.heap.intern(name);
        let hash = self.heap.string_hash(key);
        let existing = match self.globals.get(key, hash) {
            Some(Value::MutableGlobal(slot)) => Some((slot, true)),
            Some(Value::ImmutableGlobal(slot)) => Some((slot, false)),
            Some(_) => unreachable!("global table holds only mutability markers"),
            None => None,
        };
        let slot = match existing {
            None => self.new_global_slot(name),
            Some((slot, was_mutable)) => {
                // The first real declaration of a forward-referenced name
                // settles its mutability.
                let was_implicit = self.implicit_globals.remove(&slot);
                if !was_implicit && was_mutable != mutable {
                    self.error(&format!(
                        "cannot redeclare '{name}' with different mutability"
                    ));
                }
                slot
            }
        };
        let value = if mutable {
            Value::MutableGlobal(slot)
        } else {
            Value::ImmutableGlobal(slot)
        };
        self.globals.set(key, hash, value);
        slot
    }

    /// Resolve a name for reading or assignment, handing out an implicit
    /// slot for globals referenced before their declaration.
    fn resolve_global(&mut self, name: &str) -> (u16, bool) {
        let key = self.heap.intern(name);
        let hash = self.heap.string_hash(key);
        match self.globals.get(key, hash) {
            Some(Value::MutableGlobal(slot)) => (slot, true),
            Some(Value::ImmutableGlobal(slot)) => (slot, false),
            Some(_) => unreachable!("global table holds only mutability markers"),
            None => {
                let slot = self.new_global_slot(name);
                self.globals.set(key, hash, Value::MutableGlobal(slot));
                self.implicit_globals.insert(slot);
                (slot, true)
            }
        }
    }

    fn resolve_local(&mut self, ctx_index: usize, name: &str) -> Option<(usize, bool)> {
        let mut uninitialized = false;
        let found = {
            let ctx = &self.contexts[ctx_index];
            ctx.locals
                .iter()
                .enumerate()
                .rev()
                .find(|(_, l)| l.name == name)
                .map(|(i, l)| {
                    if l.depth == -1 {
                        uninitialized = true;
                    }
                    (i, l.mutable)
                })
        };
        if uninitialized {
            self.error("can't read local variable in its own initializer");
        }
        found
    }

    /// Search enclosing compiler contexts for `name`, recording the capture
    /// path as upvalue descriptors on the way back down.
    fn resolve_upvalue(&mut self, ctx_index: usize, name: &str) -> Option<(u8, bool)> {
        if ctx_index == 0 {
            return None;
        }
        if let Some((local_index, mutable)) = self.resolve_local(ctx_index - 1, name) {
            self.contexts[ctx_index - 1].locals[local_index].captured = true;
            if local_index > u8::MAX as usize {
                self.error("too many locals precede this captured variable");
                return None;
            }
            return self.add_upvalue(ctx_index, local_index as u8, true, mutable);
        }
        if let Some((upvalue_index, mutable)) = self.resolve_upvalue(ctx_index - 1, name) {
            return self.add_upvalue(ctx_index, upvalue_index, false, mutable);
        }
        None
    }

    fn add_upvalue(
        &mut self,
        ctx_index: usize,
        index: u8,
        is_local: bool,
        mutable: bool,
    ) -> Option<(u8, bool)> {
        let desc = UpvalueDesc {
            index,
            is_local,
            mutable,
        };
        let upvalues = &mut self.contexts[ctx_index].upvalues;
        if let Some(existing) = upvalues.iter().position(|u| *u == desc) {
            return Some((existing as u8, mutable));
        }
        if upvalues.len() == MAX_UPVALUES {
            self.error("too many closed-over variables in function");
            return None;
        }
        upvalues.push(desc);
        Some(((upvalues.len() - 1) as u8, mutable))
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let innermost = self.contexts.len() - 1;
        let (get_op, set_op, slot, mutable) =
            if let Some((index, mutable)) = self.resolve_local(innermost, name) {
                (OpCode::GetLocal, OpCode::SetLocal, index as u16, mutable)
            } else if let Some((index, mutable)) = self.resolve_upvalue(innermost, name) {
                (OpCode::GetUpvalue, OpCode::SetUpvalue, index as u16, mutable)
            } else {
                let (slot, mutable) = self.resolve_global(name);
                (OpCode::GetGlobal, OpCode::SetGlobal, slot, mutable)
            };

        if can_assign && self.match_token(&TokenKind::Equal) {
            if !mutable {
                self.error(&format!("cannot assign to immutable binding '{name}'"));
            }
            self.expression();
            self.emit_op(set_op);
        } else {
            self.emit_op(get_op);
        }
        self.emit_u16(slot);
    }

    // ---- Expressions (precedence climbing) ----

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix_rule(can_assign) {
            self.error("expected expression");
            return;
        }
        while precedence <= infix_precedence(&self.current.kind) {
            self.advance();
            self.infix_rule(can_assign);
        }
        if can_assign && self.match_token(&TokenKind::Equal) {
            self.error("invalid assignment target");
        }
    }

    /// Returns false when the previous token cannot begin an expression.
    fn prefix_rule(&mut self, can_assign: bool) -> bool {
        let kind = self.previous.kind.clone();
        match kind {
            TokenKind::LParen => {
                self.expression();
                self.consume(&TokenKind::RParen, "expected ')' after expression");
            }
            TokenKind::Minus => {
                self.parse_precedence(Precedence::Unary);
                self.emit_op(OpCode::Negate);
            }
            TokenKind::Bang => {
                self.parse_precedence(Precedence::Unary);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Number(n) => self.emit_constant(Value::Number(n)),
            TokenKind::Str(s) => {
                let r = self.heap.intern(&s);
                self.emit_constant(Value::Obj(r));
            }
            TokenKind::Ident(name) => self.named_variable(&name, can_assign),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::This => {
                if self.class_depth == 0 {
                    self.error("can't use 'this' outside of a class");
                }
                self.named_variable("this", false);
            }
            _ => return false,
        }
        true
    }

    fn infix_rule(&mut self, can_assign: bool) {
        let kind = self.previous.kind.clone();
        match kind {
            TokenKind::LParen => self.call(),
            TokenKind::Dot => self.dot(can_assign),
            TokenKind::And => self.and_operator(),
            TokenKind::Or => self.or_operator(),
            operator => self.binary(&operator),
        }
    }

    fn binary(&mut self, operator: &TokenKind) {
        let precedence = infix_precedence(operator);
        self.parse_precedence(precedence.next());
        match operator {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => self.error("expected binary operator"),
        }
    }

    fn and_operator(&mut self) {
        let short_circuit = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(short_circuit);
    }

    fn or_operator(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let mut argc: usize = 0;
        if !self.check(&TokenKind::RParen) {
            loop {
                self.expression();
                if argc == MAX_PARAMS {
                    self.error("can't have more than 255 arguments");
                }
                argc += 1;
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RParen, "expected ')' after arguments");
        self.emit_op(OpCode::Call);
        self.emit_byte(argc.min(MAX_PARAMS) as u8);
    }

    fn dot(&mut self, can_assign: bool) {
        let name = self.consume_ident("expected property name after '.'");
        let name_ref = self.heap.intern(&name);
        let name_const = self.make_constant(Value::Obj(name_ref));
        if can_assign && self.match_token(&TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetProperty);
        } else {
            self.emit_op(OpCode::GetProperty);
        }
        self.emit_u16(name_const);
    }

    // ---- Cooperation with the collector ----

    /// The compiler allocates strings and function objects; between
    /// declarations it offers the heap a chance to collect, enumerating
    /// everything under construction as roots.
    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let contexts = &self.contexts;
        let globals = &self.globals;
        self.heap.collect(|h| {
            for ctx in contexts {
                if let Some(name) = ctx.function.name {
                    h.mark_object(name);
                }
                for v in &ctx.function.chunk.constants {
                    h.mark_value(*v);
                }
            }
            for (key, _) in globals.iter() {
                h.mark_object(key);
            }
        });
    }
}

fn infix_precedence(kind: &TokenKind) -> Precedence {
    match kind {
        TokenKind::Or => Precedence::Or,
        TokenKind::And => Precedence::And,
        TokenKind::EqualEqual | TokenKind::BangEqual => Precedence::Equality,
        TokenKind::Greater
        | TokenKind::GreaterEqual
        | TokenKind::Less
        | TokenKind::LessEqual => Precedence::Comparison,
        TokenKind::Plus | TokenKind::Minus => Precedence::Term,
        TokenKind::Star | TokenKind::Slash => Precedence::Factor,
        TokenKind::LParen | TokenKind::Dot => Precedence::Call,
        _ => Precedence::None,
    }
}

/// Source spelling of a token for error messages.
fn lexeme(kind: &TokenKind) -> String {
    match kind {
        TokenKind::LParen => "(".to_string(),
        TokenKind::RParen => ")".to_string(),
        TokenKind::LBrace => "{".to_string(),
        TokenKind::RBrace => "}".to_string(),
        TokenKind::Semicolon => ";".to_string(),
        TokenKind::Comma => ",".to_string(),
        TokenKind::Dot => ".".to_string(),
        TokenKind::DotDot => "..".to_string(),
        TokenKind::Arrow => "->".to_string(),
        TokenKind::Pipe => "|".to_string(),
        TokenKind::Minus => "-".to_string(),
        TokenKind::Plus => "+".to_string(),
        TokenKind::Star => "*".to_string(),
        TokenKind::Slash => "/".to_string(),
        TokenKind::Bang => "!".to_string(),
        TokenKind::BangEqual => "!=".to_string(),
        TokenKind::Equal => "=".to_string(),
        TokenKind::EqualEqual => "==".to_string(),
        TokenKind::Greater => ">".to_string(),
        TokenKind::GreaterEqual => ">=".to_string(),
        TokenKind::Less => "<".to_string(),
        TokenKind::LessEqual => "<=".to_string(),
        TokenKind::And => "and".to_string(),
        TokenKind::Assert => "assert".to_string(),
        TokenKind::Class => "class".to_string(),
        TokenKind::Else => "else".to_string(),
        TokenKind::False => "false".to_string(),
        TokenKind::For => "for".to_string(),
        TokenKind::Fun => "fun".to_string(),
        TokenKind::If => "if".to_string(),
        TokenKind::Let => "let".to_string(),
        TokenKind::Nil => "nil".to_string(),
        TokenKind::Nothing => "nothing".to_string(),
        TokenKind::Or => "or".to_string(),
        TokenKind::Print => "print".to_string(),
        TokenKind::Return => "return".to_string(),
        TokenKind::This => "this".to_string(),
        TokenKind::True => "true".to_string(),
        TokenKind::Var => "var".to_string(),
        TokenKind::When => "when".to_string(),
        TokenKind::While => "while".to_string(),
        TokenKind::Number(n) => crate::value::format_number(*n),
        TokenKind::Str(s) => format!("\"{s}\""),
        TokenKind::Ident(name) => name.clone(),
        TokenKind::Newline => "\\n".to_string(),
        TokenKind::Error(message) => message.clone(),
        TokenKind::Eof => "end".to_string(),
    }
}
