//! Single-pass Pratt compiler
//!
//! Parses the token stream once and emits bytecode directly, with no AST.
//! A stack of per-function states tracks locals, scope depth, and upvalue
//! descriptors; a parallel stack of class states tracks `this`/`super`
//! legality. Forward control flow uses two-byte back-patched jumps;
//! backward control flow computes its offset at emit time.
//!
//! Errors set panic mode to silence cascades and re-synchronize at
//! statement boundaries, so one compile reports every independent mistake.

use stoat_vm_bytecode::{Chunk, ObjRef, OpCode, Value};
use stoat_vm_core::object::FunctionObj;
use stoat_vm_core::{Heap, Object};

use crate::error::{CompileErrors, Diagnostic, Location};
use crate::scanner::Scanner;
use crate::token::{Token, TokenKind};

/// Local slots addressable by a one-byte operand, including slot 0.
const MAX_LOCALS: usize = 256;
/// Upvalues addressable by a one-byte operand.
const MAX_UPVALUES: usize = 256;
/// Constant-pool ceiling reachable through `ConstantLong`.
const MAX_CONSTANTS: usize = 65536;
/// Pending case-exit jumps a single `switch` may accumulate.
const MAX_CASES: usize = 256;

/// Compile `source` into a top-level script function allocated on `heap`.
///
/// On failure every diagnostic has already been printed to stderr; the
/// returned [`CompileErrors`] carries them for the caller.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, CompileErrors> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.finish()
}

/// Operator precedence, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,  // =
    Conditional, // ?:
    Or,          // or
    And,         // and
    Equality,    // == !=
    Comparison,  // < > <= >=
    Term,        // + - %
    Factor,      // * /
    Unary,       // ! -
    Call,        // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Conditional,
            Precedence::Conditional => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'h> = fn(&mut Compiler<'src, 'h>, bool);

struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

/// What kind of function body is being compiled; decides slot 0 and the
/// implicit return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// A local variable while its scope is live.
struct Local<'src> {
    name: &'src str,
    /// Scope depth, or -1 while declared but not yet initialized.
    depth: i32,
    /// Captured by some nested closure; close instead of pop at scope exit.
    is_captured: bool,
}

/// Compile-time description of one upvalue capture.
#[derive(Debug, Clone, Copy)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// Per-function compile state. The chain of these (leaf last) is the
/// function-compiler stack; upvalue resolution walks it outward.
struct FuncState<'src> {
    kind: FunctionKind,
    name: Option<ObjRef>,
    arity: u16,
    chunk: Chunk,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    /// Chunk offset the innermost enclosing loop restarts at; -1 outside
    /// any loop. `continue` targets this.
    loop_start: i32,
    /// Scope depth just outside the innermost loop; `continue` pops
    /// locals deeper than this.
    loop_scope_depth: i32,
}

impl<'src> FuncState<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        // Slot 0 belongs to the callee: `this` in methods, unreferencable
        // otherwise.
        let slot_zero = Local {
            name: match kind {
                FunctionKind::Method | FunctionKind::Initializer => "this",
                _ => "",
            },
            depth: 0,
            is_captured: false,
        };
        Self {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
            loop_start: -1,
            loop_scope_depth: 0,
        }
    }
}

/// Per-class compile state.
struct ClassState {
    has_superclass: bool,
}

struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    heap: &'h mut Heap,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
    funcs: Vec<FuncState<'src>>,
    classes: Vec<ClassState>,
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Self {
        let placeholder = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 0,
        };
        Self {
            scanner: Scanner::new(source),
            heap,
            current: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            funcs: vec![FuncState::new(FunctionKind::Script, None)],
            classes: Vec::new(),
        }
    }

    fn finish(mut self) -> Result<ObjRef, CompileErrors> {
        self.emit_return();
        let state = self.funcs.pop().expect("script compiler state");
        if self.had_error {
            return Err(CompileErrors {
                diagnostics: self.diagnostics,
            });
        }
        Ok(self.heap.alloc(Object::Function(FunctionObj {
            arity: 0,
            upvalue_count: 0,
            chunk: state.chunk,
            name: None,
        })))
    }

    // ---- Token plumbing ---------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // ---- Errors -----------------------------------------------------------

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let diagnostic = Diagnostic {
            line: token.line,
            location: match token.kind {
                TokenKind::Eof => Location::End,
                TokenKind::Error => Location::Unknown,
                _ => Location::Lexeme(token.lexeme.to_string()),
            },
            message: message.to_string(),
        };
        eprintln!("{diagnostic}");
        self.diagnostics.push(diagnostic);
        self.had_error = true;
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return
                | TokenKind::Switch
                | TokenKind::Continue => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- State access -----------------------------------------------------

    fn current_func(&self) -> &FuncState<'src> {
        self.funcs.last().expect("function compiler stack")
    }

    fn current_func_mut(&mut self) -> &mut FuncState<'src> {
        self.funcs.last_mut().expect("function compiler stack")
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.current_func_mut().chunk
    }

    fn chunk_len(&self) -> usize {
        self.current_func().chunk.code.len()
    }

    // ---- Emission ---------------------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.to_byte());
    }

    fn emit_ops(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_return(&mut self) {
        if self.current_func().kind == FunctionKind::Initializer {
            self.emit_ops(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn emit_constant(&mut self, value: Value) {
        let line = self.previous.line;
        let index = self.chunk().write_constant(value, line);
        if index >= MAX_CONSTANTS {
            self.error("Too many constants in one chunk.");
        }
    }

    /// Pool a constant addressed by a one-byte operand (names, functions).
    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.chunk().add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // Account for the operand itself.
        let jump = self.chunk_len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let bytes = (jump as u16).to_be_bytes();
        let chunk = self.chunk();
        chunk.code[offset] = bytes[0];
        chunk.code[offset + 1] = bytes[1];
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk_len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let bytes = (offset as u16).to_be_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }

    // ---- Scopes & variables -----------------------------------------------

    fn begin_scope(&mut self) {
        self.current_func_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_func_mut().scope_depth -= 1;
        loop {
            let captured = {
                let state = self.current_func();
                match state.locals.last() {
                    Some(local) if local.depth > state.scope_depth => local.is_captured,
                    _ => break,
                }
            };
            if captured {
                // The value escapes; hoist it into its upvalue.
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.current_func_mut().locals.pop();
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let s = self.heap.intern(name);
        self.make_constant(Value::object(s))
    }

    fn add_local(&mut self, name: &'src str) {
        if self.current_func().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.current_func_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.current_func().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let state = self.current_func();
        let mut duplicate = false;
        for local in state.locals.iter().rev() {
            if local.depth != -1 && local.depth < state.scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let state = self.current_func_mut();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        if let Some(local) = state.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.current_func().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme;
        self.identifier_constant(name)
    }

    fn define_variable(&mut self, global: u8) {
        if self.current_func().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_ops(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, func_index: usize, name: &str) -> Option<u8> {
        let mut found = None;
        for (slot, local) in self.funcs[func_index].locals.iter().enumerate().rev() {
            if local.name == name {
                found = Some((slot, local.depth == -1));
                break;
            }
        }
        match found {
            Some((_, true)) => {
                self.error("Can't read local variable in its own initializer.");
                Some(0)
            }
            Some((slot, false)) => Some(slot as u8),
            None => None,
        }
    }

    /// Resolve a capture: mark the source local and thread an upvalue
    /// descriptor through every compiler between it and the use site.
    fn resolve_upvalue(&mut self, func_index: usize, name: &str) -> Option<u8> {
        if func_index == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(func_index - 1, name) {
            self.funcs[func_index - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(func_index, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(func_index - 1, name) {
            return Some(self.add_upvalue(func_index, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, func_index: usize, index: u8, is_local: bool) -> u8 {
        let upvalues = &self.funcs[func_index].upvalues;
        for (i, upvalue) in upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return i as u8;
            }
        }
        if upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        let count = self.funcs[func_index].upvalues.len();
        self.funcs[func_index]
            .upvalues
            .push(UpvalueDesc { index, is_local });
        count as u8
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let top = self.funcs.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(top, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(index) = self.resolve_upvalue(top, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, index)
        } else {
            // Late-bound global; may error at runtime.
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_ops(set_op, arg);
        } else {
            self.emit_ops(get_op, arg);
        }
    }

    // ---- Expressions ------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = Self::get_rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::get_rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = Self::get_rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let content = &lexeme[1..lexeme.len() - 1];
        let mut chars = String::with_capacity(content.len());
        let mut iter = content.chars();
        while let Some(c) = iter.next() {
            if c == '\\' {
                match iter.next() {
                    Some('"') => chars.push('"'),
                    Some('\\') => chars.push('\\'),
                    Some(other) => {
                        chars.push('\\');
                        chars.push(other);
                    }
                    None => chars.push('\\'),
                }
            } else {
                chars.push(c);
            }
        }
        let s = self.heap.intern_owned(chars);
        self.emit_constant(Value::object(s));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let rule = Self::get_rule(operator);
        self.parse_precedence(rule.precedence.next());
        match operator {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
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
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Percent => self.emit_op(OpCode::Modulus),
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    /// `a ? b : c`: both branches compile unconditionally; the fold
    /// picks one at runtime.
    fn conditional(&mut self, _can_assign: bool) {
        self.parse_precedence(Precedence::Conditional);
        self.consume(
            TokenKind::Colon,
            "Expect ':' after then branch of conditional operator.",
        );
        self.parse_precedence(Precedence::Assignment);
        self.emit_op(OpCode::Conditional);
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_ops(OpCode::Call, argc);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let lexeme = self.previous.lexeme;
        let name = self.identifier_constant(lexeme);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_ops(OpCode::SetProperty, name);
        } else if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_ops(OpCode::Invoke, name);
            self.emit_byte(argc);
        } else {
            self.emit_ops(OpCode::GetProperty, name);
        }
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.")
            }
            _ => {}
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let lexeme = self.previous.lexeme;
        let name = self.identifier_constant(lexeme);

        self.named_variable("this", false);
        if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit_ops(OpCode::SuperInvoke, name);
            self.emit_byte(argc);
        } else {
            self.named_variable("super", false);
            self.emit_ops(OpCode::GetSuper, name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc.min(255) as u8
    }

    fn get_rule(kind: TokenKind) -> ParseRule<'src, 'h> {
        let rule = |prefix: Option<ParseFn<'src, 'h>>,
                    infix: Option<ParseFn<'src, 'h>>,
                    precedence: Precedence| ParseRule {
            prefix,
            infix,
            precedence,
        };

        match kind {
            TokenKind::LeftParen => rule(Some(Self::grouping), Some(Self::call), Precedence::Call),
            TokenKind::Dot => rule(None, Some(Self::dot), Precedence::Call),
            TokenKind::Minus => rule(Some(Self::unary), Some(Self::binary), Precedence::Term),
            TokenKind::Plus => rule(None, Some(Self::binary), Precedence::Term),
            TokenKind::Percent => rule(None, Some(Self::binary), Precedence::Term),
            TokenKind::Slash => rule(None, Some(Self::binary), Precedence::Factor),
            TokenKind::Star => rule(None, Some(Self::binary), Precedence::Factor),
            TokenKind::Question => {
                rule(None, Some(Self::conditional), Precedence::Conditional)
            }
            TokenKind::Bang => rule(Some(Self::unary), None, Precedence::None),
            TokenKind::BangEqual | TokenKind::EqualEqual => {
                rule(None, Some(Self::binary), Precedence::Equality)
            }
            TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => rule(None, Some(Self::binary), Precedence::Comparison),
            TokenKind::Identifier => rule(Some(Self::variable), None, Precedence::None),
            TokenKind::String => rule(Some(Self::string), None, Precedence::None),
            TokenKind::Number => rule(Some(Self::number), None, Precedence::None),
            TokenKind::And => rule(None, Some(Self::and_), Precedence::And),
            TokenKind::Or => rule(None, Some(Self::or_), Precedence::Or),
            TokenKind::False | TokenKind::Nil | TokenKind::True => {
                rule(Some(Self::literal), None, Precedence::None)
            }
            TokenKind::Super => rule(Some(Self::super_), None, Precedence::None),
            TokenKind::This => rule(Some(Self::this_), None, Precedence::None),
            _ => rule(None, None, Precedence::None),
        }
    }

    // ---- Declarations & statements ----------------------------------------

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Switch) {
            self.switch_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let surrounding_start = self.current_func().loop_start;
        let surrounding_depth = self.current_func().loop_scope_depth;
        let loop_start = self.chunk_len();
        let scope_depth = self.current_func().scope_depth;
        let state = self.current_func_mut();
        state.loop_start = loop_start as i32;
        state.loop_scope_depth = scope_depth;

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);

        let state = self.current_func_mut();
        state.loop_start = surrounding_start;
        state.loop_scope_depth = surrounding_depth;
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let surrounding_start = self.current_func().loop_start;
        let surrounding_depth = self.current_func().loop_scope_depth;
        let scope_depth = self.current_func().scope_depth;
        let loop_start = self.chunk_len();
        let state = self.current_func_mut();
        state.loop_start = loop_start as i32;
        state.loop_scope_depth = scope_depth;

        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            // Jump over the increment, run the body, loop back to the
            // increment, which then loops to the condition.
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            let start = self.current_func().loop_start as usize;
            self.emit_loop(start);
            self.current_func_mut().loop_start = increment_start as i32;
            self.patch_jump(body_jump);
        }

        self.statement();
        let start = self.current_func().loop_start as usize;
        self.emit_loop(start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }

        let state = self.current_func_mut();
        state.loop_start = surrounding_start;
        state.loop_scope_depth = surrounding_depth;
        self.end_scope();
    }

    fn continue_statement(&mut self) {
        if self.current_func().loop_start == -1 {
            self.error("Can't use 'continue' outside of a loop.");
            return;
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");

        // Discard locals belonging to scopes inside the loop.
        let state = self.current_func();
        let depth = state.loop_scope_depth;
        let pops = state
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > depth)
            .count();
        for _ in 0..pops {
            self.emit_op(OpCode::Pop);
        }

        let start = self.current_func().loop_start as usize;
        self.emit_loop(start);
    }

    /// `switch` compiles to a chain of `Dup`/`Equal` tests. States:
    /// 0 before any case, 1 inside a case, 2 after `default`.
    fn switch_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after value.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before switch cases.");

        let mut state = 0;
        let mut case_ends: Vec<usize> = Vec::new();
        let mut previous_case_skip: Option<usize> = None;

        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.matches(TokenKind::Case) || self.matches(TokenKind::Default) {
                let case_kind = self.previous.kind;

                if state == 2 {
                    self.error("Can't have another case or default after the default case.");
                }
                if state == 1 {
                    // The previous case ran to completion: jump to the end,
                    // then land the failed test here and drop its result.
                    case_ends.push(self.emit_jump(OpCode::Jump));
                    if case_ends.len() > MAX_CASES {
                        self.error("Too many cases in switch statement.");
                    }
                    if let Some(skip) = previous_case_skip.take() {
                        self.patch_jump(skip);
                        self.emit_op(OpCode::Pop);
                    }
                }

                if case_kind == TokenKind::Case {
                    state = 1;
                    self.emit_op(OpCode::Dup);
                    self.expression();
                    self.consume(TokenKind::Colon, "Expect ':' after case value.");
                    self.emit_op(OpCode::Equal);
                    previous_case_skip = Some(self.emit_jump(OpCode::JumpIfFalse));
                    self.emit_op(OpCode::Pop);
                } else {
                    state = 2;
                    self.consume(TokenKind::Colon, "Expect ':' after 'default'.");
                    previous_case_skip = None;
                }
            } else {
                if state == 0 {
                    self.error("Can't have statements before any case.");
                }
                self.statement();
            }
        }

        // A trailing non-default case still needs its exit and its failed
        // test landed.
        if state == 1 {
            case_ends.push(self.emit_jump(OpCode::Jump));
            if let Some(skip) = previous_case_skip.take() {
                self.patch_jump(skip);
                self.emit_op(OpCode::Pop);
            }
        }

        self.consume(TokenKind::RightBrace, "Expect '}' after switch cases.");
        for end in case_ends {
            self.patch_jump(end);
        }
        self.emit_op(OpCode::Pop); // the subject
    }

    fn return_statement(&mut self) {
        if self.current_func().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_func().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may refer to itself; it is initialized as soon as
        // its name is bound.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    /// Compile a function body into a fresh compiler state, then emit the
    /// `Closure` instruction with its capture pairs in the enclosing one.
    fn function(&mut self, kind: FunctionKind) {
        let name = self.heap.intern(self.previous.lexeme);
        self.funcs.push(FuncState::new(kind, Some(name)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let state = self.current_func_mut();
                state.arity += 1;
                if state.arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        self.emit_return();
        let state = self.funcs.pop().expect("function compiler state");
        let upvalues = state.upvalues;
        let function = FunctionObj {
            arity: state.arity.min(255) as u8,
            upvalue_count: upvalues.len() as u16,
            chunk: state.chunk,
            name: state.name,
        };
        let function = self.heap.alloc(Object::Function(function));
        let constant = self.make_constant(Value::object(function));
        self.emit_ops(OpCode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let lexeme = self.previous.lexeme;
        let constant = self.identifier_constant(lexeme);
        let kind = if lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_ops(OpCode::Method, constant);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable();

        self.emit_ops(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassState {
            has_superclass: false,
        });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);

            if class_name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }

            // Bind the superclass to a synthetic scoped `super` local so
            // method bodies can capture it.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name.lexeme, false);
            self.emit_op(OpCode::Inherit);
            self.classes
                .last_mut()
                .expect("class compiler state")
                .has_superclass = true;
        }

        self.named_variable(class_name.lexeme, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self
            .classes
            .last()
            .expect("class compiler state")
            .has_superclass
        {
            self.end_scope();
        }
        self.classes.pop();
    }
}
