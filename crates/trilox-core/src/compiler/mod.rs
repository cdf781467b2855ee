//! Single-pass Pratt parser and bytecode emitter
//!
//! There is no intermediate AST: every call into a parse function both
//! consumes tokens and writes bytecode. The active `FnCompiler` tracks
//! locals, upvalues and loop context for whichever function body is
//! currently being parsed; `Parser::fc` is the top of that stack, threaded
//! through `enclosing` links rather than a separate `Vec`.

use crate::bytecode::{Chunk, Opcode, SWITCH_DEFAULT_KEY};
use crate::diagnostic::Diagnostic;
use crate::gc::{GcRoots, Heap};
use crate::lexer::Lexer;
use crate::object::{GcRef, ObjFunction, UpvalueDesc};
use crate::token::{Token, TokenKind};
use crate::value::Value;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ARITY: u8 = 255;
const MAX_LOOP_NESTING: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Modulo,
    AddSub,
    MultDiv,
    Exponential,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Modulo,
            Modulo => AddSub,
            AddSub => MultDiv,
            MultDiv => Exponential,
            Exponential => Unary,
            Unary | Call | Primary => Primary,
        }
    }
}

fn infix_precedence(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        LeftParen | LeftSquare | TableOpen | Dot => Precedence::Call,
        Minus | Plus => Precedence::AddSub,
        Star | Slash => Precedence::MultDiv,
        Percent => Precedence::Modulo,
        Caret => Precedence::Exponential,
        Compare | Less | LessEqual | Greater | GreaterEqual | EqualEqual | BangEqual => {
            Precedence::Comparison
        }
        And => Precedence::And,
        Or | Xor => Precedence::Or,
        _ => Precedence::None,
    }
}

#[derive(Clone, Copy)]
struct Local<'src> {
    name: Token<'src>,
    /// `-1` marks "declared but not yet initialised" (can't be referenced
    /// from its own initialiser).
    depth: i32,
    is_captured: bool,
}

struct LoopCtx {
    start: usize,
    /// Number of locals live in the enclosing `FnCompiler` when this loop
    /// was entered (for `each`, this is taken *after* the counter/loop-var
    /// locals are pushed). `continue`/`break` pop everything above this
    /// floor that the loop's own `end_scope` won't reach, since both divert
    /// control flow around it.
    locals_floor: usize,
    break_jumps: Vec<usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FnKind {
    Script,
    Function,
}

struct FnCompiler<'src> {
    enclosing: Option<Box<FnCompiler<'src>>>,
    function: ObjFunction,
    kind: FnKind,
    locals: Vec<Local<'src>>,
    scope_depth: usize,
    upvalues: Vec<UpvalueDesc>,
    loops: Vec<LoopCtx>,
}

impl<'src> FnCompiler<'src> {
    fn new(kind: FnKind, name: Option<GcRef>, enclosing: Option<Box<FnCompiler<'src>>>) -> Self {
        // Slot 0 is reserved for the callee itself (the running closure for
        // a function frame, the script closure for the top level) and is
        // never resolvable by name.
        let reserved = Local {
            name: Token {
                kind: TokenKind::Eof,
                lexeme: "",
                line: 0,
            },
            depth: 0,
            is_captured: false,
        };
        FnCompiler {
            enclosing,
            function: ObjFunction {
                arity: 0,
                upvalue_count: 0,
                chunk: Chunk::new(),
                name,
            },
            kind,
            locals: vec![reserved],
            scope_depth: 0,
            upvalues: Vec::new(),
            loops: Vec::new(),
        }
    }
}

impl<'src> GcRoots for FnCompiler<'src> {
    fn mark_roots(&self, heap: &mut Heap) {
        for constant in &self.function.chunk.constants {
            heap.mark_value(constant);
        }
        if let Some(enclosing) = &self.enclosing {
            enclosing.mark_roots(heap);
        }
    }
}

/// A function whose body is fully compiled: its heap handle plus the
/// upvalue descriptors the `CLOSURE[_16]` instruction needs to capture at
/// activation time.
struct CompiledFn {
    handle: GcRef,
    upvalues: Vec<UpvalueDesc>,
}

pub struct Parser<'src, 'heap> {
    lexer: Lexer<'src>,
    heap: &'heap mut Heap,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
    fc: Box<FnCompiler<'src>>,
}

/// Compiles `source` into a top-level script function, or every diagnostic
/// the parser accumulated if compilation failed (spec §6 entry point).
pub fn compile(source: &str, heap: &mut Heap) -> Result<GcRef, Vec<Diagnostic>> {
    let mut parser = Parser {
        lexer: Lexer::new(source),
        heap,
        previous: Token {
            kind: TokenKind::Error,
            lexeme: "",
            line: 0,
        },
        current: Token {
            kind: TokenKind::Error,
            lexeme: "",
            line: 0,
        },
        had_error: false,
        panic_mode: false,
        diagnostics: Vec::new(),
        fc: Box::new(FnCompiler::new(FnKind::Script, None, None)),
    };
    parser.advance();
    while !parser.check(TokenKind::Eof) {
        parser.declaration();
    }
    parser.emit_return();
    let compiled = parser.end_fn_compiler();
    if parser.had_error {
        Err(parser.diagnostics)
    } else {
        Ok(compiled.handle)
    }
}

impl<'src, 'heap> Parser<'src, 'heap> {
    // -- token stream -------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                return;
            }
            self.error_at_current(self.current.lexeme);
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

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error_at_current(&mut self, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.diagnostics
            .push(Diagnostic::error(self.current.line, message.to_string()));
    }

    fn error(&mut self, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.diagnostics
            .push(Diagnostic::error(self.previous.line, message.to_string()));
    }

    /// Statements aren't newline-terminated here (the lexer is
    /// newline-insensitive); a statement ends at `;`, a `,`/`)`/`end`/`}`
    /// that belongs to an enclosing construct, or end of input.
    fn check_end_statement(&mut self) {
        if self.matches(TokenKind::Semicolon) {
            return;
        }
        if matches!(
            self.current.kind,
            TokenKind::Comma
                | TokenKind::RightParen
                | TokenKind::End
                | TokenKind::RightBrace
                | TokenKind::Eof
        ) {
            return;
        }
        self.error_at_current("Expected end of expression.");
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            match self.current.kind {
                TokenKind::Program
                | TokenKind::End
                | TokenKind::Function
                | TokenKind::Atom
                | TokenKind::Block
                | TokenKind::Var
                | TokenKind::State
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Each
                | TokenKind::Switch
                | TokenKind::Consider
                | TokenKind::Continue
                | TokenKind::Break => return,
                _ => {}
            }
            self.advance();
        }
    }

    // -- bytecode emission ---------------------------------------------

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.fc.function.chunk
    }

    fn emit_op(&mut self, op: Opcode) {
        let line = self.previous.line as i32;
        self.chunk().write_op(op, line);
    }

    fn emit_u8(&mut self, byte: u8) {
        let line = self.previous.line as i32;
        self.chunk().write_u8(byte, line);
    }

    fn emit_bytes(&mut self, op: Opcode, byte: u8) {
        self.emit_op(op);
        self.emit_u8(byte);
    }

    fn emit_u16_operand(&mut self, op: Opcode, value: u16) {
        let line = self.previous.line as i32;
        self.chunk().write_op(op, line);
        self.chunk().write_u16(value, line);
    }

    /// Picks the short or long form of a 16-bit-indexed instruction based on
    /// the actual index, matching the compiler's constant/global/upvalue
    /// encoding rule throughout.
    fn emit_variable(&mut self, value: u16, op8: Opcode, op16: Opcode) {
        if value > u8::MAX as u16 {
            self.emit_u16_operand(op16, value);
        } else {
            self.emit_bytes(op8, value as u8);
        }
    }

    fn emit_return(&mut self) {
        self.emit_op(Opcode::Nil);
        self.emit_op(Opcode::Return);
    }

    fn emit_jump(&mut self, op: Opcode) -> usize {
        let line = self.previous.line as i32;
        self.chunk().emit_jump_placeholder(op, line)
    }

    fn patch_jump(&mut self, offset: usize) {
        self.chunk().patch_jump(offset);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.previous.line as i32;
        self.chunk().emit_loop(loop_start, line);
    }

    fn make_constant(&mut self, value: Value) -> u16 {
        let idx = self.chunk().add_constant(value);
        if idx > u16::MAX as usize {
            self.error_at_current("Too many constants in one chunk.");
            return 0;
        }
        idx as u16
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_variable(idx, Opcode::Constant, Opcode::Constant16);
    }

    fn identifier_constant(&mut self, name: Token<'src>) -> u16 {
        let interned = self.heap.intern(name.lexeme, &*self.fc);
        self.make_constant(Value::Object(interned))
    }

    // -- scopes and locals ----------------------------------------------

    fn begin_scope(&mut self) {
        self.fc.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.fc.scope_depth -= 1;
        while let Some(local) = self.fc.locals.last() {
            if local.depth <= self.fc.scope_depth as i32 {
                break;
            }
            let captured = local.is_captured;
            self.fc.locals.pop();
            if captured {
                self.emit_op(Opcode::CloseUpvalue);
            } else {
                self.emit_op(Opcode::Pop);
            }
        }
    }

    /// Emits pops for every local above `floor` without removing them from
    /// the compiler's bookkeeping — used by `continue`/`break`, which divert
    /// control flow around the scope that would normally pop them.
    fn emit_locals_pop_down_to(&mut self, floor: usize) {
        let captured: Vec<bool> = self.fc.locals[floor..]
            .iter()
            .map(|l| l.is_captured)
            .collect();
        for is_captured in captured.into_iter().rev() {
            if is_captured {
                self.emit_op(Opcode::CloseUpvalue);
            } else {
                self.emit_op(Opcode::Pop);
            }
        }
    }

    fn add_local(&mut self, name: Token<'src>) {
        if self.fc.locals.len() >= MAX_LOCALS {
            self.error_at_current("Too many local variables in a function.");
            return;
        }
        self.fc.locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self, name: Token<'src>) {
        if self.fc.scope_depth == 0 {
            return;
        }
        let mut duplicate = false;
        for local in self.fc.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.fc.scope_depth as i32 {
                break;
            }
            if local.name.lexeme == name.lexeme {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error_at_current("Already a local variable with this name in function.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u16 {
        self.consume(TokenKind::Identifier, message);
        let name = self.previous;
        self.declare_variable(name);
        if self.fc.scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(name)
    }

    fn mark_initialized(&mut self) {
        if self.fc.scope_depth == 0 {
            return;
        }
        let depth = self.fc.scope_depth as i32;
        if let Some(local) = self.fc.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u16) {
        if self.fc.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_variable(global, Opcode::DefineGlobal, Opcode::DefineGlobal16);
    }

    fn resolve_local(fc: &FnCompiler<'src>, name: Token<'src>) -> Option<(u8, bool)> {
        for (i, local) in fc.locals.iter().enumerate().rev() {
            if local.name.lexeme == name.lexeme {
                return Some((i as u8, local.depth == -1));
            }
        }
        None
    }

    fn add_upvalue(fc: &mut FnCompiler<'src>, index: u8, is_local: bool) -> Result<u8, &'static str> {
        for (i, up) in fc.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return Ok(i as u8);
            }
        }
        if fc.upvalues.len() >= MAX_UPVALUES {
            return Err("Too many closure variables in function.");
        }
        fc.upvalues.push(UpvalueDesc { index, is_local });
        fc.function.upvalue_count = fc.upvalues.len();
        Ok((fc.upvalues.len() - 1) as u8)
    }

    fn resolve_upvalue(
        fc: &mut FnCompiler<'src>,
        name: Token<'src>,
    ) -> Result<Option<u8>, &'static str> {
        let Some(enclosing) = fc.enclosing.as_mut() else {
            return Ok(None);
        };
        if let Some((idx, _uninitialized)) = Self::resolve_local(enclosing, name) {
            enclosing.locals[idx as usize].is_captured = true;
            return Self::add_upvalue(fc, idx, true).map(Some);
        }
        if let Some(up) = Self::resolve_upvalue(enclosing, name)? {
            return Self::add_upvalue(fc, up, false).map(Some);
        }
        Ok(None)
    }

    // -- function compilation -------------------------------------------

    fn push_fn_compiler(&mut self, kind: FnKind, name: Option<Token<'src>>) {
        let name_ref = name.map(|t| self.heap.intern(t.lexeme, &*self.fc));
        let mut fresh = Box::new(FnCompiler::new(kind, name_ref, None));
        std::mem::swap(&mut self.fc, &mut fresh);
        self.fc.enclosing = Some(fresh);
    }

    fn end_fn_compiler(&mut self) -> CompiledFn {
        let placeholder = Box::new(FnCompiler::new(FnKind::Function, None, None));
        let finished = std::mem::replace(&mut self.fc, placeholder);
        let FnCompiler {
            enclosing,
            function,
            upvalues,
            ..
        } = *finished;
        if let Some(parent) = enclosing {
            self.fc = parent;
        }
        let handle = self.heap.alloc_function(function, self.fc.as_ref());
        CompiledFn { handle, upvalues }
    }

    fn emit_closure(&mut self, compiled: CompiledFn) {
        let value = Value::Object(compiled.handle);
        let idx = self.make_constant(value);
        self.emit_variable(idx, Opcode::Closure, Opcode::Closure16);
        for up in &compiled.upvalues {
            self.emit_u8(up.is_local as u8);
            self.emit_u8(up.index);
        }
    }

    fn function_params(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' before function input parameters.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.fc.function.arity += 1;
                if self.fc.function.arity > MAX_ARITY {
                    self.error_at_current("Too many input parameters for function.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after function input parameters.");
    }

    /// `function NAME(params) <declarations> end [(return expr)]`.
    fn function_literal(&mut self, name: Option<Token<'src>>) {
        self.push_fn_compiler(FnKind::Function, name);
        self.begin_scope();
        self.function_params();
        self.function_body();
        if self.matches(TokenKind::LeftParen) {
            self.expression();
            self.consume(TokenKind::RightParen, "Expect ')' after return expression.");
            self.emit_op(Opcode::Return);
        } else {
            self.emit_return();
        }
        let compiled = self.end_fn_compiler();
        self.emit_closure(compiled);
    }

    fn function_body(&mut self) {
        while !self.check(TokenKind::End) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::End, "Expect 'end' to close function body.");
    }

    fn function_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect function name.");
        let name = self.previous;
        self.declare_variable(name);
        self.mark_initialized();
        let global = if self.fc.scope_depth == 0 {
            self.identifier_constant(name)
        } else {
            0
        };
        self.function_literal(Some(name));
        self.define_variable(global);
    }

    /// `atom(params) (expr)` — a nullary-style function literal sugar whose
    /// whole body is one expression, wired up as the only use of the
    /// `atom` keyword (spec §9 doesn't require generalising it further).
    fn atom_literal(&mut self) {
        self.push_fn_compiler(FnKind::Function, None);
        self.begin_scope();
        self.function_params();
        self.consume(TokenKind::LeftParen, "Expect '(' to open atom body.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' to close atom body.");
        self.emit_op(Opcode::Return);
        let compiled = self.end_fn_compiler();
        self.emit_closure(compiled);
    }

    // -- statements -------------------------------------------------------

    fn declaration(&mut self) {
        if self.matches(TokenKind::Function) {
            self.function_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(Opcode::Nil);
        }
        self.check_end_statement();
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::Each) {
            self.each_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Consider) {
            self.consider_statement();
        } else if self.matches(TokenKind::Switch) {
            self.switch_statement();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' to close block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.check_end_statement();
        self.emit_op(Opcode::Pop);
    }

    fn if_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Do, "Expect 'do' after condition.");

        if matches!(
            self.current.kind,
            TokenKind::True | TokenKind::Unknown | TokenKind::False
        ) {
            self.ternary_if();
        } else {
            self.two_arm_if();
        }
    }

    /// `if cond do true: ... unknown: ... false: ... end` — any subset, any
    /// order, each arm a `body()`-style declaration list closed by `end`.
    fn ternary_if(&mut self) {
        let true_jump = self.emit_jump(Opcode::JumpIfTrue);
        let unknown_jump = self.emit_jump(Opcode::JumpIfUnknown);
        let false_jump = self.emit_jump(Opcode::JumpIfFalse);
        let mut exit_jumps = Vec::new();
        let mut seen = [false; 3];

        loop {
            let (slot, jump_site) = match self.current.kind {
                TokenKind::True if !seen[0] => (0, true_jump),
                TokenKind::Unknown if !seen[1] => (1, unknown_jump),
                TokenKind::False if !seen[2] => (2, false_jump),
                _ => break,
            };
            seen[slot] = true;
            self.advance();
            self.consume(TokenKind::Colon, "Expect ':' after logical block opener.");
            self.patch_jump(jump_site);
            self.emit_op(Opcode::Pop);
            self.function_body();
            exit_jumps.push(self.emit_jump(Opcode::Jump));
        }

        let omitted = seen.iter().any(|s| !s);
        for (slot, jump_site) in [(0, true_jump), (1, unknown_jump), (2, false_jump)] {
            if !seen[slot] {
                self.patch_jump(jump_site);
            }
        }
        // An omitted arm falls through here rather than into a labelled
        // block, so the dispatch value it never got popped by still needs
        // discarding before the shared exit.
        if omitted {
            self.emit_op(Opcode::Pop);
        }
        for exit in exit_jumps {
            self.patch_jump(exit);
        }
    }

    /// `if cond do stmt [, stmt [, stmt]]` — true-arm mandatory, `,`-gated
    /// unknown- and false-arms optional.
    fn two_arm_if(&mut self) {
        let unknown_jump = self.emit_jump(Opcode::JumpIfUnknown);
        let false_jump = self.emit_jump(Opcode::JumpIfFalse);

        self.emit_op(Opcode::Pop);
        self.statement();
        let end_true_jump = self.emit_jump(Opcode::Jump);

        self.patch_jump(unknown_jump);
        self.emit_op(Opcode::Pop);
        if self.matches(TokenKind::Comma) && !self.check(TokenKind::Comma) {
            self.statement();
        }
        let end_unknown_jump = self.emit_jump(Opcode::Jump);

        self.patch_jump(false_jump);
        self.emit_op(Opcode::Pop);
        if self.matches(TokenKind::Comma) {
            self.statement();
        }

        self.patch_jump(end_true_jump);
        self.patch_jump(end_unknown_jump);
    }

    fn while_statement(&mut self) {
        if self.fc.loops.len() >= MAX_LOOP_NESTING {
            self.error_at_current("Too many nested loops.");
        }
        let loop_start = self.chunk().offset();
        self.fc.loops.push(LoopCtx {
            start: loop_start,
            locals_floor: self.fc.locals.len(),
            break_jumps: Vec::new(),
        });

        self.expression();
        self.consume(TokenKind::Do, "Expect 'do' after condition.");

        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        let unknown_jump = self.emit_jump(Opcode::JumpIfUnknown);
        self.emit_op(Opcode::Pop);

        self.declaration();
        self.emit_loop(loop_start);

        self.patch_jump(unknown_jump);
        if self.matches(TokenKind::Comma) {
            self.declaration();
        }

        self.patch_jump(exit_jump);
        self.emit_op(Opcode::Pop);

        let loop_ctx = self.fc.loops.pop().expect("loop pushed above");
        for jump in loop_ctx.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn each_statement(&mut self) {
        if self.fc.loops.len() >= MAX_LOOP_NESTING {
            self.error_at_current("Too many nested loops.");
        }
        self.begin_scope();

        self.consume(TokenKind::Identifier, "Expect loop variable name after 'each'.");
        let loop_var_name = self.previous;
        let counter_name = Token {
            kind: TokenKind::Identifier,
            lexeme: "counter",
            line: loop_var_name.line,
        };

        self.add_local(counter_name);
        self.mark_initialized();
        self.add_local(loop_var_name);
        self.mark_initialized();
        let counter_slot = (self.fc.locals.len() - 2) as u8;
        let loop_var_slot = (self.fc.locals.len() - 1) as u8;

        self.emit_op(Opcode::Push1);
        self.emit_op(Opcode::Push1);

        self.consume(TokenKind::In, "Expect 'in' after loop variable.");
        self.expression();
        self.consume(TokenKind::Do, "Expect 'do' after loop source expression.");

        let loop_start = self.chunk().offset();
        self.fc.loops.push(LoopCtx {
            start: loop_start,
            locals_floor: self.fc.locals.len(),
            break_jumps: Vec::new(),
        });

        self.emit_op(Opcode::GetArrayCount);
        self.emit_bytes(Opcode::GetLocal, counter_slot);
        self.emit_op(Opcode::KpGtEqual);
        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);

        self.emit_bytes(Opcode::GetLocal, counter_slot);
        self.emit_op(Opcode::GetArrayLoop);
        self.emit_bytes(Opcode::SetLocal, loop_var_slot);
        self.emit_op(Opcode::Pop);

        self.declaration();

        self.emit_op(Opcode::Push1);
        self.emit_bytes(Opcode::GetLocal, counter_slot);
        self.emit_op(Opcode::Add);
        self.emit_bytes(Opcode::SetLocal, counter_slot);
        self.emit_op(Opcode::Pop);

        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(Opcode::Pop);

        let loop_ctx = self.fc.loops.pop().expect("loop pushed above");
        for jump in loop_ctx.break_jumps {
            self.patch_jump(jump);
        }

        self.emit_op(Opcode::Pop);

        self.end_scope();
    }

    fn continue_statement(&mut self) {
        let Some(loop_ctx) = self.fc.loops.last() else {
            self.error("Can't use 'continue' outside of a loop.");
            return;
        };
        let start = loop_ctx.start;
        let floor = loop_ctx.locals_floor;
        self.emit_locals_pop_down_to(floor);
        self.emit_loop(start);
    }

    fn break_statement(&mut self) {
        if self.fc.loops.is_empty() {
            self.error("Can't use 'break' outside of a loop.");
            return;
        }
        let floor = self.fc.loops.last().unwrap().locals_floor;
        self.emit_locals_pop_down_to(floor);
        let jump = self.emit_jump(Opcode::Jump);
        self.fc.loops.last_mut().unwrap().break_jumps.push(jump);
    }

    fn consider_statement(&mut self) {
        let mut end_jumps = Vec::new();
        while self.matches(TokenKind::When) {
            self.expression();
            self.consume(TokenKind::Do, "Expect 'do' after 'when' condition.");
            let false_jump = self.emit_jump(Opcode::JumpIfNotTrue);
            self.emit_op(Opcode::Pop);
            self.statement();
            end_jumps.push(self.emit_jump(Opcode::Jump));
            self.patch_jump(false_jump);
            self.emit_op(Opcode::Pop);
        }

        if self.matches(TokenKind::Else) {
            self.consume(TokenKind::Do, "Expect 'do' after 'else'.");
            self.statement();
        }

        for jump in end_jumps {
            self.patch_jump(jump);
        }
    }

    fn switch_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Do, "Expect 'do' after switch input.");

        let table_idx = self.chunk().add_jump_table();
        if table_idx > u8::MAX as usize {
            self.error_at_current("Too many switch statements in function/script.");
        }
        self.emit_bytes(Opcode::JumpTableJump, table_idx as u8);
        let switch_start = self.chunk().offset();

        let mut end_jumps = Vec::new();
        let mut has_default = false;
        while self.matches(TokenKind::Case) {
            self.consume(TokenKind::String, "Expect string for case label.");
            let lexeme = self.previous.lexeme;
            let literal = &lexeme[1..lexeme.len() - 1];
            let key = self.heap.intern(literal, &*self.fc);
            let offset = (self.chunk().offset() - switch_start) as f64;
            let is_new = self.chunk().jump_tables[table_idx].set(key, Value::Number(offset));
            if !is_new {
                self.error_at_current("Duplicate case label inside switch statement.");
            }
            self.consume(TokenKind::Do, "Expect 'do' after case label.");
            self.emit_op(Opcode::Pop);
            self.statement();
            end_jumps.push(self.emit_jump(Opcode::Jump));
        }
        if end_jumps.is_empty() {
            self.error_at_current("No 'case' arms inside switch statement.");
        }

        let default_key = self.heap.intern(SWITCH_DEFAULT_KEY, &*self.fc);
        if self.matches(TokenKind::Default) {
            self.consume(TokenKind::Do, "Expect 'do' after 'default'.");
            let offset = (self.chunk().offset() - switch_start) as f64;
            self.chunk().jump_tables[table_idx].set(default_key, Value::Number(offset));
            self.emit_op(Opcode::Pop);
            self.statement();
            has_default = true;
        } else {
            let offset = (self.chunk().offset() - switch_start) as f64;
            self.chunk().jump_tables[table_idx].set(default_key, Value::Number(offset));
            self.emit_op(Opcode::Pop);
        }
        let _ = has_default;

        for jump in end_jumps {
            self.patch_jump(jump);
        }
    }

    // -- expressions --------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }

        while precedence <= infix_precedence(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::Nil => self.emit_op(Opcode::Nil),
            TokenKind::False | TokenKind::Unknown | TokenKind::True => self.logic_literal(kind),
            TokenKind::Number => self.number(),
            TokenKind::String => self.string(),
            TokenKind::Identifier => {
                let name = self.previous;
                self.named_variable(name, can_assign);
            }
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Not => self.unary(kind),
            TokenKind::LeftSquare => self.array_literal(),
            TokenKind::TableOpen => self.table_literal(),
            TokenKind::Atom => self.atom_literal(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::LeftParen => self.call(),
            TokenKind::LeftSquare => self.access_array(can_assign),
            TokenKind::TableOpen => self.table_calculated_access(can_assign),
            TokenKind::Dot => self.dot(can_assign),
            _ => self.binary(kind),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn logic_literal(&mut self, kind: TokenKind) {
        match kind {
            TokenKind::False => self.emit_op(Opcode::False),
            TokenKind::Unknown => self.emit_op(Opcode::Unknown),
            TokenKind::True => self.emit_op(Opcode::True),
            _ => unreachable!(),
        }
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        if value == 1.0 {
            self.emit_op(Opcode::Push1);
        } else {
            self.emit_constant(Value::Number(value));
        }
    }

    fn string(&mut self) {
        let lexeme = self.previous.lexeme;
        let literal = &lexeme[1..lexeme.len() - 1];
        let interned = self.heap.intern(literal, &*self.fc);
        self.emit_constant(Value::Object(interned));
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        enum Slot {
            Local(u8),
            Upvalue(u8),
            Global(u16),
        }

        let slot = if let Some((idx, uninitialized)) = Self::resolve_local(&self.fc, name) {
            if uninitialized {
                self.error("Can't read local variable in its own initializer.");
            }
            Slot::Local(idx)
        } else {
            match Self::resolve_upvalue(&mut self.fc, name) {
                Ok(Some(idx)) => Slot::Upvalue(idx),
                Ok(None) => Slot::Global(self.identifier_constant(name)),
                Err(message) => {
                    self.error(message);
                    Slot::Global(0)
                }
            }
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            match slot {
                Slot::Local(idx) => self.emit_bytes(Opcode::SetLocal, idx),
                Slot::Upvalue(idx) => self.emit_bytes(Opcode::SetUpvalue, idx),
                Slot::Global(idx) => self.emit_variable(idx, Opcode::SetGlobal, Opcode::SetGlobal16),
            }
        } else {
            match slot {
                Slot::Local(idx) => self.emit_bytes(Opcode::GetLocal, idx),
                Slot::Upvalue(idx) => self.emit_bytes(Opcode::GetUpvalue, idx),
                Slot::Global(idx) => self.emit_variable(idx, Opcode::GetGlobal, Opcode::GetGlobal16),
            }
        }
    }

    fn unary(&mut self, operator: TokenKind) {
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(Opcode::Negate),
            TokenKind::Not => self.emit_op(Opcode::KpNot),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, operator: TokenKind) {
        let precedence = infix_precedence(operator);
        // Exponentiation is right-associative: parse the right operand at
        // the same precedence rather than one tighter.
        let next = if operator == TokenKind::Caret {
            precedence
        } else {
            precedence.next()
        };
        self.parse_precedence(next);

        let op = match operator {
            TokenKind::Plus => Opcode::Add,
            TokenKind::Minus => Opcode::Subtract,
            TokenKind::Star => Opcode::Multiply,
            TokenKind::Slash => Opcode::Divide,
            TokenKind::Percent => Opcode::Modulo,
            TokenKind::Caret => Opcode::Exponential,
            TokenKind::Compare => Opcode::Compare,
            TokenKind::Less => Opcode::KpLessThan,
            TokenKind::LessEqual => Opcode::KpLtEqual,
            TokenKind::Greater => Opcode::KpGreatThan,
            TokenKind::GreaterEqual => Opcode::KpGtEqual,
            TokenKind::EqualEqual => Opcode::KpEqual,
            TokenKind::BangEqual => Opcode::KpNotEqual,
            TokenKind::And => Opcode::KpAnd,
            TokenKind::Or => Opcode::KpOr,
            TokenKind::Xor => Opcode::KpXor,
            _ => return,
        };
        self.emit_op(op);
    }

    fn call(&mut self) {
        let argc = self.argument_list();
        self.emit_bytes(Opcode::Call, argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count >= MAX_ARITY as u16 {
                    self.error_at_current("Too many arguments passed to function.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn array_literal(&mut self) {
        let array = self.heap.alloc_array(Vec::new(), self.fc.as_ref());
        self.emit_constant(Value::Object(array));

        let mut count: u16 = 0;
        while !self.check(TokenKind::RightSquare) && !self.check(TokenKind::Eof) {
            self.expression();
            self.matches(TokenKind::Comma);
            if count + 1 > u8::MAX as u16 {
                self.error_at_current("Arrays must be less than 256 items.");
            }
            count += 1;
        }
        self.consume(TokenKind::RightSquare, "Expect ']' at the end of array literal.");
        self.emit_bytes(Opcode::Collect, count as u8);
    }

    fn access_array(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightSquare, "Expect ']' after array index.");

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(Opcode::SetArray);
        } else {
            self.emit_op(Opcode::GetArray);
        }
    }

    fn table_literal(&mut self) {
        let table = self.heap.alloc_table(self.fc.as_ref());
        self.emit_constant(Value::Object(table));

        while !self.check(TokenKind::RightSquare) && !self.check(TokenKind::Eof) {
            self.consume(TokenKind::Identifier, "Expect identifier before ':' in table literal.");
            let name = self.previous;
            let key = self.identifier_constant(name);
            self.consume(TokenKind::Colon, "Expect ':' after identifier in table literal.");
            self.expression();
            if !self.check(TokenKind::RightSquare) {
                self.consume(TokenKind::Comma, "Expect ',' between entries in table literal.");
            }
            self.emit_variable(key, Opcode::TableSet, Opcode::TableSet16);
        }
        self.consume(TokenKind::RightSquare, "Expect ']' after table literal.");
    }

    fn table_calculated_access(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightSquare, "Expect ']' after table access.");

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(Opcode::TableClcSet);
        } else {
            self.emit_op(Opcode::TableClcGet);
        }
    }

    /// `table.field` sugar for a statically-known table key — the original
    /// scanner's `.` token had no grammar production even though the VM
    /// already carries `TABLE_GET[_16]` for exactly this shape; wiring it up
    /// reuses `TABLE_SET[_16]` for assignment the same way table-literal
    /// construction does.
    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous;
        let key = self.identifier_constant(name);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_variable(key, Opcode::TableSet, Opcode::TableSet16);
        } else {
            self.emit_variable(key, Opcode::TableGet, Opcode::TableGet16);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::disassemble_chunk;
    use crate::config::VmConfig;

    fn compile_ok(source: &str) -> (GcRef, Heap) {
        let mut heap = Heap::new(&VmConfig::default());
        let handle = compile(source, &mut heap).unwrap_or_else(|diags| {
            panic!("unexpected compile errors: {diags:?}");
        });
        (handle, heap)
    }

    fn compile_err(source: &str) -> Vec<Diagnostic> {
        let mut heap = Heap::new(&VmConfig::default());
        compile(source, &mut heap).expect_err("expected a compile error")
    }

    #[test]
    fn compiles_simple_arithmetic() {
        let (handle, _heap) = compile_ok("var x = 1 + 2");
        let function = handle.as_function().unwrap();
        let text = disassemble_chunk(&function.chunk, "script");
        assert!(text.contains("DefineGlobal"));
    }

    #[test]
    fn numeric_literal_one_uses_push1() {
        let (handle, _heap) = compile_ok("1");
        let function = handle.as_function().unwrap();
        assert!(function.chunk.code.contains(&(Opcode::Push1 as u8)));
        assert!(!function.chunk.code.contains(&(Opcode::Constant as u8)));
    }

    #[test]
    fn undefined_assignment_target_is_an_error() {
        let diags = compile_err("1 + 2 = 3");
        assert!(!diags.is_empty());
    }

    #[test]
    fn local_shadowing_in_same_scope_is_an_error() {
        let diags = compile_err("{ var x = 1; var x = 2 }");
        assert!(diags
            .iter()
            .any(|d| d.message.contains("Already a local variable")));
    }

    #[test]
    fn continue_outside_loop_is_an_error() {
        let diags = compile_err("continue");
        assert!(diags
            .iter()
            .any(|d| d.message.contains("outside of a loop")));
    }

    #[test]
    fn function_body_requires_end() {
        let diags = compile_err("function f() var x = 1");
        assert!(!diags.is_empty());
    }

    #[test]
    fn recursive_function_compiles_closure() {
        let (handle, _heap) =
            compile_ok("function fact(n) var r = 1; if n > 1 do r = n * fact(n - 1) end (r) disp(fact(5))");
        let function = handle.as_function().unwrap();
        assert!(function.chunk.code.contains(&(Opcode::Closure as u8)));
    }

    #[test]
    fn switch_allocates_a_jump_table() {
        let (handle, _heap) = compile_ok(
            "switch \"two\" do case \"one\" do disp(1); case \"two\" do disp(2); default do disp(0)",
        );
        let function = handle.as_function().unwrap();
        assert_eq!(function.chunk.jump_tables.len(), 1);
        assert!(function.chunk.jump_tables[0].len() >= 2);
    }
}
