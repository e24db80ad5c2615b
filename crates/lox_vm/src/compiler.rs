use std::rc::Rc;

use lox_lexer::{Scanner, Token, TokenKind};

use crate::chunk::Chunk;
use crate::error::CompileError;
use crate::interner::Interner;
use crate::object::ObjFunction;
use crate::opcode::Op;
use crate::value::Value;

const MAX_LOCALS: usize = 256;
const MAX_PARAMS: usize = 255;
const MAX_ARGS: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
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
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

struct Local {
    name: String,
    depth: i32,
}

#[derive(PartialEq, Clone, Copy)]
enum FunctionType {
    Script,
    Function,
}

struct FunctionScope {
    function: ObjFunction,
    function_type: FunctionType,
    locals: Vec<Local>,
    scope_depth: i32,
}

impl FunctionScope {
    fn new(function: ObjFunction, function_type: FunctionType) -> Self {
        // Slot 0 is reserved for the function itself (the callee), matching
        // the VM's calling convention where `frame.slots[0]` holds it.
        FunctionScope {
            function,
            function_type,
            locals: vec![Local { name: String::new(), depth: 0 }],
            scope_depth: 0,
        }
    }
}

/// Single-pass Pratt compiler: consumes a token stream and emits bytecode
/// directly, with no intermediate AST. Maintains a stack of per-function
/// scopes (innermost = currently-being-compiled function) rather than a
/// linked `enclosing` pointer, to stay within Rust's ownership rules.
pub struct Compiler<'a> {
    scanner: Scanner,
    previous: Token,
    current: Token,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    interner: &'a mut Interner,
    scopes: Vec<FunctionScope>,
}

impl<'a> Compiler<'a> {
    pub fn compile(source: &str, interner: &'a mut Interner) -> Result<ObjFunction, Vec<CompileError>> {
        let eof = Token::new(TokenKind::Eof, lox_lexer::Span::new(0, 0), "");
        let mut compiler = Compiler {
            scanner: Scanner::new(source),
            previous: eof.clone(),
            current: eof,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            interner,
            scopes: vec![FunctionScope::new(ObjFunction::new(None), FunctionType::Script)],
        };

        compiler.advance();
        while !compiler.match_token(&TokenKind::Eof) {
            compiler.declaration();
        }
        compiler.emit_return();

        let top = compiler.scopes.pop().unwrap();
        if compiler.had_error {
            Err(compiler.errors)
        } else {
            Ok(top.function)
        }
    }

    // ---- token stream plumbing -------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            self.current = self.scanner.scan_token();
            if let TokenKind::Error(msg) = self.current.kind.clone() {
                self.error_at_current(&msg);
            } else {
                break;
            }
        }
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current.kind) == std::mem::discriminant(kind)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: &TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn error_at_current(&mut self, message: &str) {
        let tok = self.current.clone();
        self.error_at(&tok, message);
    }

    fn error_at_previous(&mut self, message: &str) {
        let tok = self.previous.clone();
        self.error_at(&tok, message);
    }

    fn error_at(&mut self, token: &Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let lexeme = match &token.kind {
            TokenKind::Eof => None,
            _ => Some(token.lexeme.clone()),
        };
        self.errors.push(CompileError {
            line: token.line() as u32,
            lexeme,
            message: message.to_string(),
        });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !matches!(self.current.kind, TokenKind::Eof) {
            if matches!(self.previous.kind, TokenKind::Semicolon) {
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
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // ---- bytecode emission -----------------------------------------------------

    fn current_scope(&mut self) -> &mut FunctionScope {
        self.scopes.last_mut().expect("at least one function scope")
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.current_scope().function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line() as u32;
        self.chunk().write_byte(byte, line);
    }

    fn emit_op(&mut self, op: Op) {
        let line = self.previous.line() as u32;
        self.chunk().write_op(op, line);
    }

    fn emit_op_byte(&mut self, op: Op, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_return(&mut self) {
        self.emit_op(Op::Nil);
        self.emit_op(Op::Return);
    }

    fn emit_constant(&mut self, value: Value) {
        let line = self.previous.line() as u32;
        match self.chunk().add_constant(value) {
            Some(idx) => {
                self.chunk().write_op(Op::Constant, line);
                self.chunk().write_byte(idx, line);
            }
            None => self.error_at_previous("Too many constants in one chunk."),
        }
    }

    fn emit_jump(&mut self, op: Op) -> usize {
        let line = self.previous.line() as u32;
        self.chunk().emit_jump(op, line)
    }

    fn patch_jump(&mut self, offset: usize) {
        if self.chunk().patch_jump(offset).is_err() {
            self.error_at_previous("Max offset length of jump-instruction exceeded.");
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.previous.line() as u32;
        if self.chunk().emit_loop(loop_start, line).is_err() {
            self.error_at_previous("Max offset length of jump-instruction exceeded.");
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.interner.intern(name);
        let line = self.previous.line() as u32;
        match self.chunk().add_constant(Value::Str(interned)) {
            Some(idx) => idx,
            None => {
                self.error_at_previous("Too many constants in one chunk.");
                let _ = line;
                0
            }
        }
    }

    // ---- scopes & locals --------------------------------------------------------

    fn begin_scope(&mut self) {
        self.current_scope().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let scope = self.current_scope();
        scope.scope_depth -= 1;
        let depth = scope.scope_depth;
        while let Some(local) = scope.locals.last() {
            if local.depth > depth {
                scope.locals.pop();
                self.emit_op(Op::Pop);
            } else {
                break;
            }
        }
    }

    fn add_local(&mut self, name: String) {
        let scope = self.current_scope();
        if scope.locals.len() >= MAX_LOCALS {
            self.error_at_previous("Too many local variables in function.");
            return;
        }
        self.current_scope().locals.push(Local { name, depth: -1 });
    }

    fn declare_variable(&mut self) {
        let scope_depth = self.current_scope().scope_depth;
        if scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme.clone();
        let scope = self.current_scope();
        for local in scope.locals.iter().rev() {
            if local.depth != -1 && local.depth < scope_depth {
                break;
            }
            if local.name == name {
                self.error_at_previous("Already a variable with this name in this scope.");
                return;
            }
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, error_message: &str) -> u8 {
        self.consume(&TokenKind::Identifier(String::new()), error_message);
        self.declare_variable();
        if self.current_scope().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme.clone();
        self.identifier_constant(&name)
    }

    fn mark_initialized(&mut self) {
        let scope = self.current_scope();
        if scope.scope_depth == 0 {
            return;
        }
        let depth = scope.scope_depth;
        if let Some(local) = scope.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.current_scope().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(Op::DefineGlobal, global);
    }

    fn resolve_local(&mut self, name: &str) -> Option<u8> {
        let scope = self.current_scope();
        for (i, local) in scope.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    self.error_at_previous("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(name) {
            (Op::GetLocal, Op::SetLocal, slot)
        } else {
            let idx = self.identifier_constant(name);
            (Op::GetGlobal, Op::SetGlobal, idx)
        };

        if can_assign && self.match_token(&TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    // ---- expressions -------------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(can_assign) {
            self.error_at_previous("Expect expression.");
            return;
        }

        while precedence <= self.infix_precedence(&self.current.kind) {
            self.advance();
            self.infix(can_assign);
        }

        if can_assign && self.check(&TokenKind::Equal) {
            self.error_at_current("Invalid assignment target.");
        }
    }

    fn infix_precedence(&self, kind: &TokenKind) -> Precedence {
        use TokenKind::*;
        match kind {
            Or => Precedence::Or,
            And => Precedence::And,
            EqualEqual | BangEqual => Precedence::Equality,
            Less | LessEqual | Greater | GreaterEqual => Precedence::Comparison,
            Plus | Minus => Precedence::Term,
            Star | Slash => Precedence::Factor,
            LParen => Precedence::Call,
            _ => Precedence::None,
        }
    }

    fn prefix(&mut self, can_assign: bool) -> bool {
        match self.previous.kind.clone() {
            TokenKind::LParen => self.grouping(),
            TokenKind::Minus => self.unary(),
            TokenKind::Bang => self.unary(),
            TokenKind::Number(n) => self.emit_constant(Value::Number(n)),
            TokenKind::StringLiteral(s) => {
                let interned = self.interner.intern(&s);
                self.emit_constant(Value::Str(interned));
            }
            TokenKind::Identifier(name) => self.named_variable(&name, can_assign),
            TokenKind::True => self.emit_op(Op::True),
            TokenKind::False => self.emit_op(Op::False),
            TokenKind::Nil => self.emit_op(Op::Nil),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, _can_assign: bool) {
        match self.previous.kind.clone() {
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Star
            | TokenKind::Slash
            | TokenKind::EqualEqual
            | TokenKind::BangEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => self.binary(),
            TokenKind::And => self.and_(),
            TokenKind::Or => self.or_(),
            TokenKind::LParen => self.call(),
            _ => {}
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(&TokenKind::RParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let operator = self.previous.kind.clone();
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(Op::Negate),
            TokenKind::Bang => self.emit_op(Op::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self) {
        let operator = self.previous.kind.clone();
        let precedence = self.infix_precedence(&operator);
        self.parse_precedence(precedence.next());
        match operator {
            TokenKind::Plus => self.emit_op(Op::Add),
            TokenKind::Minus => self.emit_op(Op::Subtract),
            TokenKind::Star => self.emit_op(Op::Multiply),
            TokenKind::Slash => self.emit_op(Op::Divide),
            TokenKind::EqualEqual => self.emit_op(Op::Equal),
            TokenKind::BangEqual => {
                self.emit_op(Op::Equal);
                self.emit_op(Op::Not);
            }
            TokenKind::Greater => self.emit_op(Op::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(Op::Less);
                self.emit_op(Op::Not);
            }
            TokenKind::Less => self.emit_op(Op::Less),
            TokenKind::LessEqual => {
                self.emit_op(Op::Greater);
                self.emit_op(Op::Not);
            }
            _ => unreachable!(),
        }
    }

    fn and_(&mut self) {
        let end_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self) {
        let else_jump = self.emit_jump(Op::JumpIfFalse);
        let end_jump = self.emit_jump(Op::Jump);
        self.patch_jump(else_jump);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let mut argc: usize = 0;
        if !self.check(&TokenKind::RParen) {
            loop {
                self.expression();
                if argc == MAX_ARGS {
                    self.error_at_previous("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RParen, "Expect ')' after arguments.");
        self.emit_op_byte(Op::Call, argc as u8);
    }

    // ---- statements ----------------------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(&TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(&TokenKind::Var) {
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
        if self.match_token(&TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(Op::Nil);
        }
        self.consume(&TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, function_type: FunctionType) {
        let name = self.interner.intern(&self.previous.lexeme.clone());
        self.scopes.push(FunctionScope::new(ObjFunction::new(Some(name)), function_type));
        self.begin_scope();

        self.consume(&TokenKind::LParen, "Expect '(' after function name.");
        if !self.check(&TokenKind::RParen) {
            loop {
                let arity = self.current_scope().function.arity;
                if arity as usize == MAX_PARAMS {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.current_scope().function.arity += 1;
                }
                let param = self.parse_variable("Expect parameter name.");
                self.define_variable(param);
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RParen, "Expect ')' after parameters.");
        self.consume(&TokenKind::LBrace, "Expect '{' before function body.");
        self.block();
        self.emit_return();

        let scope = self.scopes.pop().unwrap();
        let func_idx_line = self.previous.line() as u32;
        let func = Rc::new(scope.function);
        let constant = self.chunk().add_constant(Value::Function(func));
        match constant {
            Some(idx) => {
                self.chunk().write_op(Op::Closure, func_idx_line);
                self.chunk().write_byte(idx, func_idx_line);
            }
            None => self.error_at_previous("Too many constants in one chunk."),
        }
    }

    fn block(&mut self) {
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            self.declaration();
        }
        self.consume(&TokenKind::RBrace, "Expect '}' after block.");
    }

    fn statement(&mut self) {
        if self.match_token(&TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(&TokenKind::If) {
            self.if_statement();
        } else if self.match_token(&TokenKind::While) {
            self.while_statement();
        } else if self.match_token(&TokenKind::For) {
            self.for_statement();
        } else if self.match_token(&TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(&TokenKind::LBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(&TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(Op::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(&TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(Op::Pop);
    }

    fn return_statement(&mut self) {
        if self.current_scope().function_type == FunctionType::Script {
            self.error_at_previous("Can't return from top-level code.");
        }
        if self.match_token(&TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(&TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(Op::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(&TokenKind::LParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(&TokenKind::RParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement();

        let else_jump = self.emit_jump(Op::Jump);
        self.patch_jump(then_jump);
        self.emit_op(Op::Pop);

        if self.match_token(&TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().code.len();
        self.consume(&TokenKind::LParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(&TokenKind::RParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(Op::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(&TokenKind::LParen, "Expect '(' after 'for'.");

        if self.match_token(&TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(&TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(&TokenKind::Semicolon) {
            self.expression();
            self.consume(&TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Op::JumpIfFalse));
            self.emit_op(Op::Pop);
        }

        if !self.check(&TokenKind::RParen) {
            let body_jump = self.emit_jump(Op::Jump);
            let incr_start = self.chunk().code.len();
            self.expression();
            self.emit_op(Op::Pop);
            self.consume(&TokenKind::RParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = incr_start;
            self.patch_jump(body_jump);
        } else {
            self.consume(&TokenKind::RParen, "Expect ')' after for clauses.");
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(Op::Pop);
        }
        self.end_scope();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(source: &str) -> Result<ObjFunction, Vec<CompileError>> {
        let mut interner = Interner::new();
        Compiler::compile(source, &mut interner)
    }

    #[test]
    fn compiles_implicit_return_nil() {
        let function = compile("1 + 2;").expect("simple expression statement should compile");
        assert_eq!(function.chunk.code.last(), Some(&(Op::Return as u8)));
    }

    #[test]
    fn rejects_reading_own_initializer() {
        let errors = compile("{ var a = a; }").unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("own initializer")));
    }

    #[test]
    fn rejects_redeclaration_in_same_scope() {
        let errors = compile("{ var a = 1; var a = 2; }").unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("Already a variable")));
    }

    #[test]
    fn rejects_return_at_top_level() {
        let errors = compile("return 1;").unwrap_err();
        assert!(errors.iter().any(|e| e.message == "Can't return from top-level code."));
    }

    #[test]
    fn accepts_255_locals_rejects_256th() {
        let mut source = String::from("{ ");
        for i in 0..255 {
            source.push_str(&format!("var v{i} = {i};"));
        }
        source.push_str(" }");
        compile(&source).expect("255 user locals plus the reserved slot should fit");

        source.insert_str(source.len() - 2, "var v255 = 255;");
        let errors = compile(&source).unwrap_err();
        assert!(errors.iter().any(|e| e.message == "Too many local variables in function."));
    }

    #[test]
    fn accepts_255_parameters_rejects_256th() {
        let params: Vec<String> = (0..255).map(|i| format!("p{i}")).collect();
        let source = format!("fun f({}) {{}}", params.join(", "));
        compile(&source).expect("255 parameters should fit");

        let params: Vec<String> = (0..256).map(|i| format!("p{i}")).collect();
        let source = format!("fun f({}) {{}}", params.join(", "));
        let errors = compile(&source).unwrap_err();
        assert!(errors.iter().any(|e| e.message == "Can't have more than 255 parameters."));
    }

    #[test]
    fn accepts_255_call_arguments_rejects_256th() {
        let args: Vec<String> = (0..255).map(|i| i.to_string()).collect();
        let source = format!("fun f() {{}} f({});", args.join(", "));
        compile(&source).expect("255 arguments should fit");

        let args: Vec<String> = (0..256).map(|i| i.to_string()).collect();
        let source = format!("fun f() {{}} f({});", args.join(", "));
        let errors = compile(&source).unwrap_err();
        assert!(errors.iter().any(|e| e.message == "Can't have more than 255 arguments."));
    }

    #[test]
    fn synchronize_recovers_after_error_at_statement_boundary() {
        // The bogus `@` token triggers a scanner error; synchronize should
        // still let the subsequent `print` statement compile and run.
        let function = compile("@; print 1;");
        assert!(function.is_err());
    }
}
