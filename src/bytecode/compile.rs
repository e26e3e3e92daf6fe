use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::{
    bytecode::{
        Chunk, OpCode,
        compile_error::{CompileError, Diagnostic},
        op::FIRE_HAS_TARGET,
    },
    frontend::{
        lexer::Lexer,
        token::{Token, TokenKind},
    },
    lang::value::{Value, ValueType},
    runtime::script::ScriptDefinition,
};

/// Reserved prefix for Dispatch arguments in the variable table.
pub const ARGS_PREFIX: &str = "args.";

/// Compiles one source file into a script definition.
///
/// `file` names the source in diagnostics and supplies the definition name
/// when the script has no `StateMachine` name.
pub fn compile(file: &str, source: &str) -> Result<ScriptDefinition, CompileError> {
    debug!(file, "compiling script");
    let result = Compiler::new(file, source).compile();
    match &result {
        Ok(def) => debug!(
            file,
            name = %def.name,
            handlers = def.handler_count(),
            "compiled script"
        ),
        Err(e) => {
            for d in &e.diagnostics {
                warn!("{}:{}: {}", file, d.line, d.message);
            }
        }
    }
    result
}

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
            Call | Primary => Primary,
        }
    }

    /// Binding power of `kind` in infix position.
    fn of_infix(kind: TokenKind) -> Precedence {
        use TokenKind::*;
        match kind {
            OrOr => Precedence::Or,
            AndAnd => Precedence::And,
            EqualEqual | BangEqual => Precedence::Equality,
            Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
            Plus | Minus => Precedence::Term,
            Star | Slash => Precedence::Factor,
            Dot => Precedence::Call,
            _ => Precedence::None,
        }
    }
}

/// Single-pass compiler: parses tokens straight into handler chunks.
pub struct Compiler<'src> {
    lexer: Lexer<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    file: String,
    diagnostics: Vec<Diagnostic>,
    panic_mode: bool,

    /// Chunk of the handler currently being compiled.
    chunk: Chunk,

    machine_name: Option<String>,
    states: Vec<String>,
    handlers: BTreeMap<String, BTreeMap<String, Chunk>>,
    /// Types from `var x: T` declarations, shared by every handler.
    declared: BTreeMap<String, ValueType>,

    /// `ChangeState` targets with their lines, checked once all states are known.
    state_refs: Vec<(String, usize)>,
}

impl<'src> Compiler<'src> {
    pub fn new(file: &str, source: &'src str) -> Self {
        Self {
            lexer: Lexer::new(source),
            current: Token::start(),
            previous: Token::start(),
            file: file.to_string(),
            diagnostics: Vec::new(),
            panic_mode: false,
            chunk: Chunk::new(""),
            machine_name: None,
            states: Vec::new(),
            handlers: BTreeMap::new(),
            declared: BTreeMap::new(),
            state_refs: Vec::new(),
        }
    }

    pub fn compile(mut self) -> Result<ScriptDefinition, CompileError> {
        self.advance();

        while !self.check(TokenKind::Eof) {
            if self.match_kind(TokenKind::StateMachine) {
                self.machine_block();
            } else if self.check(TokenKind::State) {
                self.state_declaration();
            } else {
                self.error_at_current("expected 'State' or 'StateMachine'");
                self.advance();
                self.synchronize();
            }
        }

        if self.states.is_empty() && self.diagnostics.is_empty() {
            self.error_at_current("script declares no states");
        }

        for (state, line) in std::mem::take(&mut self.state_refs) {
            if !self.states.contains(&state) {
                self.diagnostics.push(Diagnostic::syntax(
                    line,
                    format!("ChangeState targets unknown state '{}'", state),
                ));
            }
        }

        if !self.diagnostics.is_empty() {
            return Err(CompileError::new(self.file, self.diagnostics));
        }

        let name = self.machine_name.unwrap_or_else(|| {
            Path::new(&self.file)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.file.clone())
        });

        Ok(ScriptDefinition::new(
            name,
            self.file,
            self.states,
            self.handlers,
        )
        .with_declared(self.declared))
    }

    // =========================================================================
    // Token stream
    // =========================================================================

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = if self.current.lexeme.starts_with('"') {
                "unterminated string literal".to_string()
            } else {
                format!("unexpected character '{}'", self.current.lexeme)
            };
            let line = self.current.line;
            self.report(Diagnostic::lex(line, message));
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_kind(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> bool {
        if self.check(kind) {
            self.advance();
            return true;
        }
        self.error_at_current(message);
        false
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    fn report(&mut self, diagnostic: Diagnostic) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.diagnostics.push(diagnostic);
    }

    /// Reports a problem with the token about to be consumed.
    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        let message = match token.kind {
            TokenKind::Eof => format!("{} at end of file", message),
            _ => format!("{}, found '{}'", message, token.lexeme),
        };
        self.report(Diagnostic::syntax(token.line, message));
    }

    /// Reports a problem with the token just consumed.
    fn error(&mut self, message: &str) {
        let line = self.previous.line;
        self.report(Diagnostic::syntax(line, message));
    }

    /// Skips to the next statement boundary and leaves panic mode.
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while !self.check(TokenKind::Eof) {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            if self.check(TokenKind::RightBrace) || self.current.kind.starts_statement() {
                return;
            }
            self.advance();
        }
    }

    fn at_declaration_boundary(&self) -> bool {
        matches!(
            self.current.kind,
            TokenKind::OnEvent | TokenKind::State | TokenKind::StateMachine
        )
    }

    // =========================================================================
    // Declarations
    // =========================================================================

    fn machine_block(&mut self) {
        if self.match_kind(TokenKind::Identifier) {
            self.machine_name = Some(self.previous.lexeme.to_string());
        }
        if !self.consume(TokenKind::LeftBrace, "expected '{' after 'StateMachine'") {
            self.synchronize();
            return;
        }

        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.check(TokenKind::State) {
                self.state_declaration();
            } else {
                self.error_at_current("expected 'State' in StateMachine body");
                self.advance();
                self.synchronize();
            }
        }

        self.consume(TokenKind::RightBrace, "expected '}' to close StateMachine");
    }

    fn state_declaration(&mut self) {
        self.advance();

        if !self.consume(TokenKind::Identifier, "expected state name after 'State'") {
            self.synchronize();
            return;
        }
        let state = self.previous.lexeme.to_string();
        if self.states.contains(&state) {
            self.error(&format!("duplicate state '{}'", state));
        } else {
            self.states.push(state.clone());
        }

        if !self.consume(TokenKind::LeftBrace, "expected '{' after state name") {
            self.synchronize();
            return;
        }

        while !self.check(TokenKind::RightBrace)
            && !self.check(TokenKind::Eof)
            && !self.check(TokenKind::State)
            && !self.check(TokenKind::StateMachine)
        {
            if self.check(TokenKind::OnEvent) {
                self.handler(&state);
            } else {
                self.error_at_current("expected 'OnEvent' or '}' in state body");
                self.advance();
                self.synchronize();
            }
        }

        self.consume(TokenKind::RightBrace, "expected '}' after state body");
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn handler(&mut self, state: &str) {
        self.advance();
        let errors_before = self.diagnostics.len();

        let event = if self.match_kind(TokenKind::Identifier) {
            Some(self.previous.lexeme.to_string())
        } else {
            self.error_at_current("expected event name after 'OnEvent'");
            None
        };

        if !self.check(TokenKind::LeftBrace) {
            self.error_at_current("expected '{' after event name");
            self.synchronize();
            return;
        }

        let event_name = event.as_deref().unwrap_or("?");
        self.chunk = Chunk::new(format!("{}.{}", state, event_name));
        self.advance();
        self.block_body();
        self.emit_op(OpCode::Return);

        let chunk = std::mem::replace(&mut self.chunk, Chunk::new(""));

        let Some(event) = event else { return };
        if self.diagnostics.len() != errors_before {
            return;
        }

        let events = self.handlers.entry(state.to_string()).or_default();
        if events.contains_key(&event) {
            let line = chunk.line_at(0);
            self.diagnostics.push(Diagnostic::syntax(
                line,
                format!("duplicate handler for '{}' in state '{}'", event, state),
            ));
            return;
        }
        events.insert(event, chunk);
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// Parses statements up to and including the closing `}`.
    fn block_body(&mut self) {
        while !self.check(TokenKind::RightBrace)
            && !self.check(TokenKind::Eof)
            && !self.at_declaration_boundary()
        {
            self.statement();
            if self.panic_mode {
                self.synchronize();
            }
        }

        self.consume(TokenKind::RightBrace, "expected '}' after block");
    }

    fn statement(&mut self) {
        match self.current.kind {
            TokenKind::Var => self.var_declaration(),
            TokenKind::If => self.if_statement(),
            TokenKind::FireEvent => self.fire_event_statement(),
            TokenKind::ChangeState => self.change_state_statement(),
            TokenKind::LeftBrace => {
                self.advance();
                self.block_body();
            }
            _ => self.expression_statement(),
        }
    }

    fn var_declaration(&mut self) {
        self.advance();

        if !self.consume(TokenKind::Identifier, "expected variable name after 'var'") {
            return;
        }
        let name = self.previous.lexeme;
        if name == "args" {
            self.error("'args' is reserved for event arguments");
            return;
        }

        let mut declared = None;
        if self.match_kind(TokenKind::Colon) {
            if !self.consume(TokenKind::Identifier, "expected type name after ':'") {
                return;
            }
            match ValueType::from_name(self.previous.lexeme) {
                Some(ty) => {
                    if let Some(existing) = self.declared.get(name).filter(|t| **t != ty) {
                        let message = format!(
                            "variable '{}' is already declared as {}",
                            name,
                            existing.name()
                        );
                        self.error(&message);
                        return;
                    }
                    self.declared.insert(name.to_string(), ty);
                    declared = Some(ty);
                }
                None => {
                    let message = format!("unknown type '{}'", self.previous.lexeme);
                    self.error(&message);
                    return;
                }
            }
        }

        if self.match_kind(TokenKind::Equal) {
            self.expression();
        } else {
            let default = declared.unwrap_or(ValueType::Number).default_value();
            self.emit_constant(default);
        }

        let index = self.identifier_constant(name);
        self.emit_op(OpCode::SetVariable);
        self.emit_byte(index);
        self.emit_op(OpCode::Pop);

        self.consume(TokenKind::Semicolon, "expected ';' after variable declaration");
    }

    fn if_statement(&mut self) {
        self.advance();
        self.expression();

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        if !self.consume(TokenKind::LeftBrace, "expected '{' after if condition") {
            return;
        }
        self.block_body();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_kind(TokenKind::Else) {
            if self.check(TokenKind::If) {
                self.if_statement();
            } else if self.consume(TokenKind::LeftBrace, "expected '{' after 'else'") {
                self.block_body();
            }
        }

        self.patch_jump(else_jump);
    }

    fn fire_event_statement(&mut self) {
        self.advance();
        let parenthesized = self.match_kind(TokenKind::LeftParen);

        if !self.consume(TokenKind::Identifier, "expected event name after 'FireEvent'") {
            return;
        }
        let event = self.identifier_constant(self.previous.lexeme);

        let mut flags = 0u8;
        let mut argc = 0usize;
        if parenthesized {
            while self.match_kind(TokenKind::Comma) {
                let target_allowed = flags & FIRE_HAS_TARGET == 0 && argc == 0;
                if self.check(TokenKind::String) && target_allowed {
                    self.advance();
                    let Some(target) = self.decode_string(self.previous) else {
                        return;
                    };
                    self.emit_constant(Value::String(target));
                    flags |= FIRE_HAS_TARGET;
                } else if self.match_kind(TokenKind::Identifier) {
                    let name = self.previous.lexeme;
                    if self.match_kind(TokenKind::Equal) {
                        self.emit_constant(Value::from(name));
                        self.expression();
                        argc += 1;
                    } else if target_allowed {
                        self.emit_constant(Value::from(name));
                        flags |= FIRE_HAS_TARGET;
                    } else {
                        self.error_at_current("expected '=' after argument name");
                        return;
                    }
                } else {
                    self.error_at_current("expected target entity or 'name = value' argument");
                    return;
                }
            }
            if !self.consume(TokenKind::RightParen, "expected ')' after FireEvent arguments") {
                return;
            }
        }

        let Ok(argc) = u8::try_from(argc) else {
            self.error("too many arguments to FireEvent");
            return;
        };

        self.consume(TokenKind::Semicolon, "expected ';' after FireEvent");
        self.emit_op(OpCode::FireEvent);
        self.emit_byte(event);
        self.emit_byte(flags);
        self.emit_byte(argc);
    }

    fn change_state_statement(&mut self) {
        self.advance();
        let parenthesized = self.match_kind(TokenKind::LeftParen);

        if !self.consume(TokenKind::Identifier, "expected state name after 'ChangeState'") {
            return;
        }
        let state = self.previous.lexeme;
        self.state_refs.push((state.to_string(), self.previous.line));
        let index = self.identifier_constant(state);

        if parenthesized && !self.consume(TokenKind::RightParen, "expected ')' after state name")
        {
            return;
        }

        self.consume(TokenKind::Semicolon, "expected ';' after ChangeState");
        self.emit_op(OpCode::ChangeState);
        self.emit_byte(index);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after expression");
        self.emit_op(OpCode::Pop);
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;

        if !self.prefix(self.previous.kind, can_assign) {
            let message = match self.previous.kind {
                TokenKind::Eof => "expected expression at end of file".to_string(),
                _ => format!("expected expression, found '{}'", self.previous.lexeme),
            };
            self.error(&message);
            return;
        }

        self.infix_chain(precedence);

        if can_assign && self.match_kind(TokenKind::Equal) {
            self.error("invalid assignment target");
        }
    }

    /// Applies infix operators that bind at least as tightly as `precedence`.
    fn infix_chain(&mut self, precedence: Precedence) {
        while precedence <= Precedence::of_infix(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind);
        }
    }

    /// Runs the prefix rule for `kind`. Returns false if there is none.
    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::Number
            | TokenKind::Vec2
            | TokenKind::String
            | TokenKind::True
            | TokenKind::False => self.literal(),
            TokenKind::Identifier => self.variable(can_assign),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind) {
        match kind {
            TokenKind::AndAnd => self.and(),
            TokenKind::OrOr => self.or(),
            TokenKind::Dot => self.component(),
            _ => self.binary(),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after expression");
    }

    fn unary(&mut self) {
        let operator = self.previous.kind;

        // `-3,4` is the literal (-3, 4); only `-(3,4)` negates both components
        if operator == TokenKind::Minus && self.check(TokenKind::Vec2) {
            self.advance();
            if let Some(Value::Vec2 { x, y }) = self.vec2_literal(self.previous) {
                self.emit_constant(Value::vec2(-x, y));
            }
            self.infix_chain(Precedence::Unary);
            return;
        }

        self.parse_precedence(Precedence::Unary);

        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            _ => self.emit_op(OpCode::Not),
        }
    }

    fn binary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::of_infix(operator).next());

        let op = match operator {
            TokenKind::Plus => OpCode::Add,
            TokenKind::Minus => OpCode::Subtract,
            TokenKind::Star => OpCode::Multiply,
            TokenKind::Slash => OpCode::Divide,
            TokenKind::EqualEqual => OpCode::Equal,
            TokenKind::BangEqual => OpCode::NotEqual,
            TokenKind::Greater => OpCode::Greater,
            TokenKind::GreaterEqual => OpCode::GreaterEqual,
            TokenKind::Less => OpCode::Less,
            TokenKind::LessEqual => OpCode::LessEqual,
            _ => return,
        };
        self.emit_op(op);
    }

    fn and(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn component(&mut self) {
        if !self.consume(TokenKind::Identifier, "expected component name after '.'") {
            return;
        }
        let name = self.previous.lexeme;
        if name != "x" && name != "y" {
            self.error("unknown component, expected 'x' or 'y'");
            return;
        }
        let index = self.identifier_constant(name);
        self.emit_op(OpCode::GetComponent);
        self.emit_byte(index);
    }

    fn literal(&mut self) {
        let token = self.previous;
        let value = match token.kind {
            TokenKind::True => Value::Bool(true),
            TokenKind::False => Value::Bool(false),
            TokenKind::Number => match token.lexeme.parse::<f64>() {
                Ok(n) => Value::Number(n),
                Err(_) => {
                    self.error("invalid number literal");
                    return;
                }
            },
            TokenKind::Vec2 => match self.vec2_literal(token) {
                Some(value) => value,
                None => return,
            },
            _ => match self.decode_string(token) {
                Some(s) => Value::String(s),
                None => return,
            },
        };
        self.emit_constant(value);
    }

    fn vec2_literal(&mut self, token: Token<'src>) -> Option<Value> {
        let parsed = token
            .lexeme
            .split_once(',')
            .and_then(|(x, y)| Some((x.parse::<f64>().ok()?, y.parse::<f64>().ok()?)));
        match parsed {
            Some((x, y)) => Some(Value::vec2(x, y)),
            None => {
                self.error("invalid vec2 literal");
                None
            }
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let mut name = self.previous.lexeme.to_string();

        if name == "args" {
            if !self.consume(TokenKind::Dot, "expected '.' after 'args'")
                || !self.consume(TokenKind::Identifier, "expected argument name after 'args.'")
            {
                return;
            }
            name = format!("{}{}", ARGS_PREFIX, self.previous.lexeme);
        }

        let index = self.identifier_constant(&name);
        if can_assign && self.match_kind(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetVariable);
        } else {
            self.emit_op(OpCode::GetVariable);
        }
        self.emit_byte(index);
    }

    /// Strips the quotes from a string token and resolves escapes.
    fn decode_string(&mut self, token: Token<'src>) -> Option<String> {
        let inner = &token.lexeme[1..token.lexeme.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();

        while let Some(ch) = chars.next() {
            if ch != '\\' {
                out.push(ch);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('\\') => out.push('\\'),
                Some('"') => out.push('"'),
                Some(other) => {
                    let message = format!("unknown escape sequence '\\{}'", other);
                    self.report(Diagnostic::syntax(token.line, message));
                    return None;
                }
                None => {
                    let message = "dangling '\\' in string literal".to_string();
                    self.report(Diagnostic::syntax(token.line, message));
                    return None;
                }
            }
        }

        Some(out)
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn emit_byte(&mut self, byte: u8) {
        self.chunk.write(byte, self.previous.line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.as_byte());
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.chunk.add_constant(value) {
            Some(index) => index,
            None => {
                self.error("too many constants in one handler");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op(OpCode::Constant);
        self.emit_byte(index);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        self.make_constant(Value::from(name))
    }

    /// Emits a jump with a placeholder offset; returns the operand position.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xFF);
        self.emit_byte(0xFF);
        self.chunk.len() - 2
    }

    fn patch_jump(&mut self, operand: usize) {
        let distance = self.chunk.len() - operand - 2;
        let Ok(distance) = u16::try_from(distance) else {
            self.error("too much code to jump over");
            return;
        };
        let [hi, lo] = distance.to_be_bytes();
        self.chunk.code[operand] = hi;
        self.chunk.code[operand + 1] = lo;
    }
}
