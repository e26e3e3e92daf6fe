#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Punctuation
    LeftBrace,
    RightBrace,
    LeftParen,
    RightParen,
    Semicolon,
    Comma,
    Dot,
    Colon,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Equal,
    EqualEqual,
    Bang,
    BangEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    AndAnd,
    OrOr,

    // Keywords
    StateMachine,
    State,
    OnEvent,
    FireEvent,
    ChangeState,
    If,
    Else,
    Var,
    True,
    False,

    // Literals
    Number,
    Vec2,
    String,
    Identifier,

    // Special
    Error,
    Eof,
}

impl TokenKind {
    /// Keyword lookup for a scanned identifier.
    pub fn keyword(text: &str) -> Option<TokenKind> {
        Some(match text {
            "StateMachine" => TokenKind::StateMachine,
            "State" => TokenKind::State,
            "OnEvent" => TokenKind::OnEvent,
            "FireEvent" => TokenKind::FireEvent,
            "ChangeState" => TokenKind::ChangeState,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "var" => TokenKind::Var,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            _ => return None,
        })
    }

    /// Returns true if this token can only begin a statement or declaration.
    ///
    /// The compiler resynchronizes on these after a syntax error.
    pub fn starts_statement(&self) -> bool {
        matches!(
            self,
            TokenKind::Var
                | TokenKind::If
                | TokenKind::FireEvent
                | TokenKind::ChangeState
                | TokenKind::OnEvent
                | TokenKind::State
                | TokenKind::StateMachine
        )
    }
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            TokenKind::LeftBrace => "{",
            TokenKind::RightBrace => "}",
            TokenKind::LeftParen => "(",
            TokenKind::RightParen => ")",
            TokenKind::Semicolon => ";",
            TokenKind::Comma => ",",
            TokenKind::Dot => ".",
            TokenKind::Colon => ":",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Equal => "=",
            TokenKind::EqualEqual => "==",
            TokenKind::Bang => "!",
            TokenKind::BangEqual => "!=",
            TokenKind::Greater => ">",
            TokenKind::GreaterEqual => ">=",
            TokenKind::Less => "<",
            TokenKind::LessEqual => "<=",
            TokenKind::AndAnd => "&&",
            TokenKind::OrOr => "||",
            TokenKind::StateMachine => "StateMachine",
            TokenKind::State => "State",
            TokenKind::OnEvent => "OnEvent",
            TokenKind::FireEvent => "FireEvent",
            TokenKind::ChangeState => "ChangeState",
            TokenKind::If => "if",
            TokenKind::Else => "else",
            TokenKind::Var => "var",
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::Number => "number",
            TokenKind::Vec2 => "vec2",
            TokenKind::String => "string",
            TokenKind::Identifier => "identifier",
            TokenKind::Error => "error",
            TokenKind::Eof => "end of file",
        };
        write!(f, "{}", text)
    }
}

/// A classified lexeme borrowed from the source text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub lexeme: &'src str,
    pub line: usize,
}

impl<'src> Token<'src> {
    pub fn new(kind: TokenKind, lexeme: &'src str, line: usize) -> Self {
        Token { kind, lexeme, line }
    }

    /// Placeholder used before the first token has been scanned.
    pub fn start() -> Self {
        Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 1,
        }
    }
}

impl std::fmt::Display for Token<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            TokenKind::Eof => write!(f, "end of file"),
            _ => write!(f, "'{}'", self.lexeme),
        }
    }
}
