use crate::frontend::token::{Token, TokenKind};

pub struct TokenDumper {
    pub color: bool,
    pub show_debug_repr: bool, // if false, prints only the lexeme
}

impl Default for TokenDumper {
    fn default() -> Self {
        Self {
            color: true,
            show_debug_repr: true,
        }
    }
}

impl TokenDumper {
    // ANSI colors
    const RESET: &'static str = "\x1b[0m";
    const DIM: &'static str = "\x1b[2m";
    const RED: &'static str = "\x1b[31m";
    const GRN: &'static str = "\x1b[32m";
    const YEL: &'static str = "\x1b[33m";
    const CYN: &'static str = "\x1b[36m";
    const MAG: &'static str = "\x1b[35m";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_color(mut self) -> Self {
        self.color = false;
        self
    }

    pub fn pretty(mut self) -> Self {
        self.show_debug_repr = false;
        self
    }

    pub fn dump(&self, tokens: &[Token]) {
        for t in tokens {
            println!("{}", self.format_one(t));
        }
    }

    pub fn format_one(&self, t: &Token) -> String {
        let kind = self.kind(t.kind);
        let colr = if self.color { self.color(t.kind) } else { "" };
        let reset = if self.color { Self::RESET } else { "" };

        if self.show_debug_repr {
            format!(
                "[{:03}] {}{:<8} {:?} {:?}{}",
                t.line, colr, kind, t.kind, t.lexeme, reset
            )
        } else {
            match t.kind {
                TokenKind::Eof => format!("[{:03}] {}{:<8}{}", t.line, colr, kind, reset),
                _ => format!("[{:03}] {}{:<8} {}{}", t.line, colr, kind, t.lexeme, reset),
            }
        }
    }

    fn kind(&self, t: TokenKind) -> &'static str {
        use TokenKind::*;
        match t {
            Eof => "EOF",
            Error => "ERROR",

            Number | Vec2 | True | False => "LITERAL",
            String => "STRING",
            Identifier => "IDENT",

            LeftBrace | RightBrace | LeftParen | RightParen | Semicolon | Comma | Dot | Colon => {
                "PUNCT"
            }

            Plus | Minus | Star | Slash | Bang | AndAnd | OrOr | Equal => "OP",
            EqualEqual | BangEqual | Greater | GreaterEqual | Less | LessEqual => "CMP",

            StateMachine | State | OnEvent | FireEvent | ChangeState | If | Else | Var => {
                "KEYWORD"
            }
        }
    }

    fn color(&self, t: TokenKind) -> &'static str {
        use TokenKind::*;
        match t {
            Eof => Self::DIM,
            Error => Self::RED,
            String => Self::GRN,
            Number | Vec2 | True | False => Self::CYN,
            Identifier => Self::YEL,
            Plus | Minus | Star | Slash | Bang | AndAnd | OrOr | Equal => Self::MAG,
            EqualEqual | BangEqual | Greater | GreaterEqual | Less | LessEqual => Self::MAG,
            _ => Self::RESET,
        }
    }
}
