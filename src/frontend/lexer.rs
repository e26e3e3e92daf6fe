use crate::frontend::token::{Token, TokenKind};

/// On-demand scanner over Zephyr source text.
///
/// Tokens are produced one at a time by [`Lexer::next_token`]; the cursor only
/// moves forward. Once the input is exhausted every further call returns an
/// `Eof` token. Unrecognized input becomes an `Error` token and scanning
/// carries on, so the caller decides whether to stop.
pub struct Lexer<'src> {
    source: &'src str,
    start: usize,
    pos: usize,
    line: usize,
    finished: bool,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Lexer {
            source,
            start: 0,
            pos: 0,
            line: 1,
            finished: false,
        }
    }

    /// Byte offset of the cursor.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn current(&self) -> Option<char> {
        self.source[self.pos..].chars().next()
    }

    fn peek(&self) -> Option<char> {
        let mut chars = self.source[self.pos..].chars();
        chars.next();
        chars.next()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.source[self.pos..].chars();
        chars.next();
        chars.next();
        chars.next()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current()?;
        self.pos += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
        }
        Some(ch)
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.current() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn make(&self, kind: TokenKind) -> Token<'src> {
        Token::new(kind, &self.source[self.start..self.pos], self.line)
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current() {
            match ch {
                ' ' | '\t' | '\r' | '\n' => {
                    self.advance();
                }
                '/' if self.peek() == Some('/') => {
                    while let Some(ch) = self.current() {
                        if ch == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    /// Scans the next token.
    pub fn next_token(&mut self) -> Token<'src> {
        self.skip_whitespace();
        self.start = self.pos;

        let Some(ch) = self.advance() else {
            return self.make(TokenKind::Eof);
        };

        match ch {
            '{' => self.make(TokenKind::LeftBrace),
            '}' => self.make(TokenKind::RightBrace),
            '(' => self.make(TokenKind::LeftParen),
            ')' => self.make(TokenKind::RightParen),
            ';' => self.make(TokenKind::Semicolon),
            ',' => self.make(TokenKind::Comma),
            '.' => self.make(TokenKind::Dot),
            ':' => self.make(TokenKind::Colon),
            '+' => self.make(TokenKind::Plus),
            '-' => self.make(TokenKind::Minus),
            '*' => self.make(TokenKind::Star),
            '/' => self.make(TokenKind::Slash),
            '=' => {
                let kind = if self.match_char('=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                };
                self.make(kind)
            }
            '!' => {
                let kind = if self.match_char('=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                };
                self.make(kind)
            }
            '>' => {
                let kind = if self.match_char('=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                };
                self.make(kind)
            }
            '<' => {
                let kind = if self.match_char('=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                };
                self.make(kind)
            }
            '&' if self.match_char('&') => self.make(TokenKind::AndAnd),
            '|' if self.match_char('|') => self.make(TokenKind::OrOr),
            '"' => self.read_string(),
            c if c.is_ascii_digit() => self.read_number(),
            c if c.is_ascii_alphabetic() || c == '_' => self.read_identifier(),
            _ => self.make(TokenKind::Error),
        }
    }

    fn read_string(&mut self) -> Token<'src> {
        loop {
            match self.current() {
                Some('"') => {
                    self.advance();
                    return self.make(TokenKind::String);
                }
                Some('\\') => {
                    self.advance();
                    if matches!(self.current(), Some(c) if c != '\n') {
                        self.advance();
                    }
                }
                // unterminated: the lexeme is the partial string
                Some('\n') | None => return self.make(TokenKind::Error),
                Some(_) => {
                    self.advance();
                }
            }
        }
    }

    fn skip_digits(&mut self) {
        while matches!(self.current(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }
    }

    fn skip_fraction(&mut self) {
        if self.current() == Some('.') && matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.advance();
            self.skip_digits();
        }
    }

    fn read_number(&mut self) -> Token<'src> {
        self.skip_digits();
        self.skip_fraction();

        // `x,y` with no whitespace is a Vec2 literal
        if self.current() == Some(',') {
            let second_is_number = match self.peek() {
                Some(c) if c.is_ascii_digit() => true,
                Some('-') => matches!(self.peek_second(), Some(c) if c.is_ascii_digit()),
                _ => false,
            };
            if second_is_number {
                self.advance();
                self.match_char('-');
                self.skip_digits();
                self.skip_fraction();
                return self.make(TokenKind::Vec2);
            }
        }

        self.make(TokenKind::Number)
    }

    fn read_identifier(&mut self) -> Token<'src> {
        while matches!(self.current(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            self.advance();
        }
        let text = &self.source[self.start..self.pos];
        self.make(TokenKind::keyword(text).unwrap_or(TokenKind::Identifier))
    }

    /// Collects every token up to and including the first `Eof`.
    pub fn tokenize(&mut self) -> Vec<Token<'src>> {
        self.by_ref().collect()
    }
}

impl<'src> Iterator for Lexer<'src> {
    type Item = Token<'src>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let token = self.next_token();
        if token.kind == TokenKind::Eof {
            self.finished = true;
        }
        Some(token)
    }
}
