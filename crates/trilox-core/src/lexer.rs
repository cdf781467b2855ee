//! Lexical analysis (tokenization)
//!
//! Pull-based scanner: construct once with [`Lexer::new`], then call
//! [`Lexer::next_token`] repeatedly until it returns [`TokenKind::Eof`].
//! `#` introduces a line comment; the language is newline-insensitive
//! otherwise (statement separators are explicit keywords/commas), matching
//! the source scanner this is grounded on.

use crate::token::{Token, TokenKind};

pub struct Lexer<'src> {
    source: &'src str,
    bytes: &'src [u8],
    start: usize,
    current: usize,
    line: u32,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            start: 0,
            current: 0,
            line: 1,
        }
    }

    pub fn next_token(&mut self) -> Token<'src> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();

        if is_alpha(c) {
            return self.identifier();
        }
        if c.is_ascii_digit() {
            return self.number();
        }

        match c {
            b'(' => self.make_token(TokenKind::LeftParen),
            b')' => self.make_token(TokenKind::RightParen),
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => self.make_token(TokenKind::RightBrace),
            b'[' => self.make_token(TokenKind::LeftSquare),
            b']' => self.make_token(TokenKind::RightSquare),
            b',' => self.make_token(TokenKind::Comma),
            b'.' => self.make_token(TokenKind::Dot),
            b';' => self.make_token(TokenKind::Semicolon),
            b':' => {
                if self.matches(b'[') {
                    self.make_token(TokenKind::TableOpen)
                } else {
                    self.make_token(TokenKind::Colon)
                }
            }
            b'+' => self.make_token(TokenKind::Plus),
            b'-' => self.make_token(TokenKind::Minus),
            b'*' => self.make_token(TokenKind::Star),
            b'/' => self.make_token(TokenKind::Slash),
            b'%' => self.make_token(TokenKind::Percent),
            b'^' => self.make_token(TokenKind::Caret),
            b'<' => {
                let kind = if self.matches(b'=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                };
                self.make_token(kind)
            }
            b'>' => {
                let kind = if self.matches(b'=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                };
                self.make_token(kind)
            }
            b'=' => {
                let kind = if self.matches(b'=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                };
                self.make_token(kind)
            }
            b'!' => {
                let kind = if self.matches(b'=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Not
                };
                self.make_token(kind)
            }
            b'"' => self.string(),
            _ => self.error_token("Unexpected character."),
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.bytes.len()
    }

    fn advance(&mut self) -> u8 {
        let byte = self.bytes[self.current];
        self.current += 1;
        byte
    }

    fn peek(&self) -> u8 {
        if self.is_at_end() {
            b'\0'
        } else {
            self.bytes[self.current]
        }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.bytes.len() {
            b'\0'
        } else {
            self.bytes[self.current + 1]
        }
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.bytes[self.current] != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.advance();
                }
                b'\n' => {
                    self.line += 1;
                    self.advance();
                }
                b'#' => {
                    while self.peek() != b'\n' && !self.is_at_end() {
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn make_token(&self, kind: TokenKind) -> Token<'src> {
        Token {
            kind,
            lexeme: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Error,
            lexeme: message,
            line: self.line,
        }
    }

    fn string(&mut self) -> Token<'src> {
        while self.peek() != b'"' {
            if self.is_at_end() {
                return self.error_token("Unterminated string.");
            }
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.advance();
        }
        self.advance(); // closing quote
        self.make_token(TokenKind::String)
    }

    fn number(&mut self) -> Token<'src> {
        while self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.peek() == b'.' {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        self.make_token(TokenKind::Number)
    }

    fn identifier(&mut self) -> Token<'src> {
        while is_alpha(self.peek()) || self.peek().is_ascii_digit() {
            self.advance();
        }
        let text = &self.source[self.start..self.current];
        self.make_token(keyword_or_identifier(text))
    }
}

fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

/// Resolves a scanned identifier against the language's keyword set.
///
/// A straight string match rather than the original scanner's per-character
/// switch trie — same result, plainer in Rust.
fn keyword_or_identifier(text: &str) -> TokenKind {
    match text {
        "program" => TokenKind::Program,
        "end" => TokenKind::End,
        "function" => TokenKind::Function,
        "atom" => TokenKind::Atom,
        "var" => TokenKind::Var,
        "state" => TokenKind::State,
        "block" => TokenKind::Block,
        "table" => TokenKind::Table,
        "nil" => TokenKind::Nil,
        "if" => TokenKind::If,
        "while" => TokenKind::While,
        "for" => TokenKind::For,
        "in" => TokenKind::In,
        "do" => TokenKind::Do,
        "each" => TokenKind::Each,
        "continue" => TokenKind::Continue,
        "break" => TokenKind::Break,
        "switch" => TokenKind::Switch,
        "case" => TokenKind::Case,
        "consider" => TokenKind::Consider,
        "when" => TokenKind::When,
        "default" => TokenKind::Default,
        "else" => TokenKind::Else,
        "true" => TokenKind::True,
        "unknown" => TokenKind::Unknown,
        "false" => TokenKind::False,
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "xor" => TokenKind::Xor,
        "not" => TokenKind::Not,
        "compare" => TokenKind::Compare,
        _ => TokenKind::Identifier,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        let mut out = Vec::new();
        loop {
            let tok = lexer.next_token();
            if tok.is_eof() {
                break;
            }
            out.push(tok.kind);
        }
        out
    }

    #[test]
    fn scans_arithmetic() {
        assert_eq!(
            kinds("1 + 2 * 3"),
            vec![
                TokenKind::Number,
                TokenKind::Plus,
                TokenKind::Number,
                TokenKind::Star,
                TokenKind::Number,
            ]
        );
    }

    #[test]
    fn scans_keywords_not_prefixes() {
        assert_eq!(kinds("unknown unknowns"), vec![TokenKind::Unknown, TokenKind::Identifier]);
    }

    #[test]
    fn scans_table_open_vs_colon() {
        assert_eq!(kinds(":["), vec![TokenKind::TableOpen]);
        assert_eq!(kinds(":"), vec![TokenKind::Colon]);
    }

    #[test]
    fn skips_comments() {
        assert_eq!(kinds("1 # comment\n2"), vec![TokenKind::Number, TokenKind::Number]);
    }

    #[test]
    fn tracks_line_numbers() {
        let mut lexer = Lexer::new("1\n2\n3");
        let lines: Vec<u32> = std::iter::from_fn(|| {
            let t = lexer.next_token();
            (!t.is_eof()).then_some(t.line)
        })
        .collect();
        assert_eq!(lines, vec![1, 2, 3]);
    }

    #[test]
    fn reports_unterminated_string() {
        let mut lexer = Lexer::new("\"abc");
        let tok = lexer.next_token();
        assert_eq!(tok.kind, TokenKind::Error);
    }
}
