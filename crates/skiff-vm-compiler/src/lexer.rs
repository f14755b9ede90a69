//! The lexer
//!
//! A forward token stream over a fixed source range. Performs no heap
//! allocation: token text fields are slices of the source. String escapes are
//! only *recognized* here; interpretation happens when the string value is
//! constructed (see [`unescape`]). Errors are queued as diagnostics for the
//! parser to report, and the lexer always makes progress past bad input.

use crate::token::{Token, TokenKind, keyword};

/// A lexer problem: the line it occurred on and a formatted message.
#[derive(Debug, Clone)]
pub struct LexerDiagnostic {
    /// 1-based source line.
    pub line: u32,
    /// Human-readable description.
    pub message: String,
}

/// Forward token stream over `source`.
pub struct Lexer<'src> {
    source: &'src str,
    cursor: usize,
    line: u32,
    line_start: usize,
    diagnostics: Vec<LexerDiagnostic>,
}

impl<'src> Lexer<'src> {
    /// Create a lexer at the start of `source`.
    pub fn new(source: &'src str) -> Self {
        Self { source, cursor: 0, line: 1, line_start: 0, diagnostics: Vec::new() }
    }

    /// The 1-based line the cursor is on.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// The text of the line the cursor is on (for diagnostics).
    pub fn current_line_text(&self) -> &'src str {
        let rest = &self.source[self.line_start..];
        match rest.find('\n') {
            Some(end) => &rest[..end],
            None => rest,
        }
    }

    /// Drain queued diagnostics.
    pub fn take_diagnostics(&mut self) -> Vec<LexerDiagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    fn peek(&self, ahead: usize) -> u8 {
        *self.source.as_bytes().get(self.cursor + ahead).unwrap_or(&0)
    }

    fn at_end(&self) -> bool {
        self.cursor >= self.source.len()
    }

    fn advance(&mut self, amount: usize) {
        for _ in 0..amount {
            if self.at_end() {
                break;
            }
            if self.peek(0) == b'\n' {
                self.line += 1;
                self.line_start = self.cursor + 1;
            }
            self.cursor += 1;
        }
    }

    fn skip_while(&mut self, condition: impl Fn(u8) -> bool) {
        while !self.at_end() && condition(self.peek(0)) {
            self.advance(1);
        }
    }

    fn skip_line_comment(&mut self) {
        self.advance(2);
        self.skip_while(|c| c != b'\n');
    }

    fn skip_block_comment(&mut self) {
        let start_line = self.line;
        self.advance(2);
        loop {
            if self.at_end() {
                self.diagnostics.push(LexerDiagnostic {
                    line: self.line,
                    message: format!("unfinished block comment starting on line {start_line}"),
                });
                return;
            }
            if self.peek(0) == b'*' && self.peek(1) == b'/' {
                self.advance(2);
                return;
            }
            self.advance(1);
        }
    }

    fn lex_number(&mut self) -> Token<'src> {
        let start = self.cursor;
        let line = self.line;
        self.skip_while(|c| c.is_ascii_digit());
        if self.peek(0) == b'.' && self.peek(1).is_ascii_digit() {
            self.advance(1);
            self.skip_while(|c| c.is_ascii_digit());
        }
        if (self.peek(0) == b'e' || self.peek(0) == b'E')
            && (self.peek(1).is_ascii_digit()
                || ((self.peek(1) == b'+' || self.peek(1) == b'-') && self.peek(2).is_ascii_digit()))
        {
            self.advance(2);
            self.skip_while(|c| c.is_ascii_digit());
        }
        let text = &self.source[start..self.cursor];
        // optional trailing float suffix
        if self.peek(0) == b'f' || self.peek(0) == b'F' {
            self.advance(1);
        }
        let mut token = Token::new(TokenKind::Number, text, line);
        token.number = text.parse().unwrap_or(0.0);
        token
    }

    fn lex_identifier(&mut self) -> Token<'src> {
        let start = self.cursor;
        let line = self.line;
        self.skip_while(|c| c.is_ascii_alphanumeric() || c == b'_');
        let text = &self.source[start..self.cursor];
        match keyword(text) {
            Some(kind) => Token::new(kind, text, line),
            None => Token::new(TokenKind::Identifier, text, line),
        }
    }

    fn lex_string(&mut self) -> Token<'src> {
        let line = self.line;
        self.advance(1); // opening quote
        let start = self.cursor;
        loop {
            if self.at_end() {
                self.diagnostics.push(LexerDiagnostic {
                    line: self.line,
                    message: format!("unterminated string starting on line {line}"),
                });
                break;
            }
            match self.peek(0) {
                b'"' => break,
                b'\\' => self.advance(2),
                _ => self.advance(1),
            }
        }
        let end = self.cursor.min(self.source.len());
        let text = &self.source[start..end];
        self.advance(1); // closing quote
        Token::new(TokenKind::Str, text, line)
    }

    /// Produce the next token, skipping whitespace and comments.
    pub fn next_token(&mut self) -> Token<'src> {
        loop {
            if self.at_end() {
                return Token::new(TokenKind::Eof, "", self.line);
            }
            let c = self.peek(0);

            if c.is_ascii_whitespace() {
                self.skip_while(|c| c.is_ascii_whitespace());
                continue;
            }

            if c == b'/' {
                match self.peek(1) {
                    b'/' => {
                        self.skip_line_comment();
                        continue;
                    }
                    b'*' => {
                        self.skip_block_comment();
                        continue;
                    }
                    _ => {}
                }
            }

            if c.is_ascii_digit() || (c == b'.' && self.peek(1).is_ascii_digit()) {
                return self.lex_number();
            }
            if c.is_ascii_alphabetic() || c == b'_' {
                return self.lex_identifier();
            }
            if c == b'"' {
                return self.lex_string();
            }

            let line = self.line;
            let two = |lexer: &mut Self, kind, text| {
                lexer.advance(2);
                Token::new(kind, text, line)
            };
            let one = |lexer: &mut Self, kind, text| {
                lexer.advance(1);
                Token::new(kind, text, line)
            };
            let next = self.peek(1);
            return match c {
                b'(' => one(self, TokenKind::LParen, "("),
                b')' => one(self, TokenKind::RParen, ")"),
                b'[' => one(self, TokenKind::LBracket, "["),
                b']' => one(self, TokenKind::RBracket, "]"),
                b'{' => one(self, TokenKind::LBrace, "{"),
                b'}' => one(self, TokenKind::RBrace, "}"),
                b':' => one(self, TokenKind::Colon, ":"),
                b';' => one(self, TokenKind::Semicolon, ";"),
                b',' => one(self, TokenKind::Comma, ","),
                b'.' => one(self, TokenKind::Dot, "."),
                b'#' => one(self, TokenKind::Hash, "#"),
                b'@' => one(self, TokenKind::At, "@"),
                b'<' if next == b'=' => two(self, TokenKind::LessEqual, "<="),
                b'<' => one(self, TokenKind::Less, "<"),
                b'>' if next == b'=' => two(self, TokenKind::GreaterEqual, ">="),
                b'>' => one(self, TokenKind::Greater, ">"),
                b'=' if next == b'=' => two(self, TokenKind::EqualEqual, "=="),
                b'=' => one(self, TokenKind::Equals, "="),
                b'+' if next == b'=' => two(self, TokenKind::PlusEquals, "+="),
                b'+' => one(self, TokenKind::Plus, "+"),
                b'-' if next == b'=' => two(self, TokenKind::MinusEquals, "-="),
                b'-' => one(self, TokenKind::Minus, "-"),
                b'*' => one(self, TokenKind::Star, "*"),
                b'/' => one(self, TokenKind::Slash, "/"),
                b'!' if next == b'=' => two(self, TokenKind::BangEqual, "!="),
                b'!' => one(self, TokenKind::Bang, "!"),
                b'|' if next == b'|' => two(self, TokenKind::PipePipe, "||"),
                b'&' if next == b'&' => two(self, TokenKind::AmpAmp, "&&"),
                _ => {
                    let line_text = self.current_line_text().to_string();
                    self.diagnostics.push(LexerDiagnostic {
                        line: self.line,
                        message: format!(
                            "invalid character ('{}') on line {} \"{}\"",
                            c as char, self.line, line_text
                        ),
                    });
                    self.advance(1);
                    continue;
                }
            };
        }
    }
}

/// Interpret backslash escapes in a raw string-literal range.
///
/// Recognized: `\n`, `\t`, `\r`, `\0`, `\\`, `\"`, `\'`. An unknown escape
/// keeps the escaped character as-is.
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        let mut out = Vec::new();
        loop {
            let token = lexer.next_token();
            if token.kind == TokenKind::Eof {
                break;
            }
            out.push(token.kind);
        }
        out
    }

    #[test]
    fn test_punctuation_and_operators() {
        assert_eq!(
            kinds("( ) [ ] { } : ; , . # @"),
            vec![
                TokenKind::LParen,
                TokenKind::RParen,
                TokenKind::LBracket,
                TokenKind::RBracket,
                TokenKind::LBrace,
                TokenKind::RBrace,
                TokenKind::Colon,
                TokenKind::Semicolon,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Hash,
                TokenKind::At,
            ]
        );
        assert_eq!(
            kinds("= + - * / += -= == != < <= > >= && || !"),
            vec![
                TokenKind::Equals,
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::PlusEquals,
                TokenKind::MinusEquals,
                TokenKind::EqualEqual,
                TokenKind::BangEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::AmpAmp,
                TokenKind::PipePipe,
                TokenKind::Bang,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let mut lexer = Lexer::new("12 3.5 .25 2f 1e3");
        assert_eq!(lexer.next_token().number, 12.0);
        assert_eq!(lexer.next_token().number, 3.5);
        assert_eq!(lexer.next_token().number, 0.25);
        assert_eq!(lexer.next_token().number, 2.0);
        assert_eq!(lexer.next_token().number, 1000.0);
        assert_eq!(lexer.next_token().kind, TokenKind::Eof);
    }

    #[test]
    fn test_keywords_and_identifiers() {
        assert_eq!(
            kinds("var x while whiley _y2"),
            vec![
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::While,
                TokenKind::Identifier,
                TokenKind::Identifier,
            ]
        );
    }

    #[test]
    fn test_string_raw_range_keeps_escapes() {
        let mut lexer = Lexer::new(r#""a\"b\n""#);
        let token = lexer.next_token();
        assert_eq!(token.kind, TokenKind::Str);
        assert_eq!(token.text, r#"a\"b\n"#);
        assert_eq!(unescape(token.text), "a\"b\n");
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("1 // line comment\n 2 /* block \n comment */ 3"),
            vec![TokenKind::Number, TokenKind::Number, TokenKind::Number]
        );
    }

    #[test]
    fn test_unterminated_block_comment_diagnostic() {
        let mut lexer = Lexer::new("/* never closed");
        assert_eq!(lexer.next_token().kind, TokenKind::Eof);
        let diags = lexer.take_diagnostics();
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("unfinished block comment"));
    }

    #[test]
    fn test_line_tracking() {
        let mut lexer = Lexer::new("a\nb\n\nc");
        assert_eq!(lexer.next_token().line, 1);
        assert_eq!(lexer.next_token().line, 2);
        assert_eq!(lexer.next_token().line, 4);
    }

    #[test]
    fn test_invalid_character_diagnostic_and_progress() {
        let mut lexer = Lexer::new("a $ b");
        assert_eq!(lexer.next_token().kind, TokenKind::Identifier);
        assert_eq!(lexer.next_token().kind, TokenKind::Identifier);
        assert_eq!(lexer.take_diagnostics().len(), 1);
    }
}
