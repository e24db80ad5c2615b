use crate::token::{lookup_keyword, Span, Token, TokenKind};

/// Pull-based scanner: the compiler calls [`Scanner::scan_token`] once per
/// token it needs, rather than the source being tokenized eagerly up front.
pub struct Scanner {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
}

impl Scanner {
    pub fn new(source: &str) -> Self {
        Scanner {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    pub fn scan_token(&mut self) -> Token {
        self.skip_whitespace_and_comments();

        let start_span = self.span();
        if self.is_at_end() {
            return self.make_token(start_span, TokenKind::Eof, String::new());
        }

        let c = self.advance();

        if is_alpha(c) {
            return self.identifier(c, start_span);
        }
        if c.is_ascii_digit() {
            return self.number(c, start_span);
        }

        match c {
            '(' => self.make_token(start_span, TokenKind::LParen, c),
            ')' => self.make_token(start_span, TokenKind::RParen, c),
            '{' => self.make_token(start_span, TokenKind::LBrace, c),
            '}' => self.make_token(start_span, TokenKind::RBrace, c),
            ',' => self.make_token(start_span, TokenKind::Comma, c),
            '.' => self.make_token(start_span, TokenKind::Dot, c),
            '-' => self.make_token(start_span, TokenKind::Minus, c),
            '+' => self.make_token(start_span, TokenKind::Plus, c),
            ';' => self.make_token(start_span, TokenKind::Semicolon, c),
            '*' => self.make_token(start_span, TokenKind::Star, c),
            '/' => self.make_token(start_span, TokenKind::Slash, c),
            '!' => {
                if self.match_char('=') {
                    self.make_token(start_span, TokenKind::BangEqual, "!=")
                } else {
                    self.make_token(start_span, TokenKind::Bang, c)
                }
            }
            '=' => {
                if self.match_char('=') {
                    self.make_token(start_span, TokenKind::EqualEqual, "==")
                } else {
                    self.make_token(start_span, TokenKind::Equal, c)
                }
            }
            '<' => {
                if self.match_char('=') {
                    self.make_token(start_span, TokenKind::LessEqual, "<=")
                } else {
                    self.make_token(start_span, TokenKind::Less, c)
                }
            }
            '>' => {
                if self.match_char('=') {
                    self.make_token(start_span, TokenKind::GreaterEqual, ">=")
                } else {
                    self.make_token(start_span, TokenKind::Greater, c)
                }
            }
            '"' => self.string(start_span),
            _ => self.make_token(
                start_span,
                TokenKind::Error(format!("Unexpected character '{}'.", c)),
                c,
            ),
        }
    }

    fn identifier(&mut self, first: char, start_span: Span) -> Token {
        let mut lexeme = String::new();
        lexeme.push(first);
        while is_alpha(self.peek()) || self.peek().is_ascii_digit() {
            lexeme.push(self.advance());
        }
        let kind = lookup_keyword(&lexeme).unwrap_or_else(|| TokenKind::Identifier(lexeme.clone()));
        self.make_token(start_span, kind, lexeme)
    }

    fn number(&mut self, first: char, start_span: Span) -> Token {
        let mut lexeme = String::new();
        lexeme.push(first);
        while self.peek().is_ascii_digit() {
            lexeme.push(self.advance());
        }
        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            lexeme.push(self.advance()); // consume '.'
            while self.peek().is_ascii_digit() {
                lexeme.push(self.advance());
            }
        }
        let value: f64 = lexeme.parse().unwrap_or(f64::NAN);
        self.make_token(start_span, TokenKind::Number(value), lexeme)
    }

    fn string(&mut self, start_span: Span) -> Token {
        let mut contents = String::new();
        while self.peek() != '"' && !self.is_at_end() {
            contents.push(self.advance());
        }
        if self.is_at_end() {
            return self.make_token(
                start_span,
                TokenKind::Error("Unterminated string.".to_string()),
                contents,
            );
        }
        self.advance(); // closing quote
        let lexeme = format!("\"{}\"", contents);
        self.make_token(start_span, TokenKind::StringLiteral(contents), lexeme)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                ' ' | '\t' | '\r' => {
                    self.advance();
                }
                '\n' => {
                    self.advance();
                }
                '/' if self.peek_next() == '/' => {
                    while self.peek() != '\n' && !self.is_at_end() {
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn make_token(&self, span: Span, kind: TokenKind, lexeme: impl Into<String>) -> Token {
        Token::new(kind, span, lexeme)
    }

    fn span(&self) -> Span {
        Span::new(self.line, self.column)
    }

    fn is_at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> char {
        self.chars.get(self.pos).copied().unwrap_or('\0')
    }

    fn peek_next(&self) -> char {
        self.chars.get(self.pos + 1).copied().unwrap_or('\0')
    }

    fn advance(&mut self) -> char {
        let c = self.chars[self.pos];
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        c
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.is_at_end() || self.chars[self.pos] != expected {
            return false;
        }
        self.advance();
        true
    }
}

fn is_alpha(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut s = Scanner::new(src);
        let mut out = Vec::new();
        loop {
            let t = s.scan_token();
            let done = matches!(t.kind, TokenKind::Eof);
            out.push(t.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn scans_punctuation() {
        assert_eq!(
            kinds("(){},.-+;/*"),
            vec![
                TokenKind::LParen,
                TokenKind::RParen,
                TokenKind::LBrace,
                TokenKind::RBrace,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Minus,
                TokenKind::Plus,
                TokenKind::Semicolon,
                TokenKind::Slash,
                TokenKind::Star,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn scans_two_char_operators() {
        assert_eq!(
            kinds("!= == <= >= ! = < >"),
            vec![
                TokenKind::BangEqual,
                TokenKind::EqualEqual,
                TokenKind::LessEqual,
                TokenKind::GreaterEqual,
                TokenKind::Bang,
                TokenKind::Equal,
                TokenKind::Less,
                TokenKind::Greater,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn scans_number() {
        assert_eq!(kinds("3.14"), vec![TokenKind::Number(3.14), TokenKind::Eof]);
        assert_eq!(kinds("42"), vec![TokenKind::Number(42.0), TokenKind::Eof]);
    }

    #[test]
    fn scans_string() {
        assert_eq!(
            kinds("\"hi\""),
            vec![TokenKind::StringLiteral("hi".to_string()), TokenKind::Eof]
        );
    }

    #[test]
    fn unterminated_string_is_error_token() {
        let kinds = kinds("\"hi");
        assert!(matches!(kinds[0], TokenKind::Error(_)));
    }

    #[test]
    fn scans_keywords_and_identifiers() {
        assert_eq!(
            kinds("var x and foo"),
            vec![
                TokenKind::Var,
                TokenKind::Identifier("x".to_string()),
                TokenKind::And,
                TokenKind::Identifier("foo".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn skips_line_comments() {
        assert_eq!(kinds("// hello\nvar"), vec![TokenKind::Var, TokenKind::Eof]);
    }

    #[test]
    fn tracks_line_numbers() {
        let mut s = Scanner::new("var\na");
        let t1 = s.scan_token();
        let t2 = s.scan_token();
        assert_eq!(t1.line(), 1);
        assert_eq!(t2.line(), 2);
    }

    #[test]
    fn unexpected_character_is_error_token() {
        let kinds = kinds("@");
        assert!(matches!(kinds[0], TokenKind::Error(_)));
    }

    #[test]
    fn string_allows_embedded_newline() {
        let mut s = Scanner::new("\"a\nb\"");
        let t = s.scan_token();
        assert_eq!(t.kind, TokenKind::StringLiteral("a\nb".to_string()));
    }
}
