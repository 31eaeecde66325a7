//! Tokenizer for the montage language.
//!
//! Comments are dropped during tokenization, so every later pass works on
//! a clean token stream.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    /// Numeric literal as written, including an optional `f` suffix.
    Number(String),
    /// Double-quoted string, used for channel label sugar.
    Str(String),
    Punct(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn is_punct(&self, punct: &str) -> bool {
        matches!(&self.kind, TokenKind::Punct(p) if *p == punct)
    }

    pub fn is_ident(&self, name: &str) -> bool {
        matches!(&self.kind, TokenKind::Ident(s) if s == name)
    }

    pub fn ident(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Ident(s) => Some(s),
            _ => None,
        }
    }

    pub fn text(&self) -> String {
        match &self.kind {
            TokenKind::Ident(s) | TokenKind::Number(s) => s.clone(),
            TokenKind::Str(s) => format!("\"{}\"", s),
            TokenKind::Punct(p) => p.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

impl std::error::Error for LexError {}

// Longest operators first.
const PUNCTUATION: &[&str] = &[
    "+=", "-=", "*=", "/=", "==", "!=", "<=", ">=", "&&", "||", "+", "-", "*", "/", "%", "=",
    "<", ">", "!", "?", ":", "(", ")", "{", "}", ",", ";",
];

struct Cursor {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
}

impl Cursor {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn starts_with(&self, text: &str) -> bool {
        text.chars()
            .enumerate()
            .all(|(i, c)| self.peek_at(i) == Some(c))
    }

    fn error(&self, message: impl Into<String>, line: usize, column: usize) -> LexError {
        LexError {
            message: message.into(),
            line,
            column,
        }
    }
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    let mut cursor = Cursor::new(source);
    let mut tokens = Vec::new();

    while let Some(c) = cursor.peek() {
        let (line, column) = (cursor.line, cursor.column);

        if c.is_whitespace() {
            cursor.bump();
            continue;
        }

        if cursor.starts_with("//") {
            while let Some(c) = cursor.peek() {
                if c == '\n' {
                    break;
                }
                cursor.bump();
            }
            continue;
        }

        if cursor.starts_with("/*") {
            cursor.bump();
            cursor.bump();
            loop {
                if cursor.starts_with("*/") {
                    cursor.bump();
                    cursor.bump();
                    break;
                }
                if cursor.bump().is_none() {
                    return Err(cursor.error("unterminated comment", line, column));
                }
            }
            continue;
        }

        if c == '"' {
            cursor.bump();
            let mut text = String::new();
            loop {
                match cursor.bump() {
                    Some('"') => break,
                    Some('\\') => match cursor.bump() {
                        Some(escaped) => text.push(escaped),
                        None => return Err(cursor.error("unterminated string", line, column)),
                    },
                    Some('\n') | None => {
                        return Err(cursor.error("unterminated string", line, column))
                    }
                    Some(other) => text.push(other),
                }
            }
            tokens.push(Token {
                kind: TokenKind::Str(text),
                line,
                column,
            });
            continue;
        }

        let fraction = c == '.' && cursor.peek_at(1).is_some_and(|d| d.is_ascii_digit());
        if c.is_ascii_digit() || fraction {
            let text = lex_number(&mut cursor);
            tokens.push(Token {
                kind: TokenKind::Number(text),
                line,
                column,
            });
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let mut text = String::new();
            while let Some(c) = cursor.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    text.push(c);
                    cursor.bump();
                } else {
                    break;
                }
            }
            tokens.push(Token {
                kind: TokenKind::Ident(text),
                line,
                column,
            });
            continue;
        }

        if c == '#' {
            return Err(cursor.error(
                "preprocessor directives are not supported here",
                line,
                column,
            ));
        }

        match PUNCTUATION.iter().find(|p| cursor.starts_with(p)) {
            Some(&punct) => {
                for _ in 0..punct.len() {
                    cursor.bump();
                }
                tokens.push(Token {
                    kind: TokenKind::Punct(punct),
                    line,
                    column,
                });
            }
            None => {
                return Err(cursor.error(format!("unexpected character '{}'", c), line, column));
            }
        }
    }

    Ok(tokens)
}

fn lex_number(cursor: &mut Cursor) -> String {
    let mut text = String::new();
    while let Some(c) = cursor.peek() {
        if c.is_ascii_digit() || c == '.' {
            text.push(c);
            cursor.bump();
        } else {
            break;
        }
    }

    if matches!(cursor.peek(), Some('e') | Some('E')) {
        let sign = matches!(cursor.peek_at(1), Some('+') | Some('-'));
        let digit_at = if sign { 2 } else { 1 };
        if cursor.peek_at(digit_at).is_some_and(|d| d.is_ascii_digit()) {
            for _ in 0..digit_at {
                if let Some(c) = cursor.bump() {
                    text.push(c);
                }
            }
            while let Some(c) = cursor.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    cursor.bump();
                } else {
                    break;
                }
            }
        }
    }

    if matches!(cursor.peek(), Some('f') | Some('F')) {
        text.push('f');
        cursor.bump();
    }

    text
}

/// Render tokens with canonical spacing.
///
/// Binary operators are surrounded by single spaces; calls, parentheses,
/// commas, semicolons and unary operators are written tight.
pub fn render(tokens: &[Token]) -> String {
    let mut out = String::new();
    let mut previous: Option<&Token> = None;
    let mut previous_unary = false;

    for token in tokens {
        let unary = is_unary_position(previous)
            && (token.is_punct("-") || token.is_punct("+") || token.is_punct("!"));

        if let Some(prev) = previous {
            let tight = token.is_punct(")")
                || token.is_punct(",")
                || token.is_punct(";")
                || prev.is_punct("(")
                || previous_unary
                || (token.is_punct("(") && prev.ident().is_some());
            if !tight {
                out.push(' ');
            }
        }

        out.push_str(&token.text());
        previous = Some(token);
        previous_unary = unary;
    }

    out
}

fn is_unary_position(previous: Option<&Token>) -> bool {
    match previous {
        None => true,
        Some(token) => match &token.kind {
            TokenKind::Punct(p) => !matches!(*p, ")" | "}"),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_comments_are_dropped() {
        let tokens = kinds("out = in(1); // trailing\n/* block\ncomment */ out += 2;");
        assert_eq!(tokens.len(), 11);
        assert_eq!(tokens[0], TokenKind::Ident("out".to_string()));
        assert_eq!(tokens[8], TokenKind::Punct("+="));
    }

    #[test]
    fn test_numbers_with_exponent_and_suffix() {
        assert_eq!(
            kinds("1.5e-3f .25 42"),
            vec![
                TokenKind::Number("1.5e-3f".to_string()),
                TokenKind::Number(".25".to_string()),
                TokenKind::Number("42".to_string()),
            ]
        );
        // `e` not followed by digits belongs to the next identifier
        assert_eq!(
            kinds("2e"),
            vec![
                TokenKind::Number("2".to_string()),
                TokenKind::Ident("e".to_string())
            ]
        );
    }

    #[test]
    fn test_labels_are_string_tokens() {
        let tokens = tokenize("in(\"Fp1\")").unwrap();
        assert_eq!(tokens[2].kind, TokenKind::Str("Fp1".to_string()));
        assert_eq!((tokens[2].line, tokens[2].column), (1, 4));
    }

    #[test]
    fn test_errors_carry_positions() {
        let err = tokenize("out = 1;\n  out = @").unwrap_err();
        assert_eq!((err.line, err.column), (2, 9));
        assert!(tokenize("/* open").is_err());
        assert!(tokenize("in(\"Fp1)").is_err());
    }

    #[test]
    fn test_render_is_canonical() {
        let a = render(&tokenize("out=in( INDEX ) ;").unwrap());
        let b = render(&tokenize("out   =   in(INDEX);").unwrap());
        assert_eq!(a, "out = in(INDEX);");
        assert_eq!(a, b);
        assert_eq!(
            render(&tokenize("out = -in(0)*2 - in(-1);").unwrap()),
            "out = -in(0) * 2 - in(-1);"
        );
    }
}
