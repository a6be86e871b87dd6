// File: src/lexer.rs
//
// Lexical analyzer for the Alto language.
// Splits source text into positioned tokens; every token remembers the
// line it came from so later stages can render precise errors.

use crate::errors::{AltoError, SourceLocation};
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Identifier or keyword
    Word,
    /// Numeric literal with its parsed value
    Number(f64),
    /// String literal with escapes decoded
    Str(String),
    /// One of the recognized operator/delimiter spellings
    Punct,
    /// End-of-input sentinel
    End,
}

/// A single token with its position and surrounding line text
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    /// Raw lexeme as it appeared in the source
    pub text: String,
    pub row: usize,
    pub column: usize,
    /// Full text of the source line the token starts on
    pub line: Rc<str>,
}

impl Token {
    pub fn location(&self) -> SourceLocation {
        SourceLocation::new(self.row, self.column)
    }

    pub fn is_word(&self, text: &str) -> bool {
        self.kind == TokenKind::Word && self.text == text
    }

    pub fn is_punct(&self, text: &str) -> bool {
        self.kind == TokenKind::Punct && self.text == text
    }

    pub fn is_end(&self) -> bool {
        self.kind == TokenKind::End
    }
}

/// Two-character operators; checked before single characters so `<=` wins
/// over `<` followed by `=`.
const DOUBLE_PUNCT: &[&str] = &[
    "==", "!=", "<=", ">=", "&&", "||", "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "=>",
];

const SINGLE_PUNCT: &str = "+-*/%!<>=&|^?:;,.()[]{}";

/// Splits source text into rows on `\n`, `\r\n`, or a lone `\r`.
fn split_rows(source: &str) -> Vec<Rc<str>> {
    let mut rows = Vec::new();
    let mut current = String::new();
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\n' => {
                rows.push(Rc::from(current.as_str()));
                current.clear();
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                rows.push(Rc::from(current.as_str()));
                current.clear();
            }
            _ => current.push(c),
        }
    }
    rows.push(Rc::from(current.as_str()));
    rows
}

/// Tokenize source text into a finite token sequence ending in an End token.
pub fn tokenize(source: &str) -> Result<Vec<Token>, AltoError> {
    let rows = split_rows(source);
    let mut tokens = Vec::new();

    for (index, line) in rows.iter().enumerate() {
        let row = index + 1;

        // A #!-prefixed first line is skipped (shell interpreter line)
        if row == 1 && line.starts_with("#!") {
            continue;
        }

        let chars: Vec<char> = line.chars().collect();
        let mut pos = 0;

        while pos < chars.len() {
            let c = chars[pos];
            let column = pos + 1;

            if c == ' ' || c == '\t' {
                pos += 1;
                continue;
            }

            // Line comment runs to end of row
            if c == '/' && chars.get(pos + 1) == Some(&'/') {
                break;
            }

            if c == '_' || c.is_alphabetic() {
                let start = pos;
                while pos < chars.len() && (chars[pos] == '_' || chars[pos].is_alphanumeric()) {
                    pos += 1;
                }
                let text: String = chars[start..pos].iter().collect();
                tokens.push(Token {
                    kind: TokenKind::Word,
                    text,
                    row,
                    column,
                    line: Rc::clone(line),
                });
                continue;
            }

            if c.is_ascii_digit() {
                let start = pos;
                while pos < chars.len() && chars[pos].is_ascii_digit() {
                    pos += 1;
                }
                if pos < chars.len()
                    && chars[pos] == '.'
                    && chars.get(pos + 1).is_some_and(|d| d.is_ascii_digit())
                {
                    pos += 1;
                    while pos < chars.len() && chars[pos].is_ascii_digit() {
                        pos += 1;
                    }
                }
                if pos < chars.len() && (chars[pos] == 'e' || chars[pos] == 'E') {
                    let mut ahead = pos + 1;
                    if ahead < chars.len() && (chars[ahead] == '+' || chars[ahead] == '-') {
                        ahead += 1;
                    }
                    if ahead < chars.len() && chars[ahead].is_ascii_digit() {
                        pos = ahead;
                        while pos < chars.len() && chars[pos].is_ascii_digit() {
                            pos += 1;
                        }
                    }
                }
                let text: String = chars[start..pos].iter().collect();
                let value = text.parse::<f64>().map_err(|_| {
                    AltoError::lex_error(
                        format!("malformed number literal '{}'", text),
                        SourceLocation::new(row, column),
                    )
                    .with_source(line.to_string())
                })?;
                tokens.push(Token {
                    kind: TokenKind::Number(value),
                    text,
                    row,
                    column,
                    line: Rc::clone(line),
                });
                continue;
            }

            if c == '"' || c == '\'' {
                let quote = c;
                let start = pos;
                pos += 1;
                let mut decoded = String::new();
                let mut closed = false;
                while pos < chars.len() {
                    let d = chars[pos];
                    pos += 1;
                    if d == quote {
                        closed = true;
                        break;
                    }
                    if d == '\\' {
                        let esc = chars.get(pos).copied().ok_or_else(|| {
                            AltoError::lex_error(
                                "unterminated escape sequence".to_string(),
                                SourceLocation::new(row, pos),
                            )
                            .with_source(line.to_string())
                        })?;
                        pos += 1;
                        match esc {
                            'n' => decoded.push('\n'),
                            'r' => decoded.push('\r'),
                            '"' => decoded.push('"'),
                            '\'' => decoded.push('\''),
                            '\\' => decoded.push('\\'),
                            other => {
                                return Err(AltoError::lex_error(
                                    format!("unrecognized escape '\\{}'", other),
                                    SourceLocation::new(row, pos - 1),
                                )
                                .with_source(line.to_string()));
                            }
                        }
                    } else {
                        decoded.push(d);
                    }
                }
                if !closed {
                    return Err(AltoError::lex_error(
                        "unterminated string literal".to_string(),
                        SourceLocation::new(row, column),
                    )
                    .with_source(line.to_string()));
                }
                let text: String = chars[start..pos].iter().collect();
                tokens.push(Token {
                    kind: TokenKind::Str(decoded),
                    text,
                    row,
                    column,
                    line: Rc::clone(line),
                });
                continue;
            }

            // Three-character rest marker
            if c == '.' && chars.get(pos + 1) == Some(&'.') && chars.get(pos + 2) == Some(&'.') {
                pos += 3;
                tokens.push(Token {
                    kind: TokenKind::Punct,
                    text: "...".to_string(),
                    row,
                    column,
                    line: Rc::clone(line),
                });
                continue;
            }

            if let Some(&next) = chars.get(pos + 1) {
                let pair: String = [c, next].iter().collect();
                if DOUBLE_PUNCT.contains(&pair.as_str()) {
                    pos += 2;
                    tokens.push(Token {
                        kind: TokenKind::Punct,
                        text: pair,
                        row,
                        column,
                        line: Rc::clone(line),
                    });
                    continue;
                }
            }

            if SINGLE_PUNCT.contains(c) {
                pos += 1;
                tokens.push(Token {
                    kind: TokenKind::Punct,
                    text: c.to_string(),
                    row,
                    column,
                    line: Rc::clone(line),
                });
                continue;
            }

            return Err(AltoError::lex_error(
                format!("unrecognized character '{}'", c),
                SourceLocation::new(row, column),
            )
            .with_source(line.to_string()));
        }
    }

    let last_row = rows.len();
    let end_line = rows.last().cloned().unwrap_or_else(|| Rc::from(""));
    tokens.push(Token {
        kind: TokenKind::End,
        text: String::new(),
        row: last_row,
        column: end_line.chars().count() + 1,
        line: end_line,
    });

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_track_rows_and_columns() {
        let tokens = tokenize("var x = 1\n  x += 2").unwrap();
        assert!(tokens[0].is_word("var"));
        assert_eq!((tokens[0].row, tokens[0].column), (1, 1));
        let x = tokens.iter().find(|t| t.is_word("x") && t.row == 2).unwrap();
        assert_eq!(x.column, 3);
    }

    #[test]
    fn carriage_returns_split_rows() {
        let tokens = tokenize("a\r\nb\rc").unwrap();
        let rows: Vec<usize> =
            tokens.iter().filter(|t| t.kind == TokenKind::Word).map(|t| t.row).collect();
        assert_eq!(rows, vec![1, 2, 3]);
    }

    #[test]
    fn shebang_and_comments_are_skipped() {
        let tokens = tokenize("#!/usr/bin/env alto\nvar x = 1 // trailing\n").unwrap();
        assert!(tokens[0].is_word("var"));
        assert!(!tokens.iter().any(|t| t.is_word("trailing")));
    }

    #[test]
    fn string_escapes_decode() {
        let tokens = tokenize(r#"'a\n\'b\'' "c\\d""#).unwrap();
        match (&tokens[0].kind, &tokens[1].kind) {
            (TokenKind::Str(a), TokenKind::Str(b)) => {
                assert_eq!(a, "a\n'b'");
                assert_eq!(b, "c\\d");
            }
            other => panic!("expected two strings, got {:?}", other),
        }
    }

    #[test]
    fn two_char_operators_win_over_single() {
        let tokens = tokenize("a <= b => c ... d").unwrap();
        let puncts: Vec<&str> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Punct)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(puncts, vec!["<=", "=>", "..."]);
    }

    #[test]
    fn unrecognized_character_reports_position() {
        let err = tokenize("var x = @").unwrap_err();
        assert_eq!(err.location.row, 1);
        assert_eq!(err.location.column, 9);
    }

    #[test]
    fn number_forms_parse() {
        let tokens = tokenize("0 3.25 1e3 2.5e-1").unwrap();
        let nums: Vec<f64> = tokens
            .iter()
            .filter_map(|t| match t.kind {
                TokenKind::Number(n) => Some(n),
                _ => None,
            })
            .collect();
        assert_eq!(nums, vec![0.0, 3.25, 1000.0, 0.25]);
    }
}
