//! Lua tokenizer used by the instrumentation engine.
//!
//! Only as much of the language as is needed to find statement boundaries
//! safely: names, keywords, numbers, strings (short and long-bracket), comments
//! (skipped), and operators. Every token remembers the byte offset and line it
//! starts on, and the line it ends on.

use std::str::Chars;

/// End-of-file sentinel character.
const EOF_CHAR: char = '\0';

/// Lua reserved words
pub const KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

/// Token category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Identifier
    Name,
    /// Reserved word
    Keyword,
    /// Numeric literal
    Number,
    /// String literal, short or long
    Str,
    /// Operator or punctuation
    Symbol,
}

/// A lexed token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'src> {
    /// Category
    pub kind: TokenKind,
    /// Source text of the token
    pub text: &'src str,
    /// Byte offset of the first character
    pub start: usize,
    /// Line the token starts on (1-based)
    pub line: u32,
    /// Line the token ends on
    pub end_line: u32,
}

impl Token<'_> {
    /// True for the keyword `kw`
    #[inline]
    #[must_use]
    pub fn is_keyword(&self, kw: &str) -> bool {
        self.kind == TokenKind::Keyword && self.text == kw
    }

    /// True for the symbol `sym`
    #[inline]
    #[must_use]
    pub fn is_symbol(&self, sym: &str) -> bool {
        self.kind == TokenKind::Symbol && self.text == sym
    }
}

/// A lexing failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    /// Line of the failure
    pub line: u32,
    /// What went wrong
    pub message: String,
}

/// Character cursor with line tracking.
#[derive(Debug, Clone)]
struct Cursor<'src> {
    source: &'src str,
    chars: Chars<'src>,
    pos: usize,
    line: u32,
}

impl<'src> Cursor<'src> {
    fn new(source: &'src str) -> Self {
        Self {
            source,
            chars: source.chars(),
            pos: 0,
            line: 1,
        }
    }

    #[inline]
    fn is_eof(&self) -> bool {
        self.pos >= self.source.len()
    }

    #[inline]
    fn first(&self) -> char {
        self.chars.clone().next().unwrap_or(EOF_CHAR)
    }

    #[inline]
    fn second(&self) -> char {
        let mut chars = self.chars.clone();
        chars.next();
        chars.next().unwrap_or(EOF_CHAR)
    }

    /// Consume one character, counting `\n`, `\r\n` and lone `\r` as one line break.
    #[inline]
    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        self.pos += c.len_utf8();
        match c {
            '\n' => self.line += 1,
            '\r' => {
                if self.first() == '\n' {
                    self.chars.next();
                    self.pos += 1;
                }
                self.line += 1;
            }
            _ => {}
        }
        Some(c)
    }

    #[inline]
    fn eat_while(&mut self, mut predicate: impl FnMut(char) -> bool) {
        while !self.is_eof() && predicate(self.first()) {
            self.bump();
        }
    }

    #[inline]
    fn slice_from(&self, start: usize) -> &'src str {
        &self.source[start..self.pos]
    }

    /// Count `=` signs of a long bracket opener at the cursor (`[`, `[=`, ...)
    /// without consuming. Returns `Some(level)` when a full `[=*[` is present.
    fn long_bracket_level(&self) -> Option<usize> {
        let mut chars = self.chars.clone();
        if chars.next() != Some('[') {
            return None;
        }
        let mut level = 0;
        loop {
            match chars.next() {
                Some('=') => level += 1,
                Some('[') => return Some(level),
                _ => return None,
            }
        }
    }
}

/// Tokenize Lua source
pub fn tokenize(source: &str) -> Result<Vec<Token<'_>>, LexError> {
    let mut cursor = Cursor::new(source);
    let mut tokens = Vec::new();

    // shebang line
    if cursor.first() == '#' {
        cursor.eat_while(|c| c != '\n' && c != '\r');
    }

    loop {
        cursor.eat_while(char::is_whitespace);
        if cursor.is_eof() {
            break;
        }

        let start = cursor.pos;
        let line = cursor.line;
        let c = cursor.first();

        let kind = if c == '-' && cursor.second() == '-' {
            cursor.bump();
            cursor.bump();
            skip_comment(&mut cursor, line)?;
            continue;
        } else if c.is_ascii_alphabetic() || c == '_' {
            cursor.eat_while(|c| c.is_ascii_alphanumeric() || c == '_');
            if KEYWORDS.contains(&cursor.slice_from(start)) {
                TokenKind::Keyword
            } else {
                TokenKind::Name
            }
        } else if c.is_ascii_digit() || (c == '.' && cursor.second().is_ascii_digit()) {
            lex_number(&mut cursor);
            TokenKind::Number
        } else if c == '"' || c == '\'' {
            lex_short_string(&mut cursor, c)?;
            TokenKind::Str
        } else if let Some(level) = cursor.long_bracket_level() {
            lex_long_bracket(&mut cursor, level, line, "string")?;
            TokenKind::Str
        } else if c == '[' && cursor.second() == '=' {
            return Err(LexError {
                line,
                message: "invalid long string delimiter".to_string(),
            });
        } else {
            lex_symbol(&mut cursor, line)?;
            TokenKind::Symbol
        };

        tokens.push(Token {
            kind,
            text: cursor.slice_from(start),
            start,
            line,
            end_line: cursor.line,
        });
    }

    Ok(tokens)
}

fn skip_comment(cursor: &mut Cursor<'_>, line: u32) -> Result<(), LexError> {
    if let Some(level) = cursor.long_bracket_level() {
        lex_long_bracket(cursor, level, line, "comment")
    } else {
        cursor.eat_while(|c| c != '\n' && c != '\r');
        Ok(())
    }
}

fn lex_long_bracket(
    cursor: &mut Cursor<'_>,
    level: usize,
    line: u32,
    what: &str,
) -> Result<(), LexError> {
    // opener: '[' + level '=' + '['
    for _ in 0..level + 2 {
        cursor.bump();
    }
    loop {
        match cursor.bump() {
            None => {
                return Err(LexError {
                    line,
                    message: format!("unfinished long {what}"),
                })
            }
            Some(']') => {
                let mut ahead = cursor.clone();
                let mut seen = 0;
                while ahead.first() == '=' {
                    ahead.bump();
                    seen += 1;
                }
                if seen == level && ahead.first() == ']' {
                    ahead.bump();
                    *cursor = ahead;
                    return Ok(());
                }
            }
            Some(_) => {}
        }
    }
}

fn lex_short_string(cursor: &mut Cursor<'_>, quote: char) -> Result<(), LexError> {
    let line = cursor.line;
    cursor.bump();
    loop {
        match cursor.first() {
            c if c == quote && !cursor.is_eof() => {
                cursor.bump();
                return Ok(());
            }
            '\n' | '\r' => {
                return Err(LexError {
                    line,
                    message: "unfinished string".to_string(),
                })
            }
            '\\' => {
                cursor.bump();
                if cursor.first() == 'z' {
                    cursor.bump();
                    cursor.eat_while(char::is_whitespace);
                } else if cursor.bump().is_none() {
                    return Err(LexError {
                        line,
                        message: "unfinished string".to_string(),
                    });
                }
            }
            _ if cursor.is_eof() => {
                return Err(LexError {
                    line,
                    message: "unfinished string".to_string(),
                })
            }
            _ => {
                cursor.bump();
            }
        }
    }
}

fn lex_number(cursor: &mut Cursor<'_>) {
    let hex = cursor.first() == '0' && matches!(cursor.second(), 'x' | 'X');
    if hex {
        cursor.bump();
        cursor.bump();
    }
    let exponent = if hex { ['p', 'P'] } else { ['e', 'E'] };
    loop {
        let c = cursor.first();
        if exponent.contains(&c) {
            cursor.bump();
            if matches!(cursor.first(), '+' | '-') {
                cursor.bump();
            }
        } else if c.is_ascii_alphanumeric() || c == '.' && cursor.second() != '.' {
            cursor.bump();
        } else {
            break;
        }
    }
}

const THREE_CHAR: &[&str] = &["..."];
const TWO_CHAR: &[&str] = &["..", "==", "~=", "<=", ">=", "<<", ">>", "//", "::"];
const ONE_CHAR: &str = "+-*/%^#&~|<>=(){}[];:,.";

fn lex_symbol(cursor: &mut Cursor<'_>, line: u32) -> Result<(), LexError> {
    let rest = &cursor.source[cursor.pos..];
    let width = if THREE_CHAR.iter().any(|s| rest.starts_with(s)) {
        3
    } else if TWO_CHAR.iter().any(|s| rest.starts_with(s)) {
        2
    } else if ONE_CHAR.contains(cursor.first()) {
        1
    } else {
        return Err(LexError {
            line,
            message: format!("unexpected character {:?}", cursor.first()),
        });
    };
    for _ in 0..width {
        cursor.bump();
    }
    Ok(())
}
