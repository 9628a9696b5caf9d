//! The shared recursive-descent parser for annotation files.
//!
//! The grammar of all three tables is line-oriented and regular enough that a
//! small hand-written cursor suffices: tokens are separated by whitespace,
//! `#` starts a comment that extends to the end of the line, and every entry
//! starts with a keyword or a function identifier. Errors carry the line and
//! column where parsing stopped.

use super::APosition;
use std::fmt;

/// A parse failure with its location in the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parse error at line {}, column {}: {}",
            self.line, self.column, self.message
        )
    }
}

impl std::error::Error for ParseError {}

/// A character cursor over an annotation file.
pub struct Cursor<'a> {
    text: &'a str,
    pos: usize,
    line: usize,
    column: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(text: &'a str) -> Self {
        Cursor {
            text,
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    /// Skip whitespace and `#` comments.
    pub fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('#') => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                _ => return,
            }
        }
    }

    pub fn at_end(&mut self) -> bool {
        self.skip_trivia();
        self.pos >= self.text.len()
    }

    pub fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            line: self.line,
            column: self.column,
            message: message.into(),
        }
    }

    /// Read the next whitespace-delimited word without consuming it.
    fn peek_word(&mut self) -> Option<&'a str> {
        self.skip_trivia();
        let rest = &self.text[self.pos..];
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '#')
            .unwrap_or(rest.len());
        if end == 0 {
            None
        } else {
            Some(&rest[..end])
        }
    }

    /// Consume and return the next word.
    pub fn word(&mut self) -> Result<&'a str, ParseError> {
        let word = self
            .peek_word()
            .ok_or_else(|| self.error("expected a token"))?;
        for _ in 0..word.chars().count() {
            self.bump();
        }
        Ok(word)
    }

    /// Consume the next word and require it to be an identifier (function
    /// name): word characters plus `.`.
    pub fn identifier(&mut self) -> Result<String, ParseError> {
        let word = self.word()?;
        if word
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.')
        {
            Ok(word.to_string())
        } else {
            Err(self.error(format!("invalid identifier `{word}`")))
        }
    }

    /// Consume the next word if it equals `keyword`.
    pub fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_word() == Some(keyword) {
            let _ = self.word();
            true
        } else {
            false
        }
    }

    /// Parse a position token: `Ret`, `Arg<i>` or `AfterArg<i>`.
    pub fn position(&mut self) -> Result<APosition, ParseError> {
        let word = self.word()?;
        if word == "Ret" {
            return Ok(APosition::Ret);
        }
        if let Some(digits) = word.strip_prefix("AfterArg") {
            return Ok(APosition::AfterArg(self.index_of(digits, word)?));
        }
        if let Some(digits) = word.strip_prefix("Arg") {
            return Ok(APosition::Arg(self.index_of(digits, word)?));
        }
        Err(self.error(format!("expected a position, found `{word}`")))
    }

    fn index_of(&self, digits: &str, word: &str) -> Result<u8, ParseError> {
        digits
            .parse::<u8>()
            .map_err(|_| self.error(format!("invalid argument index in `{word}`")))
    }

    /// Snapshot the cursor state for limited backtracking (e.g. optional
    /// trailing tokens).
    pub fn snapshot(&self) -> Cursor<'a> {
        Cursor {
            text: self.text,
            pos: self.pos,
            line: self.line,
            column: self.column,
        }
    }

    /// Adopt the state of a snapshot that was advanced.
    pub fn restore(&mut self, other: Cursor<'a>) {
        self.pos = other.pos;
        self.line = other.line;
        self.column = other.column;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_and_comments() {
        let mut cursor = Cursor::new("  # a comment\n  foo   bar # trailing\nbaz");
        assert_eq!(cursor.word().unwrap(), "foo");
        assert_eq!(cursor.word().unwrap(), "bar");
        assert_eq!(cursor.word().unwrap(), "baz");
        assert!(cursor.at_end());
    }

    #[test]
    fn positions() {
        let mut cursor = Cursor::new("Ret Arg0 AfterArg2 Arg255");
        assert_eq!(cursor.position().unwrap(), APosition::Ret);
        assert_eq!(cursor.position().unwrap(), APosition::Arg(0));
        assert_eq!(cursor.position().unwrap(), APosition::AfterArg(2));
        assert_eq!(cursor.position().unwrap(), APosition::Arg(255));
    }

    #[test]
    fn error_location() {
        let mut cursor = Cursor::new("foo\n  !!!");
        assert_eq!(cursor.word().unwrap(), "foo");
        let err = cursor.identifier().unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("!!!"));
    }

    #[test]
    fn index_overflow_is_an_error() {
        let mut cursor = Cursor::new("Arg256");
        assert!(cursor.position().is_err());
    }
}
