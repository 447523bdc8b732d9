// Copyright 2024 OctoFHIR Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Zero-copy tokenizer for the expression language
//!
//! Tokens borrow from the input. String literal contents are returned raw
//! and unescaped by the parser, which keeps the tokenizer allocation free.

use std::ops::Range;

use super::error::{ParseError, ParseResult};

/// A token with the byte range it covers in the input
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    /// The token
    pub value: T,
    /// Byte offset of the first character
    pub start: usize,
    /// Byte offset one past the last character
    pub end: usize,
}

impl<T> Spanned<T> {
    fn new(value: T, start: usize, end: usize) -> Self {
        Self { value, start, end }
    }

    /// Byte range in the input
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// Expression token
#[derive(Debug, Clone, PartialEq)]
pub enum Token<'input> {
    // Literals
    /// Integer literal (e.g., 42)
    Integer(i64),
    /// Decimal literal as string slice, parsed on demand (e.g., 3.14)
    Decimal(&'input str),
    /// String literal contents, escapes unprocessed
    String(&'input str),

    // Names
    /// Identifier, plain or backtick-quoted
    Identifier(&'input str),
    /// Variable reference without the leading `$`
    Variable(&'input str),

    // Keywords
    /// Boolean literal true
    True,
    /// Boolean literal false
    False,
    /// Null literal
    Null,
    /// Logical AND (`and`, `&&`)
    And,
    /// Logical OR (`or`, `||`)
    Or,
    /// Logical NOT (`not`, `!`)
    Not,
    /// Membership operator (`in`)
    In,
    /// Type test (`is`)
    Is,
    /// Constructor invocation (`new`)
    New,

    // Operators
    /// Addition operator (+)
    Plus,
    /// Subtraction operator (-)
    Minus,
    /// Multiplication operator (*)
    Multiply,
    /// Division operator (/)
    Divide,
    /// Remainder operator (%)
    Percent,
    /// Equality operator (== or =)
    Equal,
    /// Inequality operator (!=)
    NotEqual,
    /// Less than operator (<)
    LessThan,
    /// Less than or equal operator (<=)
    LessThanOrEqual,
    /// Greater than operator (>)
    GreaterThan,
    /// Greater than or equal operator (>=)
    GreaterThanOrEqual,
    /// Ternary operator (?)
    Question,
    /// Null-safe navigation (?.)
    SafeDot,

    // Punctuation
    /// Left parenthesis (
    LeftParen,
    /// Right parenthesis )
    RightParen,
    /// Left square bracket [
    LeftBracket,
    /// Right square bracket ]
    RightBracket,
    /// Left curly brace {
    LeftBrace,
    /// Right curly brace }
    RightBrace,
    /// Dot operator (.) for property access
    Dot,
    /// Comma separator (,)
    Comma,
    /// Colon (:)
    Colon,
}

impl<'input> Token<'input> {
    /// Look up a keyword token
    #[inline]
    pub fn from_keyword(s: &str) -> Option<Token<'input>> {
        match s {
            "true" => Some(Token::True),
            "false" => Some(Token::False),
            "null" => Some(Token::Null),
            "and" => Some(Token::And),
            "or" => Some(Token::Or),
            "not" => Some(Token::Not),
            "in" => Some(Token::In),
            "is" => Some(Token::Is),
            "new" => Some(Token::New),
            _ => None,
        }
    }

    /// Get identifier text if this token is an identifier
    #[inline]
    pub fn as_identifier(&self) -> Option<&'input str> {
        match self {
            Token::Identifier(s) => Some(s),
            _ => None,
        }
    }
}

/// Tokenizer over a borrowed input string
#[derive(Clone)]
pub struct Tokenizer<'input> {
    input: &'input str,
    bytes: &'input [u8],
    pos: usize,
}

impl<'input> Tokenizer<'input> {
    /// Create a new tokenizer
    #[inline]
    pub fn new(input: &'input str) -> Self {
        Self {
            input,
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    /// Current byte offset
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    fn slice(&self, start: usize, end: usize) -> &'input str {
        &self.input[start..end]
    }

    #[inline]
    fn peek_byte(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    #[inline]
    fn is_id_start(ch: u8) -> bool {
        ch.is_ascii_alphabetic() || ch == b'_'
    }

    #[inline]
    fn is_id_continue(ch: u8) -> bool {
        ch.is_ascii_alphanumeric() || ch == b'_'
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn parse_identifier(&mut self) -> &'input str {
        let start = self.pos;
        while self.pos < self.bytes.len() && Self::is_id_continue(self.bytes[self.pos]) {
            self.pos += 1;
        }
        self.slice(start, self.pos)
    }

    fn parse_number(&mut self) -> ParseResult<Token<'input>> {
        let start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }

        let is_decimal = self.peek_byte(0) == Some(b'.')
            && self.peek_byte(1).is_some_and(|b| b.is_ascii_digit());
        if is_decimal {
            self.pos += 1;
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
                self.pos += 1;
            }
            return Ok(Token::Decimal(self.slice(start, self.pos)));
        }

        let text = self.slice(start, self.pos);
        text.parse::<i64>()
            .map(Token::Integer)
            .map_err(|_| ParseError::InvalidLiteral {
                literal_type: "integer",
                value: text.to_string(),
                position: start,
            })
    }

    /// Scan a quoted run, honoring backslash escapes
    fn parse_quoted(&mut self, quote: u8) -> ParseResult<&'input str> {
        let open = self.pos;
        self.pos += 1;
        let start = self.pos;
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b if b == quote => {
                    let content = self.slice(start, self.pos);
                    self.pos += 1;
                    return Ok(content);
                }
                b'\\' => self.pos += 2,
                _ => self.pos += 1,
            }
        }
        Err(ParseError::UnclosedString { position: open })
    }

    /// Produce the next token, or `None` at end of input
    pub fn next_token(&mut self) -> ParseResult<Option<Spanned<Token<'input>>>> {
        self.skip_whitespace();

        let start = self.pos;
        let Some(&byte) = self.bytes.get(self.pos) else {
            return Ok(None);
        };

        let single = |tokenizer: &mut Self, token: Token<'input>, width: usize| {
            tokenizer.pos += width;
            token
        };

        let token = match byte {
            b'.' => single(self, Token::Dot, 1),
            b'(' => single(self, Token::LeftParen, 1),
            b')' => single(self, Token::RightParen, 1),
            b'[' => single(self, Token::LeftBracket, 1),
            b']' => single(self, Token::RightBracket, 1),
            b'{' => single(self, Token::LeftBrace, 1),
            b'}' => single(self, Token::RightBrace, 1),
            b',' => single(self, Token::Comma, 1),
            b':' => single(self, Token::Colon, 1),
            b'+' => single(self, Token::Plus, 1),
            b'-' => single(self, Token::Minus, 1),
            b'*' => single(self, Token::Multiply, 1),
            b'/' => single(self, Token::Divide, 1),
            b'%' => single(self, Token::Percent, 1),
            b'=' => match self.peek_byte(1) {
                Some(b'=') => single(self, Token::Equal, 2),
                _ => single(self, Token::Equal, 1),
            },
            b'!' => match self.peek_byte(1) {
                Some(b'=') => single(self, Token::NotEqual, 2),
                _ => single(self, Token::Not, 1),
            },
            b'<' => match self.peek_byte(1) {
                Some(b'=') => single(self, Token::LessThanOrEqual, 2),
                _ => single(self, Token::LessThan, 1),
            },
            b'>' => match self.peek_byte(1) {
                Some(b'=') => single(self, Token::GreaterThanOrEqual, 2),
                _ => single(self, Token::GreaterThan, 1),
            },
            b'?' => match self.peek_byte(1) {
                Some(b'.') => single(self, Token::SafeDot, 2),
                _ => single(self, Token::Question, 1),
            },
            b'&' if self.peek_byte(1) == Some(b'&') => single(self, Token::And, 2),
            b'|' if self.peek_byte(1) == Some(b'|') => single(self, Token::Or, 2),
            b'\'' | b'"' => Token::String(self.parse_quoted(byte)?),
            b'`' => Token::Identifier(self.parse_quoted(b'`')?),
            b'$' => {
                self.pos += 1;
                if !self.peek_byte(0).is_some_and(Self::is_id_start) {
                    return Err(ParseError::ExpectedToken {
                        expected: "variable name after '$'".to_string(),
                        position: self.pos,
                    });
                }
                Token::Variable(self.parse_identifier())
            }
            b if b.is_ascii_digit() => self.parse_number()?,
            b if Self::is_id_start(b) => {
                let ident = self.parse_identifier();
                Token::from_keyword(ident).unwrap_or(Token::Identifier(ident))
            }
            _ => {
                let character = self.input[start..].chars().next().unwrap_or('\0');
                return Err(ParseError::UnexpectedCharacter {
                    character,
                    position: start,
                });
            }
        };

        Ok(Some(Spanned::new(token, start, self.pos)))
    }

    /// Tokenize the whole input
    pub fn tokenize_all(&mut self) -> ParseResult<Vec<Spanned<Token<'input>>>> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<Token<'_>> {
        Tokenizer::new(input)
            .tokenize_all()
            .unwrap()
            .into_iter()
            .map(|t| t.value)
            .collect()
    }

    #[test]
    fn test_tokenizer_basic() {
        assert_eq!(
            tokens("result.a * 10"),
            vec![
                Token::Identifier("result"),
                Token::Dot,
                Token::Identifier("a"),
                Token::Multiply,
                Token::Integer(10),
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            tokens("== = != ! && || ?. ? <= >="),
            vec![
                Token::Equal,
                Token::Equal,
                Token::NotEqual,
                Token::Not,
                Token::And,
                Token::Or,
                Token::SafeDot,
                Token::Question,
                Token::LessThanOrEqual,
                Token::GreaterThanOrEqual,
            ]
        );
    }

    #[test]
    fn test_string_literals() {
        assert_eq!(tokens("'a\\'b'"), vec![Token::String("a\\'b")]);
        assert_eq!(tokens("\"x\""), vec![Token::String("x")]);
        assert!(matches!(
            Tokenizer::new("'open").tokenize_all(),
            Err(ParseError::UnclosedString { position: 0 })
        ));
    }

    #[test]
    fn test_numbers() {
        assert_eq!(tokens("42 3.5"), vec![Token::Integer(42), Token::Decimal("3.5")]);
        assert_eq!(
            tokens("1.size"),
            vec![Token::Integer(1), Token::Dot, Token::Identifier("size")]
        );
        assert!(Tokenizer::new("99999999999999999999").tokenize_all().is_err());
    }

    #[test]
    fn test_variables_and_quoted_identifiers() {
        assert_eq!(
            tokens("$root.`x-trace`"),
            vec![Token::Variable("root"), Token::Dot, Token::Identifier("x-trace")]
        );
        assert!(Tokenizer::new("$ 1").tokenize_all().is_err());
    }

    #[test]
    fn test_spans() {
        let spanned = Tokenizer::new("  abc").tokenize_all().unwrap();
        assert_eq!(spanned[0].range(), 2..5);
    }
}
