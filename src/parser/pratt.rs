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

//! Pratt parser for the shared expression language
//!
//! ## Precedence levels (highest to lowest)
//! - **Postfix** (9): `.`, `?.`, `[]`, method calls
//! - **Unary** (8): `-`, `not`, `!`
//! - **Multiplicative** (7): `*`, `/`, `%`
//! - **Additive** (6): `+`, `-`
//! - **Comparison** (5): `<`, `<=`, `>`, `>=`, `in`, `is`
//! - **Equality** (4): `==`, `!=`
//! - **And** (3): `and`, `&&`
//! - **Or** (2): `or`, `||`
//! - **Ternary** (1): `? :` (right associative)

use smallvec::SmallVec;

use super::error::{ParseError, ParseResult};
use super::tokenizer::{Spanned, Token, Tokenizer};
use crate::ast::{BinaryOperator, ExpressionNode, LiteralValue, UnaryOperator};

/// Default maximum nesting depth accepted by the parser
pub const DEFAULT_MAX_DEPTH: usize = 128;

/// Operator precedence levels (higher = tighter binding)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
    /// Ternary conditional
    Ternary = 1,
    /// Logical OR
    Or = 2,
    /// Logical AND
    And = 3,
    /// Equality operators
    Equality = 4,
    /// Relational, membership and type operators
    Comparison = 5,
    /// Additive operators
    Additive = 6,
    /// Multiplicative operators
    Multiplicative = 7,
    /// Unary operators
    Unary = 8,
    /// Navigation and indexing
    Postfix = 9,
}

impl Precedence {
    /// Get the next higher precedence level for left-associative operators
    #[inline(always)]
    pub const fn next_level(self) -> Self {
        match self {
            Precedence::Ternary => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Additive,
            Precedence::Additive => Precedence::Multiplicative,
            Precedence::Multiplicative => Precedence::Unary,
            Precedence::Unary => Precedence::Postfix,
            Precedence::Postfix => Precedence::Postfix,
        }
    }
}

#[inline(always)]
fn get_precedence(token: &Token<'_>) -> Option<Precedence> {
    match token {
        Token::Equal | Token::NotEqual => Some(Precedence::Equality),
        Token::Plus | Token::Minus => Some(Precedence::Additive),
        Token::And => Some(Precedence::And),
        Token::Or => Some(Precedence::Or),
        Token::Multiply | Token::Divide | Token::Percent => Some(Precedence::Multiplicative),
        Token::LessThan
        | Token::LessThanOrEqual
        | Token::GreaterThan
        | Token::GreaterThanOrEqual
        | Token::In
        | Token::Is => Some(Precedence::Comparison),
        Token::Question => Some(Precedence::Ternary),
        _ => None,
    }
}

#[inline(always)]
fn token_to_binary_op(token: &Token<'_>) -> Option<BinaryOperator> {
    match token {
        Token::Equal => Some(BinaryOperator::Equal),
        Token::NotEqual => Some(BinaryOperator::NotEqual),
        Token::Plus => Some(BinaryOperator::Add),
        Token::Minus => Some(BinaryOperator::Subtract),
        Token::And => Some(BinaryOperator::And),
        Token::Or => Some(BinaryOperator::Or),
        Token::LessThan => Some(BinaryOperator::LessThan),
        Token::LessThanOrEqual => Some(BinaryOperator::LessThanOrEqual),
        Token::GreaterThan => Some(BinaryOperator::GreaterThan),
        Token::GreaterThanOrEqual => Some(BinaryOperator::GreaterThanOrEqual),
        Token::In => Some(BinaryOperator::In),
        Token::Multiply => Some(BinaryOperator::Multiply),
        Token::Divide => Some(BinaryOperator::Divide),
        Token::Percent => Some(BinaryOperator::Modulo),
        _ => None,
    }
}

/// Pratt parser producing [`ExpressionNode`] trees
pub struct PrattParser<'input> {
    tokenizer: Tokenizer<'input>,
    current: Option<Spanned<Token<'input>>>,
    depth: usize,
    max_depth: usize,
}

impl<'input> PrattParser<'input> {
    /// Create a new parser
    pub fn new(input: &'input str) -> Self {
        Self::with_max_depth(input, DEFAULT_MAX_DEPTH)
    }

    /// Create a parser with a custom nesting limit
    pub fn with_max_depth(input: &'input str, max_depth: usize) -> Self {
        Self {
            tokenizer: Tokenizer::new(input),
            current: None,
            depth: 0,
            max_depth,
        }
    }

    #[inline(always)]
    fn advance(&mut self) -> ParseResult<()> {
        self.current = self.tokenizer.next_token()?;
        Ok(())
    }

    #[inline(always)]
    fn current(&self) -> Option<&Token<'input>> {
        self.current.as_ref().map(|t| &t.value)
    }

    /// Position of the current token, or end of input
    fn position(&self) -> usize {
        self.current
            .as_ref()
            .map_or(self.tokenizer.position(), |t| t.start)
    }

    /// Take the current token and move to the next one
    fn bump(&mut self) -> ParseResult<Option<Token<'input>>> {
        let token = self.current.take().map(|t| t.value);
        self.advance()?;
        Ok(token)
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        match &self.current {
            Some(token) => ParseError::UnexpectedToken {
                token: format!("{:?} (expected {expected})", token.value),
                position: token.start,
            },
            None => ParseError::UnexpectedEndOfInput {
                position: self.tokenizer.position(),
            },
        }
    }

    fn expect(&mut self, expected: Token<'input>, description: &str) -> ParseResult<()> {
        match self.current() {
            Some(token) if std::mem::discriminant(token) == std::mem::discriminant(&expected) => {
                self.advance()
            }
            _ => Err(self.unexpected(description)),
        }
    }

    fn enter(&mut self) -> ParseResult<()> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(ParseError::TooDeep {
                max_depth: self.max_depth,
            });
        }
        Ok(())
    }

    fn parse_expression_with_precedence(
        &mut self,
        min_precedence: Precedence,
    ) -> ParseResult<ExpressionNode> {
        self.enter()?;
        let mut left = self.parse_unary()?;

        while let Some(token) = self.current() {
            let precedence = match get_precedence(token) {
                Some(prec) if prec >= min_precedence => prec,
                _ => break,
            };

            match token {
                Token::Question => {
                    self.advance()?;
                    let then_expr = self.parse_expression_with_precedence(Precedence::Ternary)?;
                    self.expect(Token::Colon, "':' in conditional expression")?;
                    let else_expr = self.parse_expression_with_precedence(Precedence::Ternary)?;
                    left = ExpressionNode::conditional(left, then_expr, else_expr);
                }
                Token::Is => {
                    self.advance()?;
                    let type_name = self.parse_type_name()?;
                    left = ExpressionNode::type_check(left, type_name);
                }
                _ => {
                    let Some(op) = token_to_binary_op(token) else {
                        break;
                    };
                    self.advance()?;
                    let right = self.parse_expression_with_precedence(precedence.next_level())?;
                    left = ExpressionNode::binary_op(op, left, right);
                }
            }
        }

        self.depth -= 1;
        Ok(left)
    }

    fn parse_unary(&mut self) -> ParseResult<ExpressionNode> {
        match self.current() {
            Some(Token::Minus) => {
                self.advance()?;
                self.enter()?;
                let operand = self.parse_unary()?;
                self.depth -= 1;
                Ok(match operand {
                    ExpressionNode::Literal(LiteralValue::Integer(i)) => {
                        ExpressionNode::literal(LiteralValue::Integer(i.wrapping_neg()))
                    }
                    ExpressionNode::Literal(LiteralValue::Decimal(d)) => {
                        ExpressionNode::literal(LiteralValue::Decimal(format!("-{d}")))
                    }
                    other => ExpressionNode::unary_op(UnaryOperator::Negate, other),
                })
            }
            Some(Token::Not) => {
                self.advance()?;
                self.enter()?;
                let operand = self.parse_unary()?;
                self.depth -= 1;
                Ok(ExpressionNode::unary_op(UnaryOperator::Not, operand))
            }
            _ => {
                let primary = self.parse_primary()?;
                self.parse_postfix(primary)
            }
        }
    }

    fn parse_primary(&mut self) -> ParseResult<ExpressionNode> {
        let position = self.position();
        let Some(token) = self.bump()? else {
            return Err(ParseError::UnexpectedEndOfInput { position });
        };

        match token {
            Token::Identifier(name) => {
                if let Some(Token::LeftParen) = self.current() {
                    let args = self.parse_arguments()?;
                    Ok(ExpressionNode::function_call(name, args))
                } else {
                    Ok(ExpressionNode::identifier(name))
                }
            }
            Token::Integer(value) => Ok(ExpressionNode::literal(LiteralValue::Integer(value))),
            Token::Decimal(value) => Ok(ExpressionNode::literal(LiteralValue::Decimal(
                value.to_string(),
            ))),
            Token::String(raw) => Ok(ExpressionNode::literal(LiteralValue::String(
                Self::process_string_escapes(raw, position)?,
            ))),
            Token::True => Ok(ExpressionNode::literal(LiteralValue::Boolean(true))),
            Token::False => Ok(ExpressionNode::literal(LiteralValue::Boolean(false))),
            Token::Null => Ok(ExpressionNode::literal(LiteralValue::Null)),
            Token::Variable(name) => Ok(ExpressionNode::variable(name)),
            Token::New => {
                let type_name = self.parse_type_name()?;
                let args = self.parse_arguments()?;
                Ok(ExpressionNode::constructor(type_name, args))
            }
            Token::LeftParen => {
                let inner = self.parse_expression_with_precedence(Precedence::Ternary)?;
                self.expect(Token::RightParen, "')'")?;
                Ok(inner)
            }
            Token::LeftBracket => {
                let mut items = Vec::new();
                if let Some(Token::RightBracket) = self.current() {
                    self.advance()?;
                    return Ok(ExpressionNode::List(items));
                }
                loop {
                    items.push(self.parse_expression_with_precedence(Precedence::Ternary)?);
                    match self.bump()? {
                        Some(Token::Comma) => continue,
                        Some(Token::RightBracket) => break,
                        _ => {
                            return Err(ParseError::ExpectedToken {
                                expected: "',' or ']' in list literal".to_string(),
                                position: self.position(),
                            });
                        }
                    }
                }
                Ok(ExpressionNode::List(items))
            }
            Token::LeftBrace => self.parse_map_literal(),
            other => Err(ParseError::UnexpectedToken {
                token: format!("{other:?}"),
                position,
            }),
        }
    }

    fn parse_map_literal(&mut self) -> ParseResult<ExpressionNode> {
        let mut entries = Vec::new();
        if let Some(Token::RightBrace) = self.current() {
            self.advance()?;
            return Ok(ExpressionNode::Map(entries));
        }
        loop {
            let position = self.position();
            let key = match self.bump()? {
                Some(Token::Identifier(name)) => name.to_string(),
                Some(Token::String(raw)) => Self::process_string_escapes(raw, position)?,
                _ => {
                    return Err(ParseError::ExpectedToken {
                        expected: "map key".to_string(),
                        position,
                    });
                }
            };
            self.expect(Token::Colon, "':' after map key")?;
            let value = self.parse_expression_with_precedence(Precedence::Ternary)?;
            entries.push((key, value));
            match self.bump()? {
                Some(Token::Comma) => continue,
                Some(Token::RightBrace) => break,
                _ => {
                    return Err(ParseError::ExpectedToken {
                        expected: "',' or '}' in map literal".to_string(),
                        position: self.position(),
                    });
                }
            }
        }
        Ok(ExpressionNode::Map(entries))
    }

    fn parse_postfix(&mut self, mut left: ExpressionNode) -> ParseResult<ExpressionNode> {
        loop {
            match self.current() {
                Some(Token::Dot) | Some(Token::SafeDot) => {
                    let null_safe = matches!(self.current(), Some(Token::SafeDot));
                    self.advance()?;
                    let name = match self.current().and_then(Token::as_identifier) {
                        Some(name) => name,
                        None => return Err(self.unexpected("member name")),
                    };
                    self.advance()?;
                    left = if let Some(Token::LeftParen) = self.current() {
                        let args = self.parse_arguments()?;
                        ExpressionNode::method_call(left, name, args, null_safe)
                    } else {
                        ExpressionNode::path(left, name, null_safe)
                    };
                }
                Some(Token::LeftBracket) => {
                    self.advance()?;
                    let index = self.parse_expression_with_precedence(Precedence::Ternary)?;
                    self.expect(Token::RightBracket, "']'")?;
                    left = ExpressionNode::index(left, index);
                }
                _ => return Ok(left),
            }
        }
    }

    /// Parse `( arg, ... )`
    fn parse_arguments(&mut self) -> ParseResult<SmallVec<[ExpressionNode; 4]>> {
        self.expect(Token::LeftParen, "'('")?;
        let mut args = SmallVec::new();

        if let Some(Token::RightParen) = self.current() {
            self.advance()?;
            return Ok(args);
        }

        loop {
            args.push(self.parse_expression_with_precedence(Precedence::Ternary)?);
            match self.bump()? {
                Some(Token::Comma) => continue,
                Some(Token::RightParen) => return Ok(args),
                _ => {
                    return Err(ParseError::ExpectedToken {
                        expected: "',' or ')' in arguments".to_string(),
                        position: self.position(),
                    });
                }
            }
        }
    }

    /// Parse a possibly qualified type name such as `acme.billing.Invoice`
    fn parse_type_name(&mut self) -> ParseResult<String> {
        let mut type_name = match self.current().and_then(Token::as_identifier) {
            Some(first) => first.to_string(),
            None => return Err(self.unexpected("type name")),
        };
        self.advance()?;

        while let Some(Token::Dot) = self.current() {
            self.advance()?;
            match self.current().and_then(Token::as_identifier) {
                Some(part) => {
                    type_name.push('.');
                    type_name.push_str(part);
                    self.advance()?;
                }
                None => return Err(self.unexpected("identifier in qualified type name")),
            }
        }
        Ok(type_name)
    }

    /// Parse a complete expression, rejecting trailing input
    pub fn parse(&mut self) -> ParseResult<ExpressionNode> {
        self.advance()?;
        let expression = self.parse_expression_with_precedence(Precedence::Ternary)?;
        match &self.current {
            None => Ok(expression),
            Some(token) => Err(ParseError::UnexpectedToken {
                token: format!("{:?}", token.value),
                position: token.start,
            }),
        }
    }

    fn process_string_escapes(input: &str, position: usize) -> ParseResult<String> {
        let mut result = String::with_capacity(input.len());
        let mut chars = input.chars();

        while let Some(ch) = chars.next() {
            if ch != '\\' {
                result.push(ch);
                continue;
            }
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('t') => result.push('\t'),
                Some('r') => result.push('\r'),
                Some('\\') => result.push('\\'),
                Some('\'') => result.push('\''),
                Some('"') => result.push('"'),
                Some('`') => result.push('`'),
                Some('u') => {
                    let hex: String = chars.by_ref().take(4).collect();
                    let decoded = (hex.len() == 4)
                        .then(|| u32::from_str_radix(&hex, 16).ok())
                        .flatten()
                        .and_then(char::from_u32);
                    match decoded {
                        Some(unicode_char) => result.push(unicode_char),
                        None => {
                            return Err(ParseError::InvalidEscape {
                                sequence: format!("\\u{hex}"),
                                position,
                            });
                        }
                    }
                }
                Some(other) => {
                    return Err(ParseError::InvalidEscape {
                        sequence: format!("\\{other}"),
                        position,
                    });
                }
                None => {
                    return Err(ParseError::InvalidEscape {
                        sequence: "\\".to_string(),
                        position,
                    });
                }
            }
        }

        Ok(result)
    }
}

/// Parse an expression with the default nesting limit
pub fn parse_expression(input: &str) -> ParseResult<ExpressionNode> {
    PrattParser::new(input).parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn int(i: i64) -> ExpressionNode {
        ExpressionNode::literal(LiteralValue::Integer(i))
    }

    #[test]
    fn test_precedence_ordering() {
        assert!(Precedence::Multiplicative > Precedence::Additive);
        assert!(Precedence::And > Precedence::Or);
        assert!(Precedence::Ternary < Precedence::Or);
    }

    #[test]
    fn test_basic_expressions() {
        assert_eq!(
            parse_expression("1 + 2 * 3").unwrap(),
            ExpressionNode::binary_op(
                BinaryOperator::Add,
                int(1),
                ExpressionNode::binary_op(BinaryOperator::Multiply, int(2), int(3)),
            )
        );
        assert_eq!(
            parse_expression("result.a * 10").unwrap(),
            ExpressionNode::binary_op(
                BinaryOperator::Multiply,
                ExpressionNode::path(ExpressionNode::identifier("result"), "a", false),
                int(10),
            )
        );
    }

    #[test]
    fn test_associativity() {
        assert_eq!(
            parse_expression("10 - 4 - 3").unwrap(),
            ExpressionNode::binary_op(
                BinaryOperator::Subtract,
                ExpressionNode::binary_op(BinaryOperator::Subtract, int(10), int(4)),
                int(3),
            )
        );
    }

    #[test]
    fn test_ternary_is_right_associative() {
        let parsed = parse_expression("a ? 1 : b ? 2 : 3").unwrap();
        assert_eq!(
            parsed,
            ExpressionNode::conditional(
                ExpressionNode::identifier("a"),
                int(1),
                ExpressionNode::conditional(ExpressionNode::identifier("b"), int(2), int(3)),
            )
        );
    }

    #[test]
    fn test_calls_and_navigation() {
        let parsed = parse_expression("sum(items)?.name.toUpperCase()").unwrap();
        assert_eq!(
            parsed,
            ExpressionNode::method_call(
                ExpressionNode::path(
                    ExpressionNode::function_call("sum", vec![ExpressionNode::identifier("items")]),
                    "name",
                    true,
                ),
                "toUpperCase",
                Vec::new(),
                false,
            )
        );
    }

    #[test]
    fn test_constructor_and_type_check() {
        assert_eq!(
            parse_expression("new lang.Integer('4') is Integer").unwrap(),
            ExpressionNode::type_check(
                ExpressionNode::constructor(
                    "lang.Integer",
                    vec![ExpressionNode::literal(LiteralValue::String("4".into()))],
                ),
                "Integer",
            )
        );
    }

    #[test]
    fn test_collection_literals() {
        assert_eq!(
            parse_expression("{x: 1, 'y z': [2, -3]}").unwrap(),
            ExpressionNode::Map(vec![
                ("x".to_string(), int(1)),
                ("y z".to_string(), ExpressionNode::List(vec![int(2), int(-3)])),
            ])
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            parse_expression(r"'a\'bA'").unwrap(),
            ExpressionNode::literal(LiteralValue::String("a'bA".into()))
        );
        assert!(matches!(
            parse_expression(r"'\q'"),
            Err(ParseError::InvalidEscape { .. })
        ));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            parse_expression("1 +"),
            Err(ParseError::UnexpectedEndOfInput { .. })
        ));
        assert!(matches!(
            parse_expression("a b"),
            Err(ParseError::UnexpectedToken { position: 2, .. })
        ));
        assert!(matches!(
            PrattParser::with_max_depth("((((1))))", 3).parse(),
            Err(ParseError::TooDeep { max_depth: 3 })
        ));
    }
}
