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

//! Expression AST node definitions

use super::operator::{BinaryOperator, UnaryOperator};
use smallvec::SmallVec;

/// AST representation of expressions
///
/// Large variants are boxed to keep the enum small.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExpressionNode {
    /// Literal value
    Literal(LiteralValue),

    /// Bare identifier, resolved against the root
    Identifier(String),

    /// Variable reference (`$name`)
    Variable(String),

    /// Property navigation (`base.property`, `base?.property`)
    Path {
        /// Base expression
        base: Box<ExpressionNode>,
        /// Property name
        property: String,
        /// Whether a null base yields null instead of failing
        null_safe: bool,
    },

    /// Index access (`base[index]`)
    Index {
        /// Base expression
        base: Box<ExpressionNode>,
        /// Index expression
        index: Box<ExpressionNode>,
    },

    /// Utility function call (`name(args)`)
    FunctionCall(Box<FunctionCallData>),

    /// Method call on a value (`base.method(args)`)
    MethodCall(Box<MethodCallData>),

    /// Constructor invocation (`new Type(args)`)
    Constructor(Box<ConstructorData>),

    /// Binary operation
    BinaryOp(Box<BinaryOpData>),

    /// Unary operation
    UnaryOp {
        /// The operator
        op: UnaryOperator,
        /// The operand
        operand: Box<ExpressionNode>,
    },

    /// Type test (`expression is Type`)
    TypeCheck {
        /// Expression to test
        expression: Box<ExpressionNode>,
        /// Type name as written
        type_name: String,
    },

    /// Ternary conditional (`condition ? then : else`)
    Conditional(Box<ConditionalData>),

    /// List literal (`[a, b]`)
    List(Vec<ExpressionNode>),

    /// Map literal (`{key: value}`)
    Map(Vec<(String, ExpressionNode)>),
}

/// Binary operation data
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BinaryOpData {
    /// The operator
    pub op: BinaryOperator,
    /// Left operand
    pub left: ExpressionNode,
    /// Right operand
    pub right: ExpressionNode,
}

/// Function call data
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionCallData {
    /// Function name
    pub name: String,
    /// Function arguments
    pub args: SmallVec<[ExpressionNode; 4]>,
}

/// Method call data
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodCallData {
    /// Receiver expression
    pub base: ExpressionNode,
    /// Method name
    pub method: String,
    /// Method arguments
    pub args: SmallVec<[ExpressionNode; 4]>,
    /// Whether a null receiver yields null instead of failing
    pub null_safe: bool,
}

/// Constructor data
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConstructorData {
    /// Type name as written
    pub type_name: String,
    /// Constructor arguments
    pub args: SmallVec<[ExpressionNode; 4]>,
}

/// Conditional expression data
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConditionalData {
    /// Condition
    pub condition: ExpressionNode,
    /// Then branch
    pub then_expr: ExpressionNode,
    /// Else branch
    pub else_expr: ExpressionNode,
}

/// Literal values
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LiteralValue {
    /// Null literal
    Null,
    /// Boolean literal
    Boolean(bool),
    /// Integer literal
    Integer(i64),
    /// Decimal literal (kept as text so nodes stay hashable)
    Decimal(String),
    /// String literal
    String(String),
}

impl ExpressionNode {
    /// Create a literal expression
    pub fn literal(value: LiteralValue) -> Self {
        Self::Literal(value)
    }

    /// Create an identifier expression
    pub fn identifier(name: impl Into<String>) -> Self {
        Self::Identifier(name.into())
    }

    /// Create a variable reference
    pub fn variable(name: impl Into<String>) -> Self {
        Self::Variable(name.into())
    }

    /// Create a property navigation
    pub fn path(base: ExpressionNode, property: impl Into<String>, null_safe: bool) -> Self {
        Self::Path {
            base: Box::new(base),
            property: property.into(),
            null_safe,
        }
    }

    /// Create an index access
    pub fn index(base: ExpressionNode, index: ExpressionNode) -> Self {
        Self::Index {
            base: Box::new(base),
            index: Box::new(index),
        }
    }

    /// Create a function call expression
    pub fn function_call(
        name: impl Into<String>,
        args: impl Into<SmallVec<[ExpressionNode; 4]>>,
    ) -> Self {
        Self::FunctionCall(Box::new(FunctionCallData {
            name: name.into(),
            args: args.into(),
        }))
    }

    /// Create a method call expression
    pub fn method_call(
        base: ExpressionNode,
        method: impl Into<String>,
        args: impl Into<SmallVec<[ExpressionNode; 4]>>,
        null_safe: bool,
    ) -> Self {
        Self::MethodCall(Box::new(MethodCallData {
            base,
            method: method.into(),
            args: args.into(),
            null_safe,
        }))
    }

    /// Create a constructor invocation
    pub fn constructor(
        type_name: impl Into<String>,
        args: impl Into<SmallVec<[ExpressionNode; 4]>>,
    ) -> Self {
        Self::Constructor(Box::new(ConstructorData {
            type_name: type_name.into(),
            args: args.into(),
        }))
    }

    /// Create a binary operation
    pub fn binary_op(op: BinaryOperator, left: ExpressionNode, right: ExpressionNode) -> Self {
        Self::BinaryOp(Box::new(BinaryOpData { op, left, right }))
    }

    /// Create a unary operation
    pub fn unary_op(op: UnaryOperator, operand: ExpressionNode) -> Self {
        Self::UnaryOp {
            op,
            operand: Box::new(operand),
        }
    }

    /// Create a type test
    pub fn type_check(expression: ExpressionNode, type_name: impl Into<String>) -> Self {
        Self::TypeCheck {
            expression: Box::new(expression),
            type_name: type_name.into(),
        }
    }

    /// Create a conditional expression
    pub fn conditional(
        condition: ExpressionNode,
        then_expr: ExpressionNode,
        else_expr: ExpressionNode,
    ) -> Self {
        Self::Conditional(Box::new(ConditionalData {
            condition,
            then_expr,
            else_expr,
        }))
    }

    /// Check if this is a literal
    pub fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    /// Get as identifier if this is an identifier
    pub fn as_identifier(&self) -> Option<&str> {
        match self {
            Self::Identifier(name) => Some(name),
            _ => None,
        }
    }

    /// Nesting depth of the tree
    pub fn depth(&self) -> usize {
        let children = match self {
            Self::Literal(_) | Self::Identifier(_) | Self::Variable(_) => return 1,
            Self::Path { base, .. } => vec![base.as_ref()],
            Self::Index { base, index } => vec![base.as_ref(), index.as_ref()],
            Self::FunctionCall(data) => data.args.iter().collect(),
            Self::MethodCall(data) => std::iter::once(&data.base).chain(&data.args).collect(),
            Self::Constructor(data) => data.args.iter().collect(),
            Self::BinaryOp(data) => vec![&data.left, &data.right],
            Self::UnaryOp { operand, .. } => vec![operand.as_ref()],
            Self::TypeCheck { expression, .. } => vec![expression.as_ref()],
            Self::Conditional(data) => vec![&data.condition, &data.then_expr, &data.else_expr],
            Self::List(items) => items.iter().collect(),
            Self::Map(entries) => entries.iter().map(|(_, v)| v).collect(),
        };
        1 + children.into_iter().map(ExpressionNode::depth).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth() {
        let leaf = ExpressionNode::identifier("a");
        assert_eq!(leaf.depth(), 1);

        let nested = ExpressionNode::binary_op(
            BinaryOperator::Add,
            ExpressionNode::path(ExpressionNode::identifier("a"), "b", false),
            ExpressionNode::literal(LiteralValue::Integer(1)),
        );
        assert_eq!(nested.depth(), 3);
    }
}
