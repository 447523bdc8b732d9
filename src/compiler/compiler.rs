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

//! Expression compiler from AST to bytecode
//!
//! Literal-only subexpressions are folded at compile time. When a function
//! registry is supplied, unknown utility functions and wrong argument
//! counts are rejected here instead of at evaluation.

use std::sync::Arc;
use thiserror::Error;

use crate::ast::{
    BinaryOpData, BinaryOperator, ConditionalData, ExpressionNode, FunctionCallData,
    MethodCallData, UnaryOperator,
};
use crate::compiler::bytecode::{AssemblyError, Bytecode, BytecodeBuilder, Instruction};
use crate::evaluator::operations;
use crate::model::Value;
use crate::registry::FunctionRegistry;

/// Compilation error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompilationError {
    /// Unknown function name
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// Invalid function arity
    #[error("Function {function} expects {min}-{} arguments, got {got}", max.map_or("∞".to_string(), |n| n.to_string()))]
    InvalidArity {
        /// Function name
        function: String,
        /// Minimum arguments
        min: usize,
        /// Maximum arguments (None for unlimited)
        max: Option<usize>,
        /// Arguments supplied
        got: usize,
    },

    /// More operands than an instruction can address
    #[error("Too many operands: {0}")]
    TooManyOperands(usize),

    /// A literal could not be converted
    #[error("Invalid literal: {0}")]
    InvalidLiteral(String),

    /// Bytecode assembly failed
    #[error("Internal compiler error: {0}")]
    InternalError(String),

    /// Maximum recursion depth exceeded
    #[error("Maximum recursion depth of {0} exceeded")]
    MaxRecursionDepthExceeded(usize),
}

impl From<AssemblyError> for CompilationError {
    fn from(err: AssemblyError) -> Self {
        Self::InternalError(err.to_string())
    }
}

/// Result type for compilation operations
pub type CompilationResult<T> = Result<T, CompilationError>;

/// Configuration for the expression compiler
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Maximum recursion depth to prevent stack overflow
    pub max_recursion_depth: usize,
    /// Whether to enable constant folding
    pub constant_folding: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            max_recursion_depth: crate::evaluator::DEFAULT_MAX_DEPTH,
            constant_folding: true,
        }
    }
}

/// Expression compiler that converts AST to bytecode
pub struct ExpressionCompiler {
    config: CompilerConfig,
    /// Registry used to check function calls at compile time
    functions: Option<Arc<FunctionRegistry>>,
    recursion_depth: usize,
}

impl ExpressionCompiler {
    /// Create a compiler that checks calls against `functions`
    pub fn new(functions: Arc<FunctionRegistry>) -> Self {
        Self::with_config(Some(functions), CompilerConfig::default())
    }

    /// Create a compiler with explicit configuration
    pub fn with_config(functions: Option<Arc<FunctionRegistry>>, config: CompilerConfig) -> Self {
        Self {
            config,
            functions,
            recursion_depth: 0,
        }
    }

    /// Compile an expression into bytecode
    pub fn compile(&mut self, expression: &ExpressionNode) -> CompilationResult<Bytecode> {
        self.recursion_depth = 0;

        let mut builder = BytecodeBuilder::new();
        self.compile_expression(expression, &mut builder)?;
        builder.emit(Instruction::Return);

        Ok(builder.finalize()?)
    }

    /// Compile an expression and record its source text
    pub fn compile_with_source(
        &mut self,
        expression: &ExpressionNode,
        source: &str,
    ) -> CompilationResult<Bytecode> {
        let mut bytecode = self.compile(expression)?;
        bytecode.source = Some(source.to_string());
        Ok(bytecode)
    }

    fn compile_expression(
        &mut self,
        expression: &ExpressionNode,
        builder: &mut BytecodeBuilder,
    ) -> CompilationResult<()> {
        if self.recursion_depth >= self.config.max_recursion_depth {
            return Err(CompilationError::MaxRecursionDepthExceeded(
                self.config.max_recursion_depth,
            ));
        }
        self.recursion_depth += 1;

        let result = match expression {
            ExpressionNode::Literal(literal) => {
                let value = operations::literal(literal)
                    .map_err(|err| CompilationError::InvalidLiteral(err.to_string()))?;
                builder.push_constant(value).map(|_| ()).map_err(Into::into)
            }
            ExpressionNode::Identifier(name) => {
                let index = builder.add_string(name)?;
                builder.emit(Instruction::LoadIdentifier(index));
                Ok(())
            }
            ExpressionNode::Variable(name) => {
                let index = builder.add_string(name)?;
                builder.emit(Instruction::LoadVariable(index));
                Ok(())
            }
            ExpressionNode::Path {
                base,
                property,
                null_safe,
            } => self.compile_path(base, property, *null_safe, builder),
            ExpressionNode::Index { base, index } => {
                self.compile_expression(base, builder)?;
                self.compile_expression(index, builder)?;
                builder.emit(Instruction::Index);
                Ok(())
            }
            ExpressionNode::FunctionCall(data) => self.compile_function_call(data, builder),
            ExpressionNode::MethodCall(data) => self.compile_method_call(data, builder),
            ExpressionNode::Constructor(data) => {
                let argc = self.compile_arguments(&data.args, builder)?;
                let type_index = builder.add_string(&data.type_name)?;
                builder.emit(Instruction::Construct(type_index, argc));
                Ok(())
            }
            ExpressionNode::BinaryOp(data) => self.compile_binary_op(data, builder),
            ExpressionNode::UnaryOp { op, operand } => self.compile_unary_op(*op, operand, builder),
            ExpressionNode::TypeCheck {
                expression,
                type_name,
            } => {
                self.compile_expression(expression, builder)?;
                let type_index = builder.add_string(type_name)?;
                builder.emit(Instruction::IsType(type_index));
                Ok(())
            }
            ExpressionNode::Conditional(data) => self.compile_conditional(data, builder),
            ExpressionNode::List(items) => {
                for item in items {
                    self.compile_expression(item, builder)?;
                }
                let count = u16::try_from(items.len())
                    .map_err(|_| CompilationError::TooManyOperands(items.len()))?;
                builder.emit(Instruction::MakeList(count));
                Ok(())
            }
            ExpressionNode::Map(entries) => {
                for (key, value) in entries {
                    builder.push_constant(Value::String(key.clone()))?;
                    self.compile_expression(value, builder)?;
                }
                let count = u16::try_from(entries.len())
                    .map_err(|_| CompilationError::TooManyOperands(entries.len()))?;
                builder.emit(Instruction::MakeMap(count));
                Ok(())
            }
        };

        self.recursion_depth -= 1;
        result
    }

    fn compile_path(
        &mut self,
        base: &ExpressionNode,
        property: &str,
        null_safe: bool,
        builder: &mut BytecodeBuilder,
    ) -> CompilationResult<()> {
        self.compile_expression(base, builder)?;
        let index = builder.add_string(property)?;
        builder.emit(if null_safe {
            Instruction::LoadPropertySafe(index)
        } else {
            Instruction::LoadProperty(index)
        });
        Ok(())
    }

    fn compile_arguments(
        &mut self,
        args: &[ExpressionNode],
        builder: &mut BytecodeBuilder,
    ) -> CompilationResult<u8> {
        let argc = u8::try_from(args.len()).map_err(|_| CompilationError::TooManyOperands(args.len()))?;
        for arg in args {
            self.compile_expression(arg, builder)?;
        }
        Ok(argc)
    }

    fn compile_function_call(
        &mut self,
        data: &FunctionCallData,
        builder: &mut BytecodeBuilder,
    ) -> CompilationResult<()> {
        if let Some(functions) = &self.functions {
            let function = functions
                .get(&data.name)
                .ok_or_else(|| CompilationError::UnknownFunction(data.name.clone()))?;
            let (min, max) = function.arity();
            let got = data.args.len();
            if got < min || max.is_some_and(|max| got > max) {
                return Err(CompilationError::InvalidArity {
                    function: data.name.clone(),
                    min,
                    max,
                    got,
                });
            }
        }

        let argc = self.compile_arguments(&data.args, builder)?;
        let name_index = builder.add_string(&data.name)?;
        builder.emit(Instruction::CallFunction(name_index, argc));
        Ok(())
    }

    fn compile_method_call(
        &mut self,
        data: &MethodCallData,
        builder: &mut BytecodeBuilder,
    ) -> CompilationResult<()> {
        self.compile_expression(&data.base, builder)?;
        let argc = self.compile_arguments(&data.args, builder)?;
        let method_index = builder.add_string(&data.method)?;
        builder.emit(if data.null_safe {
            Instruction::CallMethodSafe(method_index, argc)
        } else {
            Instruction::CallMethod(method_index, argc)
        });
        Ok(())
    }

    fn compile_binary_op(
        &mut self,
        data: &BinaryOpData,
        builder: &mut BytecodeBuilder,
    ) -> CompilationResult<()> {
        if let Some(folded) = self.fold(|| {
            let left = literal_of(&data.left)?;
            let right = literal_of(&data.right)?;
            operations::binary(data.op, &left, &right).ok()
        }) {
            builder.push_constant(folded)?;
            return Ok(());
        }

        match data.op {
            // left; TO_BOOL; DUP; JMP_FALSE end; POP; right; TO_BOOL; end:
            BinaryOperator::And | BinaryOperator::Or => {
                let end = builder.new_label();
                self.compile_expression(&data.left, builder)?;
                builder.emit(Instruction::ToBool).emit(Instruction::Duplicate);
                if data.op == BinaryOperator::And {
                    builder.jump_if_false_to(end);
                } else {
                    builder.jump_if_true_to(end);
                }
                builder.emit(Instruction::Pop);
                self.compile_expression(&data.right, builder)?;
                builder.emit(Instruction::ToBool).place(end);
                return Ok(());
            }
            _ => {}
        }

        self.compile_expression(&data.left, builder)?;
        self.compile_expression(&data.right, builder)?;

        let instruction = match data.op {
            BinaryOperator::Add => Instruction::Add,
            BinaryOperator::Subtract => Instruction::Subtract,
            BinaryOperator::Multiply => Instruction::Multiply,
            BinaryOperator::Divide => Instruction::Divide,
            BinaryOperator::Modulo => Instruction::Modulo,
            BinaryOperator::Equal => Instruction::Equal,
            BinaryOperator::NotEqual => Instruction::NotEqual,
            BinaryOperator::LessThan => Instruction::LessThan,
            BinaryOperator::LessThanOrEqual => Instruction::LessThanOrEqual,
            BinaryOperator::GreaterThan => Instruction::GreaterThan,
            BinaryOperator::GreaterThanOrEqual => Instruction::GreaterThanOrEqual,
            BinaryOperator::In => Instruction::In,
            BinaryOperator::And | BinaryOperator::Or => {
                return Err(CompilationError::InternalError(format!(
                    "'{}' reached strict operator emission",
                    data.op
                )));
            }
        };

        builder.emit(instruction);
        Ok(())
    }

    fn compile_unary_op(
        &mut self,
        op: UnaryOperator,
        operand: &ExpressionNode,
        builder: &mut BytecodeBuilder,
    ) -> CompilationResult<()> {
        if let Some(folded) = self.fold(|| operations::unary(op, &literal_of(operand)?).ok()) {
            builder.push_constant(folded)?;
            return Ok(());
        }

        self.compile_expression(operand, builder)?;
        builder.emit(match op {
            UnaryOperator::Negate => Instruction::Negate,
            UnaryOperator::Not => Instruction::Not,
        });
        Ok(())
    }

    // cond; JMP_FALSE else; then; JUMP end; else: else_expr; end:
    fn compile_conditional(
        &mut self,
        data: &ConditionalData,
        builder: &mut BytecodeBuilder,
    ) -> CompilationResult<()> {
        let else_label = builder.new_label();
        let end_label = builder.new_label();

        self.compile_expression(&data.condition, builder)?;
        builder.emit(Instruction::ToBool).jump_if_false_to(else_label);
        self.compile_expression(&data.then_expr, builder)?;
        builder.jump_to(end_label).place(else_label);
        self.compile_expression(&data.else_expr, builder)?;
        builder.place(end_label);
        Ok(())
    }

    fn fold(&self, attempt: impl FnOnce() -> Option<Value>) -> Option<Value> {
        if self.config.constant_folding {
            attempt()
        } else {
            None
        }
    }
}

fn literal_of(node: &ExpressionNode) -> Option<Value> {
    match node {
        ExpressionNode::Literal(literal) => operations::literal(literal).ok(),
        _ => None,
    }
}
