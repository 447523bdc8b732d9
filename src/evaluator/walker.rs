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

//! Tree-walking interpreter for the path backend

use smallvec::SmallVec;

use super::budget::EvaluationBudget;
use super::operations;
use crate::ast::{BinaryOperator, ExpressionNode};
use crate::backend::Invocation;
use crate::error::{EvalError, EvalResult};
use crate::model::{Value, ValueMap};

/// Evaluates an AST against one invocation
pub struct TreeWalker<'a, 'i> {
    invocation: &'a Invocation<'i>,
    budget: EvaluationBudget,
    depth: usize,
}

impl<'a, 'i> TreeWalker<'a, 'i> {
    /// Create a walker with a fresh budget
    pub fn new(invocation: &'a Invocation<'i>) -> Self {
        Self {
            invocation,
            budget: invocation.limits.start(),
            depth: 0,
        }
    }

    /// Operations performed so far
    pub fn operations(&self) -> u64 {
        self.budget.operations()
    }

    /// Evaluate a node
    pub fn evaluate(&mut self, node: &ExpressionNode) -> EvalResult<Value> {
        if self.depth >= self.invocation.limits.max_depth {
            return Err(EvalError::RecursionLimit {
                max_depth: self.invocation.limits.max_depth,
            });
        }
        self.budget.tick()?;
        self.depth += 1;
        let result = self.evaluate_node(node);
        self.depth -= 1;
        result
    }

    fn evaluate_node(&mut self, node: &ExpressionNode) -> EvalResult<Value> {
        let resolvers = self.invocation.resolvers;
        match node {
            ExpressionNode::Literal(literal) => operations::literal(literal),
            ExpressionNode::Identifier(name) => {
                resolvers.properties.read(self.invocation.root(), name)
            }
            ExpressionNode::Variable(name) => self.invocation.context.variable(name),
            ExpressionNode::Path {
                base,
                property,
                null_safe,
            } => {
                let base = self.evaluate(base)?;
                if base.is_null() && *null_safe {
                    return Ok(Value::Null);
                }
                resolvers.properties.read(&base, property)
            }
            ExpressionNode::Index { base, index } => {
                let base = self.evaluate(base)?;
                let index = self.evaluate(index)?;
                operations::index(&base, &index)
            }
            ExpressionNode::FunctionCall(data) => {
                let args = self.evaluate_all(&data.args)?;
                self.invocation.context.functions().call(&data.name, &args)
            }
            ExpressionNode::MethodCall(data) => {
                let base = self.evaluate(&data.base)?;
                if base.is_null() && data.null_safe {
                    return Ok(Value::Null);
                }
                let args = self.evaluate_all(&data.args)?;
                resolvers.methods.invoke(&base, &data.method, &args)
            }
            ExpressionNode::Constructor(data) => {
                let args = self.evaluate_all(&data.args)?;
                resolvers.constructors.construct(&data.type_name, &args)
            }
            ExpressionNode::BinaryOp(data) => match data.op {
                BinaryOperator::And => {
                    let left = operations::truthy(&self.evaluate(&data.left)?)?;
                    Ok(Value::Boolean(
                        left && operations::truthy(&self.evaluate(&data.right)?)?,
                    ))
                }
                BinaryOperator::Or => {
                    let left = operations::truthy(&self.evaluate(&data.left)?)?;
                    Ok(Value::Boolean(
                        left || operations::truthy(&self.evaluate(&data.right)?)?,
                    ))
                }
                op => {
                    let left = self.evaluate(&data.left)?;
                    let right = self.evaluate(&data.right)?;
                    operations::binary(op, &left, &right)
                }
            },
            ExpressionNode::UnaryOp { op, operand } => {
                let operand = self.evaluate(operand)?;
                operations::unary(*op, &operand)
            }
            ExpressionNode::TypeCheck {
                expression,
                type_name,
            } => {
                let value = self.evaluate(expression)?;
                resolvers.is_instance(&value, type_name).map(Value::Boolean)
            }
            ExpressionNode::Conditional(data) => {
                if operations::truthy(&self.evaluate(&data.condition)?)? {
                    self.evaluate(&data.then_expr)
                } else {
                    self.evaluate(&data.else_expr)
                }
            }
            ExpressionNode::List(items) => Ok(Value::List(self.evaluate_all(items)?.into_vec())),
            ExpressionNode::Map(entries) => {
                let mut map = ValueMap::with_capacity(entries.len());
                for (key, value) in entries {
                    let value = self.evaluate(value)?;
                    map.insert(key.clone(), value);
                }
                Ok(Value::Map(map))
            }
        }
    }

    fn evaluate_all<'n>(
        &mut self,
        nodes: impl IntoIterator<Item = &'n ExpressionNode>,
    ) -> EvalResult<SmallVec<[Value; 4]>> {
        nodes.into_iter().map(|node| self.evaluate(node)).collect()
    }
}
