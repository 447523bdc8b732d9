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

//! Stack virtual machine for compiled expressions

use smallvec::SmallVec;

use crate::backend::Invocation;
use crate::compiler::bytecode::{Bytecode, Instruction};
use crate::error::{EvalError, EvalResult};
use crate::evaluator::operations;
use crate::ast::{BinaryOperator, UnaryOperator};
use crate::model::{Value, ValueMap};

/// Virtual machine execution error types
#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    /// Stack underflow (not enough values on stack)
    StackUnderflow,
    /// Stack overflow (too many values on stack)
    StackOverflow,
    /// Invalid constant index
    InvalidConstantIndex(u16),
    /// Invalid string index
    InvalidStringIndex(u16),
    /// Jump target out of bounds
    JumpOutOfBounds(i16),
    /// Instructions ran out without a return
    MissingReturn,
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StackUnderflow => write!(f, "Stack underflow"),
            Self::StackOverflow => write!(f, "Stack overflow"),
            Self::InvalidConstantIndex(idx) => write!(f, "Invalid constant index: {idx}"),
            Self::InvalidStringIndex(idx) => write!(f, "Invalid string index: {idx}"),
            Self::JumpOutOfBounds(offset) => write!(f, "Jump target out of bounds: {offset}"),
            Self::MissingReturn => write!(f, "Program ended without a return"),
        }
    }
}

impl std::error::Error for VmError {}

impl From<VmError> for EvalError {
    fn from(err: VmError) -> Self {
        EvalError::Vm {
            message: err.to_string(),
        }
    }
}

/// Configuration for the virtual machine
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Maximum stack size
    pub max_stack_size: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_stack_size: 1024,
        }
    }
}

/// Executes one bytecode program against an invocation
pub struct VirtualMachine<'a, 'i> {
    bytecode: &'a Bytecode,
    invocation: &'a Invocation<'i>,
    config: VmConfig,
}

impl<'a, 'i> VirtualMachine<'a, 'i> {
    /// Create a VM with default configuration
    pub fn new(bytecode: &'a Bytecode, invocation: &'a Invocation<'i>) -> Self {
        Self::with_config(bytecode, invocation, VmConfig::default())
    }

    /// Create a VM with explicit configuration
    pub fn with_config(bytecode: &'a Bytecode, invocation: &'a Invocation<'i>, config: VmConfig) -> Self {
        Self {
            bytecode,
            invocation,
            config,
        }
    }

    /// Run the program to its `Return`
    pub fn execute(&self) -> EvalResult<Value> {
        let mut budget = self.invocation.limits.start();
        let mut stack: Vec<Value> = Vec::with_capacity(self.bytecode.max_stack_depth.max(4));
        let resolvers = self.invocation.resolvers;
        let mut ip = 0usize;

        while let Some(instruction) = self.bytecode.instructions.get(ip) {
            budget.tick()?;
            let mut next = ip + 1;

            match *instruction {
                Instruction::PushConstant(idx) => {
                    let value = self
                        .bytecode
                        .constants
                        .get(usize::from(idx))
                        .ok_or(VmError::InvalidConstantIndex(idx))?;
                    self.push(&mut stack, value.clone())?;
                }
                Instruction::Duplicate => {
                    let top = stack.last().cloned().ok_or(VmError::StackUnderflow)?;
                    self.push(&mut stack, top)?;
                }
                Instruction::Pop => {
                    pop(&mut stack)?;
                }
                Instruction::LoadIdentifier(idx) => {
                    let value = resolvers.properties.read(self.invocation.root(), self.string(idx)?)?;
                    self.push(&mut stack, value)?;
                }
                Instruction::LoadVariable(idx) => {
                    let value = self.invocation.context.variable(self.string(idx)?)?;
                    self.push(&mut stack, value)?;
                }
                Instruction::LoadProperty(idx) | Instruction::LoadPropertySafe(idx) => {
                    let base = pop(&mut stack)?;
                    let value = if base.is_null() && matches!(instruction, Instruction::LoadPropertySafe(_)) {
                        Value::Null
                    } else {
                        resolvers.properties.read(&base, self.string(idx)?)?
                    };
                    stack.push(value);
                }
                Instruction::Index => {
                    let index = pop(&mut stack)?;
                    let base = pop(&mut stack)?;
                    stack.push(operations::index(&base, &index)?);
                }
                Instruction::CallFunction(idx, argc) => {
                    let args = pop_n(&mut stack, usize::from(argc))?;
                    let result = self
                        .invocation
                        .context
                        .functions()
                        .call(self.string(idx)?, &args)?;
                    stack.push(result);
                }
                Instruction::CallMethod(idx, argc) | Instruction::CallMethodSafe(idx, argc) => {
                    let args = pop_n(&mut stack, usize::from(argc))?;
                    let receiver = pop(&mut stack)?;
                    let value = if receiver.is_null() && matches!(instruction, Instruction::CallMethodSafe(..)) {
                        Value::Null
                    } else {
                        resolvers.methods.invoke(&receiver, self.string(idx)?, &args)?
                    };
                    stack.push(value);
                }
                Instruction::Construct(idx, argc) => {
                    let args = pop_n(&mut stack, usize::from(argc))?;
                    stack.push(resolvers.constructors.construct(self.string(idx)?, &args)?);
                }
                Instruction::Add => self.binary(&mut stack, BinaryOperator::Add)?,
                Instruction::Subtract => self.binary(&mut stack, BinaryOperator::Subtract)?,
                Instruction::Multiply => self.binary(&mut stack, BinaryOperator::Multiply)?,
                Instruction::Divide => self.binary(&mut stack, BinaryOperator::Divide)?,
                Instruction::Modulo => self.binary(&mut stack, BinaryOperator::Modulo)?,
                Instruction::Equal => self.binary(&mut stack, BinaryOperator::Equal)?,
                Instruction::NotEqual => self.binary(&mut stack, BinaryOperator::NotEqual)?,
                Instruction::LessThan => self.binary(&mut stack, BinaryOperator::LessThan)?,
                Instruction::LessThanOrEqual => self.binary(&mut stack, BinaryOperator::LessThanOrEqual)?,
                Instruction::GreaterThan => self.binary(&mut stack, BinaryOperator::GreaterThan)?,
                Instruction::GreaterThanOrEqual => {
                    self.binary(&mut stack, BinaryOperator::GreaterThanOrEqual)?
                }
                Instruction::In => self.binary(&mut stack, BinaryOperator::In)?,
                Instruction::Negate => {
                    let operand = pop(&mut stack)?;
                    stack.push(operations::unary(UnaryOperator::Negate, &operand)?);
                }
                Instruction::Not => {
                    let operand = pop(&mut stack)?;
                    stack.push(operations::unary(UnaryOperator::Not, &operand)?);
                }
                Instruction::ToBool => {
                    let operand = pop(&mut stack)?;
                    stack.push(Value::Boolean(operations::truthy(&operand)?));
                }
                Instruction::IsType(idx) => {
                    let value = pop(&mut stack)?;
                    stack.push(Value::Boolean(resolvers.is_instance(&value, self.string(idx)?)?));
                }
                Instruction::MakeList(count) => {
                    let items = pop_n(&mut stack, usize::from(count))?;
                    stack.push(Value::List(items.into_vec()));
                }
                Instruction::MakeMap(count) => {
                    let flat = pop_n(&mut stack, 2 * usize::from(count))?;
                    let mut map = ValueMap::with_capacity(usize::from(count));
                    let mut flat = flat.into_iter();
                    while let (Some(key), Some(value)) = (flat.next(), flat.next()) {
                        map.insert(key.to_string(), value);
                    }
                    stack.push(Value::Map(map));
                }
                Instruction::Jump(offset) => next = self.target(ip, offset)?,
                Instruction::JumpIfFalse(offset) => {
                    if !operations::truthy(&pop(&mut stack)?)? {
                        next = self.target(ip, offset)?;
                    }
                }
                Instruction::JumpIfTrue(offset) => {
                    if operations::truthy(&pop(&mut stack)?)? {
                        next = self.target(ip, offset)?;
                    }
                }
                Instruction::Return => return Ok(pop(&mut stack)?),
            }

            ip = next;
        }

        Err(VmError::MissingReturn.into())
    }

    fn string(&self, idx: u16) -> Result<&'a str, VmError> {
        self.bytecode
            .strings
            .get(usize::from(idx))
            .map(String::as_str)
            .ok_or(VmError::InvalidStringIndex(idx))
    }

    fn push(&self, stack: &mut Vec<Value>, value: Value) -> Result<(), VmError> {
        if stack.len() >= self.config.max_stack_size {
            return Err(VmError::StackOverflow);
        }
        stack.push(value);
        Ok(())
    }

    fn binary(&self, stack: &mut Vec<Value>, op: BinaryOperator) -> EvalResult<()> {
        let right = pop(stack)?;
        let left = pop(stack)?;
        stack.push(operations::binary(op, &left, &right)?);
        Ok(())
    }

    fn target(&self, ip: usize, offset: i16) -> Result<usize, VmError> {
        ip.checked_add_signed(isize::from(offset))
            .filter(|target| *target <= self.bytecode.instructions.len())
            .ok_or(VmError::JumpOutOfBounds(offset))
    }
}

fn pop(stack: &mut Vec<Value>) -> Result<Value, VmError> {
    stack.pop().ok_or(VmError::StackUnderflow)
}

/// Pop `count` values, returned in push order
fn pop_n(stack: &mut Vec<Value>, count: usize) -> Result<SmallVec<[Value; 4]>, VmError> {
    let start = stack.len().checked_sub(count).ok_or(VmError::StackUnderflow)?;
    Ok(stack.drain(start..).collect())
}
