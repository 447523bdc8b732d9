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

//! Bytecode instruction set for compiled expressions
//!
//! A compact stack-machine representation with constant and string pools.
//! Jump offsets are relative to the jump instruction itself.

use std::collections::HashMap;
use std::fmt;

use crate::model::Value;

/// Index into the constant pool
pub type ConstantIndex = u16;

/// Index into the string pool
pub type StringIndex = u16;

/// Bytecode instruction set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    // === Stack Operations ===
    /// Push a constant value onto the stack
    PushConstant(ConstantIndex),

    /// Duplicate the top stack value
    Duplicate,

    /// Pop and discard the top stack value
    Pop,

    // === Name Resolution ===
    /// Read a root property by name
    /// Stack: [] -> [value]
    LoadIdentifier(StringIndex),

    /// Read a variable
    /// Stack: [] -> [value]
    LoadVariable(StringIndex),

    // === Property Access ===
    /// Read a property of the top stack value
    /// Stack: [object] -> [value]
    LoadProperty(StringIndex),

    /// Like `LoadProperty`, but a null object yields null
    LoadPropertySafe(StringIndex),

    /// Index into a list, map or string
    /// Stack: [collection, index] -> [element]
    Index,

    // === Calls ===
    /// Call a utility function
    /// Stack: [arg1, ..., argN] -> [result]
    CallFunction(StringIndex, u8),

    /// Call a method on a receiver
    /// Stack: [receiver, arg1, ..., argN] -> [result]
    CallMethod(StringIndex, u8),

    /// Like `CallMethod`, but a null receiver yields null
    CallMethodSafe(StringIndex, u8),

    /// Invoke a constructor
    /// Stack: [arg1, ..., argN] -> [instance]
    Construct(StringIndex, u8),

    // === Arithmetic Operations ===
    /// Stack: [left, right] -> [left + right]
    Add,
    /// Stack: [left, right] -> [left - right]
    Subtract,
    /// Stack: [left, right] -> [left * right]
    Multiply,
    /// Stack: [left, right] -> [left / right]
    Divide,
    /// Stack: [left, right] -> [left % right]
    Modulo,
    /// Stack: [value] -> [-value]
    Negate,

    // === Comparison Operations ===
    /// Stack: [left, right] -> [boolean]
    Equal,
    /// Stack: [left, right] -> [boolean]
    NotEqual,
    /// Stack: [left, right] -> [boolean]
    LessThan,
    /// Stack: [left, right] -> [boolean]
    LessThanOrEqual,
    /// Stack: [left, right] -> [boolean]
    GreaterThan,
    /// Stack: [left, right] -> [boolean]
    GreaterThanOrEqual,
    /// Membership test
    /// Stack: [item, container] -> [boolean]
    In,

    // === Logical Operations ===
    /// Stack: [value] -> [!value]
    Not,

    /// Coerce the top value to a boolean condition
    /// Stack: [value] -> [boolean]
    ToBool,

    // === Type Operations ===
    /// Type test (`is`)
    /// Stack: [value] -> [boolean]
    IsType(StringIndex),

    // === Collection Operations ===
    /// Build a list from the top N values
    MakeList(u16),

    /// Build a map from the top N key/value pairs
    /// Stack: [key1, value1, ..., keyN, valueN] -> [map]
    MakeMap(u16),

    // === Control Flow ===
    /// Jump unconditionally
    Jump(i16),

    /// Pop a condition and jump if it is false
    JumpIfFalse(i16),

    /// Pop a condition and jump if it is true
    JumpIfTrue(i16),

    /// Stop and return the top stack value
    Return,
}

impl Instruction {
    /// Net effect on stack depth (positive pushes, negative pops)
    pub fn stack_effect(&self) -> i32 {
        match self {
            Self::PushConstant(_)
            | Self::Duplicate
            | Self::LoadIdentifier(_)
            | Self::LoadVariable(_) => 1,

            Self::Pop | Self::JumpIfFalse(_) | Self::JumpIfTrue(_) => -1,

            Self::LoadProperty(_)
            | Self::LoadPropertySafe(_)
            | Self::Negate
            | Self::Not
            | Self::ToBool
            | Self::IsType(_)
            | Self::Jump(_)
            | Self::Return => 0,

            Self::Index
            | Self::Add
            | Self::Subtract
            | Self::Multiply
            | Self::Divide
            | Self::Modulo
            | Self::Equal
            | Self::NotEqual
            | Self::LessThan
            | Self::LessThanOrEqual
            | Self::GreaterThan
            | Self::GreaterThanOrEqual
            | Self::In => -1,

            Self::CallFunction(_, argc) | Self::Construct(_, argc) => 1 - i32::from(*argc),
            Self::CallMethod(_, argc) | Self::CallMethodSafe(_, argc) => -i32::from(*argc),
            Self::MakeList(count) => 1 - i32::from(*count),
            Self::MakeMap(count) => 1 - 2 * i32::from(*count),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PushConstant(idx) => write!(f, "PUSH_CONST {idx}"),
            Self::Duplicate => write!(f, "DUP"),
            Self::Pop => write!(f, "POP"),
            Self::LoadIdentifier(idx) => write!(f, "LOAD_IDENT {idx}"),
            Self::LoadVariable(idx) => write!(f, "LOAD_VAR {idx}"),
            Self::LoadProperty(idx) => write!(f, "LOAD_PROP {idx}"),
            Self::LoadPropertySafe(idx) => write!(f, "LOAD_PROP_SAFE {idx}"),
            Self::Index => write!(f, "INDEX"),
            Self::CallFunction(idx, argc) => write!(f, "CALL {idx} {argc}"),
            Self::CallMethod(idx, argc) => write!(f, "CALL_METHOD {idx} {argc}"),
            Self::CallMethodSafe(idx, argc) => write!(f, "CALL_METHOD_SAFE {idx} {argc}"),
            Self::Construct(idx, argc) => write!(f, "NEW {idx} {argc}"),
            Self::Add => write!(f, "ADD"),
            Self::Subtract => write!(f, "SUB"),
            Self::Multiply => write!(f, "MUL"),
            Self::Divide => write!(f, "DIV"),
            Self::Modulo => write!(f, "MOD"),
            Self::Negate => write!(f, "NEG"),
            Self::Equal => write!(f, "EQ"),
            Self::NotEqual => write!(f, "NE"),
            Self::LessThan => write!(f, "LT"),
            Self::LessThanOrEqual => write!(f, "LE"),
            Self::GreaterThan => write!(f, "GT"),
            Self::GreaterThanOrEqual => write!(f, "GE"),
            Self::In => write!(f, "IN"),
            Self::Not => write!(f, "NOT"),
            Self::ToBool => write!(f, "TO_BOOL"),
            Self::IsType(idx) => write!(f, "IS_TYPE {idx}"),
            Self::MakeList(count) => write!(f, "MAKE_LIST {count}"),
            Self::MakeMap(count) => write!(f, "MAKE_MAP {count}"),
            Self::Jump(offset) => write!(f, "JUMP {offset}"),
            Self::JumpIfFalse(offset) => write!(f, "JMP_FALSE {offset}"),
            Self::JumpIfTrue(offset) => write!(f, "JMP_TRUE {offset}"),
            Self::Return => write!(f, "RETURN"),
        }
    }
}

/// Bytecode program containing instructions and constant pools
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    /// Instruction sequence
    pub instructions: Vec<Instruction>,

    /// Constant value pool
    pub constants: Vec<Value>,

    /// String pool (names of properties, functions, methods, types)
    pub strings: Vec<String>,

    /// Maximum stack depth required for execution
    pub max_stack_depth: usize,

    /// Original expression text
    pub source: Option<String>,
}

impl Bytecode {
    /// Create empty bytecode
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constant to the pool and return its index
    ///
    /// Returns `None` when the pool is full.
    pub fn add_constant(&mut self, value: Value) -> Option<ConstantIndex> {
        // Values compare with numeric widening, so dedup only on identical kinds
        if let Some(index) = self.constants.iter().position(|v| {
            std::mem::discriminant(v) == std::mem::discriminant(&value) && v == &value
        }) {
            return ConstantIndex::try_from(index).ok();
        }

        let index = ConstantIndex::try_from(self.constants.len()).ok()?;
        self.constants.push(value);
        Some(index)
    }

    /// Add a string to the pool and return its index
    ///
    /// Returns `None` when the pool is full.
    pub fn add_string(&mut self, string: &str) -> Option<StringIndex> {
        if let Some(index) = self.strings.iter().position(|s| s == string) {
            return StringIndex::try_from(index).ok();
        }

        let index = StringIndex::try_from(self.strings.len()).ok()?;
        self.strings.push(string.to_string());
        Some(index)
    }

    /// Add an instruction
    pub fn emit(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    /// Calculate the maximum stack depth over the straight-line sequence
    pub fn calculate_max_stack_depth(&mut self) {
        let mut current_depth = 0i32;
        let mut max_depth = 0i32;

        for instruction in &self.instructions {
            current_depth += instruction.stack_effect();
            max_depth = max_depth.max(current_depth);
        }

        self.max_stack_depth = max_depth.max(0) as usize;
    }

    /// Pretty print the bytecode for debugging
    pub fn disassemble(&self) -> String {
        let mut output = String::new();
        output.push_str("=== BYTECODE DISASSEMBLY ===\n");

        if let Some(source) = &self.source {
            output.push_str(&format!("Source: {source}\n"));
        }

        output.push_str(&format!("Max Stack Depth: {}\n", self.max_stack_depth));
        output.push_str("\n--- CONSTANTS ---\n");
        for (i, constant) in self.constants.iter().enumerate() {
            output.push_str(&format!("{i:4}: {constant:?}\n"));
        }

        output.push_str("\n--- STRINGS ---\n");
        for (i, string) in self.strings.iter().enumerate() {
            output.push_str(&format!("{i:4}: \"{string}\"\n"));
        }

        output.push_str("\n--- INSTRUCTIONS ---\n");
        for (i, instruction) in self.instructions.iter().enumerate() {
            output.push_str(&format!("{i:4}: {instruction}\n"));
        }

        output
    }
}

/// Opaque label handed out by [`BytecodeBuilder::new_label`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy)]
enum JumpType {
    Unconditional,
    IfFalse,
    IfTrue,
}

/// Error raised while assembling bytecode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    /// A jump refers to a label that was never placed
    UndefinedLabel(usize),
    /// A jump offset does not fit the operand
    JumpOutOfRange(i64),
    /// A constant or string pool is full
    PoolOverflow(&'static str),
}

impl fmt::Display for AssemblyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UndefinedLabel(label) => write!(f, "Undefined label: {label}"),
            Self::JumpOutOfRange(offset) => write!(f, "Jump offset too large: {offset}"),
            Self::PoolOverflow(pool) => write!(f, "{pool} pool overflow"),
        }
    }
}

/// Bytecode builder with label-based jump resolution
#[derive(Debug, Default)]
pub struct BytecodeBuilder {
    bytecode: Bytecode,
    labels: HashMap<Label, usize>,
    next_label: usize,
    pending_jumps: Vec<(usize, Label, JumpType)>,
}

impl BytecodeBuilder {
    /// Create a new bytecode builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit an instruction
    pub fn emit(&mut self, instruction: Instruction) -> &mut Self {
        self.bytecode.emit(instruction);
        self
    }

    /// Add a constant and emit `PushConstant`
    pub fn push_constant(&mut self, value: Value) -> Result<&mut Self, AssemblyError> {
        let index = self
            .bytecode
            .add_constant(value)
            .ok_or(AssemblyError::PoolOverflow("constant"))?;
        Ok(self.emit(Instruction::PushConstant(index)))
    }

    /// Add a string to the pool and return its index
    pub fn add_string(&mut self, string: &str) -> Result<StringIndex, AssemblyError> {
        self.bytecode
            .add_string(string)
            .ok_or(AssemblyError::PoolOverflow("string"))
    }

    /// Reserve a label to be placed later
    pub fn new_label(&mut self) -> Label {
        self.next_label += 1;
        Label(self.next_label)
    }

    /// Place a label at the current position
    pub fn place(&mut self, label: Label) -> &mut Self {
        self.labels.insert(label, self.bytecode.instructions.len());
        self
    }

    /// Emit a jump to a label
    pub fn jump_to(&mut self, label: Label) -> &mut Self {
        self.pending(label, JumpType::Unconditional, Instruction::Jump(0))
    }

    /// Emit a conditional jump taken when the popped value is false
    pub fn jump_if_false_to(&mut self, label: Label) -> &mut Self {
        self.pending(label, JumpType::IfFalse, Instruction::JumpIfFalse(0))
    }

    /// Emit a conditional jump taken when the popped value is true
    pub fn jump_if_true_to(&mut self, label: Label) -> &mut Self {
        self.pending(label, JumpType::IfTrue, Instruction::JumpIfTrue(0))
    }

    fn pending(&mut self, label: Label, jump_type: JumpType, placeholder: Instruction) -> &mut Self {
        let position = self.bytecode.instructions.len();
        self.pending_jumps.push((position, label, jump_type));
        self.emit(placeholder)
    }

    /// Resolve jumps and calculate the stack depth
    pub fn finalize(mut self) -> Result<Bytecode, AssemblyError> {
        for (position, label, jump_type) in std::mem::take(&mut self.pending_jumps) {
            let target = *self
                .labels
                .get(&label)
                .ok_or(AssemblyError::UndefinedLabel(label.0))?;

            let offset = target as i64 - position as i64;
            let offset = i16::try_from(offset).map_err(|_| AssemblyError::JumpOutOfRange(offset))?;

            self.bytecode.instructions[position] = match jump_type {
                JumpType::Unconditional => Instruction::Jump(offset),
                JumpType::IfFalse => Instruction::JumpIfFalse(offset),
                JumpType::IfTrue => Instruction::JumpIfTrue(offset),
            };
        }

        self.bytecode.calculate_max_stack_depth();
        Ok(self.bytecode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_effect() {
        assert_eq!(Instruction::PushConstant(0).stack_effect(), 1);
        assert_eq!(Instruction::Pop.stack_effect(), -1);
        assert_eq!(Instruction::Add.stack_effect(), -1);
        assert_eq!(Instruction::CallFunction(0, 2).stack_effect(), -1);
        assert_eq!(Instruction::CallMethod(0, 2).stack_effect(), -2);
        assert_eq!(Instruction::MakeMap(2).stack_effect(), -3);
    }

    #[test]
    fn test_constant_deduplication() {
        let mut bytecode = Bytecode::new();
        let idx1 = bytecode.add_constant(Value::Integer(42));
        let idx2 = bytecode.add_constant(Value::Integer(42));
        let idx3 = bytecode.add_constant(Value::Decimal(42.0));

        assert_eq!(idx1, idx2);
        assert_ne!(idx1, idx3);
        assert_eq!(bytecode.constants.len(), 2);
    }

    #[test]
    fn test_string_deduplication() {
        let mut bytecode = Bytecode::new();
        assert_eq!(bytecode.add_string("name"), bytecode.add_string("name"));
        assert_eq!(bytecode.strings.len(), 1);
    }

    #[test]
    fn test_jump_resolution() {
        let mut builder = BytecodeBuilder::new();
        let end = builder.new_label();
        builder.push_constant(Value::Boolean(true)).unwrap();
        builder.jump_if_false_to(end);
        builder.push_constant(Value::Integer(1)).unwrap();
        builder.place(end).emit(Instruction::Return);

        let bytecode = builder.finalize().unwrap();
        assert_eq!(bytecode.instructions[1], Instruction::JumpIfFalse(2));
    }

    #[test]
    fn test_undefined_label() {
        let mut builder = BytecodeBuilder::new();
        let nowhere = builder.new_label();
        builder.jump_to(nowhere);
        assert!(matches!(builder.finalize(), Err(AssemblyError::UndefinedLabel(_))));
    }

    #[test]
    fn test_bytecode_disassembly() {
        let mut bytecode = Bytecode::new();
        bytecode.add_string("name");
        bytecode.emit(Instruction::LoadIdentifier(0));
        bytecode.source = Some("order.name".to_string());

        let disassembly = bytecode.disassemble();
        assert!(disassembly.contains("Source: order.name"));
        assert!(disassembly.contains("LOAD_IDENT 0"));
    }
}
