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

//! Error types for expression compilation and evaluation
//!
//! Two layers exist. [`EvalError`] is what a backend reports while running an
//! expression. [`ExpressionError`] is what the public API surfaces: it adds
//! validation, compilation and sandbox failures, and wraps backend failures
//! with the backend that produced them.

use crate::backend::Backend;
use crate::model::MemberKind;
use thiserror::Error;

/// Result type alias for public engine operations
pub type Result<T> = std::result::Result<T, ExpressionError>;

/// Result type alias for backend evaluation
pub type EvalResult<T> = std::result::Result<T, EvalError>;

/// Errors surfaced by the public engine API
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    /// A required field was missing before compilation
    #[error("Validation error: {field} {message}")]
    Validation {
        /// Name of the offending field
        field: &'static str,
        /// Human-readable message
        message: String,
    },

    /// The backend rejected the source text
    #[error("Compile error ({backend}): {message}")]
    Compile {
        /// Backend that rejected the source
        backend: Backend,
        /// Human-readable message
        message: String,
    },

    /// A sandboxed resolver refused a reflective operation
    #[error("Capability denied ({backend}): {kind} access to '{target}' is not permitted")]
    CapabilityDenied {
        /// Backend in which the denial happened
        backend: Backend,
        /// Kind of member that was refused
        kind: DeniedKind,
        /// Qualified target, e.g. `acme.Order#total`
        target: String,
    },

    /// Sandboxed evaluation was requested while sandboxing is globally off
    #[error("Sandboxing is disabled; sandboxed compilation or evaluation is not available")]
    SandboxingDisabled,

    /// Any other backend failure
    #[error("Evaluation error ({backend}): {cause}")]
    Evaluation {
        /// Backend that failed
        backend: Backend,
        /// Underlying failure
        #[source]
        cause: EvalError,
    },
}

impl ExpressionError {
    /// Create a validation error
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// Create a compile error
    pub fn compile(backend: Backend, message: impl Into<String>) -> Self {
        Self::Compile {
            backend,
            message: message.into(),
        }
    }

    /// Wrap a backend failure, lifting capability denials to their own variant
    pub fn from_eval(backend: Backend, cause: EvalError) -> Self {
        match cause {
            EvalError::Denied { kind, target } => Self::CapabilityDenied {
                backend,
                kind,
                target,
            },
            cause => Self::Evaluation { backend, cause },
        }
    }

    /// Whether this failure belongs to the benign "null intermediate" class
    pub fn is_null_intermediate(&self) -> bool {
        matches!(
            self,
            Self::Evaluation {
                cause: EvalError::NullIntermediate { .. },
                ..
            }
        )
    }

    /// Backend associated with the failure, if any
    pub fn backend(&self) -> Option<Backend> {
        match self {
            Self::Compile { backend, .. }
            | Self::CapabilityDenied { backend, .. }
            | Self::Evaluation { backend, .. } => Some(*backend),
            Self::Validation { .. } | Self::SandboxingDisabled => None,
        }
    }
}

/// What kind of capability a sandboxed resolver refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeniedKind {
    /// Member access (property, method, constructor)
    Member(MemberKind),
    /// Type lookup by name
    Type,
}

impl std::fmt::Display for DeniedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeniedKind::Member(kind) => write!(f, "{kind}"),
            DeniedKind::Type => write!(f, "type"),
        }
    }
}

/// Failures raised by backends while evaluating
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    /// A property was read from a null intermediate value
    #[error("Cannot read property '{property}' of null")]
    NullIntermediate {
        /// Property being read
        property: String,
    },

    /// The target value has no such property
    #[error("Unknown property '{property}' on {type_name}")]
    UnknownProperty {
        /// Property name
        property: String,
        /// Type of the receiver
        type_name: String,
    },

    /// The target value has no such method
    #[error("Unknown method '{method}' on {type_name}")]
    UnknownMethod {
        /// Method name
        method: String,
        /// Type of the receiver
        type_name: String,
    },

    /// Unknown utility function
    #[error("Unknown function: {name}")]
    UnknownFunction {
        /// Function name
        name: String,
    },

    /// Unknown variable
    #[error("Unknown variable: ${name}")]
    UnknownVariable {
        /// Variable name
        name: String,
    },

    /// Unknown type in `new` or `is`
    #[error("Unknown type: {name}")]
    UnknownType {
        /// Type name as written
        name: String,
    },

    /// A sandboxed resolver refused the operation
    #[error("{kind} access to '{target}' denied by sandbox policy")]
    Denied {
        /// Kind of capability refused
        kind: DeniedKind,
        /// Qualified target
        target: String,
    },

    /// Operand types do not fit the operation
    #[error("Type error: {message}")]
    TypeMismatch {
        /// Human-readable message
        message: String,
    },

    /// Division or modulo by zero, or integer overflow
    #[error("Arithmetic error: {message}")]
    Arithmetic {
        /// Human-readable message
        message: String,
    },

    /// Index out of bounds
    #[error("Index out of bounds: {index} for collection of size {size}")]
    IndexOutOfBounds {
        /// Requested index
        index: i64,
        /// Collection size
        size: usize,
    },

    /// A host member failed
    #[error("Invocation of '{member}' failed: {source}")]
    Invocation {
        /// Qualified member
        member: String,
        /// Underlying failure
        #[source]
        source: InvokeError,
    },

    /// A utility function failed
    #[error("Function '{name}' error: {message}")]
    Function {
        /// Function name
        name: String,
        /// Human-readable message
        message: String,
    },

    /// The wall-clock deadline passed
    #[error("Evaluation timed out after {elapsed_ms}ms")]
    Timeout {
        /// Milliseconds elapsed when the deadline was observed
        elapsed_ms: u64,
    },

    /// The operation budget was exhausted
    #[error("Operation limit of {limit} exceeded")]
    OperationLimit {
        /// Configured limit
        limit: u64,
    },

    /// Recursion depth exceeded
    #[error("Recursion limit exceeded: maximum depth of {max_depth}")]
    RecursionLimit {
        /// Configured maximum
        max_depth: usize,
    },

    /// Malformed bytecode reached the virtual machine
    #[error("Virtual machine error: {message}")]
    Vm {
        /// Failure description
        message: String,
    },

    /// Script interpreter runtime failure
    #[error("Script error: {message}")]
    Script {
        /// Interpreter message
        message: String,
    },
}

impl EvalError {
    /// Create a type mismatch error
    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::TypeMismatch {
            message: message.into(),
        }
    }

    /// Create an arithmetic error
    pub fn arithmetic(message: impl Into<String>) -> Self {
        Self::Arithmetic {
            message: message.into(),
        }
    }

    /// Create a denial for a member access
    pub fn denied_member(kind: MemberKind, target: impl Into<String>) -> Self {
        Self::Denied {
            kind: DeniedKind::Member(kind),
            target: target.into(),
        }
    }

    /// Create a denial for a type lookup
    pub fn denied_type(name: impl Into<String>) -> Self {
        Self::Denied {
            kind: DeniedKind::Type,
            target: name.into(),
        }
    }

    /// Create a function failure
    pub fn function(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Function {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a script failure
    pub fn script(message: impl Into<String>) -> Self {
        Self::Script {
            message: message.into(),
        }
    }
}

/// Failures raised by host members themselves
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvokeError {
    /// The member was invoked without being public or elevated
    #[error("member is not accessible")]
    Inaccessible,

    /// Receiver was not the type the member belongs to
    #[error("receiver is not a {expected}")]
    WrongReceiver {
        /// Expected type name
        expected: String,
    },

    /// Wrong number of arguments
    #[error("expected {expected} arguments, got {actual}")]
    Arity {
        /// Expected count
        expected: usize,
        /// Actual count
        actual: usize,
    },

    /// Argument of the wrong type
    #[error("argument {index}: {message}")]
    Argument {
        /// Zero-based index
        index: usize,
        /// Human-readable message
        message: String,
    },

    /// Member-specific failure
    #[error("{0}")]
    Failed(String),
}

impl InvokeError {
    /// Create an argument error
    pub fn argument(index: usize, message: impl Into<String>) -> Self {
        Self::Argument {
            index,
            message: message.into(),
        }
    }

    /// Check the argument count
    pub fn check_arity(args: &[crate::model::Value], expected: usize) -> std::result::Result<(), Self> {
        if args.len() == expected {
            Ok(())
        } else {
            Err(Self::Arity {
                expected,
                actual: args.len(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denied_is_lifted_to_capability_error() {
        let err = ExpressionError::from_eval(
            Backend::Compiled,
            EvalError::denied_member(MemberKind::Method, "acme.Order#cancel"),
        );
        assert!(matches!(
            err,
            ExpressionError::CapabilityDenied {
                backend: Backend::Compiled,
                kind: DeniedKind::Member(MemberKind::Method),
                ..
            }
        ));
        assert_eq!(
            err.to_string(),
            "Capability denied (compiled): method access to 'acme.Order#cancel' is not permitted"
        );
    }

    #[test]
    fn test_null_intermediate_classification() {
        let err = ExpressionError::from_eval(
            Backend::Path,
            EvalError::NullIntermediate {
                property: "city".into(),
            },
        );
        assert!(err.is_null_intermediate());
        assert_eq!(err.backend(), Some(Backend::Path));
        assert!(!ExpressionError::SandboxingDisabled.is_null_intermediate());
    }
}
