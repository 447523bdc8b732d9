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

//! Per-evaluation limits: wall-clock deadline, operation budget, depth

use std::time::{Duration, Instant};

use crate::error::{EvalError, EvalResult};

/// Default maximum number of operations per evaluation
pub const DEFAULT_MAX_OPERATIONS: u64 = 1_000_000;

/// Default maximum evaluation depth
pub const DEFAULT_MAX_DEPTH: usize = 128;

/// The deadline is read once every this many operations
const DEADLINE_CHECK_INTERVAL: u64 = 16;

/// Limits applied to every evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationLimits {
    /// Wall-clock limit, unlimited when `None`
    pub timeout: Option<Duration>,
    /// Operation budget, unlimited when zero
    pub max_operations: u64,
    /// Maximum nesting depth of the tree walker
    pub max_depth: usize,
}

impl Default for EvaluationLimits {
    fn default() -> Self {
        Self {
            timeout: None,
            max_operations: DEFAULT_MAX_OPERATIONS,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl EvaluationLimits {
    /// No deadline and no operation budget
    pub fn unlimited() -> Self {
        Self {
            timeout: None,
            max_operations: 0,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Start a budget for one evaluation
    pub fn start(&self) -> EvaluationBudget {
        let started = Instant::now();
        EvaluationBudget {
            started,
            deadline: self.timeout.map(|timeout| started + timeout),
            max_operations: self.max_operations,
            operations: 0,
        }
    }
}

/// Running budget of one evaluation
#[derive(Debug, Clone)]
pub struct EvaluationBudget {
    started: Instant,
    deadline: Option<Instant>,
    max_operations: u64,
    operations: u64,
}

impl EvaluationBudget {
    /// Account for one operation
    pub fn tick(&mut self) -> EvalResult<()> {
        self.operations += 1;
        if self.max_operations > 0 && self.operations > self.max_operations {
            return Err(EvalError::OperationLimit {
                limit: self.max_operations,
            });
        }
        if self.operations % DEADLINE_CHECK_INTERVAL == 1 {
            self.check_deadline()?;
        }
        Ok(())
    }

    /// Fail if the deadline has passed
    pub fn check_deadline(&self) -> EvalResult<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(EvalError::Timeout {
                elapsed_ms: self.elapsed().as_millis() as u64,
            }),
            _ => Ok(()),
        }
    }

    /// Operations performed so far
    pub fn operations(&self) -> u64 {
        self.operations
    }

    /// Time since the budget started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the deadline, `None` when unlimited
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_limit() {
        let limits = EvaluationLimits {
            max_operations: 3,
            ..EvaluationLimits::default()
        };
        let mut budget = limits.start();
        for _ in 0..3 {
            budget.tick().unwrap();
        }
        assert_eq!(budget.tick(), Err(EvalError::OperationLimit { limit: 3 }));
    }

    #[test]
    fn test_expired_deadline_fails_first_tick() {
        let limits = EvaluationLimits {
            timeout: Some(Duration::ZERO),
            ..EvaluationLimits::default()
        };
        let mut budget = limits.start();
        assert!(matches!(budget.tick(), Err(EvalError::Timeout { .. })));
    }

    #[test]
    fn test_unlimited() {
        let mut budget = EvaluationLimits::unlimited().start();
        for _ in 0..10_000 {
            budget.tick().unwrap();
        }
        assert_eq!(budget.remaining(), None);
    }
}
