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

//! Timing of compiles and evaluations
//!
//! The engine starts a [`Timer`] around every compile and every evaluation.
//! The timer reports to a [`MetricsSink`] when stopped or dropped.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::backend::Backend;

/// Category used by the engine for every timer
pub const EXPRESSION_CATEGORY: &str = "expression";

/// Measured phase of an expression's life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    /// Source to compiled form
    Compile,
    /// Compiled form to value
    Evaluate,
}

impl Phase {
    /// Tag used in metric names
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Compile => "compile",
            Phase::Evaluate => "evaluate",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver of timing samples
pub trait MetricsSink: Send + Sync {
    /// Record one measured call
    fn record(&self, category: &str, backend: Backend, phase: Phase, elapsed: Duration);
}

/// Running timer, reported once
#[must_use = "a timer reports when stopped or dropped"]
pub struct Timer {
    sink: Arc<dyn MetricsSink>,
    category: &'static str,
    backend: Backend,
    phase: Phase,
    started: Instant,
    reported: bool,
}

impl Timer {
    /// Start timing `phase` of `backend`
    pub fn start(
        sink: Arc<dyn MetricsSink>,
        category: &'static str,
        backend: Backend,
        phase: Phase,
    ) -> Self {
        Self {
            sink,
            category,
            backend,
            phase,
            started: Instant::now(),
            reported: false,
        }
    }

    /// Stop and report, returning the measured time
    pub fn stop(mut self) -> Duration {
        self.report()
    }

    fn report(&mut self) -> Duration {
        let elapsed = self.started.elapsed();
        if !self.reported {
            self.reported = true;
            self.sink
                .record(self.category, self.backend, self.phase, elapsed);
        }
        elapsed
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.report();
    }
}

/// Discards every sample
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _category: &str, _backend: Backend, _phase: Phase, _elapsed: Duration) {}
}

/// Writes samples to the `log` facade at trace level
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn record(&self, category: &str, backend: Backend, phase: Phase, elapsed: Duration) {
        log::trace!(
            "{category}.{backend}.{phase} took {}us",
            elapsed.as_micros()
        );
    }
}

/// Aggregated samples for one backend and phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseStats {
    /// Number of samples
    pub count: u64,
    /// Sum of all samples
    pub total: Duration,
    /// Longest sample
    pub max: Duration,
}

impl PhaseStats {
    /// Mean sample, zero when empty
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }
}

/// Keeps per backend and phase aggregates in memory
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    samples: Mutex<FxHashMap<(Backend, Phase), PhaseStats>>,
}

impl InMemoryMetrics {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregate for one backend and phase
    pub fn get(&self, backend: Backend, phase: Phase) -> PhaseStats {
        self.samples
            .lock()
            .get(&(backend, phase))
            .copied()
            .unwrap_or_default()
    }

    /// Number of samples for one backend and phase
    pub fn count(&self, backend: Backend, phase: Phase) -> u64 {
        self.get(backend, phase).count
    }

    /// Forget all samples
    pub fn reset(&self) {
        self.samples.lock().clear();
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record(&self, _category: &str, backend: Backend, phase: Phase, elapsed: Duration) {
        let mut samples = self.samples.lock();
        let stats = samples.entry((backend, phase)).or_default();
        stats.count += 1;
        stats.total += elapsed;
        stats.max = stats.max.max(elapsed);
    }
}
