//! Core traits for memory testing.
//!
//! This module defines the seams between the test engine and its
//! collaborators: the `RegionComparator` strategies the classifier drives, and
//! the `FaultSink` that fault reports are written to.

use crate::compare::ComparisonOutcome;
use crate::report::FaultReport;
use crate::word::Word;
use std::io;

/// Outcome of one test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    /// Every pass compared equal.
    Passed,
    /// A pass detected a fault; remaining passes were skipped.
    Failed(FaultReport),
}

impl TestOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }

    pub fn fault(&self) -> Option<&FaultReport> {
        match self {
            Self::Passed => None,
            Self::Failed(report) => Some(report),
        }
    }
}

/// Result of running one test case, as recorded by the orchestrator.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Report name of the test.
    pub test_name: &'static str,
    /// How the test ended.
    pub outcome: TestOutcome,
    /// Duration of the test in milliseconds.
    pub duration_ms: u64,
}

/// Strategy for comparing two equal-length regions.
///
/// Implementations must be deterministic: comparing the same unmutated
/// buffers twice yields the same outcome, token included.
pub trait RegionComparator: Send + Sync {
    /// Returns the name of this strategy (e.g., "scalar").
    fn name(&self) -> &'static str;

    /// Compares `buf_a` against `buf_b` word by word.
    fn compare(&self, buf_a: &[Word], buf_b: &[Word]) -> ComparisonOutcome;
}

/// Destination for rendered fault reports.
///
/// The process may exit right after a report is emitted, so implementations
/// flush before returning.
pub trait FaultSink: Send {
    fn emit(&mut self, report: &FaultReport) -> io::Result<()>;
}

impl<S: FaultSink + ?Sized> FaultSink for Box<S> {
    fn emit(&mut self, report: &FaultReport) -> io::Result<()> {
        (**self).emit(report)
    }
}
