//! Fault classification.
//!
//! A mismatch is confirmed by comparing the untouched buffers again up to
//! [`CONFIRMATION_PASSES`] times. If every pass reproduces the same index and
//! consistency token the corruption is stored in memory (a write fault);
//! otherwise it comes and goes on the read path (a read fault).

use crate::compare::{CompareStrategy, ComparisonOutcome};
use crate::report::{FaultKind, FaultLocation, FaultReport};
use crate::stats::TestStats;
use crate::traits::{FaultSink, RegionComparator};
use crate::word::{Word, WORD_BYTES};
use log::{debug, error, warn};
use std::hint::black_box;
use std::sync::Arc;

/// Re-comparisons run to confirm a mismatch.
pub const CONFIRMATION_PASSES: usize = 32;

/// Process exit status used when early exit is configured.
pub const EARLY_EXIT_STATUS: i32 = 4;

/// How faults are located and what happens after one is reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifierConfig {
    /// Report physical addresses instead of buffer offsets.
    pub use_physical_addresses: bool,
    /// Physical address of word 0 of the buffers.
    pub physical_base: u64,
    /// Terminate the process after the first reported comparison fault.
    pub early_exit_on_fault: bool,
}

impl ClassifierConfig {
    /// Converts a word index into the configured kind of location.
    pub fn location(&self, index: usize) -> FaultLocation {
        let offset = (index as u64).wrapping_mul(WORD_BYTES as u64);
        if self.use_physical_addresses {
            FaultLocation::PhysicalAddress(self.physical_base.wrapping_add(offset))
        } else {
            FaultLocation::Offset(offset)
        }
    }
}

/// Called with the process exit status when early exit triggers.
pub type ExitHook = Box<dyn FnMut(i32) + Send>;

/// Drives a comparator, confirms mismatches and keeps every report it issues.
///
/// Once a fault is recorded, [`has_failed`](Self::has_failed) stays true for
/// the life of the classifier, even after the reports are drained.
pub struct FaultClassifier<C: RegionComparator = CompareStrategy> {
    comparator: C,
    config: ClassifierConfig,
    sink: Box<dyn FaultSink>,
    stats: Arc<TestStats>,
    reports: Vec<FaultReport>,
    failed: bool,
    on_exit: ExitHook,
}

impl<C: RegionComparator> FaultClassifier<C> {
    pub fn new(comparator: C, config: ClassifierConfig, sink: Box<dyn FaultSink>) -> Self {
        Self {
            comparator,
            config,
            sink,
            stats: Arc::new(TestStats::new()),
            reports: Vec::new(),
            failed: false,
            on_exit: Box::new(exit_process),
        }
    }

    /// Replaces `std::process::exit` as the early-exit action.
    pub fn with_exit_hook<F>(mut self, hook: F) -> Self
    where
        F: FnMut(i32) + Send + 'static,
    {
        self.on_exit = Box::new(hook);
        self
    }

    /// Shares a statistics tracker with the caller.
    pub fn with_stats(mut self, stats: Arc<TestStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn comparator(&self) -> &C {
        &self.comparator
    }

    pub fn stats(&self) -> &Arc<TestStats> {
        &self.stats
    }

    /// Compares the buffers and, on a mismatch, confirms, records and emits
    /// a fault report.
    pub fn classify(
        &mut self,
        buf_a: &[Word],
        buf_b: &[Word],
        test_name: &'static str,
    ) -> Option<FaultReport> {
        let first = self.compare(buf_a, buf_b);
        if first.is_match() {
            return None;
        }
        let fault = *first.fault()?;

        let kind = self.confirm(buf_a, buf_b, &first);
        let report = FaultReport {
            test_name,
            kind,
            location: self.config.location(fault.index),
            value_a: fault.value_a,
            value_b: fault.value_b,
        };
        self.record(&report);

        if self.config.early_exit_on_fault {
            error!("{} fault in {}, exiting early", kind.label(), test_name);
            (self.on_exit)(EARLY_EXIT_STATUS);
        }
        Some(report)
    }

    /// Re-compares the unmodified buffers and classifies the fault found by
    /// `first`. Stops at the first pass that disagrees.
    pub fn confirm(
        &self,
        buf_a: &[Word],
        buf_b: &[Word],
        first: &ComparisonOutcome,
    ) -> FaultKind {
        for pass in 0..CONFIRMATION_PASSES {
            // Each pass must read memory again.
            let again = self.compare(black_box(buf_a), black_box(buf_b));
            if again.index() != first.index() || again.token() != first.token() {
                debug!(
                    "confirmation pass {} diverged: {:?} (token {:08x}) -> {:?} (token {:08x})",
                    pass,
                    first.index(),
                    first.token().value(),
                    again.index(),
                    again.token().value()
                );
                return FaultKind::Read;
            }
        }
        FaultKind::Write
    }

    /// Records and emits an address-line fault from the stuck-address test.
    pub fn report_address_line(
        &mut self,
        test_name: &'static str,
        index: usize,
        expected: Word,
        actual: Word,
    ) -> FaultReport {
        let report = FaultReport {
            test_name,
            kind: FaultKind::AddressLine,
            location: self.config.location(index),
            value_a: expected,
            value_b: actual,
        };
        self.record(&report);
        report
    }

    /// True once any fault has been recorded.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Hands the recorded reports over to the caller.
    pub fn take_reports(&mut self) -> Vec<FaultReport> {
        std::mem::take(&mut self.reports)
    }

    fn compare(&self, buf_a: &[Word], buf_b: &[Word]) -> ComparisonOutcome {
        self.stats
            .add_comparison(std::mem::size_of_val(buf_a) as u64);
        self.comparator.compare(buf_a, buf_b)
    }

    fn record(&mut self, report: &FaultReport) {
        self.failed = true;
        self.stats.add_fault();
        if let Err(e) = self.sink.emit(report) {
            warn!("Failed to write fault report: {}", e);
        }
        self.reports.push(report.clone());
    }
}

fn exit_process(status: i32) {
    std::process::exit(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::{FaultRecord, ScalarComparator, VectorizedComparator};
    use crate::report::MemorySink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Reports a fault at index 5, moving to index 6 from call `shift_at` on.
    struct ShiftingComparator {
        calls: AtomicUsize,
        shift_at: usize,
    }

    impl ShiftingComparator {
        fn new(shift_at: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                shift_at,
            }
        }
    }

    impl RegionComparator for ShiftingComparator {
        fn name(&self) -> &'static str {
            "shifting"
        }

        fn compare(&self, _buf_a: &[Word], _buf_b: &[Word]) -> ComparisonOutcome {
            let call = self.calls.fetch_add(1, Ordering::Relaxed);
            let index = if call >= self.shift_at { 6 } else { 5 };
            ComparisonOutcome::from_fault(Some(FaultRecord {
                index,
                value_a: 0,
                value_b: 1,
            }))
        }
    }

    fn classifier<C: RegionComparator>(comparator: C) -> (FaultClassifier<C>, MemorySink) {
        let sink = MemorySink::new();
        let classifier =
            FaultClassifier::new(comparator, ClassifierConfig::default(), Box::new(sink.clone()));
        (classifier, sink)
    }

    #[test]
    fn test_equal_buffers_report_nothing() {
        let (mut c, sink) = classifier(ScalarComparator);
        let buf = vec![7 as Word; 64];
        assert!(c.classify(&buf, &buf, "random_value").is_none());
        assert!(!c.has_failed());
        assert!(sink.lines().is_empty());
        assert_eq!(c.stats().get_comparisons(), 1);
    }

    #[test]
    fn test_stable_mismatch_is_write_fault() {
        let (mut c, sink) = classifier(VectorizedComparator::new(8));
        let a = vec![0 as Word; 1024];
        let mut b = a.clone();
        b[500] = 0xDEAD_BEEF;

        let report = c.classify(&a, &b, "xor").expect("fault expected");
        assert_eq!(report.kind, FaultKind::Write);
        assert_eq!(report.location, FaultLocation::Offset(500 * WORD_BYTES as u64));
        assert_eq!(report.value_a, 0);
        assert_eq!(report.value_b, 0xDEAD_BEEF);
        assert!(c.has_failed());
        assert_eq!(c.stats().get_comparisons(), 1 + CONFIRMATION_PASSES as u64);
        assert_eq!(c.stats().get_faults(), 1);
        assert_eq!(sink.lines().len(), 1);
        assert!(sink.lines()[0].starts_with("WRITE FAILURE: 0x00000000 != 0xdeadbeef"));
    }

    #[test]
    fn test_shifting_mismatch_is_read_fault() {
        let (mut c, sink) = classifier(ShiftingComparator::new(3));
        let buf = vec![0 as Word; 16];
        let report = c.classify(&buf, &buf, "sub").expect("fault expected");
        assert_eq!(report.kind, FaultKind::Read);
        // The first outcome is what gets reported.
        assert_eq!(report.location, FaultLocation::Offset(5 * WORD_BYTES as u64));
        assert!(sink.lines()[0].starts_with("READ FAILURE"));
    }

    #[test]
    fn test_confirmation_stops_at_first_divergence() {
        let (mut c, _sink) = classifier(ShiftingComparator::new(3));
        let buf = vec![0 as Word; 16];
        c.classify(&buf, &buf, "mul");
        // Initial compare, two agreeing passes, then the divergent one.
        assert_eq!(c.comparator().calls.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_divergence_on_last_pass_is_read_fault() {
        let (mut c, _sink) = classifier(ShiftingComparator::new(CONFIRMATION_PASSES));
        let buf = vec![0 as Word; 16];
        let report = c.classify(&buf, &buf, "div").unwrap();
        assert_eq!(report.kind, FaultKind::Read);
        assert_eq!(
            c.comparator().calls.load(Ordering::Relaxed),
            1 + CONFIRMATION_PASSES
        );
    }

    #[test]
    fn test_never_diverging_runs_all_passes() {
        let (mut c, _sink) = classifier(ShiftingComparator::new(usize::MAX));
        let buf = vec![0 as Word; 16];
        let report = c.classify(&buf, &buf, "or").unwrap();
        assert_eq!(report.kind, FaultKind::Write);
        assert_eq!(
            c.comparator().calls.load(Ordering::Relaxed),
            1 + CONFIRMATION_PASSES
        );
    }

    #[test]
    fn test_physical_address_location() {
        let config = ClassifierConfig {
            use_physical_addresses: true,
            physical_base: 0x8000_0000,
            early_exit_on_fault: false,
        };
        let sink = MemorySink::new();
        let mut c = FaultClassifier::new(ScalarComparator, config, Box::new(sink.clone()));
        let a = vec![1 as Word; 8];
        let mut b = a.clone();
        b[2] = 3;

        let report = c.classify(&a, &b, "and").unwrap();
        assert_eq!(
            report.location,
            FaultLocation::PhysicalAddress(0x8000_0000 + 2 * WORD_BYTES as u64)
        );
        assert!(sink.lines()[0].contains("at physical address 0x800000"));
    }

    #[test]
    fn test_reports_accumulate_and_drain() {
        let (mut c, _sink) = classifier(ScalarComparator);
        let a = vec![0 as Word; 4];
        let b = vec![1 as Word; 4];
        c.classify(&a, &b, "solidbits");
        c.classify(&a, &b, "checkerboard");
        let drained = c.take_reports();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[1].test_name, "checkerboard");
        assert!(c.take_reports().is_empty());
        assert!(c.has_failed());
    }

    #[test]
    fn test_address_line_report() {
        let (mut c, sink) = classifier(ScalarComparator);
        let report = c.report_address_line("stuck_address", 3, 0x18, 0xFF);
        assert_eq!(report.kind, FaultKind::AddressLine);
        assert_eq!(report.location, FaultLocation::Offset(3 * WORD_BYTES as u64));
        assert!(c.has_failed());
        assert!(sink.lines()[0].starts_with("FAILURE: possible bad address line"));
    }

    fn exit_recorder(
        early_exit_on_fault: bool,
    ) -> (FaultClassifier<ScalarComparator>, MemorySink, Arc<Mutex<Vec<(i32, usize)>>>) {
        let sink = MemorySink::new();
        let exits = Arc::new(Mutex::new(Vec::new()));
        let config = ClassifierConfig {
            early_exit_on_fault,
            ..Default::default()
        };
        let classifier = FaultClassifier::new(ScalarComparator, config, Box::new(sink.clone()))
            .with_exit_hook({
                let exits = Arc::clone(&exits);
                let sink = sink.clone();
                move |status| exits.lock().unwrap().push((status, sink.lines().len()))
            });
        (classifier, sink, exits)
    }

    #[test]
    fn test_early_exit_fires_once_after_report_is_emitted() {
        let (mut c, sink, exits) = exit_recorder(true);
        let a = vec![0 as Word; 32];
        let mut b = a.clone();
        b[7] = 9;

        c.classify(&a, &b, "xor").expect("fault expected");
        // The sink already held the report line when the process would exit.
        assert_eq!(*exits.lock().unwrap(), vec![(EARLY_EXIT_STATUS, 1)]);
        assert_eq!(sink.lines().len(), 1);
    }

    #[test]
    fn test_no_early_exit_when_disabled() {
        let (mut c, _sink, exits) = exit_recorder(false);
        let a = vec![0 as Word; 32];
        let b = vec![1 as Word; 32];
        c.classify(&a, &b, "sub");
        assert!(exits.lock().unwrap().is_empty());
    }

    #[test]
    fn test_no_early_exit_on_match_or_address_line() {
        let (mut c, _sink, exits) = exit_recorder(true);
        let buf = vec![3 as Word; 32];
        assert!(c.classify(&buf, &buf, "mul").is_none());
        c.report_address_line("stuck_address", 1, 0, 1);
        assert!(exits.lock().unwrap().is_empty());
    }

    #[test]
    fn test_location_offset_mode() {
        let config = ClassifierConfig::default();
        assert_eq!(config.location(0), FaultLocation::Offset(0));
        assert_eq!(
            config.location(10),
            FaultLocation::Offset(10 * WORD_BYTES as u64)
        );
    }
}
