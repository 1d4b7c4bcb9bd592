//! CPU/RAM memory testing implementation.
//!
//! This module owns the test buffers and drives the catalog over them: it
//! allocates one block, splits it into the two halves the comparison patterns
//! need, runs the stuck-address test over the whole block and then every
//! selected pattern, loop after loop.

use crate::classify::{ClassifierConfig, FaultClassifier};
use crate::compare::{CompareStrategy, StrategyKind};
use crate::error::MemtwinError;
use crate::patterns::TestPattern;
use crate::report::FaultReport;
use crate::stats::TestStats;
use crate::stuck::StuckAddressTest;
use crate::traits::{FaultSink, RegionComparator, TestOutcome, TestResult};
use std::io;
use crate::word::{Word, WORD_BYTES};
use bytesize::ByteSize;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The run could not start.
pub const EXIT_FAIL_NONSTARTER: i32 = 0x01;
/// The stuck-address test failed.
pub const EXIT_FAIL_ADDRESSLINES: i32 = 0x02;
/// Any other test failed.
pub const EXIT_FAIL_OTHERTEST: i32 = 0x04;

/// CPU memory tester configuration.
#[derive(Debug, Clone)]
pub struct CpuTesterConfig {
    /// Total bytes to test; each comparison buffer gets half.
    pub memory_bytes: u64,
    /// Number of loops, or `None` to run until stopped.
    pub loops: Option<u64>,
    /// Optional timeout duration.
    pub timeout: Option<Duration>,
    /// Patterns to run, in order.
    pub patterns: Vec<TestPattern>,
    /// Run the stuck-address test at the start of every loop.
    pub stuck_address: bool,
    /// Seed for the random patterns; `None` seeds from the OS.
    pub seed: Option<u64>,
    /// Comparator strategy.
    pub comparator: StrategyKind,
    /// Comparator worker threads (defaults to CPU count if None).
    pub threads: Option<usize>,
    /// Fault location and early-exit settings.
    pub classifier: ClassifierConfig,
    /// Draw progress bars.
    pub show_progress: bool,
}

impl Default for CpuTesterConfig {
    fn default() -> Self {
        Self {
            memory_bytes: 64 * 1024 * 1024,
            loops: Some(1),
            timeout: None,
            patterns: TestPattern::all_patterns(),
            stuck_address: true,
            seed: None,
            comparator: StrategyKind::default(),
            threads: None,
            classifier: ClassifierConfig::default(),
            show_progress: true,
        }
    }
}

/// What a run found.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Loops that ran to completion.
    pub loops_completed: u64,
    /// Every test executed, in order.
    pub results: Vec<TestResult>,
    /// Every fault the classifier reported, in order.
    pub reports: Vec<FaultReport>,
    /// The classifier saw at least one fault.
    pub failed: bool,
    /// The stuck-address test failed at least once.
    pub address_lines_failed: bool,
    /// Some other test failed at least once.
    pub other_tests_failed: bool,
}

impl RunSummary {
    /// Process exit status: a bit per failing test family.
    pub fn exit_code(&self) -> i32 {
        let mut code = 0;
        if self.address_lines_failed {
            code |= EXIT_FAIL_ADDRESSLINES;
        }
        if self.other_tests_failed {
            code |= EXIT_FAIL_OTHERTEST;
        }
        code
    }

    fn record(
        &mut self,
        test_name: &'static str,
        outcome: TestOutcome,
        started: Instant,
        reports: Vec<FaultReport>,
    ) {
        if !reports.is_empty() {
            if test_name == StuckAddressTest::NAME {
                self.address_lines_failed = true;
            } else {
                self.other_tests_failed = true;
            }
            self.reports.extend(reports);
        }
        self.results.push(TestResult {
            test_name,
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }
}

/// Emits reports with the progress bars cleared, so report lines do not
/// interleave with bar redraws on stderr.
struct SuspendingSink {
    inner: Box<dyn FaultSink>,
    multi: MultiProgress,
}

impl FaultSink for SuspendingSink {
    fn emit(&mut self, report: &FaultReport) -> io::Result<()> {
        let inner = &mut self.inner;
        self.multi.suspend(|| inner.emit(report))
    }
}

/// CPU/RAM memory tester.
pub struct CpuTester {
    config: CpuTesterConfig,
    num_threads: usize,
    comparator: CompareStrategy,
}

impl CpuTester {
    /// Creates a new CPU tester with the given configuration.
    pub fn new(config: CpuTesterConfig) -> Self {
        let num_threads = config.threads.unwrap_or_else(num_cpus::get).max(1);
        let comparator = CompareStrategy::build(config.comparator, num_threads);
        Self {
            config,
            num_threads,
            comparator,
        }
    }

    /// Returns the name of this tester.
    pub fn name(&self) -> &'static str {
        "CPU/RAM"
    }

    /// Returns information about the device being tested.
    pub fn device_info(&self) -> String {
        format!(
            "{} comparator threads, {}-bit words, {}",
            self.num_threads(),
            WORD_BYTES * 8,
            self.comparator.describe()
        )
    }

    /// Returns the number of comparator threads.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Runs the configured loops.
    ///
    /// Stops early when `should_stop` is raised or the timeout elapses; the
    /// test in progress finishes first.
    pub fn run(
        &self,
        sink: Box<dyn FaultSink>,
        stats: Arc<TestStats>,
        should_stop: Arc<AtomicBool>,
    ) -> Result<RunSummary, MemtwinError> {
        let mut block = allocate_words(self.config.memory_bytes)?;
        let half = block.len() / 2;
        if half == 0 {
            return Err(MemtwinError::Config(format!(
                "{} bytes is too small, need at least {} bytes",
                self.config.memory_bytes,
                2 * WORD_BYTES
            )));
        }

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        info!(
            "Testing {} bytes ({} words per buffer), {}",
            half * 2 * WORD_BYTES,
            half,
            self.device_info()
        );

        let multi = if self.config.show_progress {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        let progress = multi.add(ProgressBar::new(0));
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{msg:<28} [{bar:40.cyan/blue}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        let status = multi.add(ProgressBar::new_spinner());
        status.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );

        let sink = SuspendingSink {
            inner: sink,
            multi: multi.clone(),
        };
        let exit_multi = multi.clone();
        let mut classifier =
            FaultClassifier::new(self.comparator, self.config.classifier, Box::new(sink))
                .with_stats(Arc::clone(&stats))
                .with_exit_hook(move |status| {
                    let _ = exit_multi.clear();
                    std::process::exit(status)
                });
        debug!(
            "Classifier: {}, {:?}, {} comparisons so far",
            classifier.comparator().name(),
            classifier.config(),
            classifier.stats().get_comparisons()
        );

        let start_time = Instant::now();
        let mut summary = RunSummary::default();
        let mut loop_index = 0u64;

        let status_done = Arc::new(AtomicBool::new(false));
        let status_handle = {
            let stats = Arc::clone(&stats);
            let done = Arc::clone(&status_done);
            std::thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    status.set_message(format!(
                        "{} compared | {} faults | {}",
                        ByteSize::b(stats.get_bytes()),
                        stats.get_faults(),
                        humantime::format_duration(Duration::from_secs(
                            start_time.elapsed().as_secs()
                        ))
                    ));
                    status.tick();
                    std::thread::sleep(Duration::from_millis(100));
                }
                status.finish_and_clear();
            })
        };

        'loops: loop {
            if let Some(loops) = self.config.loops {
                if loop_index >= loops {
                    break;
                }
            }
            loop_index += 1;
            info!(
                "Loop {}{}",
                loop_index,
                self.config
                    .loops
                    .map(|n| format!("/{}", n))
                    .unwrap_or_default()
            );

            if self.config.stuck_address {
                if self.stop_requested(&should_stop, start_time) {
                    break 'loops;
                }
                progress.set_length(StuckAddressTest::PASSES as u64);
                progress.set_position(0);
                progress.set_message(StuckAddressTest::DISPLAY_NAME);
                let started = Instant::now();
                let outcome = StuckAddressTest::run(&mut block, &mut classifier);
                log_outcome(StuckAddressTest::DISPLAY_NAME, &outcome);
                stats.add_test();
                let reports = classifier.take_reports();
                summary.record(StuckAddressTest::NAME, outcome, started, reports);
            }

            let (buf_a, rest) = block.split_at_mut(half);
            let buf_b = &mut rest[..half];
            if self.config.stuck_address {
                // The arithmetic patterns start from equal halves.
                buf_b.copy_from_slice(buf_a);
            }

            for pattern in &self.config.patterns {
                if self.stop_requested(&should_stop, start_time) {
                    break 'loops;
                }
                progress.set_length(pattern.passes() as u64);
                progress.set_position(0);
                progress.set_message(pattern.name());

                let started = Instant::now();
                let outcome = pattern.run_with_progress(
                    buf_a,
                    buf_b,
                    &mut rng,
                    &mut classifier,
                    |pass| progress.set_position(pass as u64),
                );
                log_outcome(pattern.name(), &outcome);
                stats.add_test();
                let reports = classifier.take_reports();
                summary.record(pattern.test_name(), outcome, started, reports);
            }

            summary.loops_completed += 1;
        }

        status_done.store(true, Ordering::Relaxed);
        if status_handle.join().is_err() {
            warn!("Progress thread panicked");
        }
        progress.finish_and_clear();
        summary.failed = classifier.has_failed();
        debug!("{} faults recorded by the classifier", summary.reports.len());
        Ok(summary)
    }

    fn stop_requested(&self, should_stop: &AtomicBool, start_time: Instant) -> bool {
        if let Some(timeout) = self.config.timeout {
            if start_time.elapsed() >= timeout {
                should_stop.store(true, Ordering::Relaxed);
            }
        }
        should_stop.load(Ordering::Relaxed)
    }
}

fn log_outcome(name: &str, outcome: &TestOutcome) {
    match outcome.fault() {
        None => info!("  {:<22}: ok", name),
        Some(report) => warn!("  {:<22}: {:?} fault", name, report.kind),
    }
}

/// Allocates a zeroed block of `bytes / WORD_BYTES` words.
fn allocate_words(bytes: u64) -> Result<Vec<Word>, MemtwinError> {
    let words =
        usize::try_from(bytes / WORD_BYTES as u64).map_err(|_| MemtwinError::Allocation {
            requested_bytes: bytes,
        })?;
    let mut block: Vec<Word> = Vec::new();
    block
        .try_reserve_exact(words)
        .map_err(|_| MemtwinError::Allocation {
            requested_bytes: bytes,
        })?;
    block.resize(words, 0);
    Ok(block)
}
