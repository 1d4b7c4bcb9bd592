//! Region comparison.
//!
//! Two strategies implement [`RegionComparator`]: a scalar scan and a
//! lane-striped scan that mirrors how a SIMD unit walks the buffers. Both
//! report the mismatch with the highest index, because the scan never stops
//! early and every mismatch overwrites the previous one. Both also derive the
//! consistency token from the same canonical serialization of the reduced
//! outcome, so a confirmation pass can mix strategies freely.

use crate::traits::RegionComparator;
use crate::word::{Word, WORD_BYTES};

/// Buffers shorter than this are always compared by the scalar path.
pub const VECTOR_THRESHOLD: usize = 16;

/// Smallest slice (in words) handed to a single comparator worker thread.
pub const PARALLEL_MIN_WORDS_PER_WORKER: usize = 1 << 20;

/// Fewest lanes the striped comparator will run with.
pub const MIN_LANES: usize = 2;

/// A single mismatching word pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    /// Word index of the mismatch.
    pub index: usize,
    /// Value read from buffer A.
    pub value_a: Word,
    /// Value read from buffer B.
    pub value_b: Word,
}

/// CRC-32 of the canonical outcome serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsistencyToken(u32);

impl ConsistencyToken {
    /// Computes the token for an outcome.
    ///
    /// The serialization is `index, value_a, value_b`, each as a little-endian
    /// `u64`; a match serializes as `u64::MAX, 0, 0`.
    pub fn of(fault: Option<&FaultRecord>) -> Self {
        let (index, a, b) = match fault {
            Some(f) => (f.index as u64, f.value_a as u64, f.value_b as u64),
            None => (u64::MAX, 0, 0),
        };
        let mut bytes = [0u8; 24];
        bytes[0..8].copy_from_slice(&index.to_le_bytes());
        bytes[8..16].copy_from_slice(&a.to_le_bytes());
        bytes[16..24].copy_from_slice(&b.to_le_bytes());
        Self(crc32_ieee(&bytes))
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Result of comparing two regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComparisonOutcome {
    fault: Option<FaultRecord>,
    token: ConsistencyToken,
}

impl ComparisonOutcome {
    /// Wraps a (possibly absent) fault and stamps its consistency token.
    pub fn from_fault(fault: Option<FaultRecord>) -> Self {
        Self {
            token: ConsistencyToken::of(fault.as_ref()),
            fault,
        }
    }

    pub fn is_match(&self) -> bool {
        self.fault.is_none()
    }

    pub fn fault(&self) -> Option<&FaultRecord> {
        self.fault.as_ref()
    }

    pub fn index(&self) -> Option<usize> {
        self.fault.map(|f| f.index)
    }

    pub fn token(&self) -> ConsistencyToken {
        self.token
    }
}

/// Word-at-a-time comparison.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarComparator;

impl RegionComparator for ScalarComparator {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn compare(&self, buf_a: &[Word], buf_b: &[Word]) -> ComparisonOutcome {
        debug_assert_eq!(buf_a.len(), buf_b.len());
        ComparisonOutcome::from_fault(scan_scalar(buf_a, buf_b))
    }
}

/// Lane-striped comparison.
///
/// Lane `l` owns every word whose index is congruent to `l` modulo the lane
/// count and remembers its own highest mismatch. Lanes are reduced in order
/// `0..lanes`, so the result matches [`ScalarComparator`] exactly. With more
/// than one worker, lane-aligned chunks of large buffers are scanned on scoped
/// threads and merged back in chunk order before the reduction.
#[derive(Debug, Clone, Copy)]
pub struct VectorizedComparator {
    lanes: usize,
    workers: usize,
    min_words_per_worker: usize,
}

impl VectorizedComparator {
    /// Creates a single-threaded comparator with `lanes` lanes.
    pub fn new(lanes: usize) -> Self {
        Self {
            lanes: lanes.max(MIN_LANES),
            workers: 1,
            min_words_per_worker: PARALLEL_MIN_WORDS_PER_WORKER,
        }
    }

    /// Creates a comparator sized for the vector unit of the running CPU.
    pub fn detect() -> Self {
        Self::new(detect_lane_count())
    }

    /// Sets the number of worker threads used on large buffers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Sets the smallest chunk a worker thread is given.
    #[cfg(test)]
    pub fn with_min_words_per_worker(mut self, words: usize) -> Self {
        self.min_words_per_worker = words.max(1);
        self
    }

    pub fn lanes(&self) -> usize {
        self.lanes
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Returns every lane's own highest mismatch, before reduction.
    pub fn lane_faults(&self, buf_a: &[Word], buf_b: &[Word]) -> Vec<Option<FaultRecord>> {
        let len = buf_a.len().min(buf_b.len());
        let workers = self.workers.min(len / self.min_words_per_worker).max(1);
        if workers == 1 {
            let mut lanes = vec![None; self.lanes];
            scan_lanes(&buf_a[..len], &buf_b[..len], 0, &mut lanes);
            return lanes;
        }

        // Chunk boundaries stay lane-aligned so word i lands in lane i % lanes.
        let chunk = len.div_ceil(workers).div_ceil(self.lanes) * self.lanes;
        let lane_count = self.lanes;
        let per_chunk: Vec<Vec<Option<FaultRecord>>> = crossbeam::thread::scope(|s| {
            let handles: Vec<_> = buf_a[..len]
                .chunks(chunk)
                .zip(buf_b[..len].chunks(chunk))
                .enumerate()
                .map(|(n, (ca, cb))| {
                    s.spawn(move |_| {
                        let mut lanes = vec![None; lane_count];
                        scan_lanes(ca, cb, n * chunk, &mut lanes);
                        lanes
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("Comparator worker panicked"))
                .collect()
        })
        .expect("Comparator scope panicked");

        // Later chunks hold higher indices, so they overwrite earlier ones.
        let mut lanes = vec![None; self.lanes];
        for chunk_lanes in per_chunk {
            for (slot, fault) in lanes.iter_mut().zip(chunk_lanes) {
                if fault.is_some() {
                    *slot = fault;
                }
            }
        }
        lanes
    }
}

impl Default for VectorizedComparator {
    fn default() -> Self {
        Self::detect()
    }
}

impl RegionComparator for VectorizedComparator {
    fn name(&self) -> &'static str {
        "vectorized"
    }

    fn compare(&self, buf_a: &[Word], buf_b: &[Word]) -> ComparisonOutcome {
        debug_assert_eq!(buf_a.len(), buf_b.len());
        if buf_a.len() < VECTOR_THRESHOLD {
            return ComparisonOutcome::from_fault(scan_scalar(buf_a, buf_b));
        }
        ComparisonOutcome::from_fault(reduce_lanes(&self.lane_faults(buf_a, buf_b)))
    }
}

/// Which comparator strategy to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum StrategyKind {
    /// Word-by-word scan.
    Scalar,
    /// Lane-striped scan sized for the CPU's vector unit.
    #[default]
    Vectorized,
}

/// The comparator strategies, selectable at runtime.
#[derive(Debug, Clone, Copy)]
pub enum CompareStrategy {
    Scalar(ScalarComparator),
    Vectorized(VectorizedComparator),
}

impl CompareStrategy {
    /// Picks the striped comparator sized for this CPU, with `workers` threads.
    pub fn auto(workers: usize) -> Self {
        Self::Vectorized(VectorizedComparator::detect().with_workers(workers))
    }

    /// Builds the strategy of the given kind. `workers` only applies to the
    /// vectorized comparator.
    pub fn build(kind: StrategyKind, workers: usize) -> Self {
        match kind {
            StrategyKind::Scalar => Self::Scalar(ScalarComparator),
            StrategyKind::Vectorized => Self::auto(workers),
        }
    }

    /// One-line description for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Scalar(_) => "scalar comparator".to_string(),
            Self::Vectorized(c) => format!(
                "vectorized comparator ({} lanes, {} workers)",
                c.lanes(),
                c.workers()
            ),
        }
    }
}

impl Default for CompareStrategy {
    fn default() -> Self {
        Self::auto(1)
    }
}

impl RegionComparator for CompareStrategy {
    fn name(&self) -> &'static str {
        match self {
            Self::Scalar(c) => c.name(),
            Self::Vectorized(c) => c.name(),
        }
    }

    fn compare(&self, buf_a: &[Word], buf_b: &[Word]) -> ComparisonOutcome {
        match self {
            Self::Scalar(c) => c.compare(buf_a, buf_b),
            Self::Vectorized(c) => c.compare(buf_a, buf_b),
        }
    }
}

/// Scans every word and keeps the last mismatch seen.
fn scan_scalar(buf_a: &[Word], buf_b: &[Word]) -> Option<FaultRecord> {
    let mut last = None;
    for (index, (&value_a, &value_b)) in buf_a.iter().zip(buf_b).enumerate() {
        if value_a != value_b {
            last = Some(FaultRecord {
                index,
                value_a,
                value_b,
            });
        }
    }
    last
}

/// Lane-striped scan of one chunk. `base` must be a multiple of `lanes.len()`.
fn scan_lanes(buf_a: &[Word], buf_b: &[Word], base: usize, lanes: &mut [Option<FaultRecord>]) {
    let width = lanes.len();
    let rows_a = buf_a.chunks_exact(width);
    let rows_b = buf_b.chunks_exact(width);
    let tail_a = rows_a.remainder();
    let tail_b = rows_b.remainder();

    for (row, (ra, rb)) in rows_a.zip(rows_b).enumerate() {
        let row_base = base + row * width;
        for (lane, slot) in lanes.iter_mut().enumerate() {
            if ra[lane] != rb[lane] {
                *slot = Some(FaultRecord {
                    index: row_base + lane,
                    value_a: ra[lane],
                    value_b: rb[lane],
                });
            }
        }
    }

    let tail_base = base + (buf_a.len() / width) * width;
    for (lane, (&value_a, &value_b)) in tail_a.iter().zip(tail_b).enumerate() {
        if value_a != value_b {
            lanes[lane] = Some(FaultRecord {
                index: tail_base + lane,
                value_a,
                value_b,
            });
        }
    }
}

/// Picks the lane fault with the greatest index; the first lane wins ties.
fn reduce_lanes(lanes: &[Option<FaultRecord>]) -> Option<FaultRecord> {
    let mut best: Option<FaultRecord> = None;
    for fault in lanes.iter().flatten() {
        match best {
            Some(current) if fault.index <= current.index => {}
            _ => best = Some(*fault),
        }
    }
    best
}

/// Bytes in one vector register of the running CPU.
pub fn vector_register_bytes() -> usize {
    #[cfg(target_arch = "x86_64")]
    {
        if std::arch::is_x86_feature_detected!("avx512f") {
            64
        } else if std::arch::is_x86_feature_detected!("avx2") {
            32
        } else {
            16
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        16
    }

    #[cfg(all(target_arch = "arm", target_feature = "neon"))]
    {
        16
    }

    #[cfg(not(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        all(target_arch = "arm", target_feature = "neon")
    )))]
    {
        8
    }
}

/// Lane count for the striped comparator: two registers' worth of words.
pub fn detect_lane_count() -> usize {
    (2 * vector_register_bytes() / WORD_BYTES).max(MIN_LANES)
}

/// Bitwise CRC-32 (IEEE 802.3, reflected).
fn crc32_ieee(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn strategies() -> Vec<CompareStrategy> {
        vec![
            CompareStrategy::Scalar(ScalarComparator),
            CompareStrategy::Vectorized(VectorizedComparator::new(2)),
            CompareStrategy::Vectorized(VectorizedComparator::new(8)),
            CompareStrategy::Vectorized(VectorizedComparator::new(7)),
            CompareStrategy::Vectorized(
                VectorizedComparator::new(8)
                    .with_workers(4)
                    .with_min_words_per_worker(16),
            ),
        ]
    }

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32_ieee(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32_ieee(b""), 0);
    }

    #[test]
    fn test_equal_buffers_match() {
        let a: Vec<Word> = (0..1000).map(|i| i as Word ^ 0xCCCC_CCCC).collect();
        let b = a.clone();
        for strategy in strategies() {
            let outcome = strategy.compare(&a, &b);
            assert!(outcome.is_match(), "{} reported a fault", strategy.name());
            assert_eq!(outcome.token(), ComparisonOutcome::from_fault(None).token());
        }
    }

    #[test]
    fn test_empty_buffers_match() {
        for strategy in strategies() {
            assert!(strategy.compare(&[], &[]).is_match());
        }
    }

    #[test]
    fn test_single_mismatch_scenario() {
        let a = vec![0 as Word; 1024];
        let mut b = vec![0 as Word; 1024];
        b[500] = 0xDEAD_BEEF;

        for strategy in strategies() {
            let outcome = strategy.compare(&a, &b);
            let fault = outcome.fault().expect("mismatch not detected");
            assert_eq!(fault.index, 500, "{}", strategy.name());
            assert_eq!(fault.value_a, 0);
            assert_eq!(fault.value_b, 0xDEAD_BEEF);
        }
    }

    #[test]
    fn test_multiple_mismatches_report_highest_index() {
        let a = vec![0x1234 as Word; 1024];
        let mut b = a.clone();
        b[10] = 1;
        b[777] = 2;

        for strategy in strategies() {
            let outcome = strategy.compare(&a, &b);
            assert_eq!(outcome.index(), Some(777), "{}", strategy.name());
            assert_eq!(outcome.fault().map(|f| f.value_b), Some(2));
        }
    }

    #[test]
    fn test_mismatch_in_tail_past_last_full_row() {
        let a = vec![0 as Word; 21];
        let mut b = a.clone();
        b[3] = 9;
        b[20] = 7;
        let outcome = VectorizedComparator::new(8).compare(&a, &b);
        assert_eq!(outcome.index(), Some(20));
    }

    #[test]
    fn test_below_threshold_uses_scalar_path() {
        let a = vec![5 as Word; VECTOR_THRESHOLD - 1];
        let mut b = a.clone();
        b[0] = 6;
        b[VECTOR_THRESHOLD - 2] = 7;
        let outcome = VectorizedComparator::new(8).compare(&a, &b);
        assert_eq!(outcome.index(), Some(VECTOR_THRESHOLD - 2));
    }

    #[test]
    fn test_compare_is_idempotent() {
        let a: Vec<Word> = (0..4096).map(|i| i as Word).collect();
        let mut b = a.clone();
        b[123] = 0;
        b[4000] = 1;

        for strategy in strategies() {
            let first = strategy.compare(&a, &b);
            let second = strategy.compare(&a, &b);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_lane_faults_are_per_lane_maxima() {
        let a = vec![0 as Word; 32];
        let mut b = a.clone();
        b[1] = 1;
        b[9] = 2;
        b[4] = 3;
        let lanes = VectorizedComparator::new(8).lane_faults(&a, &b);
        assert_eq!(lanes.len(), 8);
        assert_eq!(lanes[1].map(|f| f.index), Some(9));
        assert_eq!(lanes[4].map(|f| f.index), Some(4));
        assert!(lanes[0].is_none());
    }

    #[test]
    fn test_threaded_lane_faults_match_sequential() {
        let a: Vec<Word> = (0..1000).map(|i| (i * 31) as Word).collect();
        let mut b = a.clone();
        for i in [0, 17, 250, 251, 600, 999] {
            b[i] ^= 0x40;
        }
        let sequential = VectorizedComparator::new(8).lane_faults(&a, &b);
        let threaded = VectorizedComparator::new(8)
            .with_workers(3)
            .with_min_words_per_worker(64)
            .lane_faults(&a, &b);
        assert_eq!(sequential, threaded);
    }

    #[test]
    fn test_reduce_prefers_greatest_index_then_first_lane() {
        let f = |index, tag| {
            Some(FaultRecord {
                index,
                value_a: 0,
                value_b: tag,
            })
        };
        assert_eq!(reduce_lanes(&[None, None]), None);
        assert_eq!(
            reduce_lanes(&[f(3, 1), None, f(9, 2), f(5, 3)]).map(|r| r.index),
            Some(9)
        );
        // Equal indices never occur in disjoint lanes, but the first still wins.
        assert_eq!(
            reduce_lanes(&[None, f(4, 1), f(4, 2)]).map(|r| r.value_b),
            Some(1)
        );
    }

    #[test]
    fn test_token_depends_on_values() {
        let one = FaultRecord {
            index: 4,
            value_a: 1,
            value_b: 2,
        };
        let other = FaultRecord { value_b: 3, ..one };
        assert_ne!(
            ComparisonOutcome::from_fault(Some(one)).token(),
            ComparisonOutcome::from_fault(Some(other)).token()
        );
    }

    #[test]
    fn test_detected_lane_count() {
        let lanes = detect_lane_count();
        assert!(lanes >= MIN_LANES);
        assert_eq!(VectorizedComparator::detect().lanes(), lanes);
    }

    #[test]
    fn test_lane_count_floor() {
        assert_eq!(VectorizedComparator::new(0).lanes(), MIN_LANES);
        assert_eq!(VectorizedComparator::new(3).with_workers(0).workers(), 1);
    }

    #[test]
    fn test_build_strategy_kinds() {
        let scalar = CompareStrategy::build(StrategyKind::Scalar, 8);
        assert!(matches!(scalar, CompareStrategy::Scalar(_)));
        assert_eq!(scalar.name(), "scalar");
        assert_eq!(scalar.describe(), "scalar comparator");

        let vectorized = CompareStrategy::build(StrategyKind::Vectorized, 3);
        match vectorized {
            CompareStrategy::Vectorized(c) => assert_eq!(c.workers(), 3),
            CompareStrategy::Scalar(_) => panic!("expected the vectorized comparator"),
        }
        assert!(vectorized.describe().contains("3 workers"));
        assert_eq!(StrategyKind::default(), StrategyKind::Vectorized);
    }

    #[test]
    fn test_strategies_agree_through_enum() {
        let a = vec![0 as Word; 300];
        let mut b = a.clone();
        b[17] = 1;
        b[250] = 2;
        let scalar = CompareStrategy::build(StrategyKind::Scalar, 1).compare(&a, &b);
        let vectorized = CompareStrategy::build(StrategyKind::Vectorized, 1).compare(&a, &b);
        assert_eq!(scalar, vectorized);
        assert_eq!(scalar.index(), Some(250));
    }

    proptest! {
        #[test]
        fn prop_strategies_agree(
            base in prop::collection::vec(any::<Word>(), 0..300),
            flips in prop::collection::vec((any::<prop::sample::Index>(), 1..=Word::MAX), 0..6),
            lanes in 2usize..17,
        ) {
            let mut other = base.clone();
            if !base.is_empty() {
                for (idx, mask) in &flips {
                    let i = idx.index(base.len());
                    other[i] ^= mask;
                }
            }
            let expected = ScalarComparator.compare(&base, &other);
            let striped = VectorizedComparator::new(lanes).compare(&base, &other);
            let threaded = VectorizedComparator::new(lanes)
                .with_workers(3)
                .with_min_words_per_worker(8)
                .compare(&base, &other);
            prop_assert_eq!(expected, striped);
            prop_assert_eq!(expected, threaded);
        }

        #[test]
        fn prop_reports_highest_differing_index(
            base in prop::collection::vec(any::<Word>(), 1..300),
            picks in prop::collection::vec(any::<prop::sample::Index>(), 1..6),
        ) {
            let mut other = base.clone();
            let mut highest = 0;
            for pick in &picks {
                let i = pick.index(base.len());
                other[i] = !base[i];
                highest = highest.max(i);
            }
            let outcome = VectorizedComparator::new(8).compare(&base, &other);
            prop_assert_eq!(outcome.index(), Some(highest));
            prop_assert_eq!(outcome.fault().map(|f| f.value_b), Some(!base[highest]));
        }
    }
}
