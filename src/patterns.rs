//! Test pattern definitions for memory testing.
//!
//! This module contains the `TestPattern` catalog. Every pattern fills two
//! buffers with identical contents, one pass at a time, and hands them to the
//! fault classifier after each pass. Pass counts are fixed per pattern.

use crate::classify::FaultClassifier;
use crate::traits::{RegionComparator, TestOutcome};
use crate::word::{
    bit, broadcast_byte, Word, CHECKERBOARD1, CHECKERBOARD2, ONE_BITS, WORD_BITS, WORD_BYTES,
};
use bytemuck::Pod;
use log::debug;
use rand::Rng;

/// Memory test patterns for detecting different types of memory faults.
///
/// - Random and arithmetic patterns provide broad coverage and exercise the
///   read-modify-write path
/// - Solid, checkerboard and block patterns hammer neighbouring cells with
///   opposite values
/// - Walking and spreading bits detect stuck and coupled data lines
/// - Narrow-write patterns catch byte-lane and write-combining faults
///
/// The arithmetic patterns (`CompareXor` through `CompareAnd`) start from the
/// buffers' current contents and assume both buffers are still equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestPattern {
    RandomValue,
    CompareXor,
    CompareSub,
    CompareMul,
    CompareDiv,
    CompareOr,
    CompareAnd,
    SeqInc,
    SolidBits,
    BlockSeq,
    Checkerboard,
    BitSpread,
    BitFlip,
    WalkBits1,
    WalkBits0,
    NarrowWrites8,
    NarrowWrites16,
}

/// Catalog order. A pattern's position is also its test-mask bit.
const ALL_PATTERNS: [TestPattern; 17] = [
    TestPattern::RandomValue,
    TestPattern::CompareXor,
    TestPattern::CompareSub,
    TestPattern::CompareMul,
    TestPattern::CompareDiv,
    TestPattern::CompareOr,
    TestPattern::CompareAnd,
    TestPattern::SeqInc,
    TestPattern::SolidBits,
    TestPattern::BlockSeq,
    TestPattern::Checkerboard,
    TestPattern::BitSpread,
    TestPattern::BitFlip,
    TestPattern::WalkBits1,
    TestPattern::WalkBits0,
    TestPattern::NarrowWrites8,
    TestPattern::NarrowWrites16,
];

impl TestPattern {
    /// Returns all available test patterns.
    pub fn all_patterns() -> Vec<Self> {
        ALL_PATTERNS.to_vec()
    }

    /// Returns the patterns selected by `mask`; an empty mask selects all.
    pub fn from_mask(mask: u64) -> Vec<Self> {
        if mask == 0 {
            return Self::all_patterns();
        }
        ALL_PATTERNS
            .into_iter()
            .filter(|p| (mask & p.mask_bit()) != 0)
            .collect()
    }

    /// Bit selecting this pattern in a test mask.
    pub fn mask_bit(&self) -> u64 {
        let position = ALL_PATTERNS
            .iter()
            .position(|p| p == self)
            .unwrap_or_default();
        1 << position
    }

    /// Returns the human-readable name of this pattern.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RandomValue => "Random Value",
            Self::CompareXor => "Compare XOR",
            Self::CompareSub => "Compare SUB",
            Self::CompareMul => "Compare MUL",
            Self::CompareDiv => "Compare DIV",
            Self::CompareOr => "Compare OR",
            Self::CompareAnd => "Compare AND",
            Self::SeqInc => "Sequential Increment",
            Self::SolidBits => "Solid Bits",
            Self::BlockSeq => "Block Sequential",
            Self::Checkerboard => "Checkerboard",
            Self::BitSpread => "Bit Spread",
            Self::BitFlip => "Bit Flip",
            Self::WalkBits1 => "Walking Ones",
            Self::WalkBits0 => "Walking Zeros",
            Self::NarrowWrites8 => "8-bit Writes",
            Self::NarrowWrites16 => "16-bit Writes",
        }
    }

    /// Returns the name used in fault reports.
    pub fn test_name(&self) -> &'static str {
        match self {
            Self::RandomValue => "random_value",
            Self::CompareXor => "xor",
            Self::CompareSub => "sub",
            Self::CompareMul => "mul",
            Self::CompareDiv => "div",
            Self::CompareOr => "or",
            Self::CompareAnd => "and",
            Self::SeqInc => "seqinc",
            Self::SolidBits => "solidbits",
            Self::BlockSeq => "blockseq",
            Self::Checkerboard => "checkerboard",
            Self::BitSpread => "bitspread",
            Self::BitFlip => "bitflip",
            Self::WalkBits1 => "walkbits1",
            Self::WalkBits0 => "walkbits0",
            Self::NarrowWrites8 => "8bit_wide_random",
            Self::NarrowWrites16 => "16bit_wide_random",
        }
    }

    /// Number of fill-and-compare passes this pattern runs.
    pub fn passes(&self) -> usize {
        let w = WORD_BITS as usize;
        match self {
            Self::SolidBits | Self::Checkerboard => 64,
            Self::BlockSeq => 256,
            Self::WalkBits0 | Self::WalkBits1 | Self::BitSpread => 2 * w,
            Self::BitFlip => 8 * w,
            Self::NarrowWrites8 | Self::NarrowWrites16 => 2,
            _ => 1,
        }
    }

    /// Value of word `index` during `pass`, for patterns that do not draw
    /// random numbers.
    pub fn pass_word(&self, pass: usize, index: usize) -> Option<Word> {
        let even = index % 2 == 0;
        let word = match self {
            Self::SolidBits => {
                let q = if pass % 2 == 0 { ONE_BITS } else { 0 };
                alternate(q, even)
            }
            Self::Checkerboard => {
                let q = if pass % 2 == 0 { CHECKERBOARD1 } else { CHECKERBOARD2 };
                alternate(q, even)
            }
            Self::BlockSeq => broadcast_byte(pass as u8),
            Self::WalkBits0 => bit(walk_position(pass)),
            Self::WalkBits1 => ONE_BITS ^ bit(walk_position(pass)),
            Self::BitSpread => {
                let w = WORD_BITS as usize;
                let spread = if pass < w {
                    bit(pass as u32) | bit(pass as u32 + 2)
                } else {
                    bit((2 * w - 1 - pass) as u32) | bit((2 * w + 1 - pass) as u32)
                };
                if even {
                    spread
                } else {
                    ONE_BITS ^ spread
                }
            }
            Self::BitFlip => {
                let (k, m) = (pass / 8, pass % 8);
                // bit(k) inverted m + 1 times.
                let q = if m % 2 == 0 { !bit(k as u32) } else { bit(k as u32) };
                alternate(q, even)
            }
            _ => return None,
        };
        Some(word)
    }

    /// Fills both buffers for `pass`.
    pub fn fill_pass<R: Rng>(
        &self,
        pass: usize,
        buf_a: &mut [Word],
        buf_b: &mut [Word],
        rng: &mut R,
    ) {
        match self {
            Self::RandomValue => {
                for (a, b) in buf_a.iter_mut().zip(buf_b.iter_mut()) {
                    let value: Word = rng.gen();
                    *a = value;
                    *b = value;
                }
            }
            Self::CompareXor
            | Self::CompareSub
            | Self::CompareMul
            | Self::CompareDiv
            | Self::CompareOr
            | Self::CompareAnd => {
                let q: Word = rng.gen();
                for (a, b) in buf_a.iter_mut().zip(buf_b.iter_mut()) {
                    *a = self.apply_operator(*a, q);
                    *b = self.apply_operator(*b, q);
                }
            }
            Self::SeqInc => {
                let q: Word = rng.gen();
                for (i, (a, b)) in buf_a.iter_mut().zip(buf_b.iter_mut()).enumerate() {
                    let value = (i as Word).wrapping_add(q);
                    *a = value;
                    *b = value;
                }
            }
            Self::NarrowWrites8 => fill_narrow::<u8, R>(pass, buf_a, buf_b, rng),
            Self::NarrowWrites16 => fill_narrow::<u16, R>(pass, buf_a, buf_b, rng),
            _ => {
                for (i, (a, b)) in buf_a.iter_mut().zip(buf_b.iter_mut()).enumerate() {
                    let value = self.pass_word(pass, i).unwrap_or_default();
                    *a = value;
                    *b = value;
                }
            }
        }
    }

    /// Applies this arithmetic pattern's operator with operand `q`.
    /// Non-arithmetic patterns leave `word` unchanged.
    pub fn apply_operator(&self, word: Word, q: Word) -> Word {
        match self {
            Self::CompareXor => word ^ q,
            Self::CompareSub => word.wrapping_sub(q),
            Self::CompareMul => word.wrapping_mul(q),
            Self::CompareDiv => word / q.max(1),
            Self::CompareOr => word | q,
            Self::CompareAnd => word & q,
            _ => word,
        }
    }

    /// Runs every pass, stopping at the first fault.
    #[cfg(test)]
    pub fn run<C: RegionComparator, R: Rng>(
        &self,
        buf_a: &mut [Word],
        buf_b: &mut [Word],
        rng: &mut R,
        classifier: &mut FaultClassifier<C>,
    ) -> TestOutcome {
        self.run_with_progress(buf_a, buf_b, rng, classifier, |_| {})
    }

    /// Like [`run`](Self::run), calling `on_pass` with each pass index before
    /// the pass is written.
    pub fn run_with_progress<C, R, F>(
        &self,
        buf_a: &mut [Word],
        buf_b: &mut [Word],
        rng: &mut R,
        classifier: &mut FaultClassifier<C>,
        mut on_pass: F,
    ) -> TestOutcome
    where
        C: RegionComparator,
        R: Rng,
        F: FnMut(usize),
    {
        debug_assert_eq!(buf_a.len(), buf_b.len());
        for pass in 0..self.passes() {
            on_pass(pass);
            self.fill_pass(pass, buf_a, buf_b, rng);
            if let Some(report) = classifier.classify(buf_a, buf_b, self.test_name()) {
                debug!(
                    "{}: fault on pass {} of {}, skipping remaining passes",
                    self.test_name(),
                    pass,
                    self.passes()
                );
                return TestOutcome::Failed(report);
            }
        }
        TestOutcome::Passed
    }
}

/// `q` on even indices, its complement on odd ones.
fn alternate(q: Word, even: bool) -> Word {
    if even {
        q
    } else {
        !q
    }
}

/// Bit position for walking patterns: up through the word, then back down.
fn walk_position(pass: usize) -> u32 {
    let w = WORD_BITS as usize;
    if pass < w {
        pass as u32
    } else {
        (2 * w - pass - 1) as u32
    }
}

/// Writes one random stream into both buffers: whole words into one buffer
/// and `T`-sized pieces into the other. The buffers swap roles on odd passes.
fn fill_narrow<T: Pod, R: Rng>(
    pass: usize,
    buf_a: &mut [Word],
    buf_b: &mut [Word],
    rng: &mut R,
) {
    let (wide, narrow) = if pass % 2 == 0 {
        (buf_a, buf_b)
    } else {
        (buf_b, buf_a)
    };
    let pieces_per_word = WORD_BYTES / std::mem::size_of::<T>();
    let narrow: &mut [T] = bytemuck::cast_slice_mut(narrow);

    for (slot, pieces) in wide.iter_mut().zip(narrow.chunks_exact_mut(pieces_per_word)) {
        let value: Word = rng.gen();
        *slot = value;
        let parts: &[T] = bytemuck::cast_slice(std::slice::from_ref(&value));
        for (dst, src) in pieces.iter_mut().zip(parts) {
            *dst = *src;
        }
    }
}
