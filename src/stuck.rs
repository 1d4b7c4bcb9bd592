//! Stuck-address test.
//!
//! Unlike the twin-buffer patterns this test works on one buffer: every word
//! is set to its own address (or the complement of it, alternating by index
//! and pass) and read back. A word that holds somebody else's address points
//! at an address-decode defect rather than a bad storage cell.

use crate::classify::FaultClassifier;
use crate::report::FaultReport;
use crate::traits::{RegionComparator, TestOutcome};
use crate::word::Word;
use log::debug;
use std::hint::black_box;

/// A word that did not hold the value written to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressMismatch {
    pub index: usize,
    pub expected: Word,
    pub actual: Word,
}

/// The single-buffer address-aliasing test.
#[derive(Debug, Clone, Copy, Default)]
pub struct StuckAddressTest;

impl StuckAddressTest {
    pub const NAME: &'static str = "stuck_address";
    pub const DISPLAY_NAME: &'static str = "Stuck Address";
    pub const PASSES: usize = 16;

    /// Value word `index` at `address` must hold during `pass`.
    pub fn expected_word(address: Word, index: usize, pass: usize) -> Word {
        if (index + pass) % 2 == 0 {
            address
        } else {
            !address
        }
    }

    /// Writes every word of `buf` for `pass`.
    pub fn fill_pass(buf: &mut [Word], pass: usize) {
        for (i, word) in buf.iter_mut().enumerate() {
            let address = &*word as *const Word as usize as Word;
            *word = Self::expected_word(address, i, pass);
        }
    }

    /// Reads `buf` back and returns the first word that does not match `pass`.
    pub fn verify_pass(buf: &[Word], pass: usize) -> Option<AddressMismatch> {
        buf.iter().enumerate().find_map(|(i, word)| {
            let address = word as *const Word as usize as Word;
            let expected = Self::expected_word(address, i, pass);
            (*word != expected).then_some(AddressMismatch {
                index: i,
                expected,
                actual: *word,
            })
        })
    }

    /// Verifies one pass and reports a mismatch through the classifier.
    pub fn check_pass<C: RegionComparator>(
        buf: &[Word],
        pass: usize,
        classifier: &mut FaultClassifier<C>,
    ) -> Option<FaultReport> {
        let mismatch = Self::verify_pass(buf, pass)?;
        Some(classifier.report_address_line(
            Self::NAME,
            mismatch.index,
            mismatch.expected,
            mismatch.actual,
        ))
    }

    /// Runs all passes, stopping at the first address-line fault.
    pub fn run<C: RegionComparator>(
        buf: &mut [Word],
        classifier: &mut FaultClassifier<C>,
    ) -> TestOutcome {
        for pass in 0..Self::PASSES {
            debug!("{}: pass {}", Self::NAME, pass);
            Self::fill_pass(buf, pass);
            // Keep the read-back from being folded into the writes.
            let buf = black_box(&mut *buf);
            if let Some(report) = Self::check_pass(buf, pass, classifier) {
                return TestOutcome::Failed(report);
            }
        }
        TestOutcome::Passed
    }
}
