//! Statistics tracking for memory testing.
//!
//! This module provides thread-safe statistics tracking using atomic operations.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe statistics tracker for memory testing.
///
/// Written by the classifier on the test thread and read by the progress
/// display, so every counter is a relaxed atomic.
pub struct TestStats {
    bytes_compared: AtomicU64,
    comparisons: AtomicU64,
    faults_found: AtomicU64,
    tests_completed: AtomicU64,
}

impl TestStats {
    /// Creates a new TestStats instance with all counters at zero.
    pub fn new() -> Self {
        Self {
            bytes_compared: AtomicU64::new(0),
            comparisons: AtomicU64::new(0),
            faults_found: AtomicU64::new(0),
            tests_completed: AtomicU64::new(0),
        }
    }

    /// Records one region comparison covering `bytes` bytes per buffer.
    pub fn add_comparison(&self, bytes: u64) {
        self.comparisons.fetch_add(1, Ordering::Relaxed);
        self.bytes_compared.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Increments the fault counter by one.
    pub fn add_fault(&self) {
        self.faults_found.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the test counter by one.
    pub fn add_test(&self) {
        self.tests_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the total number of bytes compared.
    pub fn get_bytes(&self) -> u64 {
        self.bytes_compared.load(Ordering::Relaxed)
    }

    /// Returns the number of region comparisons run.
    pub fn get_comparisons(&self) -> u64 {
        self.comparisons.load(Ordering::Relaxed)
    }

    /// Returns the number of faults recorded.
    pub fn get_faults(&self) -> u64 {
        self.faults_found.load(Ordering::Relaxed)
    }

    /// Returns the number of tests completed.
    pub fn get_tests(&self) -> u64 {
        self.tests_completed.load(Ordering::Relaxed)
    }
}

impl Default for TestStats {
    fn default() -> Self {
        Self::new()
    }
}
