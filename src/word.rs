//! Native memory word and the bit constants the test patterns are built from.
//!
//! A word is as wide as the target's pointers, which on every platform we
//! support is also the width of the memory bus.

#[cfg(target_pointer_width = "32")]
mod native {
    pub type Word = u32;
    pub const CHECKERBOARD1: Word = 0x5555_5555;
    pub const CHECKERBOARD2: Word = 0xAAAA_AAAA;
}

#[cfg(target_pointer_width = "64")]
mod native {
    pub type Word = u64;
    pub const CHECKERBOARD1: Word = 0x5555_5555_5555_5555;
    pub const CHECKERBOARD2: Word = 0xAAAA_AAAA_AAAA_AAAA;
}

pub use native::{Word, CHECKERBOARD1, CHECKERBOARD2};

/// Width of a word in bits (`W`).
pub const WORD_BITS: u32 = Word::BITS;

/// Width of a word in bytes.
pub const WORD_BYTES: usize = std::mem::size_of::<Word>();

/// Every bit set.
pub const ONE_BITS: Word = Word::MAX;

/// Returns a word with only bit `n` set, or zero when `n` is past the top bit.
pub fn bit(n: u32) -> Word {
    (1 as Word).checked_shl(n).unwrap_or(0)
}

/// Replicates `byte` into every byte lane of a word.
pub fn broadcast_byte(byte: u8) -> Word {
    Word::from_ne_bytes([byte; WORD_BYTES])
}
