//! Bit-field packing of register values into 16-bit words
//!
//! Words are assembled most significant first: `words[0]` holds the high
//! bits of a multi-word value. The field itself starts `bit_offset` bits
//! above the least significant bit of the assembled value.

use super::RegisterConfig;

fn lsb_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn assemble(words: &[u16]) -> u64 {
    words
        .iter()
        .fold(0u64, |acc, word| (acc << 16) | u64::from(*word))
}

/// Extract the raw value of `config` from its `word16_width` words
pub fn extract_value(config: &RegisterConfig, words: &[u16]) -> u64 {
    let assembled = assemble(words);
    (assembled >> config.bit_offset) & lsb_mask(config.bit_width())
}

/// Merge `raw` into `cached` words, keeping bits outside the field untouched.
///
/// `cached` must hold `word16_width` words; the result has the same length.
pub fn compose_words(config: &RegisterConfig, raw: u64, cached: &[u16]) -> Vec<u16> {
    let mask = lsb_mask(config.bit_width()) << config.bit_offset;
    let merged = (assemble(cached) & !mask) | ((raw << config.bit_offset) & mask);
    let count = cached.len();
    (0..count)
        .map(|i| (merged >> (16 * (count - 1 - i))) as u16)
        .collect()
}
