//! Helpers for extracting bit-fields from 32-bit data words.
//!
//! VME module output is bit-packed into little-endian 32-bit words; every
//! decoder in [`crate::vme`] reads its fields through [`extract`]. The
//! convention follows the module manuals: `extract(word, lo, width)` returns
//! bits `[lo, lo + width)` of `word`, shifted down to the least-significant
//! position.

/// Returns bits `[lo, lo + width)` of `word`.
///
/// `width` must be in `1..=32` and `lo + width` must not exceed 32. Callers
/// pass literal field positions taken from the hardware manuals, so the
/// bounds are enforced with debug assertions only.
#[must_use]
pub const fn extract(word: u32, lo: u32, width: u32) -> u32 {
    debug_assert!(width >= 1 && width <= 32);
    debug_assert!(lo + width <= 32);
    let shifted = word >> lo;
    if width == 32 { shifted } else { shifted & mask(width) }
}

/// The value whose binary representation is `width` consecutive ones.
#[must_use]
pub const fn mask(width: u32) -> u32 {
    debug_assert!(width >= 1 && width <= 32);
    if width == 32 { u32::MAX } else { (1 << width) - 1 }
}

/// Returns true if bit `bit` of `word` is set.
#[must_use]
pub const fn test_bit(word: u32, bit: u32) -> bool {
    extract(word, bit, 1) == 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    #[parameterized(
        low_byte = { 0xdead_beef, 0, 8, 0xef },
        mid_field = { 0xdead_beef, 8, 12, 0xdbe },
        top_bit = { 0x8000_0000, 31, 1, 1 },
        top_bit_clear = { 0x7fff_ffff, 31, 1, 0 },
        full_word = { 0xdead_beef, 0, 32, 0xdead_beef },
        tdc_buffer_kind = { 0x4000_0000, 27, 5, 0x08 },
        tsc_channel_tag = { 0x4000_0001, 30, 2, 1 },
    )]
    fn extract_fields(word: u32, lo: u32, width: u32, expected: u32) {
        assert_eq!(extract(word, lo, width), expected);
    }

    #[test]
    fn masks() {
        assert_eq!(mask(1), 0x1);
        assert_eq!(mask(12), 0xfff);
        assert_eq!(mask(19), 0x7_ffff);
        assert_eq!(mask(30), 0x3fff_ffff);
        assert_eq!(mask(32), u32::MAX);
    }

    #[test]
    fn single_bits() {
        assert!(test_bit(1 << 15, 15));
        assert!(!test_bit(1 << 15, 14));
    }
}
