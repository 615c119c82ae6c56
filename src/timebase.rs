//! Conversions between timestamp-counter ticks and physical time.
//!
//! Both front-ends run their timestamp counters (TSC) from a common 20 MHz
//! clock. The per-event trigger timestamp is the low 30 bits of the free
//! running counter, which rolls over roughly every 53.7 s; the coarse readout
//! time counters are full 32-bit values.

/// TSC clock frequency in MHz.
pub const TSC_FREQUENCY_MHZ: f64 = 20.0;

/// Width in bits of the per-event trigger timestamp field.
pub const TRIGGER_TSC_BITS: u32 = 30;

/// Converts counter ticks to microseconds.
#[must_use]
pub fn ticks_to_us(ticks: f64) -> f64 {
    ticks / TSC_FREQUENCY_MHZ
}

/// Converts counter ticks to seconds.
#[must_use]
pub fn ticks_to_sec(ticks: f64) -> f64 {
    ticks / (TSC_FREQUENCY_MHZ * 1e6)
}

/// Signed shortest-path difference `later - earlier` modulo
/// `2^modulus_bits`.
///
/// Two events straddling a counter rollover still yield a small signed
/// delta, which is the physically correct one as long as the real separation
/// is below half the counter period. Used with 30-bit arguments for trigger
/// timestamps and 32-bit arguments for the coarse readout counters.
#[must_use]
pub fn diff_with_rollover(later: u32, earlier: u32, modulus_bits: u32) -> i32 {
    debug_assert!(modulus_bits >= 2 && modulus_bits <= 32);
    let modulus = 1u64 << modulus_bits;
    let mask = modulus - 1;
    let forward = (u64::from(later) & mask).wrapping_sub(u64::from(earlier) & mask) & mask;
    if forward >= modulus / 2 {
        (forward as i64 - modulus as i64) as i32
    } else {
        forward as i32
    }
}
