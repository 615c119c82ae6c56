//! Error types surfaced by the bank decoders.

use thiserror::Error;

/// Recoverable decoding failures.
///
/// Decoders return these rather than panicking. The dispatcher logs the
/// failure, skips the offending bank, and continues with the next frame;
/// per-buffer problems inside a bank (unknown buffer codes, out-of-range
/// channels, hit-count overflow) are instead counted and rate-limit logged
/// so that one bad word never aborts a frame.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum DecodeError {
    /// Requested bank is not present in the frame payload.
    #[error("bank \"{bank}\" not found in frame payload")]
    MissingBank { bank: String },

    /// Bank length differs from the fixed width the module writes.
    #[error("bank \"{bank}\": length {got} words, expected {expected}")]
    BadLength {
        bank: String,
        got: usize,
        expected: usize,
    },

    /// Bank declared type does not match the requested element type.
    #[error("bank \"{bank}\": type id {got}, expected {expected}")]
    BadBankType { bank: String, got: u16, expected: u16 },

    /// Bank byte count is not a whole number of elements.
    #[error("bank \"{bank}\": {len} bytes is not a whole number of {width}-byte elements")]
    Truncated {
        bank: String,
        len: usize,
        width: usize,
    },

    /// Timestamp bank carried no trigger-tag entry, so the frame cannot be
    /// placed on the time axis.
    #[error("TSC bank \"{bank}\" has no trigger timestamp entry")]
    NoTriggerTime { bank: String },
}
