//! Decoders for the VME module families read out by both streams.
//!
//! Each decoder owns fixed per-channel storage that is reset (not
//! reallocated) between frames, and a set of running counters for the
//! recoverable problems it can meet in a bank.

pub mod io32;
pub mod v1190;
pub mod v792;

/// Running totals of recoverable decode problems, kept across events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeCounters {
    /// Buffers with an unrecognized kind code.
    pub unknown_buffer: u64,
    /// Buffers carrying the explicit invalid code.
    pub invalid_buffer: u64,
    /// Buffers whose channel field exceeds the module capacity.
    pub channel_out_of_range: u64,
    /// Channel-edge hit lists that reached the per-event cap.
    pub hit_count_exceeded: u64,
}
