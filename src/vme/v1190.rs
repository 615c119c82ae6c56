//! Multi-hit TDC (CAEN V1190) stream-of-buffers decoder.
//!
//! The module writes a flat sequence of 32-bit buffers; the top five bits of
//! each buffer give its kind. Measurements accumulate into per-channel
//! leading- and trailing-edge hit lists. Decoding never aborts a frame: bad
//! buffers are counted, rate-limit logged, and skipped.

use crate::bits::extract;
use crate::error::DecodeError;
use crate::messages::DelayedMessageLog;
use crate::midas::banks::BankName;
use crate::midas::frame::RawFrame;
use crate::valid;
use crate::vme::DecodeCounters;
use bitflags::bitflags;
use log::warn;

/// Number of measurement channels.
pub const MAX_CHANNELS: usize = 64;

/// Default cap on recorded hits per channel edge per event.
pub const DEFAULT_MAX_HITS: usize = 32;

/// TDC header buffer code.
pub const TDC_HEADER: u32 = 0x01;
/// Measurement (data) buffer code.
pub const TDC_MEASUREMENT: u32 = 0x00;
/// Error buffer code.
pub const TDC_ERROR: u32 = 0x04;
/// TDC trailer buffer code.
pub const TDC_TRAILER: u32 = 0x03;
/// Global header buffer code.
pub const GLOBAL_HEADER: u32 = 0x08;
/// Global trailer buffer code.
pub const GLOBAL_TRAILER: u32 = 0x10;
/// Extended trigger time buffer code.
pub const EXTENDED_TRIGGER_TIME: u32 = 0x11;

// Delayed-message codes above the 15 hardware error bits.
const MSG_CHANNEL_RANGE: u16 = 16;
const MSG_HIT_OVERFLOW: u16 = 17;
const MSG_UNKNOWN_BUFFER: u16 = 18;

bitflags! {
    /// Error conditions reported in a TDC error buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ErrorFlags: u16 {
        const GROUP0_FIFO_OVERFLOW = 1 << 0;
        const GROUP0_L1_OVERFLOW   = 1 << 1;
        const GROUP0_HIT_ERROR     = 1 << 2;
        const GROUP1_FIFO_OVERFLOW = 1 << 3;
        const GROUP1_L1_OVERFLOW   = 1 << 4;
        const GROUP1_HIT_ERROR     = 1 << 5;
        const GROUP2_FIFO_OVERFLOW = 1 << 6;
        const GROUP2_L1_OVERFLOW   = 1 << 7;
        const GROUP2_HIT_ERROR     = 1 << 8;
        const GROUP3_FIFO_OVERFLOW = 1 << 9;
        const GROUP3_L1_OVERFLOW   = 1 << 10;
        const GROUP3_HIT_ERROR     = 1 << 11;
        const SIZE_LIMIT_REJECT    = 1 << 12;
        const EVENT_LOST           = 1 << 13;
        const FATAL_CHIP_ERROR     = 1 << 14;
    }
}

/// Messages from the module manual, one per error bit.
const ERROR_MESSAGES: [&str; 15] = [
    "Hit lost in group 0 from read-out FIFO overflow",
    "Hit lost in group 0 from L1 buffer overflow",
    "Hit error detected in group 0",
    "Hit lost in group 1 from read-out FIFO overflow",
    "Hit lost in group 1 from L1 buffer overflow",
    "Hit error detected in group 1",
    "Hit lost in group 2 from read-out FIFO overflow",
    "Hit lost in group 2 from L1 buffer overflow",
    "Hit error detected in group 2",
    "Hit lost in group 3 from read-out FIFO overflow",
    "Hit lost in group 3 from L1 buffer overflow",
    "Hit error detected in group 3",
    "Hits rejected because of programmed event size limit",
    "Event lost (trigger FIFO overflow)",
    "Internal fatal chip error detected",
];

/// Measurement data for a single TDC channel in one event.
#[derive(Debug, Clone, Default)]
pub struct Channel {
    /// Leading-edge measurements, in arrival order.
    pub leading: Vec<i32>,
    /// Trailing-edge measurements, in arrival order.
    pub trailing: Vec<i32>,
    saturated_leading: bool,
    saturated_trailing: bool,
}

impl Channel {
    fn clear(&mut self) {
        self.leading.clear();
        self.trailing.clear();
        self.saturated_leading = false;
        self.saturated_trailing = false;
    }
}

/// Decoder for one V1190 module.
#[derive(Debug, Clone)]
pub struct V1190 {
    /// Per-channel hit lists.
    pub channels: [Channel; MAX_CHANNELS],
    /// Event counter from the global header.
    pub count: u32,
    /// Word count from the TDC trailer.
    pub word_count: u16,
    /// Word count from the global trailer.
    pub trailer_word_count: u16,
    /// Event id from the TDC header; the trailer is checked against it.
    pub event_id: u16,
    /// Bunch id from the TDC header.
    pub bunch_id: u16,
    /// Status bits from the global trailer.
    pub status: u8,
    /// Extended trigger time, when the module emits one.
    pub extended_trigger: u32,
    /// Error bits latched from error buffers in this event.
    pub errors: ErrorFlags,
    /// Running decode-problem totals (not reset per event).
    pub counters: DecodeCounters,
    max_hits: usize,
}

impl Default for V1190 {
    fn default() -> Self {
        Self::new()
    }
}

impl V1190 {
    #[must_use]
    pub fn new() -> Self {
        let mut v1190 = Self {
            channels: std::array::from_fn(|_| Channel::default()),
            count: 0,
            word_count: 0,
            trailer_word_count: 0,
            event_id: 0,
            bunch_id: 0,
            status: 0,
            extended_trigger: 0,
            errors: ErrorFlags::empty(),
            counters: DecodeCounters::default(),
            max_hits: DEFAULT_MAX_HITS,
        };
        v1190.reset();
        v1190
    }

    /// Caps the number of recorded hits per channel edge per event.
    pub fn set_max_hits(&mut self, max_hits: usize) {
        self.max_hits = max_hits;
    }

    /// Clears per-event state, keeping hit-list capacity.
    pub fn reset(&mut self) {
        for channel in &mut self.channels {
            channel.clear();
        }
        valid::set_no_data(&mut self.count);
        valid::set_no_data(&mut self.word_count);
        valid::set_no_data(&mut self.trailer_word_count);
        valid::set_no_data(&mut self.event_id);
        valid::set_no_data(&mut self.bunch_id);
        self.status = 0;
        valid::set_no_data(&mut self.extended_trigger);
        self.errors = ErrorFlags::empty();
    }

    /// First leading-edge time on `ch`, the common single-hit case.
    #[must_use]
    pub fn get_data(&self, ch: usize) -> Option<i32> {
        self.get_leading(ch, 0)
    }

    /// Leading-edge measurement number `hit` on channel `ch`.
    #[must_use]
    pub fn get_leading(&self, ch: usize, hit: usize) -> Option<i32> {
        if ch >= MAX_CHANNELS {
            warn!("TDC channel number {ch} out of bounds (valid range: [0, {}])", MAX_CHANNELS - 1);
            return None;
        }
        self.channels[ch].leading.get(hit).copied()
    }

    /// Trailing-edge measurement number `hit` on channel `ch`.
    #[must_use]
    pub fn get_trailing(&self, ch: usize, hit: usize) -> Option<i32> {
        if ch >= MAX_CHANNELS {
            warn!("TDC channel number {ch} out of bounds (valid range: [0, {}])", MAX_CHANNELS - 1);
            return None;
        }
        self.channels[ch].trailing.get(hit).copied()
    }

    /// Decodes every buffer in the bank.
    ///
    /// Returns `Ok(true)` when all buffers decoded cleanly, `Ok(false)` when
    /// at least one was dropped.
    pub fn unpack(
        &mut self,
        frame: &RawFrame,
        bank_name: &BankName,
        messages: &mut DelayedMessageLog,
    ) -> Result<bool, DecodeError> {
        let bank = frame.find_bank(bank_name).ok_or_else(|| DecodeError::MissingBank {
            bank: bank_name.to_string(),
        })?;
        let mut all_ok = true;
        for buffer in bank.u32_words()? {
            if !self.unpack_buffer(buffer, bank_name, messages) {
                all_ok = false;
            }
        }
        Ok(all_ok)
    }

    fn unpack_buffer(
        &mut self,
        buffer: u32,
        bank_name: &BankName,
        messages: &mut DelayedMessageLog,
    ) -> bool {
        let kind = extract(buffer, 27, 5);
        match kind {
            GLOBAL_HEADER => {
                self.count = extract(buffer, 5, 22);
                true
            }
            GLOBAL_TRAILER => {
                self.status = extract(buffer, 24, 3) as u8;
                self.trailer_word_count = extract(buffer, 5, 16) as u16;
                true
            }
            EXTENDED_TRIGGER_TIME => {
                self.extended_trigger = extract(buffer, 0, 27);
                true
            }
            TDC_HEADER => {
                self.bunch_id = extract(buffer, 0, 12) as u16;
                self.event_id = extract(buffer, 12, 12) as u16;
                true
            }
            TDC_MEASUREMENT => self.unpack_measurement(buffer, bank_name, messages),
            TDC_ERROR => {
                self.handle_error_buffer(buffer, bank_name, messages);
                false
            }
            TDC_TRAILER => {
                self.unpack_trailer(buffer, bank_name);
                true
            }
            _ => {
                self.counters.unknown_buffer += 1;
                messages.record(bank_name.as_str(), MSG_UNKNOWN_BUFFER, || {
                    format!("bank \"{bank_name}\": unknown TDC buffer code 0x{kind:02x}, skipping")
                });
                false
            }
        }
    }

    fn unpack_measurement(
        &mut self,
        buffer: u32,
        bank_name: &BankName,
        messages: &mut DelayedMessageLog,
    ) -> bool {
        let edge = extract(buffer, 26, 1);
        let ch = extract(buffer, 19, 7) as usize;
        if ch >= MAX_CHANNELS {
            self.counters.channel_out_of_range += 1;
            messages.record(bank_name.as_str(), MSG_CHANNEL_RANGE, || {
                format!(
                    "bank \"{bank_name}\": TDC channel {ch} >= maximum {MAX_CHANNELS}, dropping buffer"
                )
            });
            return false;
        }
        let measurement = extract(buffer, 0, 19) as i32;

        let channel = &mut self.channels[ch];
        let (hits, saturated) = if edge == 0 {
            (&mut channel.leading, &mut channel.saturated_leading)
        } else {
            (&mut channel.trailing, &mut channel.saturated_trailing)
        };
        if *saturated {
            // excess hits for this channel are dropped for the rest of the
            // event, preserving the order of the ones already accepted
            return true;
        }
        if hits.len() >= self.max_hits {
            *saturated = true;
            self.counters.hit_count_exceeded += 1;
            let max_hits = self.max_hits;
            messages.record(bank_name.as_str(), MSG_HIT_OVERFLOW, || {
                format!(
                    "bank \"{bank_name}\": more than {max_hits} hits on TDC channel {ch}, dropping the excess"
                )
            });
            return true;
        }
        hits.push(measurement);
        true
    }

    fn unpack_trailer(&mut self, buffer: u32, bank_name: &BankName) {
        self.word_count = extract(buffer, 0, 12) as u16;
        let trailer_event_id = extract(buffer, 12, 12) as u16;
        if trailer_event_id != self.event_id {
            warn!(
                "bank \"{bank_name}\": TDC trailer event id ({trailer_event_id}) != header event id ({})",
                self.event_id
            );
        }
    }

    fn handle_error_buffer(
        &mut self,
        buffer: u32,
        bank_name: &BankName,
        messages: &mut DelayedMessageLog,
    ) {
        let flags = ErrorFlags::from_bits_truncate(extract(buffer, 0, 15) as u16);
        self.errors |= flags;
        for (bit, message) in ERROR_MESSAGES.iter().enumerate() {
            if flags.bits() & (1u16 << bit) != 0 {
                messages.record(bank_name.as_str(), bit as u16, || {
                    format!("TDC error (bank \"{bank_name}\"): {message}")
                });
            }
        }
    }
}
