//! Peak-sensing ADC (CAEN V792/V785) stream-of-buffers decoder.
//!
//! The module writes a flat sequence of 32-bit buffers; the top three bits of
//! the kind field (word bits 24-26) select header, data, trailer, or the
//! explicit invalid code. Conversions land in a fixed 32-slot array with an
//! in-band sentinel for channels absent from the event. The readout
//! structure of the V785 peak-sensing ADC is identical, so the same decoder
//! serves both; the tail stream decodes two instances side by side,
//! distinguished by bank name.

use crate::bits::extract;
use crate::error::DecodeError;
use crate::messages::DelayedMessageLog;
use crate::midas::banks::BankName;
use crate::midas::frame::RawFrame;
use crate::valid;
use crate::vme::DecodeCounters;
use log::warn;

/// Number of conversion channels.
pub const MAX_CHANNELS: usize = 32;

/// Code of a data buffer.
pub const DATA_BITS: u32 = 0x0;
/// Code of a header buffer.
pub const HEADER_BITS: u32 = 0x2;
/// Code of a trailer buffer.
pub const FOOTER_BITS: u32 = 0x4;
/// Code of an invalid buffer.
pub const INVALID_BITS: u32 = 0x6;

// Delayed-message codes.
const MSG_CHANNEL_RANGE: u16 = 0;
const MSG_INVALID_BUFFER: u16 = 1;
const MSG_UNKNOWN_BUFFER: u16 = 2;

/// Decoder for one V792/V785 module.
#[derive(Debug, Clone)]
pub struct V792 {
    /// Number of channels present in the event, from the header.
    pub n_ch: u16,
    /// Event counter from the trailer.
    pub count: u32,
    /// Per-channel overflow bits.
    pub overflow: u32,
    /// Per-channel under-threshold bits.
    pub underflow: u32,
    /// Running decode-problem totals (not reset per event).
    pub counters: DecodeCounters,
    data: [i32; MAX_CHANNELS],
}

impl Default for V792 {
    fn default() -> Self {
        Self::new()
    }
}

impl V792 {
    #[must_use]
    pub fn new() -> Self {
        let mut v792 = Self {
            n_ch: 0,
            count: 0,
            overflow: 0,
            underflow: 0,
            counters: DecodeCounters::default(),
            data: [0; MAX_CHANNELS],
        };
        v792.reset();
        v792
    }

    /// Clears per-event state.
    pub fn reset(&mut self) {
        self.n_ch = 0;
        valid::set_no_data(&mut self.count);
        self.overflow = 0;
        self.underflow = 0;
        for value in &mut self.data {
            valid::set_no_data(value);
        }
    }

    /// Conversion value for `ch`; `None` when the channel was absent from
    /// the event.
    #[must_use]
    pub fn get_data(&self, ch: usize) -> Option<i32> {
        if ch >= MAX_CHANNELS {
            warn!("ADC channel number {ch} out of bounds (valid range: [0, {}])", MAX_CHANNELS - 1);
            return None;
        }
        valid::to_option(self.data[ch])
    }

    /// True if the conversion on `ch` overflowed.
    #[must_use]
    pub fn is_overflow(&self, ch: usize) -> bool {
        ch < MAX_CHANNELS && (self.overflow >> ch) & 1 == 1
    }

    /// True if the conversion on `ch` was under threshold.
    #[must_use]
    pub fn is_underflow(&self, ch: usize) -> bool {
        ch < MAX_CHANNELS && (self.underflow >> ch) & 1 == 1
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
        let kind = extract(buffer, 24, 3);
        match kind {
            DATA_BITS => self.unpack_data_buffer(buffer, bank_name, messages),
            HEADER_BITS => {
                self.n_ch = extract(buffer, 6, 8) as u16;
                true
            }
            FOOTER_BITS => {
                self.count = extract(buffer, 0, 24);
                true
            }
            INVALID_BITS => {
                self.counters.invalid_buffer += 1;
                messages.record(bank_name.as_str(), MSG_INVALID_BUFFER, || {
                    format!("bank \"{bank_name}\": INVALID code in ADC output buffer, skipping")
                });
                false
            }
            _ => {
                self.counters.unknown_buffer += 1;
                messages.record(bank_name.as_str(), MSG_UNKNOWN_BUFFER, || {
                    format!("bank \"{bank_name}\": unknown ADC buffer code 0x{kind:x}, skipping")
                });
                false
            }
        }
    }

    fn unpack_data_buffer(
        &mut self,
        buffer: u32,
        bank_name: &BankName,
        messages: &mut DelayedMessageLog,
    ) -> bool {
        let ch = extract(buffer, 16, 5) as usize;
        if ch >= MAX_CHANNELS {
            self.counters.channel_out_of_range += 1;
            messages.record(bank_name.as_str(), MSG_CHANNEL_RANGE, || {
                format!(
                    "bank \"{bank_name}\": ADC channel {ch} >= maximum {MAX_CHANNELS}, dropping buffer"
                )
            });
            return false;
        }
        if extract(buffer, 12, 1) == 1 {
            self.overflow |= 1 << ch;
        }
        if extract(buffer, 13, 1) == 1 {
            self.underflow |= 1 << ch;
        }
        self.data[ch] = extract(buffer, 0, 12) as i32;
        true
    }
}
