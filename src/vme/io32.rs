//! Trigger/timestamp FPGA (IO32) bank decoders.
//!
//! Every participating frame opens with two banks written by the IO32: a
//! fixed nine-word trigger summary, and a variable-length timestamp-counter
//! (TSC4) fifo dump. The frontend writes the summary in this order:
//!
//! ```text
//! 0 - header and version        5 - trigger latency (start - trigger)
//! 1 - event number, from 0      6 - readout elapsed time (end - start)
//! 2 - trigger timestamp         7 - busy elapsed time (end - trigger)
//! 3 - readout start time        8 - trigger latch bitmask
//! 4 - readout end time
//! ```
//!
//! The TSC4 bank carries the firmware revision, a write timestamp, routing,
//! a control word (bit 15 = overflow flag, bits 0-14 = entry count), then
//! `(lower, upper)` word pairs per entry. Bits 0-29 of the lower word are
//! the low 30 bits of the tick count, bits 30-31 the channel tag, and the
//! upper word contributes the next 30 bits.

use crate::bits::extract;
use crate::error::DecodeError;
use crate::midas::banks::BankName;
use crate::midas::frame::RawFrame;
use crate::timebase;
use crate::valid;
use log::warn;

/// Value of the header/version word the frontend writes first.
pub const HEADER_MAGIC: u32 = 0xaaaa_0020;

/// Fixed length of the trigger summary bank, in words.
pub const BANK_WORDS: usize = 9;

/// Firmware revisions whose TSC4 layout matches the decoder.
///
/// Anything else gets a warning, not a decode failure; so far every revision
/// has kept the layout.
pub const KNOWN_TSC_VERSIONS: [u32; 5] = [
    0x0112_0809,
    0x0112_0810,
    0x0112_0910,
    0x0112_1212,
    0x0112_0925,
];

/// Number of TSC4 fifo channels.
pub const TSC_CHANNELS: usize = 4;

/// One TSC4 fifo entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TscEntry {
    /// Channel tag: 0 = trigger, 1 = cross trigger, 2-3 = auxiliary.
    pub channel: u8,
    /// Full composed tick count (`upper << 30 | lower`).
    pub ticks: u64,
    /// Low 30 bits only, as used for trigger timing.
    pub low_ticks: u32,
}

/// Parsed view of a TSC4 bank.
#[derive(Debug, Clone, Copy)]
pub struct TscBank<'a> {
    /// Firmware revision word.
    pub version: u32,
    /// Coarse timestamp at which the bank was written.
    pub write_timestamp: u32,
    /// Routing word.
    pub routing: u32,
    /// Hardware fifo overflow flag from the control word.
    pub overflow: bool,
    entries: &'a [u32],
}

impl<'a> TscBank<'a> {
    /// Parses the four header words and checks the entry count against the
    /// bank length.
    pub fn parse(words: &'a [u32], bank_name: &BankName) -> Result<Self, DecodeError> {
        if words.len() < 4 {
            return Err(DecodeError::BadLength {
                bank: bank_name.to_string(),
                got: words.len(),
                expected: 4,
            });
        }
        let control = words[3];
        let n_entries = extract(control, 0, 15) as usize;
        let expected = 4 + 2 * n_entries;
        if words.len() < expected {
            return Err(DecodeError::BadLength {
                bank: bank_name.to_string(),
                got: words.len(),
                expected,
            });
        }
        Ok(Self {
            version: words[0],
            write_timestamp: words[1],
            routing: words[2],
            overflow: extract(control, 15, 1) == 1,
            entries: &words[4..expected],
        })
    }

    /// Number of fifo entries in the bank.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len() / 2
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Walks the fifo entries in wire order.
    pub fn entries(&self) -> impl Iterator<Item = TscEntry> + 'a {
        self.entries.chunks_exact(2).map(|pair| {
            let (lower, upper) = (pair[0], pair[1]);
            let low_ticks = extract(lower, 0, 30);
            TscEntry {
                channel: extract(lower, 30, 2) as u8,
                ticks: (u64::from(extract(upper, 0, 30)) << 30) | u64::from(low_ticks),
                low_ticks,
            }
        })
    }

    /// Minimum trigger-tag entry, handling the rare multi-entry case.
    #[must_use]
    pub fn trigger_ticks(&self) -> Option<u32> {
        self.entries()
            .filter(|e| e.channel == 0)
            .map(|e| e.low_ticks)
            .min()
    }
}

/// TSC4 fifo contents for one event.
#[derive(Debug, Clone, Default)]
pub struct Tsc4 {
    /// Composed tick values per fifo channel.
    pub fifo: [Vec<u64>; TSC_CHANNELS],
    /// Trigger time in microseconds.
    pub trig_time_us: f64,
}

impl Tsc4 {
    /// Entry counts per fifo channel.
    #[must_use]
    pub fn counts(&self) -> [usize; TSC_CHANNELS] {
        [
            self.fifo[0].len(),
            self.fifo[1].len(),
            self.fifo[2].len(),
            self.fifo[3].len(),
        ]
    }

    fn reset(&mut self) {
        for fifo in &mut self.fifo {
            fifo.clear();
        }
        self.trig_time_us = 0.0;
    }
}

/// Decoded IO32 trigger summary plus TSC4 data.
#[derive(Debug, Clone, Default)]
pub struct Io32 {
    /// Header and version word.
    pub header: u32,
    /// Event number, counting from 0.
    pub trig_count: u32,
    /// Coarse trigger timestamp.
    pub tstamp: u32,
    /// Readout start time.
    pub start: u32,
    /// Readout end time.
    pub end: u32,
    /// Trigger latency (readout start - trigger time).
    pub latency: u32,
    /// Readout elapsed time.
    pub read_time: u32,
    /// Busy elapsed time.
    pub busy_time: u32,
    /// One-hot bitmask naming the signal that generated the trigger.
    pub trigger_latch: u32,
    /// Index of the single set latch bit; `None` when zero or multiple bits
    /// were latched.
    pub which_trigger: Option<u8>,
    /// TSC4 data.
    pub tsc4: Tsc4,
}

impl Io32 {
    #[must_use]
    pub fn new() -> Self {
        let mut io32 = Self::default();
        io32.reset();
        io32
    }

    /// Sets all fields back to no-data defaults, keeping fifo capacity.
    pub fn reset(&mut self) {
        valid::set_no_data(&mut self.header);
        valid::set_no_data(&mut self.trig_count);
        valid::set_no_data(&mut self.tstamp);
        valid::set_no_data(&mut self.start);
        valid::set_no_data(&mut self.end);
        valid::set_no_data(&mut self.latency);
        valid::set_no_data(&mut self.read_time);
        valid::set_no_data(&mut self.busy_time);
        valid::set_no_data(&mut self.trigger_latch);
        self.which_trigger = None;
        self.tsc4.reset();
    }

    /// Unpacks the fixed nine-word trigger summary bank.
    pub fn unpack(&mut self, frame: &RawFrame, bank_name: &BankName) -> Result<(), DecodeError> {
        let bank = frame.find_bank(bank_name).ok_or_else(|| DecodeError::MissingBank {
            bank: bank_name.to_string(),
        })?;
        if bank.word_count() != BANK_WORDS {
            return Err(DecodeError::BadLength {
                bank: bank_name.to_string(),
                got: bank.word_count(),
                expected: BANK_WORDS,
            });
        }
        let mut words = [0u32; BANK_WORDS];
        for (slot, word) in words.iter_mut().zip(bank.u32_words()?) {
            *slot = word;
        }

        self.header = words[0];
        self.trig_count = words[1];
        self.tstamp = words[2];
        self.start = words[3];
        self.end = words[4];
        self.latency = words[5];
        self.read_time = words[6];
        self.busy_time = words[7];
        self.trigger_latch = words[8];

        if self.header != HEADER_MAGIC {
            warn!(
                "bank \"{bank_name}\": IO32 header 0x{:08x} != expected 0x{HEADER_MAGIC:08x} (serial {})",
                self.header,
                frame.serial()
            );
        }
        self.which_trigger = (self.trigger_latch.count_ones() == 1)
            .then(|| self.trigger_latch.trailing_zeros() as u8);
        if self.which_trigger.is_none() {
            warn!(
                "bank \"{bank_name}\": trigger latch 0x{:x} does not have exactly one bit set (serial {})",
                self.trigger_latch,
                frame.serial()
            );
        }
        Ok(())
    }

    /// Unpacks the TSC4 fifo bank.
    ///
    /// Version and overflow warnings are emitted where the frame's trigger
    /// time is first extracted, not here.
    pub fn unpack_tsc(&mut self, frame: &RawFrame, bank_name: &BankName) -> Result<(), DecodeError> {
        let bank = frame.find_bank(bank_name).ok_or_else(|| DecodeError::MissingBank {
            bank: bank_name.to_string(),
        })?;
        let words: Vec<u32> = bank.u32_words()?.collect();
        let tsc = TscBank::parse(&words, bank_name)?;

        self.tsc4.reset();
        for entry in tsc.entries() {
            debug_assert!((entry.channel as usize) < TSC_CHANNELS);
            self.tsc4.fifo[(entry.channel as usize) % TSC_CHANNELS].push(entry.ticks);
        }
        self.tsc4.trig_time_us = tsc
            .trigger_ticks()
            .map_or(0.0, |ticks| timebase::ticks_to_us(f64::from(ticks)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midas::frame::{PayloadBuilder, RawFrame};

    const IO32_BANK: &str = "VTRH";
    const TSC_BANK: &str = "TSCH";

    fn summary_words(trigger_latch: u32) -> [u32; BANK_WORDS] {
        [
            HEADER_MAGIC,
            41,       // trig_count
            123_456,  // tstamp
            123_466,  // start
            123_500,  // end
            10,       // latency
            34,       // read_time
            44,       // busy_time
            trigger_latch,
        ]
    }

    fn frame_with_summary(words: &[u32]) -> RawFrame {
        let payload = PayloadBuilder::new()
            .u32_bank(&BankName::new(IO32_BANK), words)
            .finish();
        RawFrame::new(1, 99, 0, payload)
    }

    #[test]
    fn unpacks_summary_fields() {
        let frame = frame_with_summary(&summary_words(1 << 0));
        let mut io32 = Io32::new();
        io32.unpack(&frame, &BankName::new(IO32_BANK)).unwrap();
        assert_eq!(io32.header, HEADER_MAGIC);
        assert_eq!(io32.trig_count, 41);
        assert_eq!(io32.tstamp, 123_456);
        assert_eq!(io32.start, 123_466);
        assert_eq!(io32.end, 123_500);
        assert_eq!(io32.latency, 10);
        assert_eq!(io32.read_time, 34);
        assert_eq!(io32.busy_time, 44);
        assert_eq!(io32.which_trigger, Some(0));
    }

    #[test]
    fn which_trigger_requires_exactly_one_bit() {
        let mut io32 = Io32::new();
        io32.unpack(
            &frame_with_summary(&summary_words(1 << 1)),
            &BankName::new(IO32_BANK),
        )
        .unwrap();
        assert_eq!(io32.which_trigger, Some(1));

        io32.unpack(
            &frame_with_summary(&summary_words(0b11)),
            &BankName::new(IO32_BANK),
        )
        .unwrap();
        assert_eq!(io32.which_trigger, None);

        io32.unpack(
            &frame_with_summary(&summary_words(0)),
            &BankName::new(IO32_BANK),
        )
        .unwrap();
        assert_eq!(io32.which_trigger, None);
    }

    #[test]
    fn wrong_length_is_rejected() {
        let frame = frame_with_summary(&[HEADER_MAGIC, 1, 2, 3]);
        let mut io32 = Io32::new();
        assert!(matches!(
            io32.unpack(&frame, &BankName::new(IO32_BANK)),
            Err(DecodeError::BadLength { got: 4, expected: BANK_WORDS, .. })
        ));
    }

    #[test]
    fn missing_bank_is_reported() {
        let frame = RawFrame::new(1, 0, 0, PayloadBuilder::new().finish());
        let mut io32 = Io32::new();
        assert!(matches!(
            io32.unpack(&frame, &BankName::new(IO32_BANK)),
            Err(DecodeError::MissingBank { .. })
        ));
    }

    #[test]
    fn reset_restores_sentinels() {
        let mut io32 = Io32::new();
        io32.unpack(
            &frame_with_summary(&summary_words(1)),
            &BankName::new(IO32_BANK),
        )
        .unwrap();
        io32.reset();
        assert!(!valid::is_valid(io32.trig_count));
        assert_eq!(io32.which_trigger, None);
    }

    fn tsc_frame(entries: &[(u8, u64)]) -> RawFrame {
        let control = entries.len() as u32;
        let mut words = vec![KNOWN_TSC_VERSIONS[1], 77, 0, control];
        for &(channel, ticks) in entries {
            words.push((ticks as u32 & 0x3fff_ffff) | (u32::from(channel) << 30));
            words.push((ticks >> 30) as u32);
        }
        let payload = PayloadBuilder::new()
            .u32_bank(&BankName::new(TSC_BANK), &words)
            .finish();
        RawFrame::new(1, 5, 0, payload)
    }

    #[test]
    fn tsc_entries_route_to_fifo_channels() {
        let frame = tsc_frame(&[(0, 2000), (1, 2100), (3, 9_000_000_000), (0, 2400)]);
        let mut io32 = Io32::new();
        io32.unpack_tsc(&frame, &BankName::new(TSC_BANK)).unwrap();
        assert_eq!(io32.tsc4.counts(), [2, 1, 0, 1]);
        assert_eq!(io32.tsc4.fifo[0], vec![2000, 2400]);
        assert_eq!(io32.tsc4.fifo[1], vec![2100]);
        // 60-bit composition survives values beyond the 30-bit field
        assert_eq!(io32.tsc4.fifo[3], vec![9_000_000_000]);
        // trigger time from the earliest trigger-tag entry
        assert!((io32.tsc4.trig_time_us - 100.0).abs() < 1e-9);
    }

    #[test]
    fn short_tsc_bank_is_rejected() {
        let payload = PayloadBuilder::new()
            .u32_bank(&BankName::new(TSC_BANK), &[KNOWN_TSC_VERSIONS[0], 0, 0])
            .finish();
        let frame = RawFrame::new(1, 0, 0, payload);
        let mut io32 = Io32::new();
        assert!(matches!(
            io32.unpack_tsc(&frame, &BankName::new(TSC_BANK)),
            Err(DecodeError::BadLength { .. })
        ));
    }

    #[test]
    fn entry_count_larger_than_bank_is_rejected() {
        // control word promises 3 entries but only one pair follows
        let words = [KNOWN_TSC_VERSIONS[0], 0, 0, 3, 42, 0];
        let payload = PayloadBuilder::new()
            .u32_bank(&BankName::new(TSC_BANK), &words)
            .finish();
        let frame = RawFrame::new(1, 0, 0, payload);
        let mut io32 = Io32::new();
        assert!(matches!(
            io32.unpack_tsc(&frame, &BankName::new(TSC_BANK)),
            Err(DecodeError::BadLength { .. })
        ));
    }
}
