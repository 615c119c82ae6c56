//! Framed events and their payload banks.
//!
//! The upstream framing layer delivers each trigger as one frame: a fixed
//! header plus a payload of named, typed, length-prefixed banks. This module
//! owns the payload walk ([`RawFrame`], [`Banks`]), synthesis of payloads for
//! tests and simulated sources ([`PayloadBuilder`]), and the
//! timestamp-carrying wrapper consumed by the matching queue
//! ([`FramedEvent`]).
//!
//! All multi-byte fields are little-endian; an ingest layer facing a
//! big-endian producer byte-swaps headers and payload before frames reach
//! this module.

use crate::error::DecodeError;
use crate::midas::banks::BankName;
use crate::timebase;
use crate::valid::{self, NoData};
use crate::vme::io32::TscBank;
use chrono::{DateTime, Utc};
use log::warn;

/// Type id for a bank of `u32` words.
pub const TID_DWORD: u16 = 6;
/// Type id for a bank of `f64` values.
pub const TID_DOUBLE: u16 = 10;

const BANK_HEADER_BYTES: usize = 12;

/// Aligns a bank body to the 8-byte framing grid.
const fn padded(len: usize) -> usize {
    (len + 7) & !7
}

/// Fixed header preceding every frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub event_id: u16,
    pub trigger_mask: u16,
    pub serial: u32,
    /// Coarse wall-clock time, seconds since the Unix epoch.
    pub wall_time_s: u32,
    /// Byte length of the payload that follows.
    pub payload_size: u32,
}

/// One frame as delivered by the ingest layer. Immutable once built.
#[derive(Debug, Clone)]
pub struct RawFrame {
    header: FrameHeader,
    payload: Vec<u8>,
}

impl RawFrame {
    #[must_use]
    pub fn new(event_id: u16, serial: u32, wall_time_s: u32, payload: Vec<u8>) -> Self {
        let header = FrameHeader {
            event_id,
            trigger_mask: 0,
            serial,
            wall_time_s,
            payload_size: payload.len() as u32,
        };
        Self { header, payload }
    }

    #[must_use]
    pub fn with_trigger_mask(mut self, trigger_mask: u16) -> Self {
        self.header.trigger_mask = trigger_mask;
        self
    }

    #[must_use]
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    #[must_use]
    pub fn event_id(&self) -> u16 {
        self.header.event_id
    }

    #[must_use]
    pub fn serial(&self) -> u32 {
        self.header.serial
    }

    /// Coarse wall-clock time of the frame, if it parses as a valid instant.
    #[must_use]
    pub fn wall_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::from(self.header.wall_time_s), 0)
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Walks the payload banks in wire order.
    #[must_use]
    pub fn banks(&self) -> Banks<'_> {
        Banks {
            buf: &self.payload,
            offset: 0,
            serial: self.header.serial,
        }
    }

    /// Finds the bank called `name`, if present.
    #[must_use]
    pub fn find_bank(&self, name: &BankName) -> Option<Bank<'_>> {
        self.banks().find(|bank| bank.name == name.bytes())
    }
}

/// Borrowed view of one payload bank.
#[derive(Debug, Clone, Copy)]
pub struct Bank<'a> {
    pub name: [u8; 4],
    pub type_id: u16,
    pub data: &'a [u8],
}

impl<'a> Bank<'a> {
    #[must_use]
    pub fn bank_name(&self) -> BankName {
        BankName::from_bytes(self.name)
    }

    /// Number of whole 32-bit words in the bank body.
    #[must_use]
    pub fn word_count(&self) -> usize {
        self.data.len() / 4
    }

    /// Iterates the bank body as little-endian `u32` words.
    pub fn u32_words(&self) -> Result<impl Iterator<Item = u32> + 'a, DecodeError> {
        if self.type_id != TID_DWORD {
            return Err(DecodeError::BadBankType {
                bank: self.bank_name().to_string(),
                got: self.type_id,
                expected: TID_DWORD,
            });
        }
        if self.data.len() % 4 != 0 {
            return Err(DecodeError::Truncated {
                bank: self.bank_name().to_string(),
                len: self.data.len(),
                width: 4,
            });
        }
        Ok(self
            .data
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
    }

    /// Iterates the bank body as little-endian `f64` values.
    pub fn f64_values(&self) -> Result<impl Iterator<Item = f64> + 'a, DecodeError> {
        if self.type_id != TID_DOUBLE {
            return Err(DecodeError::BadBankType {
                bank: self.bank_name().to_string(),
                got: self.type_id,
                expected: TID_DOUBLE,
            });
        }
        if self.data.len() % 8 != 0 {
            return Err(DecodeError::Truncated {
                bank: self.bank_name().to_string(),
                len: self.data.len(),
                width: 8,
            });
        }
        Ok(self.data.chunks_exact(8).map(|c| {
            f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
        }))
    }
}

/// Iterator over the banks of one frame payload.
///
/// A payload that ends inside a bank header or body is corrupt; the iterator
/// warns once and stops, per the skip-and-log recovery policy.
pub struct Banks<'a> {
    buf: &'a [u8],
    offset: usize,
    serial: u32,
}

impl<'a> Iterator for Banks<'a> {
    type Item = Bank<'a>;

    fn next(&mut self) -> Option<Bank<'a>> {
        if self.offset == self.buf.len() {
            return None;
        }
        if self.offset + BANK_HEADER_BYTES > self.buf.len() {
            warn!(
                "frame payload (serial {}) truncated inside a bank header at offset {}",
                self.serial, self.offset
            );
            self.offset = self.buf.len();
            return None;
        }
        let h = &self.buf[self.offset..self.offset + BANK_HEADER_BYTES];
        let name = [h[0], h[1], h[2], h[3]];
        let type_id = u16::from_le_bytes([h[4], h[5]]);
        let data_len = u32::from_le_bytes([h[8], h[9], h[10], h[11]]) as usize;
        let body_start = self.offset + BANK_HEADER_BYTES;
        if body_start + data_len > self.buf.len() {
            warn!(
                "frame payload (serial {}) truncated inside bank \"{}\" at offset {}",
                self.serial,
                BankName::from_bytes(name),
                self.offset
            );
            self.offset = self.buf.len();
            return None;
        }
        self.offset = padded(body_start + data_len).min(self.buf.len());
        Some(Bank {
            name,
            type_id,
            data: &self.buf[body_start..body_start + data_len],
        })
    }
}

/// Builds frame payloads bank by bank: the writer counterpart of [`Banks`].
///
/// Used by tests and by simulated data sources; the framing it produces is
/// byte-identical to what the walk in [`RawFrame::banks`] consumes.
#[derive(Debug, Default)]
pub struct PayloadBuilder {
    bytes: Vec<u8>,
}

impl PayloadBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a bank of `u32` words.
    #[must_use]
    pub fn u32_bank(mut self, name: &BankName, words: &[u32]) -> Self {
        let mut data = Vec::with_capacity(words.len() * 4);
        for word in words {
            data.extend_from_slice(&word.to_le_bytes());
        }
        self.push_bank(name, TID_DWORD, &data);
        self
    }

    /// Appends a bank of `f64` values.
    #[must_use]
    pub fn f64_bank(mut self, name: &BankName, values: &[f64]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 8);
        for value in values {
            data.extend_from_slice(&value.to_le_bytes());
        }
        self.push_bank(name, TID_DOUBLE, &data);
        self
    }

    fn push_bank(&mut self, name: &BankName, type_id: u16, data: &[u8]) {
        self.bytes.extend_from_slice(&name.bytes());
        self.bytes.extend_from_slice(&type_id.to_le_bytes());
        self.bytes.extend_from_slice(&0u16.to_le_bytes());
        self.bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(data);
        self.bytes.resize(padded(self.bytes.len()), 0);
    }

    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// A raw frame plus the high-resolution trigger time extracted from its
/// timestamp-counter bank.
///
/// Frames that participate in coincidence matching are built with
/// [`FramedEvent::with_trigger`]; scaler and run-transition frames use
/// [`FramedEvent::untimed`] and are never pushed into the queue.
#[derive(Debug, Clone)]
pub struct FramedEvent {
    raw: RawFrame,
    coinc_window_us: f64,
    /// Trigger timestamp in clock ticks (30-bit counter); sentinel when the
    /// frame carries no timestamp.
    clock: u32,
    cross_clock: Vec<u32>,
    trigger_time_us: f64,
}

impl FramedEvent {
    /// Wraps a participating frame, extracting its trigger time from the
    /// TSC bank called `tsc_bank`.
    ///
    /// The trigger time is the minimum over all trigger-tag entries, which
    /// handles the rare case of more than one entry in the fifo.
    pub fn with_trigger(
        raw: RawFrame,
        tsc_bank: &BankName,
        coinc_window_us: f64,
    ) -> Result<Self, DecodeError> {
        let bank = raw.find_bank(tsc_bank).ok_or_else(|| DecodeError::MissingBank {
            bank: tsc_bank.to_string(),
        })?;
        let words: Vec<u32> = bank.u32_words()?.collect();
        let tsc = TscBank::parse(&words, tsc_bank)?;

        if !crate::vme::io32::KNOWN_TSC_VERSIONS.contains(&tsc.version) {
            warn!(
                "unknown TSC version 0x{:x} (id {}, serial {})",
                tsc.version,
                raw.event_id(),
                raw.serial()
            );
        }
        if tsc.overflow {
            warn!(
                "IO32 TSC in overflow condition (id {}, serial {})",
                raw.event_id(),
                raw.serial()
            );
        }

        let mut clock = u32::NO_DATA;
        let mut cross_clock = Vec::new();
        for entry in tsc.entries() {
            debug_assert!(entry.channel < 4);
            match entry.channel {
                0 => clock = clock.min(entry.low_ticks),
                1 => cross_clock.push(entry.low_ticks),
                _ => {}
            }
        }
        if !valid::is_valid(clock) {
            return Err(DecodeError::NoTriggerTime {
                bank: tsc_bank.to_string(),
            });
        }

        Ok(Self {
            raw,
            coinc_window_us,
            clock,
            cross_clock,
            trigger_time_us: timebase::ticks_to_us(f64::from(clock)),
        })
    }

    /// Wraps a non-participating frame; the trigger time is sentinel zero.
    #[must_use]
    pub fn untimed(raw: RawFrame) -> Self {
        Self {
            raw,
            coinc_window_us: 0.0,
            clock: u32::NO_DATA,
            cross_clock: Vec::new(),
            trigger_time_us: 0.0,
        }
    }

    #[must_use]
    pub fn raw(&self) -> &RawFrame {
        &self.raw
    }

    #[must_use]
    pub fn event_id(&self) -> u16 {
        self.raw.event_id()
    }

    #[must_use]
    pub fn serial(&self) -> u32 {
        self.raw.serial()
    }

    /// Trigger timestamp in clock ticks.
    #[must_use]
    pub fn clock(&self) -> u32 {
        self.clock
    }

    /// Cross-trigger timestamps seen by the other stream's input.
    #[must_use]
    pub fn cross_clock(&self) -> &[u32] {
        &self.cross_clock
    }

    /// Trigger time in microseconds since the last counter rollover.
    #[must_use]
    pub fn trigger_time_us(&self) -> f64 {
        self.trigger_time_us
    }

    #[must_use]
    pub fn coinc_window_us(&self) -> f64 {
        self.coinc_window_us
    }

    /// Trigger-time difference `self - other` in microseconds.
    ///
    /// Computed on the clock ticks with a rollover-aware difference, so two
    /// events straddling the 30-bit boundary still yield a small delta.
    #[must_use]
    pub fn time_diff(&self, other: &Self) -> f64 {
        let ticks = timebase::diff_with_rollover(self.clock, other.clock, timebase::TRIGGER_TSC_BITS);
        timebase::ticks_to_us(f64::from(ticks))
    }

    /// True if the two trigger times fall within this event's window.
    #[must_use]
    pub fn is_coincident(&self, other: &Self) -> bool {
        self.time_diff(other).abs() < self.coinc_window_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vme::io32;

    fn tsc_words(ticks: &[(u8, u64)], overflow: bool) -> Vec<u32> {
        let control = (ticks.len() as u32) | (u32::from(overflow) << 15);
        let mut words = vec![io32::KNOWN_TSC_VERSIONS[0], 0xbeef, 0, control];
        for &(channel, tick) in ticks {
            let lower = (tick as u32 & 0x3fff_ffff) | (u32::from(channel) << 30);
            let upper = (tick >> 30) as u32;
            words.push(lower);
            words.push(upper);
        }
        words
    }

    fn timed_frame(event_id: u16, serial: u32, ticks: &[(u8, u64)]) -> RawFrame {
        let payload = PayloadBuilder::new()
            .u32_bank(&BankName::new("TSCH"), &tsc_words(ticks, false))
            .finish();
        RawFrame::new(event_id, serial, 1_500_000_000, payload)
    }

    #[test]
    fn builder_and_walk_round_trip() {
        let name_a = BankName::new("VTRH");
        let name_b = BankName::new("SCLR");
        let payload = PayloadBuilder::new()
            .u32_bank(&name_a, &[1, 2, 3])
            .f64_bank(&name_b, &[0.5, 1.5])
            .finish();
        let frame = RawFrame::new(1, 7, 0, payload.clone());

        let banks: Vec<_> = frame.banks().collect();
        assert_eq!(banks.len(), 2);
        assert_eq!(banks[0].name, *b"VTRH");
        assert_eq!(banks[0].type_id, TID_DWORD);
        assert_eq!(banks[1].name, *b"SCLR");

        let words: Vec<u32> = banks[0].u32_words().unwrap().collect();
        assert_eq!(words, vec![1, 2, 3]);
        let values: Vec<f64> = banks[1].f64_values().unwrap().collect();
        assert_eq!(values, vec![0.5, 1.5]);

        // re-synthesise and compare byte for byte
        let rebuilt = PayloadBuilder::new()
            .u32_bank(&name_a, &words)
            .f64_bank(&name_b, &values)
            .finish();
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn find_bank_by_name() {
        let payload = PayloadBuilder::new()
            .u32_bank(&BankName::new("ADC0"), &[9])
            .u32_bank(&BankName::new("TDC0"), &[8])
            .finish();
        let frame = RawFrame::new(1, 0, 0, payload);
        assert!(frame.find_bank(&BankName::new("TDC0")).is_some());
        assert!(frame.find_bank(&BankName::new("TLQ0")).is_none());
    }

    #[test]
    fn truncated_payload_stops_walk() {
        let mut payload = PayloadBuilder::new()
            .u32_bank(&BankName::new("ADC0"), &[1, 2, 3, 4])
            .finish();
        payload.truncate(payload.len() - 6);
        let frame = RawFrame::new(1, 0, 0, payload);
        assert_eq!(frame.banks().count(), 0);
    }

    #[test]
    fn wrong_type_request_fails() {
        let payload = PayloadBuilder::new()
            .u32_bank(&BankName::new("ADC0"), &[1])
            .finish();
        let frame = RawFrame::new(1, 0, 0, payload);
        let bank = frame.find_bank(&BankName::new("ADC0")).unwrap();
        assert!(matches!(
            bank.f64_values().map(|_| ()),
            Err(DecodeError::BadBankType { .. })
        ));
    }

    #[test]
    fn trigger_time_is_minimum_trigger_tag_entry() {
        let frame = timed_frame(1, 3, &[(0, 2200), (1, 2300), (0, 2000)]);
        let event = FramedEvent::with_trigger(frame, &BankName::new("TSCH"), 10.0).unwrap();
        assert_eq!(event.clock(), 2000);
        assert!((event.trigger_time_us() - 100.0).abs() < 1e-9);
        assert_eq!(event.cross_clock(), &[2300]);
    }

    #[test]
    fn missing_tsc_bank_is_an_error() {
        let frame = RawFrame::new(1, 0, 0, PayloadBuilder::new().finish());
        assert!(matches!(
            FramedEvent::with_trigger(frame, &BankName::new("TSCH"), 10.0),
            Err(DecodeError::MissingBank { .. })
        ));
    }

    #[test]
    fn no_trigger_tag_entry_is_an_error() {
        let frame = timed_frame(1, 0, &[(1, 500), (2, 600)]);
        assert!(matches!(
            FramedEvent::with_trigger(frame, &BankName::new("TSCH"), 10.0),
            Err(DecodeError::NoTriggerTime { .. })
        ));
    }

    #[test]
    fn time_diff_handles_rollover() {
        let a = FramedEvent::with_trigger(
            timed_frame(1, 0, &[(0, (1 << 30) - 10)]),
            &BankName::new("TSCH"),
            10.0,
        )
        .unwrap();
        let b = FramedEvent::with_trigger(
            timed_frame(3, 1, &[(0, 5)]),
            &BankName::new("TSCH"),
            10.0,
        )
        .unwrap();
        assert!((b.time_diff(&a) - 0.75).abs() < 1e-9);
        assert!((a.time_diff(&b) + 0.75).abs() < 1e-9);
        assert!(a.is_coincident(&b));
    }

    #[test]
    fn coincidence_window_is_exclusive() {
        let a = FramedEvent::with_trigger(
            timed_frame(1, 0, &[(0, 2000)]),
            &BankName::new("TSCH"),
            10.0,
        )
        .unwrap();
        let b = FramedEvent::with_trigger(
            timed_frame(3, 1, &[(0, 2200)]),
            &BankName::new("TSCH"),
            10.0,
        )
        .unwrap();
        // exactly 10 us apart: not coincident under a strict window
        assert!(!a.is_coincident(&b));
    }

    #[test]
    fn untimed_frames_have_sentinel_time() {
        let event = FramedEvent::untimed(RawFrame::new(2, 0, 0, Vec::new()));
        assert!((event.trigger_time_us() - 0.0).abs() < f64::EPSILON);
        assert!(!crate::valid::is_valid(event.clock()));
    }
}
