//! Frame routing and run-transition handling.
//!
//! The dispatcher consumes frames in arrival order (the two front-end
//! streams are already multiplexed into one sequence by the framing layer)
//! and routes each by event id: trigger events go through the coincidence
//! queue (or straight to the decoders in singles mode), scaler frames to the
//! per-stream [`Scaler`]s, and run transitions to begin/end-of-run handling.
//! Decoded results are delivered through the [`EventSink`] callbacks, every
//! one of which defaults to a no-op.

use crate::error::DecodeError;
use crate::messages::DelayedMessageLog;
use crate::midas::banks::{self, BankName, EventBanks};
use crate::midas::database::Db;
use crate::midas::frame::{FrameHeader, FramedEvent, RawFrame};
use crate::scaler::Scaler;
use crate::tstamp::{Diagnostics, MatchQueue, MatchSink};
use crate::vme::io32::Io32;
use crate::vme::v1190::V1190;
use crate::vme::v792::V792;
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::warn;
use std::time::Duration;
use strum_macros::Display;

/// Event id of a head (gamma-ray) trigger frame.
pub const HEAD_EVENT: u16 = 1;
/// Event id of a head scaler frame.
pub const HEAD_SCALER: u16 = 2;
/// Event id of a tail (heavy-ion) trigger frame.
pub const TAIL_EVENT: u16 = 3;
/// Event id of a tail scaler frame.
pub const TAIL_SCALER: u16 = 4;
/// Synthetic id under which coincidences are counted in diagnostics.
pub const COINC_EVENT: u16 = 5;
/// Begin-of-run transition frame.
pub const BEGIN_OF_RUN: u16 = 0x8000;
/// End-of-run transition frame.
pub const END_OF_RUN: u16 = 0x8001;

/// Default coincidence window, microseconds.
pub const DEFAULT_COINC_WINDOW_US: f64 = 10.0;
/// Default queue buffering span, seconds.
pub const DEFAULT_QUEUE_SPAN_S: f64 = 4.0;

/// Wall-clock budget for draining the queue at end of run.
const END_OF_RUN_FLUSH: Duration = Duration::from_secs(60);

/// Rate-limit period for repeating decode messages.
const MESSAGE_PERIOD: Duration = Duration::from_secs(10);

/// Delayed-message code for a bank missing from an event payload, keyed by
/// bank name (codes below are used by the per-module decoders).
const MSG_MISSING_BANK: u16 = 32;

/// Which front-end stream produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Stream {
    Head,
    Tail,
}

/// Fully decoded head event: IO32 plus one ADC and one TDC.
#[derive(Debug, Clone)]
pub struct HeadEvent {
    pub header: FrameHeader,
    pub io32: Io32,
    pub adc: V792,
    pub tdc: V1190,
    pub banks: EventBanks<1, 1>,
}

impl Default for HeadEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadEvent {
    #[must_use]
    pub fn new() -> Self {
        Self {
            header: FrameHeader::default(),
            io32: Io32::new(),
            adc: V792::new(),
            tdc: V1190::new(),
            banks: banks::head_defaults(),
        }
    }

    /// Sets all module data back to no-data defaults.
    pub fn reset(&mut self) {
        self.header = FrameHeader::default();
        self.io32.reset();
        self.adc.reset();
        self.tdc.reset();
    }

    /// Reads bank-name overrides from the database.
    pub fn set_variables(&mut self, db: &Db) {
        self.banks.io32 = BankName::from_db(db, "/dragon/head/bank_names/io32", "VTRH");
        self.banks.tsc = BankName::from_db(db, "/dragon/head/bank_names/tsc", "TSCH");
        self.banks.adc[0] = BankName::from_db(db, "/dragon/head/bank_names/adc", "ADC0");
        self.banks.tdc[0] = BankName::from_db(db, "/dragon/head/bank_names/tdc", "TDC0");
    }

    /// Decodes all module banks from the frame.
    ///
    /// The IO32 summary bank is required; converter banks that are absent
    /// are skipped with a rate-limited message.
    pub fn unpack(
        &mut self,
        event: &FramedEvent,
        messages: &mut DelayedMessageLog,
    ) -> Result<(), DecodeError> {
        let frame = event.raw();
        self.header = *frame.header();
        self.io32.unpack(frame, &self.banks.io32)?;
        let result = self.io32.unpack_tsc(frame, &self.banks.tsc);
        tolerate_missing(result, messages)?;
        let result = self.adc.unpack(frame, &self.banks.adc[0], messages).map(|_| ());
        tolerate_missing(result, messages)?;
        let result = self.tdc.unpack(frame, &self.banks.tdc[0], messages).map(|_| ());
        tolerate_missing(result, messages)?;
        Ok(())
    }
}

/// Fully decoded tail event: IO32 plus two ADCs and one TDC.
#[derive(Debug, Clone)]
pub struct TailEvent {
    pub header: FrameHeader,
    pub io32: Io32,
    pub adc: [V792; 2],
    pub tdc: V1190,
    pub banks: EventBanks<2, 1>,
}

impl Default for TailEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl TailEvent {
    #[must_use]
    pub fn new() -> Self {
        Self {
            header: FrameHeader::default(),
            io32: Io32::new(),
            adc: [V792::new(), V792::new()],
            tdc: V1190::new(),
            banks: banks::tail_defaults(),
        }
    }

    pub fn reset(&mut self) {
        self.header = FrameHeader::default();
        self.io32.reset();
        for adc in &mut self.adc {
            adc.reset();
        }
        self.tdc.reset();
    }

    /// Reads bank-name overrides from the database.
    pub fn set_variables(&mut self, db: &Db) {
        self.banks.io32 = BankName::from_db(db, "/dragon/tail/bank_names/io32", "VTRT");
        self.banks.tsc = BankName::from_db(db, "/dragon/tail/bank_names/tsc", "TSCT");
        self.banks.adc[0] = BankName::from_db(db, "/dragon/tail/bank_names/adc0", "TLQ0");
        self.banks.adc[1] = BankName::from_db(db, "/dragon/tail/bank_names/adc1", "TLQ1");
        self.banks.tdc[0] = BankName::from_db(db, "/dragon/tail/bank_names/tdc", "TLT0");
    }

    /// Decodes all module banks from the frame.
    pub fn unpack(
        &mut self,
        event: &FramedEvent,
        messages: &mut DelayedMessageLog,
    ) -> Result<(), DecodeError> {
        let frame = event.raw();
        self.header = *frame.header();
        self.io32.unpack(frame, &self.banks.io32)?;
        let result = self.io32.unpack_tsc(frame, &self.banks.tsc);
        tolerate_missing(result, messages)?;
        for (adc, bank) in self.adc.iter_mut().zip(&self.banks.adc) {
            let result = adc.unpack(frame, bank, messages).map(|_| ());
            tolerate_missing(result, messages)?;
        }
        let result = self.tdc.unpack(frame, &self.banks.tdc[0], messages).map(|_| ());
        tolerate_missing(result, messages)?;
        Ok(())
    }
}

/// Run-level bookkeeping read from the database at run transitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunParameters {
    pub run_number: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
}

impl RunParameters {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Re-reads all fields from the database.
    pub fn read(&mut self, db: &Db) {
        self.run_number = db.read_value("/runinfo/run_number");
        self.start_time = db
            .read_value::<i64>("/runinfo/start_time_binary")
            .and_then(|s| DateTime::from_timestamp(s, 0));
        self.stop_time = db
            .read_value::<i64>("/runinfo/stop_time_binary")
            .and_then(|s| DateTime::from_timestamp(s, 0));
    }
}

/// Downstream consumer callbacks.
///
/// Every method defaults to a no-op so tests and partial consumers
/// implement only what they observe.
pub trait EventSink {
    /// One fully decoded head singles event.
    fn on_head(&mut self, _event: &HeadEvent) {}

    /// One fully decoded tail singles event.
    fn on_tail(&mut self, _event: &TailEvent) {}

    /// A coincidence pair; `delta_us` is the head-minus-tail trigger-time
    /// difference. Delivered before the singles callbacks that retire the
    /// two members.
    fn on_coincidence(&mut self, _head: &HeadEvent, _tail: &TailEvent, _delta_us: f64) {}

    /// Updated scaler readings for one stream.
    fn on_scaler(&mut self, _stream: Stream, _scaler: &Scaler) {}

    /// Begin-of-run, after per-run state was reset and variables re-read.
    fn on_run_start(&mut self, _db: &Db) {}

    /// End-of-run, after the queue was drained.
    fn on_run_stop(&mut self, _db: &Db) {}

    /// Queue diagnostics snapshot, after each push or flush step.
    fn on_diagnostics(&mut self, _diagnostics: &Diagnostics) {}
}

fn tolerate_missing(
    result: Result<(), DecodeError>,
    messages: &mut DelayedMessageLog,
) -> Result<(), DecodeError> {
    match result {
        Err(DecodeError::MissingBank { bank }) => {
            messages.record(&bank, MSG_MISSING_BANK, || {
                format!("bank \"{bank}\" not found in event payload, skipping")
            });
            Ok(())
        }
        other => other,
    }
}

/// Routes frames to decoders and the matching queue.
pub struct Dispatcher<S: EventSink> {
    sink: S,
    db: Db,
    head: HeadEvent,
    tail: TailEvent,
    head_scaler: Scaler,
    tail_scaler: Scaler,
    run_parameters: RunParameters,
    diagnostics: Diagnostics,
    messages: DelayedMessageLog,
    queue: Option<MatchQueue>,
    coinc_window_us: f64,
    queue_span_us: f64,
}

impl<S: EventSink> Dispatcher<S> {
    /// Builds a dispatcher around a configuration database and a sink.
    ///
    /// With `singles_mode` set, trigger events are decoded immediately and
    /// no queue is constructed; otherwise events buffer in a [`MatchQueue`]
    /// sized from the database (or the wired defaults).
    #[must_use]
    pub fn new(db: Db, sink: S, singles_mode: bool) -> Self {
        let mut dispatcher = Self {
            sink,
            db,
            head: HeadEvent::new(),
            tail: TailEvent::new(),
            head_scaler: Scaler::new("head"),
            tail_scaler: Scaler::new("tail"),
            run_parameters: RunParameters::default(),
            diagnostics: Diagnostics::new(),
            messages: DelayedMessageLog::new(MESSAGE_PERIOD),
            queue: None,
            coinc_window_us: DEFAULT_COINC_WINDOW_US,
            queue_span_us: DEFAULT_QUEUE_SPAN_S * 1e6,
        };
        dispatcher.read_variables();
        if !singles_mode {
            dispatcher.queue = Some(MatchQueue::new(dispatcher.queue_span_us));
        }
        dispatcher
    }

    #[must_use]
    pub fn is_singles_mode(&self) -> bool {
        self.queue.is_none()
    }

    /// Coincidence window in microseconds.
    #[must_use]
    pub fn coinc_window_us(&self) -> f64 {
        self.coinc_window_us
    }

    /// Takes effect from the next pushed event.
    pub fn set_coinc_window_us(&mut self, window_us: f64) {
        self.coinc_window_us = window_us;
    }

    /// Queue buffering span in seconds.
    #[must_use]
    pub fn queue_span_s(&self) -> f64 {
        self.queue_span_us / 1e6
    }

    pub fn set_queue_span_s(&mut self, span_s: f64) {
        self.queue_span_us = span_s * 1e6;
        if let Some(queue) = &mut self.queue {
            queue.set_span_us(self.queue_span_us);
        }
    }

    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.queue.as_ref().map_or(0, MatchQueue::size)
    }

    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    #[must_use]
    pub fn run_parameters(&self) -> &RunParameters {
        &self.run_parameters
    }

    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Consumes the dispatcher, handing back the sink.
    #[must_use]
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Pulls frames from an iterator until it ends.
    ///
    /// The queue is not drained on return; follow with [`Dispatcher::flush_queue`]
    /// (or a run-stop frame) when the stream is complete.
    pub fn run<I>(&mut self, frames: I) -> Result<()>
    where
        I: IntoIterator<Item = RawFrame>,
    {
        for frame in frames {
            self.process(frame)?;
        }
        Ok(())
    }

    /// Handles one frame.
    ///
    /// The only fatal error is the queue's double insertion failure; every
    /// decode problem is logged and recovered per frame.
    pub fn process(&mut self, frame: RawFrame) -> Result<()> {
        match frame.event_id() {
            HEAD_EVENT => self.process_trigger(frame, Stream::Head),
            TAIL_EVENT => self.process_trigger(frame, Stream::Tail),
            HEAD_SCALER => {
                self.process_scaler(&frame, Stream::Head);
                Ok(())
            }
            TAIL_SCALER => {
                self.process_scaler(&frame, Stream::Tail);
                Ok(())
            }
            BEGIN_OF_RUN => {
                self.begin_run();
                Ok(())
            }
            END_OF_RUN => {
                self.end_run();
                Ok(())
            }
            id => {
                self.messages.record("dispatch", id, || {
                    format!("unknown event id {id}, dropping frame")
                });
                Ok(())
            }
        }
    }

    /// Switches to singles mode, draining the queue first.
    ///
    /// `flush_time` bounds the drain as in [`MatchQueue::flush`]; a zero
    /// duration skips the drain and drops whatever is queued.
    pub fn set_singles_mode(&mut self, flush_time: Option<Duration>) {
        match flush_time {
            Some(limit) if limit.is_zero() => {}
            other => self.flush_queue(other),
        }
        self.queue = None;
    }

    /// Switches back to coincidence mode with the configured span; no-op if
    /// a queue already exists.
    pub fn set_coinc_mode(&mut self) {
        if self.queue.is_none() {
            self.queue = Some(MatchQueue::new(self.queue_span_us));
        }
    }

    /// Drains the queue; `max_time` as in [`MatchQueue::flush`].
    pub fn flush_queue(&mut self, max_time: Option<Duration>) {
        let Some(mut queue) = self.queue.take() else {
            return;
        };
        let mut diagnostics = std::mem::take(&mut self.diagnostics);
        queue.flush(
            max_time,
            &mut QueueAdapter { dispatcher: self },
            Some(&mut diagnostics),
        );
        self.diagnostics = diagnostics;
        self.queue = Some(queue);
    }

    /// Pops at most one queued event; returns the queue size seen before.
    pub fn flush_queue_one(&mut self) -> usize {
        let Some(mut queue) = self.queue.take() else {
            return 0;
        };
        let mut diagnostics = std::mem::take(&mut self.diagnostics);
        let size = queue.flush_one(&mut QueueAdapter { dispatcher: self }, Some(&mut diagnostics));
        self.diagnostics = diagnostics;
        self.queue = Some(queue);
        size
    }

    /// Flushes pending rate-limited messages; call at normal termination.
    pub fn flush_messages(&mut self) {
        self.messages.flush();
    }

    fn process_trigger(&mut self, frame: RawFrame, stream: Stream) -> Result<()> {
        if self.queue.is_none() {
            let event = FramedEvent::untimed(frame);
            self.unpack_singles(&event, stream);
            return Ok(());
        }
        let tsc_bank = match stream {
            Stream::Head => self.head.banks.tsc,
            Stream::Tail => self.tail.banks.tsc,
        };
        let serial = frame.serial();
        match FramedEvent::with_trigger(frame, &tsc_bank, self.coinc_window_us) {
            Ok(event) => self.push_to_queue(event),
            Err(e) => {
                warn!("{stream} event (serial {serial}): cannot extract trigger time: {e}; skipping frame");
                Ok(())
            }
        }
    }

    fn push_to_queue(&mut self, event: FramedEvent) -> Result<()> {
        let Some(mut queue) = self.queue.take() else {
            return Ok(());
        };
        let mut diagnostics = std::mem::take(&mut self.diagnostics);
        let result = queue.push(
            event,
            &mut QueueAdapter { dispatcher: self },
            Some(&mut diagnostics),
        );
        self.diagnostics = diagnostics;
        self.queue = Some(queue);
        result
    }

    fn unpack_singles(&mut self, event: &FramedEvent, stream: Stream) {
        match stream {
            Stream::Head => {
                self.head.reset();
                if let Err(e) = self.head.unpack(event, &mut self.messages) {
                    warn!(
                        "head event (serial {}): {e}; delivering with no-data contents",
                        event.serial()
                    );
                }
                self.sink.on_head(&self.head);
            }
            Stream::Tail => {
                self.tail.reset();
                if let Err(e) = self.tail.unpack(event, &mut self.messages) {
                    warn!(
                        "tail event (serial {}): {e}; delivering with no-data contents",
                        event.serial()
                    );
                }
                self.sink.on_tail(&self.tail);
            }
        }
    }

    fn process_scaler(&mut self, frame: &RawFrame, stream: Stream) {
        let scaler = match stream {
            Stream::Head => &mut self.head_scaler,
            Stream::Tail => &mut self.tail_scaler,
        };
        if let Err(e) = scaler.unpack(frame) {
            warn!("{stream} scaler (serial {}): {e}", frame.serial());
        }
        let scaler = match stream {
            Stream::Head => &self.head_scaler,
            Stream::Tail => &self.tail_scaler,
        };
        self.sink.on_scaler(stream, scaler);
    }

    fn begin_run(&mut self) {
        self.head_scaler.reset();
        self.tail_scaler.reset();
        self.diagnostics.reset();
        self.run_parameters.reset();
        self.read_variables();
        self.run_parameters.read(&self.db);
        self.sink.on_run_start(&self.db);
    }

    fn end_run(&mut self) {
        self.run_parameters.read(&self.db);
        self.flush_queue(Some(END_OF_RUN_FLUSH));
        self.messages.flush();
        self.sink.on_run_stop(&self.db);
    }

    fn read_variables(&mut self) {
        if let Some(window) = self.db.read_value::<f64>("/dragon/coinc/variables/window") {
            self.coinc_window_us = window;
        }
        if let Some(span_s) = self.db.read_value::<f64>("/dragon/coinc/variables/buffer_time") {
            self.queue_span_us = span_s * 1e6;
        }
        if let Some(queue) = &mut self.queue {
            queue.set_span_us(self.queue_span_us);
        }
        self.head.set_variables(&self.db);
        self.tail.set_variables(&self.db);
        self.head_scaler.set_variables(&self.db);
        self.tail_scaler.set_variables(&self.db);
    }
}

/// Adapts queue callbacks onto the dispatcher's decoders and sink.
struct QueueAdapter<'a, S: EventSink> {
    dispatcher: &'a mut Dispatcher<S>,
}

impl<S: EventSink> MatchSink for QueueAdapter<'_, S> {
    fn on_single(&mut self, event: &FramedEvent) {
        match event.event_id() {
            HEAD_EVENT => self.dispatcher.unpack_singles(event, Stream::Head),
            TAIL_EVENT => self.dispatcher.unpack_singles(event, Stream::Tail),
            id => warn!("unknown event id {id} retired from queue, skipping"),
        }
    }

    fn on_coinc(&mut self, earlier: &FramedEvent, later: &FramedEvent) {
        let dispatcher = &mut *self.dispatcher;
        let (head, tail) = match (earlier.event_id(), later.event_id()) {
            (HEAD_EVENT, TAIL_EVENT) => (earlier, later),
            (TAIL_EVENT, HEAD_EVENT) => (later, earlier),
            (first, second) => {
                warn!(
                    "cannot pair events with ids {first} and {second} (serials {}, {}, \
                     time diff {:.3} us); skipping coincidence",
                    earlier.serial(),
                    later.serial(),
                    earlier.time_diff(later)
                );
                return;
            }
        };
        dispatcher.head.reset();
        if let Err(e) = dispatcher.head.unpack(head, &mut dispatcher.messages) {
            warn!(
                "head member of coincidence (serial {}): {e}; delivering with no-data contents",
                head.serial()
            );
        }
        dispatcher.tail.reset();
        if let Err(e) = dispatcher.tail.unpack(tail, &mut dispatcher.messages) {
            warn!(
                "tail member of coincidence (serial {}): {e}; delivering with no-data contents",
                tail.serial()
            );
        }
        let delta_us = head.time_diff(tail);
        dispatcher
            .sink
            .on_coincidence(&dispatcher.head, &dispatcher.tail, delta_us);
    }

    fn on_diagnostics(&mut self, diagnostics: &Diagnostics) {
        self.dispatcher.sink.on_diagnostics(diagnostics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midas::frame::PayloadBuilder;
    use crate::vme::io32::{self, KNOWN_TSC_VERSIONS};
    use crate::vme::{v1190, v792};

    /// Builds the nine-word IO32 summary with a plausible latch.
    fn io32_words(trig_count: u32) -> [u32; io32::BANK_WORDS] {
        [io32::HEADER_MAGIC, trig_count, 0, 10, 44, 10, 34, 44, 1]
    }

    fn tsc_words(ticks: u32) -> [u32; 6] {
        [KNOWN_TSC_VERSIONS[0], 0, 0, 1, ticks & 0x3fff_ffff, 0]
    }

    fn adc_data(ch: u32, value: u32) -> u32 {
        (v792::DATA_BITS << 24) | (ch << 16) | value
    }

    fn tdc_measurement(ch: u32, value: u32) -> u32 {
        (v1190::TDC_MEASUREMENT << 27) | (ch << 19) | value
    }

    /// A complete head frame: IO32, TSC, ADC, TDC banks.
    fn head_frame(serial: u32, ticks: u32, adc_value: u32) -> RawFrame {
        let payload = PayloadBuilder::new()
            .u32_bank(&BankName::new("VTRH"), &io32_words(serial))
            .u32_bank(&BankName::new("TSCH"), &tsc_words(ticks))
            .u32_bank(&BankName::new("ADC0"), &[adc_data(0, adc_value)])
            .u32_bank(&BankName::new("TDC0"), &[tdc_measurement(2, 777)])
            .finish();
        RawFrame::new(HEAD_EVENT, serial, 1_600_000_000, payload)
    }

    /// A complete tail frame: IO32, TSC, two ADCs, TDC banks.
    fn tail_frame(serial: u32, ticks: u32, adc_value: u32) -> RawFrame {
        let payload = PayloadBuilder::new()
            .u32_bank(&BankName::new("VTRT"), &io32_words(serial))
            .u32_bank(&BankName::new("TSCT"), &tsc_words(ticks))
            .u32_bank(&BankName::new("TLQ0"), &[adc_data(1, adc_value)])
            .u32_bank(&BankName::new("TLQ1"), &[adc_data(1, adc_value + 1)])
            .u32_bank(&BankName::new("TLT0"), &[tdc_measurement(3, 888)])
            .finish();
        RawFrame::new(TAIL_EVENT, serial, 1_600_000_000, payload)
    }

    fn scaler_frame(event_id: u16, counts: &[u32]) -> RawFrame {
        let payload = PayloadBuilder::new()
            .u32_bank(&BankName::new("SCLD"), counts)
            .finish();
        RawFrame::new(event_id, 0, 1_600_000_000, payload)
    }

    #[derive(Default)]
    struct Recorder {
        heads: Vec<u32>,
        tails: Vec<u32>,
        coincs: Vec<(u32, u32, f64)>,
        scalers: Vec<(Stream, u32)>,
        run_starts: usize,
        run_stops: usize,
        adc_values: Vec<Option<i32>>,
    }

    impl EventSink for Recorder {
        fn on_head(&mut self, event: &HeadEvent) {
            self.heads.push(event.header.serial);
            self.adc_values.push(event.adc.get_data(0));
        }
        fn on_tail(&mut self, event: &TailEvent) {
            self.tails.push(event.header.serial);
        }
        fn on_coincidence(&mut self, head: &HeadEvent, tail: &TailEvent, delta_us: f64) {
            self.coincs
                .push((head.header.serial, tail.header.serial, delta_us));
        }
        fn on_scaler(&mut self, stream: Stream, scaler: &Scaler) {
            self.scalers.push((stream, scaler.count[0]));
        }
        fn on_run_start(&mut self, _db: &Db) {
            self.run_starts += 1;
        }
        fn on_run_stop(&mut self, _db: &Db) {
            self.run_stops += 1;
        }
    }

    fn dispatcher(singles_mode: bool) -> Dispatcher<Recorder> {
        Dispatcher::new(Db::empty(), Recorder::default(), singles_mode)
    }

    #[test]
    fn coincident_pair_end_to_end() {
        // head at 100.0 us, tail at 105.0 us; window 10 us
        let mut dispatcher = dispatcher(false);
        dispatcher.process(head_frame(0, 2000, 451)).unwrap();
        dispatcher.process(tail_frame(1, 2100, 900)).unwrap();
        dispatcher.flush_queue(None);

        let sink = dispatcher.sink();
        assert_eq!(sink.coincs.len(), 1);
        let (head_serial, tail_serial, delta) = sink.coincs[0];
        assert_eq!((head_serial, tail_serial), (0, 1));
        assert!((delta + 5.0).abs() < 1e-9);
        assert_eq!(sink.heads, vec![0]);
        assert_eq!(sink.tails, vec![1]);
        assert_eq!(sink.adc_values, vec![Some(451)]);
        assert_eq!(dispatcher.diagnostics().n_coinc, 1);
        assert_eq!(dispatcher.diagnostics().n_singles[HEAD_EVENT as usize], 1);
        assert_eq!(dispatcher.diagnostics().n_singles[TAIL_EVENT as usize], 1);
    }

    #[test]
    fn separated_events_are_singles_only() {
        // 100.0 us and 111.0 us straddle the window
        let mut dispatcher = dispatcher(false);
        dispatcher.process(head_frame(0, 2000, 1)).unwrap();
        dispatcher.process(tail_frame(1, 2220, 2)).unwrap();
        dispatcher.flush_queue(None);

        let sink = dispatcher.sink();
        assert!(sink.coincs.is_empty());
        assert_eq!(sink.heads, vec![0]);
        assert_eq!(sink.tails, vec![1]);
    }

    #[test]
    fn singles_mode_decodes_immediately() {
        let mut dispatcher = dispatcher(true);
        assert!(dispatcher.is_singles_mode());
        dispatcher.process(head_frame(7, 2000, 123)).unwrap();
        assert_eq!(dispatcher.sink().heads, vec![7]);
        assert_eq!(dispatcher.sink().adc_values, vec![Some(123)]);
        assert_eq!(dispatcher.queue_size(), 0);
    }

    #[test]
    fn scaler_frames_route_by_stream() {
        let mut dispatcher = dispatcher(false);
        dispatcher.process(scaler_frame(HEAD_SCALER, &[5])).unwrap();
        dispatcher.process(scaler_frame(TAIL_SCALER, &[8])).unwrap();
        let sink = dispatcher.sink();
        assert_eq!(sink.scalers, vec![(Stream::Head, 5), (Stream::Tail, 8)]);
    }

    #[test]
    fn unknown_event_id_is_dropped() {
        let mut dispatcher = dispatcher(false);
        dispatcher
            .process(RawFrame::new(42, 0, 0, PayloadBuilder::new().finish()))
            .unwrap();
        let sink = dispatcher.sink();
        assert!(sink.heads.is_empty() && sink.tails.is_empty() && sink.scalers.is_empty());
    }

    #[test]
    fn begin_of_run_resets_and_reports() {
        let mut dispatcher = dispatcher(false);
        dispatcher.process(head_frame(0, 2000, 1)).unwrap();
        dispatcher.process(scaler_frame(HEAD_SCALER, &[5])).unwrap();
        dispatcher
            .process(RawFrame::new(BEGIN_OF_RUN, 1, 0, PayloadBuilder::new().finish()))
            .unwrap();
        assert_eq!(dispatcher.sink().run_starts, 1);
        assert_eq!(dispatcher.diagnostics().size, 0);
        assert_eq!(dispatcher.diagnostics().n_singles, [0; Diagnostics::MAX_TYPES]);
    }

    #[test]
    fn end_of_run_flushes_queue_and_reports() {
        let mut dispatcher = dispatcher(false);
        dispatcher.process(head_frame(0, 2000, 1)).unwrap();
        dispatcher.process(tail_frame(1, 2100, 2)).unwrap();
        dispatcher
            .process(RawFrame::new(END_OF_RUN, 2, 0, PayloadBuilder::new().finish()))
            .unwrap();
        let sink = dispatcher.sink();
        assert_eq!(sink.run_stops, 1);
        assert_eq!(sink.coincs.len(), 1);
        assert_eq!(sink.heads.len(), 1);
        assert_eq!(sink.tails.len(), 1);
        assert_eq!(dispatcher.queue_size(), 0);
    }

    #[test]
    fn window_and_span_come_from_the_database() {
        let db = Db::from_json(
            r#"{"dragon":{"coinc":{"variables":{"window": 2.0, "buffer_time": 1}}}}"#,
        )
        .unwrap();
        let mut dispatcher = Dispatcher::new(db, Recorder::default(), false);
        assert!((dispatcher.coinc_window_us() - 2.0).abs() < f64::EPSILON);
        assert!((dispatcher.queue_span_s() - 1.0).abs() < f64::EPSILON);

        // 100.0 us and 105.0 us are no longer coincident under a 2 us window
        dispatcher.process(head_frame(0, 2000, 1)).unwrap();
        dispatcher.process(tail_frame(1, 2100, 2)).unwrap();
        dispatcher.flush_queue(None);
        assert!(dispatcher.sink().coincs.is_empty());
    }

    #[test]
    fn bank_name_overrides_come_from_the_database() {
        let db = Db::from_json(
            r#"{"dragon":{"head":{"bank_names":{"adc": "QQQ0"}}}}"#,
        )
        .unwrap();
        let mut dispatcher = Dispatcher::new(db, Recorder::default(), true);
        // frame written with the overridden ADC bank name
        let payload = PayloadBuilder::new()
            .u32_bank(&BankName::new("VTRH"), &io32_words(0))
            .u32_bank(&BankName::new("TSCH"), &tsc_words(2000))
            .u32_bank(&BankName::new("QQQ0"), &[adc_data(0, 321)])
            .finish();
        dispatcher
            .process(RawFrame::new(HEAD_EVENT, 0, 0, payload))
            .unwrap();
        assert_eq!(dispatcher.sink().adc_values, vec![Some(321)]);
    }

    #[test]
    fn decoder_failure_still_delivers_sentinel_content() {
        // IO32 bank with the wrong length: frame is delivered, fields no-data
        let payload = PayloadBuilder::new()
            .u32_bank(&BankName::new("VTRH"), &[1, 2, 3])
            .u32_bank(&BankName::new("TSCH"), &tsc_words(2000))
            .finish();
        let mut dispatcher = dispatcher(false);
        dispatcher
            .process(RawFrame::new(HEAD_EVENT, 5, 0, payload))
            .unwrap();
        dispatcher.flush_queue(None);
        let sink = dispatcher.sink();
        assert_eq!(sink.heads, vec![5]);
        assert_eq!(sink.adc_values, vec![None]);
    }

    #[test]
    fn frame_without_timestamp_is_skipped_in_coinc_mode() {
        let payload = PayloadBuilder::new()
            .u32_bank(&BankName::new("VTRH"), &io32_words(0))
            .finish();
        let mut dispatcher = dispatcher(false);
        dispatcher
            .process(RawFrame::new(HEAD_EVENT, 0, 0, payload))
            .unwrap();
        assert_eq!(dispatcher.queue_size(), 0);
        assert!(dispatcher.sink().heads.is_empty());
    }

    #[test]
    fn set_singles_mode_with_zero_budget_drops_the_queue() {
        let mut dispatcher = dispatcher(false);
        dispatcher.process(head_frame(0, 2000, 1)).unwrap();
        dispatcher.set_singles_mode(Some(Duration::ZERO));
        assert!(dispatcher.is_singles_mode());
        assert!(dispatcher.sink().heads.is_empty());

        dispatcher.set_coinc_mode();
        assert!(!dispatcher.is_singles_mode());
    }

    #[test]
    fn flush_queue_one_steps_through_the_backlog() {
        let mut dispatcher = dispatcher(false);
        dispatcher.process(head_frame(0, 2000, 1)).unwrap();
        dispatcher.process(tail_frame(1, 40_000, 2)).unwrap();
        assert_eq!(dispatcher.flush_queue_one(), 2);
        assert_eq!(dispatcher.flush_queue_one(), 1);
        assert_eq!(dispatcher.flush_queue_one(), 0);
        let sink = dispatcher.sink();
        assert_eq!(sink.heads.len(), 1);
        assert_eq!(sink.tails.len(), 1);
    }

    #[test]
    fn singles_multiset_matches_pushed_frames() {
        let mut dispatcher = dispatcher(false);
        let mut expected = Vec::new();
        for i in 0..50 {
            // alternate streams, 50 us apart
            if i % 2 == 0 {
                dispatcher.process(head_frame(i, 2000 + 1000 * i, 1)).unwrap();
            } else {
                dispatcher.process(tail_frame(i, 2000 + 1000 * i, 1)).unwrap();
            }
            expected.push(i);
        }
        dispatcher.flush_queue(None);
        let sink = dispatcher.sink();
        let mut emitted: Vec<u32> = sink.heads.iter().chain(sink.tails.iter()).copied().collect();
        emitted.sort_unstable();
        assert_eq!(emitted, expected);
    }

    #[test]
    fn run_loop_consumes_an_iterator() {
        let frames = vec![
            head_frame(0, 2000, 1),
            tail_frame(1, 2100, 2),
            RawFrame::new(END_OF_RUN, 2, 0, PayloadBuilder::new().finish()),
        ];
        let mut dispatcher = dispatcher(false);
        dispatcher.run(frames).unwrap();
        assert_eq!(dispatcher.sink().coincs.len(), 1);
        assert_eq!(dispatcher.sink().run_stops, 1);
    }
}
