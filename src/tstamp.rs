//! Trigger-timestamp coincidence matching.
//!
//! Events from the two front-end streams arrive multiplexed into a single
//! sequence, but not necessarily in trigger-time order across streams. The
//! [`MatchQueue`] buffers events long enough to guarantee that any possible
//! coincidence partner has arrived, then retires them oldest first: partners
//! within the coincidence window are reported as pairs, after which the
//! retired event is reported as a singles event.
//!
//! The container is a `VecDeque` kept sorted on trigger time, with an
//! explicit forward scan for coincidences at pop time. This is O(k) per pop
//! for a group of k partners and keeps the ordering predicate a plain `f64`
//! comparison; an associative container indexed by the window-equivalence
//! predicate was measured to gain nothing at our rates and has much subtler
//! semantics near the window boundary.

use crate::midas::frame::FramedEvent;
use anyhow::{Context, Result};
use log::error;
use log::warn;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Receives events retired from a [`MatchQueue`].
pub trait MatchSink {
    /// Called once for every event leaving the queue, in trigger-time order.
    fn on_single(&mut self, event: &FramedEvent);

    /// Called for each coincidence pair, always before the `on_single` that
    /// retires `earlier`.
    fn on_coinc(&mut self, earlier: &FramedEvent, later: &FramedEvent);

    /// Called with updated diagnostics after each push or flush step.
    fn on_diagnostics(&mut self, _diagnostics: &Diagnostics) {}
}

/// Counters describing queue behavior over a run.
///
/// Updated at the end of every push, so whatever a push caused (a new
/// coincidence match, singles processed) is already reflected when the
/// snapshot is delivered. Flushes update it too, with `time_diff` pinned to
/// zero since no new event is incoming.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostics {
    /// Queue size after the most recent operation.
    pub size: usize,
    /// Total coincidence pairs emitted.
    pub n_coinc: u64,
    /// Coincidence rate since the first event, 1/s.
    pub coinc_rate: f64,
    /// Singles emitted, indexed by event id.
    pub n_singles: [u64; Self::MAX_TYPES],
    /// Singles rates since the first event, 1/s.
    pub singles_rate: [f64; Self::MAX_TYPES],
    /// Trigger-time gap between the last pushed event and the queue front,
    /// in microseconds. Tells how close the queue runs to its span.
    pub time_diff: f64,
    time0: Option<u32>,
}

impl Diagnostics {
    /// Number of event ids tracked individually.
    pub const MAX_TYPES: usize = 10;

    #[must_use]
    pub fn new() -> Self {
        Self {
            size: 0,
            n_coinc: 0,
            coinc_rate: 0.0,
            n_singles: [0; Self::MAX_TYPES],
            singles_rate: [0.0; Self::MAX_TYPES],
            time_diff: 0.0,
            time0: None,
        }
    }

    /// Back to begin-of-run values.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Wall-clock seconds between the first event of the run and
    /// `wall_time_s`; zero before any event was seen.
    #[must_use]
    pub fn elapsed_s(&self, wall_time_s: u32) -> u32 {
        self.time0.map_or(0, |t| wall_time_s.saturating_sub(t))
    }

    fn update(
        &mut self,
        size: usize,
        time_diff: f64,
        have_coinc: bool,
        singles_id: Option<u16>,
        wall_time_s: u32,
    ) {
        self.size = size;
        self.time_diff = time_diff;
        if have_coinc {
            self.n_coinc += 1;
        }
        if let Some(id) = singles_id {
            if (id as usize) < Self::MAX_TYPES {
                self.n_singles[id as usize] += 1;
            } else {
                warn!(
                    "singles event id {id} exceeds the diagnostics range ({})",
                    Self::MAX_TYPES
                );
            }
        }

        let time0 = *self.time0.get_or_insert(wall_time_s);
        let elapsed = wall_time_s.saturating_sub(time0);
        if elapsed > 0 {
            let dt = f64::from(elapsed);
            self.coinc_rate = self.n_coinc as f64 / dt;
            for (rate, n) in self.singles_rate.iter_mut().zip(self.n_singles) {
                *rate = n as f64 / dt;
            }
        } else {
            self.coinc_rate = 0.0;
            self.singles_rate = [0.0; Self::MAX_TYPES];
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct Entry {
    event: FramedEvent,
    /// Insertion sequence number, unique over the queue's lifetime.
    seq: u64,
    /// Sequence numbers of co-members of a group this event was already
    /// reported in. Such pairs were consumed when the group's earliest
    /// member retired and must not be reported again; partners outside the
    /// group are still fair game when this event reaches the front.
    grouped_with: Vec<u64>,
}

/// Time-ordered buffer matching coincidences across the two streams.
///
/// Insertion keeps the deque sorted on trigger time (ties keep arrival
/// order). After each push the front is retired until the queue's time
/// extent fits back inside the configured span, so memory stays bounded by
/// `stream rate x span`.
#[derive(Debug)]
pub struct MatchQueue {
    span_us: f64,
    events: VecDeque<Entry>,
    next_seq: u64,
}

impl MatchQueue {
    /// `span_us` should cover any possible timestamp overlap between the
    /// streams without holding an unbounded backlog.
    #[must_use]
    pub fn new(span_us: f64) -> Self {
        Self {
            span_us,
            events: VecDeque::new(),
            next_seq: 0,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Trigger-time difference between the newest and oldest queued event,
    /// in microseconds.
    #[must_use]
    pub fn time_extent_us(&self) -> f64 {
        match (self.events.back(), self.events.front()) {
            (Some(back), Some(front)) => {
                back.event.trigger_time_us() - front.event.trigger_time_us()
            }
            _ => 0.0,
        }
    }

    #[must_use]
    pub fn span_us(&self) -> f64 {
        self.span_us
    }

    /// Takes effect from the next push.
    pub fn set_span_us(&mut self, span_us: f64) {
        self.span_us = span_us;
    }

    /// Inserts `event`, then retires the front until the extent fits the
    /// span again.
    ///
    /// If the container cannot grow, the queue is flushed completely (which
    /// loses any coincidence the flushed events might have formed with later
    /// arrivals), the insertion is retried once, and a second failure is
    /// returned as fatal.
    pub fn push(
        &mut self,
        event: FramedEvent,
        sink: &mut dyn MatchSink,
        mut diagnostics: Option<&mut Diagnostics>,
    ) -> Result<()> {
        if self.events.try_reserve(1).is_err() {
            error!(
                "coincidence queue cannot grow past {} entries; flushing and retrying \
                 (coincidences may be missed)",
                self.events.len()
            );
            self.flush(None, sink, diagnostics.as_deref_mut());
            self.events
                .try_reserve(1)
                .context("coincidence queue allocation failed twice, giving up")?;
        }

        let wall_time_s = event.raw().header().wall_time_s;
        let position = self
            .events
            .partition_point(|e| e.event.trigger_time_us() <= event.trigger_time_us());
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.insert(
            position,
            Entry {
                event,
                seq,
                grouped_with: Vec::new(),
            },
        );

        let time_diff = match (self.events.get(position), self.events.front()) {
            (Some(inserted), Some(front)) => inserted.event.time_diff(&front.event),
            _ => 0.0,
        };

        let mut popped = false;
        while self.time_extent_us() > self.span_us {
            popped = true;
            self.pop_and_record(sink, diagnostics.as_deref_mut(), time_diff, wall_time_s);
        }
        if !popped {
            if let Some(diag) = diagnostics {
                diag.update(self.events.len(), time_diff, false, None, wall_time_s);
                sink.on_diagnostics(diag);
            }
        }
        Ok(())
    }

    /// Retires the earliest event: reports its coincidence partners, then
    /// the event itself.
    ///
    /// The front and the partners it pairs with here form a group. Pairs
    /// inside a group are emitted from its earliest-entered member only:
    /// the co-members are cross-marked and will not re-pair among
    /// themselves when they reach the front. Partners outside the group
    /// (a later event inside the window of a claimed member but not of the
    /// member that claimed it) still pair normally, so each distinct
    /// coincident pair is emitted exactly once over the queue's lifetime.
    ///
    /// Returns the retired event's id (`None` on an empty queue) and whether
    /// at least one coincidence was found.
    pub fn pop(&mut self, sink: &mut dyn MatchSink) -> (Option<u16>, bool) {
        if self.events.is_empty() {
            return (None, false);
        }
        let mut found_coinc = false;
        let mut partners = Vec::new();
        let mut index = 1;
        while index < self.events.len()
            && self.events[0].event.is_coincident(&self.events[index].event)
        {
            if !self.events[0].grouped_with.contains(&self.events[index].seq) {
                sink.on_coinc(&self.events[0].event, &self.events[index].event);
                found_coinc = true;
                partners.push(index);
            }
            index += 1;
        }
        for i in 0..partners.len() {
            for j in (i + 1)..partners.len() {
                let seq_i = self.events[partners[i]].seq;
                let seq_j = self.events[partners[j]].seq;
                self.events[partners[i]].grouped_with.push(seq_j);
                self.events[partners[j]].grouped_with.push(seq_i);
            }
        }
        let singles_id = self.events[0].event.event_id();
        sink.on_single(&self.events[0].event);
        self.events.pop_front();
        (Some(singles_id), found_coinc)
    }

    /// Empties the queue through [`MatchQueue::pop`].
    ///
    /// `max_time` bounds the wall-clock time spent; `None` blocks until the
    /// queue is empty. On timeout the remainder is discarded with a warning
    /// naming the count.
    pub fn flush(
        &mut self,
        max_time: Option<Duration>,
        sink: &mut dyn MatchSink,
        mut diagnostics: Option<&mut Diagnostics>,
    ) {
        let begin = Instant::now();
        while !self.events.is_empty() {
            if max_time.is_none_or(|limit| begin.elapsed() < limit) {
                let wall_time_s = self
                    .events
                    .back()
                    .map_or(0, |e| e.event.raw().header().wall_time_s);
                self.pop_and_record(sink, diagnostics.as_deref_mut(), 0.0, wall_time_s);
            } else {
                warn!(
                    "flush timeout of {:.1} s reached, clearing event queue (skipping {} events)",
                    max_time.unwrap_or_default().as_secs_f64(),
                    self.events.len()
                );
                self.events.clear();
            }
        }
    }

    /// Pops exactly one event if the queue is non-empty; returns the size
    /// observed before the pop. Intended for cooperative shutdown loops.
    pub fn flush_one(
        &mut self,
        sink: &mut dyn MatchSink,
        diagnostics: Option<&mut Diagnostics>,
    ) -> usize {
        let size = self.events.len();
        if size > 0 {
            let wall_time_s = self
                .events
                .back()
                .map_or(0, |e| e.event.raw().header().wall_time_s);
            self.pop_and_record(sink, diagnostics, 0.0, wall_time_s);
        }
        size
    }

    fn pop_and_record(
        &mut self,
        sink: &mut dyn MatchSink,
        diagnostics: Option<&mut Diagnostics>,
        time_diff: f64,
        wall_time_s: u32,
    ) {
        let (singles_id, have_coinc) = self.pop(sink);
        if let Some(diag) = diagnostics {
            diag.update(self.events.len(), time_diff, have_coinc, singles_id, wall_time_s);
            sink.on_diagnostics(diag);
        }
    }
}
