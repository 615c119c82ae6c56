//! Rate-limited aggregation of repeating decode messages.
//!
//! A misbehaving TDC can latch the same error bit on every trigger; logging
//! each occurrence floods the output at hardware rate. [`DelayedMessageLog`]
//! prints the first occurrence of each `(module, code)` pair immediately,
//! then counts repeats and re-prints an aggregate line at most once per
//! period. [`DelayedMessageLog::flush`] reports any counts still pending and
//! should be called at normal termination.

use log::warn;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry {
    text: String,
    pending: u64,
    total: u64,
    printed: u64,
    last_print: Instant,
}

/// Registry of rate-limited messages keyed by `(module id, message code)`.
///
/// Module ids are logical names (typically the bank being decoded), not
/// object addresses, so aggregation survives decoder resets.
#[derive(Debug)]
pub struct DelayedMessageLog {
    period: Duration,
    modules: HashMap<String, HashMap<u16, Entry>>,
}

impl DelayedMessageLog {
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            modules: HashMap::new(),
        }
    }

    /// Records one occurrence of the message identified by `(module, code)`.
    ///
    /// `text` is rendered only the first time the key is seen; later
    /// occurrences reuse it in the aggregate line.
    pub fn record<F>(&mut self, module: &str, code: u16, text: F)
    where
        F: FnOnce() -> String,
    {
        let now = Instant::now();
        if let Some(entry) = self.modules.get_mut(module).and_then(|m| m.get_mut(&code)) {
            entry.total += 1;
            entry.pending += 1;
            if now.duration_since(entry.last_print) >= self.period {
                warn!("{} (repeated {} times)", entry.text, entry.pending);
                entry.printed += 1;
                entry.pending = 0;
                entry.last_print = now;
            }
            return;
        }
        let rendered = text();
        warn!("{rendered}");
        self.modules.entry(module.to_owned()).or_default().insert(
            code,
            Entry {
                text: rendered,
                pending: 0,
                total: 1,
                printed: 1,
                last_print: now,
            },
        );
    }

    /// Total occurrences recorded for `(module, code)`.
    #[must_use]
    pub fn occurrences(&self, module: &str, code: u16) -> u64 {
        self.modules
            .get(module)
            .and_then(|m| m.get(&code))
            .map_or(0, |e| e.total)
    }

    /// Number of lines actually emitted for `(module, code)`.
    #[must_use]
    pub fn printed(&self, module: &str, code: u16) -> u64 {
        self.modules
            .get(module)
            .and_then(|m| m.get(&code))
            .map_or(0, |e| e.printed)
    }

    /// Emits any counts still pending aggregation.
    pub fn flush(&mut self) {
        for entries in self.modules.values_mut() {
            for entry in entries.values_mut() {
                if entry.pending > 0 {
                    warn!("{} (repeated {} more times)", entry.text, entry.pending);
                    entry.printed += 1;
                    entry.pending = 0;
                }
            }
        }
    }
}
