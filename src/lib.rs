//! Rust library for decoding and time-ordering events from two-stream VME
//! data acquisition systems such as the
//! [DRAGON recoil separator](https://dragon.triumf.ca/) at TRIUMF.
//!
//! Please see the project README for information on contributing to the
//! project.
//!
//! ## How to use
//!
//! This library contains components that form a per-frame processing
//! pipeline. Broadly speaking, these components fall into the following
//! categories:
//!
//! ### Frames
//!
//! The ingest layer (a MIDAS-style record stream, not part of this crate)
//! yields framed buffers: an event header plus a payload of named banks.
//! [`midas`] owns the payload walk and the timestamp-carrying event wrapper,
//! plus the read-only run-configuration database.
//!
//! ### Decoders
//!
//! Each VME module family writes a bit-packed bank format; [`vme`] turns
//! those banks into per-module parameter structs. Decoders recover from bad
//! buffers by skipping them, with rate-limited logging through [`messages`].
//!
//! ### Matching
//!
//! Trigger events from the two streams carry timestamps from a common
//! 20 MHz clock ([`timebase`]). The queue in [`tstamp`] buffers them long
//! enough to guarantee any coincidence partner has arrived, then retires
//! them in trigger-time order as singles and coincidence pairs.
//!
//! ### Dispatch
//!
//! [`dispatch`] routes incoming frames by event id, owns the queue and the
//! decoders, handles begin/end-of-run transitions, and delivers results
//! through caller-supplied sink callbacks.
//!
//! ## API stability
//!
//! We follow the [Semantic Versioning 2.0.0](https://semver.org/) standard.
//!
//! The bank formats decoded here are fixed by frontend firmware, but the
//! sink and configuration APIs are still settling as more consumers are
//! ported; we do not anticipate making a 1.x.x release in the near future.

pub mod bits;
pub mod dispatch;
pub mod error;
pub mod messages;
pub mod midas;
pub mod scaler;
pub mod timebase;
pub mod tstamp;
pub mod valid;
pub mod vme;

pub use error::DecodeError;
