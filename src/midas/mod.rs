//! Framed events, payload banks, and the run-configuration database.
//!
//! The upstream framing layer is a MIDAS-style record stream; everything the
//! core needs from it is the frame header, the named banks inside the
//! payload, and a read-only view of the experiment's configuration database.

pub mod banks;
pub mod database;
pub mod frame;
