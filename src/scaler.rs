//! Scaler (counting-rate) event decoding.
//!
//! Each stream's frontend reads its scaler channels once a second and ships
//! three banks: counts in the latest read period (`u32`), counts accumulated
//! over the run (`u32`), and average rates (`f64`). Channel meanings are
//! configuration, not wire format, so the names come from the database.

use crate::error::DecodeError;
use crate::midas::banks::{BankName, ScalerBanks};
use crate::midas::database::Db;
use crate::midas::frame::RawFrame;

/// Number of scaler channels per stream.
pub const MAX_CHANNELS: usize = 32;

/// Accumulated scaler readings for one stream.
#[derive(Debug, Clone)]
pub struct Scaler {
    /// Counts in the most recent read period.
    pub count: [u32; MAX_CHANNELS],
    /// Counts accumulated over the run.
    pub sum: [u32; MAX_CHANNELS],
    /// Average rate over the run, 1/s.
    pub rate: [f64; MAX_CHANNELS],
    names: Box<[String; MAX_CHANNELS]>,
    banks: ScalerBanks,
    db_base: String,
}

impl Scaler {
    /// `base` selects the database subtree, `"head"` or `"tail"`.
    #[must_use]
    pub fn new(base: &str) -> Self {
        Self {
            count: [0; MAX_CHANNELS],
            sum: [0; MAX_CHANNELS],
            rate: [0.0; MAX_CHANNELS],
            names: Box::new(std::array::from_fn(|ch| format!("channel_{ch}"))),
            banks: ScalerBanks::default(),
            db_base: base.to_owned(),
        }
    }

    /// Zeroes all readings (begin-of-run).
    pub fn reset(&mut self) {
        self.count = [0; MAX_CHANNELS];
        self.sum = [0; MAX_CHANNELS];
        self.rate = [0.0; MAX_CHANNELS];
    }

    /// Descriptive name of `ch`.
    #[must_use]
    pub fn channel_name(&self, ch: usize) -> &str {
        self.names.get(ch).map_or("", String::as_str)
    }

    #[must_use]
    pub fn banks(&self) -> &ScalerBanks {
        &self.banks
    }

    /// Reads channel names and bank-name overrides from the database.
    pub fn set_variables(&mut self, db: &Db) {
        let base = format!("/dragon/{}/scaler", self.db_base);
        if let Some(names) = db.read_array::<String>(&format!("{base}/names"), MAX_CHANNELS) {
            for (slot, name) in self.names.iter_mut().zip(names) {
                *slot = name;
            }
        }
        self.banks.count = BankName::from_db(db, &format!("{base}/bank_names/count"), "SCLD");
        self.banks.sum = BankName::from_db(db, &format!("{base}/bank_names/sum"), "SCLS");
        self.banks.rate = BankName::from_db(db, &format!("{base}/bank_names/rate"), "SCLR");
    }

    /// Unpacks whichever of the three banks the frame carries.
    pub fn unpack(&mut self, frame: &RawFrame) -> Result<(), DecodeError> {
        if let Some(bank) = frame.find_bank(&self.banks.count) {
            for (slot, word) in self.count.iter_mut().zip(bank.u32_words()?) {
                *slot = word;
            }
        }
        if let Some(bank) = frame.find_bank(&self.banks.sum) {
            for (slot, word) in self.sum.iter_mut().zip(bank.u32_words()?) {
                *slot = word;
            }
        }
        if let Some(bank) = frame.find_bank(&self.banks.rate) {
            for (slot, value) in self.rate.iter_mut().zip(bank.f64_values()?) {
                *slot = value;
            }
        }
        Ok(())
    }
}
