//! Bank-name handling.
//!
//! Bank names on the wire are exactly four ASCII characters. Configured
//! overrides of any other length are coerced: longer names are truncated,
//! shorter names are right-padded with `'0'`, with a warning either way.

use crate::midas::database::Db;
use log::warn;
use std::fmt;

/// A four-character bank name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BankName([u8; 4]);

impl BankName {
    /// Coerces `name` to four characters, warning when it has to.
    #[must_use]
    pub fn new(name: &str) -> Self {
        let bytes = name.as_bytes();
        let mut out = [b'0'; 4];
        if bytes.len() >= 4 {
            out.copy_from_slice(&bytes[..4]);
            if bytes.len() > 4 {
                warn!(
                    "bank name \"{name}\" longer than 4 characters, truncated to \"{}\"",
                    Self(out)
                );
            }
        } else {
            out[..bytes.len()].copy_from_slice(bytes);
            warn!(
                "bank name \"{name}\" shorter than 4 characters, extended to \"{}\"",
                Self(out)
            );
        }
        Self(out)
    }

    /// Name bytes as stored in a bank header.
    #[must_use]
    pub const fn bytes(&self) -> [u8; 4] {
        self.0
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Name as a string slice; non-ASCII bytes render as `"????"`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }

    /// Reads an override from the database, falling back to the wired
    /// default.
    #[must_use]
    pub fn from_db(db: &Db, path: &str, default: &str) -> Self {
        match db.read_value::<String>(path) {
            Some(name) => Self::new(&name),
            None => Self::new(default),
        }
    }
}

impl fmt::Display for BankName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bank names for one participating event stream.
///
/// `NADC` and `NTDC` give the number of converter modules the stream reads
/// out; the head carries one of each, the tail two ADCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBanks<const NADC: usize, const NTDC: usize> {
    pub io32: BankName,
    pub tsc: BankName,
    pub adc: [BankName; NADC],
    pub tdc: [BankName; NTDC],
}

/// Head (gamma-ray) stream defaults.
#[must_use]
pub fn head_defaults() -> EventBanks<1, 1> {
    EventBanks {
        io32: BankName::new("VTRH"),
        tsc: BankName::new("TSCH"),
        adc: [BankName::new("ADC0")],
        tdc: [BankName::new("TDC0")],
    }
}

/// Tail (heavy-ion) stream defaults.
#[must_use]
pub fn tail_defaults() -> EventBanks<2, 1> {
    EventBanks {
        io32: BankName::new("VTRT"),
        tsc: BankName::new("TSCT"),
        adc: [BankName::new("TLQ0"), BankName::new("TLQ1")],
        tdc: [BankName::new("TLT0")],
    }
}

/// Bank names for a scaler event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalerBanks {
    /// Counts in the latest read period.
    pub count: BankName,
    /// Counts accumulated over the run.
    pub sum: BankName,
    /// Average rates over the run.
    pub rate: BankName,
}

impl Default for ScalerBanks {
    fn default() -> Self {
        Self {
            count: BankName::new("SCLD"),
            sum: BankName::new("SCLS"),
            rate: BankName::new("SCLR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_names_pass_through() {
        assert_eq!(BankName::new("VTRH").as_str(), "VTRH");
        assert_eq!(BankName::new("TLQ0").bytes(), *b"TLQ0");
    }

    #[test]
    fn long_names_truncate() {
        assert_eq!(BankName::new("VTRHEAD").as_str(), "VTRH");
    }

    #[test]
    fn short_names_pad_with_zero() {
        assert_eq!(BankName::new("TD").as_str(), "TD00");
        assert_eq!(BankName::new("").as_str(), "0000");
    }

    #[test]
    fn db_override_and_default() {
        let db = Db::from_json(r#"{"dragon":{"head":{"bank_names":{"tdc":"XTDC"}}}}"#).unwrap();
        let name = BankName::from_db(&db, "/dragon/head/bank_names/tdc", "TDC0");
        assert_eq!(name.as_str(), "XTDC");
        let name = BankName::from_db(&db, "/dragon/head/bank_names/adc", "ADC0");
        assert_eq!(name.as_str(), "ADC0");
    }

    #[test]
    fn stream_defaults() {
        let head = head_defaults();
        assert_eq!(head.io32.as_str(), "VTRH");
        assert_eq!(head.tsc.as_str(), "TSCH");
        let tail = tail_defaults();
        assert_eq!(tail.adc[0].as_str(), "TLQ0");
        assert_eq!(tail.adc[1].as_str(), "TLQ1");
        assert_eq!(tail.tdc[0].as_str(), "TLT0");
    }
}
