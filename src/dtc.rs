//! Diagnostic Trouble Codes.
//!
//! Codes travel as big-endian byte pairs (SAE J2012). A `00 00` pair is padding and never a
//! code, so the value 0 cannot be represented.

use std::fmt;

use crate::error::Error;
use crate::Result;

/// Default number of codes kept in a snapshot.
pub const DEFAULT_CAPACITY: usize = 10;

/// A single trouble code, e.g. `P0300`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Dtc(pub u16);

impl Dtc {
    pub fn code(&self) -> u16 {
        self.0
    }

    /// System letter: powertrain, chassis, body or network.
    pub fn category(&self) -> char {
        match self.0 >> 14 {
            0 => 'P',
            1 => 'C',
            2 => 'B',
            _ => 'U',
        }
    }
}

impl fmt::Display for Dtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:03X}", self.category(), (self.0 >> 12) & 0x3, self.0 & 0xfff)
    }
}

impl fmt::Debug for Dtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dtc({})", self)
    }
}

impl From<u16> for Dtc {
    fn from(code: u16) -> Dtc {
        Dtc(code)
    }
}

/// Encode codes as the byte pairs carried by an OBD service 03 response.
pub fn encode(codes: &[u16]) -> Vec<u8> {
    codes.iter().flat_map(|code| code.to_be_bytes()).collect()
}

/// Decode byte pairs into codes, skipping padding. An odd byte count is a framing error.
pub fn decode(bytes: &[u8]) -> Result<Vec<u16>> {
    if bytes.len() % 2 != 0 {
        return Err(Error::DecodeMismatch);
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .filter(|code| *code != 0)
        .collect())
}

/// Result of [`crate::aggregator::DiagnosticAggregator::check_dtcs`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DtcCheck {
    /// Parsed codes in the order the vehicle reported them, at most the requested capacity
    pub codes: Vec<Dtc>,
    /// Number of codes the vehicle reported before truncation
    pub available: usize,
}

impl DtcCheck {
    pub fn count(&self) -> usize {
        self.codes.len()
    }

    /// True when codes were dropped to honour the capacity.
    pub fn truncated(&self) -> bool {
        self.available > self.codes.len()
    }

    /// The truncation as an error value, for callers that want to report it.
    pub fn capacity_error(&self) -> Option<Error> {
        self.truncated().then(|| Error::CapacityExceeded {
            capacity: self.codes.len(),
            available: self.available,
        })
    }
}
