//! Sortable watermarks.
//!
//! A watermark encodes a shard-local LSN so that plain string comparison
//! agrees with numeric order. The encoding is length-prefixed base 36: the
//! first character is the number of digits that follow minus one, written
//! as a base-36 digit, followed by the LSN in lowercase base 36.
//!
//! | LSN | Watermark |
//! |-----|-----------|
//! | 0 | `00` |
//! | 1 | `01` |
//! | 35 | `0z` |
//! | 36 | `110` |
//! | 1295 | `1zz` |
//!
//! A longer LSN always gets a larger prefix, and equal-length digit strings
//! sort like the numbers they encode.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The LSN assigned by the first mint on a shard.
pub const BASE_LSN: u64 = 1;

/// Watermark a subscriber presents to request an initial sync. It encodes
/// LSN 0, so it sorts below every minted watermark.
pub const INITIAL_SYNC: &str = "00";

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// An externally visible, lexicographically sortable position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(String);

impl Watermark {
    /// Encode an LSN.
    pub fn from_lsn(lsn: u64) -> Self {
        let mut digits = Vec::new();
        let mut n = lsn;
        loop {
            digits.push(DIGITS[(n % 36) as usize]);
            n /= 36;
            if n == 0 {
                break;
            }
        }
        digits.push(DIGITS[digits.len() - 1]);
        digits.reverse();
        // every byte comes from DIGITS, so this is ASCII
        Self(digits.into_iter().map(char::from).collect())
    }

    /// Parse and validate an encoded watermark.
    pub fn parse(raw: &str) -> Result<Self> {
        Self::decode(raw)?;
        Ok(Self(raw.to_string()))
    }

    /// Decode back to the LSN.
    pub fn lsn(&self) -> Result<u64> {
        Self::decode(&self.0)
    }

    fn decode(raw: &str) -> Result<u64> {
        let invalid = || Error::InvalidWatermark(raw.to_string());
        let mut chars = raw.chars();
        let prefix = chars.next().ok_or_else(invalid)?;
        let len = prefix.to_digit(36).filter(|_| !prefix.is_ascii_uppercase()).ok_or_else(invalid)? as usize + 1;
        let body = chars.as_str();
        if body.len() != len
            || body.bytes().any(|b| !DIGITS.contains(&b))
            || (len > 1 && body.starts_with('0'))
        {
            return Err(invalid());
        }
        u64::from_str_radix(body, 36).map_err(|_| invalid())
    }

    /// The watermark following this one.
    pub fn next(&self) -> Result<Self> {
        let lsn = self.lsn()?;
        lsn.checked_add(1)
            .map(Self::from_lsn)
            .ok_or_else(|| Error::InvalidWatermark(format!("{} has no successor", self.0)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `raw` asks for an initial sync rather than a resume.
    pub fn requests_initial_sync(raw: Option<&str>) -> bool {
        match raw {
            None => true,
            Some(raw) => raw.is_empty() || raw == INITIAL_SYNC,
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
