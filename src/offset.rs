//! Message offsets and their order-preserving codec.
//!
//! An offset is the position of a message within a topic: the start
//! timestamp of the publishing transaction plus the message's index inside
//! that batch. The binary form must sort byte-wise in the same order as the
//! `(ts, index)` pairs sort numerically, because subscription cursors are
//! compared against message keys with nothing but `memcmp`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of the binary encoding: two sign-flipped big-endian i64s.
pub const ENCODED_LEN: usize = 16;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    #[error("expected exactly one '-' separator: {0:?}")]
    Separator(String),

    #[error("malformed decimal component: {0}")]
    Malformed(#[from] std::num::ParseIntError),
}

#[derive(Debug, Error)]
#[error("offset must be {ENCODED_LEN} bytes, got {0}")]
pub struct DecodeError(pub usize);

/// Position of a message within a topic.
///
/// Ordered by `ts` first, then `index`; [`Offset::encode`] preserves that
/// order under lexicographic byte comparison.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Offset {
    /// Start timestamp of the publishing transaction.
    pub ts: i64,

    /// Zero-based position within the publish batch.
    pub index: i64,
}

impl Offset {
    pub fn new(ts: i64, index: i64) -> Self {
        Self { ts, index }
    }

    /// The smallest offset strictly greater than `self`.
    ///
    /// Used as the inclusive start of a scan that must exclude the named
    /// offset. `None` on index overflow; batch sizes bound the index in
    /// practice.
    pub fn next(&self) -> Option<Self> {
        Some(Self {
            ts: self.ts,
            index: self.index.checked_add(1)?,
        })
    }

    /// Memory-comparable binary form, `ts` first then `index`.
    pub fn encode(&self) -> [u8; ENCODED_LEN] {
        let mut out = [0u8; ENCODED_LEN];
        out[..8].copy_from_slice(&encode_i64(self.ts));
        out[8..].copy_from_slice(&encode_i64(self.index));
        out
    }

    /// Exact inverse of [`Offset::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() != ENCODED_LEN {
            return Err(DecodeError(buf.len()));
        }

        let mut ts = [0u8; 8];
        let mut index = [0u8; 8];
        ts.copy_from_slice(&buf[..8]);
        index.copy_from_slice(&buf[8..]);

        Ok(Self {
            ts: decode_i64(ts),
            index: decode_i64(index),
        })
    }
}

/// Big-endian with the sign bit flipped, so negative values sort below
/// positive ones under byte comparison.
fn encode_i64(v: i64) -> [u8; 8] {
    ((v as u64) ^ (1 << 63)).to_be_bytes()
}

fn decode_i64(buf: [u8; 8]) -> i64 {
    (u64::from_be_bytes(buf) ^ (1 << 63)) as i64
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ts, self.index)
    }
}

impl FromStr for Offset {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut parts = s.split('-');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(ts), Some(index), None) => Ok(Self {
                ts: ts.parse()?,
                index: index.parse()?,
            }),
            _ => Err(ParseError::Separator(s.to_owned())),
        }
    }
}
