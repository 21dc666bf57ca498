#![warn(missing_docs)]
//! WAL positions as `(logid, recoff)` pairs.
//!
//! The WAL address space is split into logical log files; `recoff` is the
//! byte offset inside the current logical file and resets when the stream
//! crosses into the next one. The last, partial segment of each logical
//! file does not exist on disk, so positions are not dense in a plain
//! 64-bit offset; the pair form keeps the carry rule explicit.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// A position in the WAL stream.
///
/// Ordering is lexicographic on `(logid, recoff)`, which is the stream
/// order. Two positions are equal iff both components are equal.
#[derive(Debug, Clone, Copy, Hash, Eq, Ord, PartialEq, PartialOrd)]
pub struct Lsn {
    /// Logical log file number
    pub logid: u32,
    /// Byte offset within the logical log file
    pub recoff: u32,
}

/// We tried to parse an LSN from a string, but failed
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("LsnParseError")]
pub struct LsnParseError;

impl Lsn {
    /// Start of the WAL stream
    pub const ZERO: Lsn = Lsn { logid: 0, recoff: 0 };

    /// Construct from components
    pub const fn new(logid: u32, recoff: u32) -> Lsn {
        Lsn { logid, recoff }
    }

    /// Advance by `nbytes`, carrying into the next logical log file when
    /// the offset reaches `log_file_size`.
    pub fn advance(self, nbytes: u64, log_file_size: u32) -> Lsn {
        let mut logid = self.logid;
        let mut off = self.recoff as u64 + nbytes;
        while off >= log_file_size as u64 {
            off -= log_file_size as u64;
            logid += 1;
        }
        Lsn {
            logid,
            recoff: off as u32,
        }
    }

    /// Compute the offset into the containing segment
    pub fn segment_offset(self, seg_size: u32) -> u32 {
        self.recoff % seg_size
    }

    /// Compute the segment number within the logical log file
    pub fn segment_number(self, seg_size: u32) -> u32 {
        self.recoff / seg_size
    }

    /// Pack into a single word. The packing is order-preserving, which is
    /// what makes [`AtomicLsn`] monotonic under `fetch_max`.
    pub fn into_word(self) -> u64 {
        ((self.logid as u64) << 32) | self.recoff as u64
    }

    /// Inverse of [`Lsn::into_word`]
    pub fn from_word(word: u64) -> Lsn {
        Lsn {
            logid: (word >> 32) as u32,
            recoff: word as u32,
        }
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> u64 {
        lsn.into_word()
    }
}

impl From<u64> for Lsn {
    fn from(word: u64) -> Lsn {
        Lsn::from_word(word)
    }
}

impl FromStr for Lsn {
    type Err = LsnParseError;

    /// Parse an LSN from a string in the form `00000000/00000000`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut splitter = s.split('/');
        if let (Some(left), Some(right), None) = (splitter.next(), splitter.next(), splitter.next())
        {
            let logid = u32::from_str_radix(left, 16).map_err(|_| LsnParseError)?;
            let recoff = u32::from_str_radix(right, 16).map_err(|_| LsnParseError)?;
            Ok(Lsn { logid, recoff })
        } else {
            Err(LsnParseError)
        }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.logid, self.recoff)
    }
}

/// An [`Lsn`] that can be accessed atomically.
pub struct AtomicLsn {
    inner: AtomicU64,
}

impl AtomicLsn {
    /// Creates a new atomic `Lsn`.
    pub fn new(val: Lsn) -> Self {
        AtomicLsn {
            inner: AtomicU64::new(val.into_word()),
        }
    }

    /// Atomically retrieve the `Lsn` value from memory.
    pub fn load(&self) -> Lsn {
        Lsn::from_word(self.inner.load(Ordering::Acquire))
    }

    /// Atomically store a new `Lsn` value to memory.
    pub fn store(&self, lsn: Lsn) {
        self.inner.store(lsn.into_word(), Ordering::Release);
    }

    /// Atomically sets the Lsn to the max of old and new value, returning
    /// the old value.
    pub fn fetch_max(&self, lsn: Lsn) -> Lsn {
        Lsn::from_word(self.inner.fetch_max(lsn.into_word(), Ordering::AcqRel))
    }
}
