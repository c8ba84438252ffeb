//! Half-open offset ranges and lock modes.
//!
//! A [`Range`] is `[start, end)` over an unsigned 64-bit offset space. The
//! unit is up to the caller (bytes, blocks, pages); the lock manager only
//! compares offsets. Empty ranges are unrepresentable: every constructor
//! rejects `start >= end`.

use core::fmt;

/// A non-empty half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Range {
    start: u64,
    end: u64,
}

impl Range {
    /// Creates the range `[start, end)`.
    ///
    /// Returns [`RangeError::Empty`] if `start >= end`.
    pub const fn new(start: u64, end: u64) -> Result<Self, RangeError> {
        if start < end {
            Ok(Self { start, end })
        } else {
            Err(RangeError::Empty { start, end })
        }
    }

    /// Creates the range `[start, start + len)`.
    pub const fn with_len(start: u64, len: u64) -> Result<Self, RangeError> {
        match start.checked_add(len) {
            Some(end) => Self::new(start, end),
            None => Err(RangeError::Overflow { start, len }),
        }
    }

    /// Returns the inclusive lower bound.
    pub const fn start(self) -> u64 {
        self.start
    }

    /// Returns the exclusive upper bound.
    pub const fn end(self) -> u64 {
        self.end
    }

    /// Returns the number of offsets covered. Always non-zero.
    pub const fn len(self) -> u64 {
        self.end - self.start
    }

    /// Returns `true` if the two ranges share at least one offset.
    #[inline]
    pub const fn overlaps(self, other: Range) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns `true` if `other` lies entirely within `self`.
    pub const fn contains(self, other: Range) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Returns `true` if `offset` lies within the range.
    pub const fn contains_offset(self, offset: u64) -> bool {
        self.start <= offset && offset < self.end
    }
}

impl TryFrom<core::ops::Range<u64>> for Range {
    type Error = RangeError;

    fn try_from(r: core::ops::Range<u64>) -> Result<Self, Self::Error> {
        Self::new(r.start, r.end)
    }
}

impl From<Range> for core::ops::Range<u64> {
    fn from(r: Range) -> Self {
        r.start..r.end
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

/// Errors from [`Range`] construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// `start >= end`: the range would cover no offsets.
    Empty {
        /// Requested lower bound.
        start: u64,
        /// Requested upper bound.
        end: u64,
    },
    /// `start + len` does not fit in a `u64`.
    Overflow {
        /// Requested lower bound.
        start: u64,
        /// Requested length.
        len: u64,
    },
}

impl fmt::Display for RangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty { start, end } => {
                write!(f, "empty range [{start:#x}, {end:#x})")
            }
            Self::Overflow { start, len } => {
                write!(f, "range {start:#x}+{len:#x} overflows the offset space")
            }
        }
    }
}

impl core::error::Error for RangeError {}

/// Access mode of a range lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared access. Any number of readers may overlap.
    Read,
    /// Exclusive access. Overlaps with nothing.
    Write,
}

impl LockMode {
    /// Returns `true` if two requests in these modes may hold overlapping
    /// ranges at the same time.
    #[inline]
    pub const fn is_compatible(self, other: LockMode) -> bool {
        matches!((self, other), (Self::Read, Self::Read))
    }

    /// Returns `true` if a lock held in `self` mode grants at least the
    /// access `expected` asks for. A write hold satisfies a read expectation.
    pub const fn satisfies(self, expected: LockMode) -> bool {
        matches!(
            (self, expected),
            (Self::Write, _) | (Self::Read, Self::Read)
        )
    }

    /// Returns a human-readable string for this mode.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: u64, end: u64) -> Range {
        Range::new(start, end).unwrap()
    }

    #[test]
    fn empty_range_rejected() {
        assert_eq!(
            Range::new(5, 5),
            Err(RangeError::Empty { start: 5, end: 5 })
        );
        assert!(Range::new(10, 3).is_err());
    }

    #[test]
    fn with_len_overflow() {
        assert!(matches!(
            Range::with_len(u64::MAX, 1),
            Err(RangeError::Overflow { .. })
        ));
        assert!(Range::with_len(4, 0).is_err());
        assert_eq!(Range::with_len(4, 6).unwrap(), r(4, 10));
    }

    #[test]
    fn adjacent_ranges_do_not_overlap() {
        assert!(!r(0, 10).overlaps(r(10, 20)));
        assert!(!r(10, 20).overlaps(r(0, 10)));
    }

    #[test]
    fn overlap_is_symmetric() {
        let cases = [(r(0, 10), r(5, 15)), (r(0, 100), r(50, 60)), (r(3, 4), r(0, 8))];
        for (a, b) in cases {
            assert!(a.overlaps(b));
            assert!(b.overlaps(a));
        }
    }

    #[test]
    fn containment() {
        assert!(r(0, 100).contains(r(50, 60)));
        assert!(!r(50, 60).contains(r(0, 100)));
        assert!(r(0, 10).contains_offset(9));
        assert!(!r(0, 10).contains_offset(10));
        assert_eq!(r(40, 70).len(), 30);
    }

    #[test]
    fn try_from_std_range() {
        assert_eq!(Range::try_from(2..9).unwrap(), r(2, 9));
        assert!(Range::try_from(9..9).is_err());
        let back: core::ops::Range<u64> = r(2, 9).into();
        assert_eq!(back, 2..9);
    }

    #[test]
    fn mode_compatibility() {
        assert!(LockMode::Read.is_compatible(LockMode::Read));
        assert!(!LockMode::Read.is_compatible(LockMode::Write));
        assert!(!LockMode::Write.is_compatible(LockMode::Read));
        assert!(!LockMode::Write.is_compatible(LockMode::Write));
    }

    #[test]
    fn mode_satisfies() {
        assert!(LockMode::Write.satisfies(LockMode::Read));
        assert!(LockMode::Write.satisfies(LockMode::Write));
        assert!(LockMode::Read.satisfies(LockMode::Read));
        assert!(!LockMode::Read.satisfies(LockMode::Write));
    }

    #[test]
    fn display() {
        assert_eq!(r(0x10, 0x20).to_string(), "[0x10, 0x20)");
        assert_eq!(LockMode::Write.to_string(), "write");
        assert_eq!(
            RangeError::Empty { start: 1, end: 1 }.to_string(),
            "empty range [0x1, 0x1)"
        );
    }
}
