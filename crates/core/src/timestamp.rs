//! Synthetic access-time stamps for the hot path
//!
//! Successful lookups mark the entries they touched with a monotonically
//! incrementing `(seconds, microseconds)` stamp instead of relying on real
//! access times, which the kernel may update lazily (or not at all under
//! `noatime`). The stamp advances by one microsecond per lookup, so entries
//! touched later always compare strictly newer, and the LRU signal the
//! garbage collector reads from atimes stays isolated from wall-clock noise.
//!
//! The counter is seeded from the access time of the object tree root at
//! startup; every stamp also refreshes that root, so the sequence resumes
//! monotonically across daemon restarts.

use filetime::FileTime;

const MICROS_PER_SECOND: u32 = 1_000_000;

/// Monotonically incrementing hot-path marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    seconds: i64,
    micros: u32,
    overflown: bool,
}

impl Timestamp {
    /// Create a stamp at the given point
    #[must_use]
    pub fn new(seconds: i64, micros: u32) -> Self {
        Self {
            seconds,
            micros: micros % MICROS_PER_SECOND,
            overflown: false,
        }
    }

    /// Seed the stamp from a file's access time
    #[must_use]
    pub fn from_file_time(ft: FileTime) -> Self {
        Self::new(ft.unix_seconds(), ft.nanoseconds() / 1_000)
    }

    /// Advance by one microsecond and return the new stamp value
    ///
    /// When the seconds field saturates, the overflow flag latches and the
    /// caller is expected to schedule a full timestamp reset.
    pub fn increment(&mut self) -> FileTime {
        if self.micros + 1 >= MICROS_PER_SECOND {
            if self.seconds == i64::MAX {
                self.overflown = true;
            } else {
                self.seconds += 1;
                self.micros = 0;
            }
        } else {
            self.micros += 1;
        }

        self.file_time()
    }

    /// Move the counter to a new base and clear the overflow latch
    pub fn rebase(&mut self, ft: FileTime) {
        *self = Self::from_file_time(ft);
    }

    /// Current stamp value
    #[must_use]
    pub fn file_time(&self) -> FileTime {
        FileTime::from_unix_time(self.seconds, self.micros * 1_000)
    }

    /// True once the counter has saturated
    #[must_use]
    pub fn overflown(&self) -> bool {
        self.overflown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_advances_one_microsecond() {
        let mut ts = Timestamp::new(100, 0);
        let ft = ts.increment();
        assert_eq!(ft.unix_seconds(), 100);
        assert_eq!(ft.nanoseconds(), 1_000);
    }

    #[test]
    fn test_increment_is_strictly_monotonic() {
        let mut ts = Timestamp::new(7, 999_990);
        let mut prev = ts.file_time();
        for _ in 0..32 {
            let next = ts.increment();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_micros_carry_into_seconds() {
        let mut ts = Timestamp::new(100, 999_999);
        let ft = ts.increment();
        assert_eq!(ft.unix_seconds(), 101);
        assert_eq!(ft.nanoseconds(), 0);
        assert!(!ts.overflown());
    }

    #[test]
    fn test_overflow_latches() {
        let mut ts = Timestamp::new(i64::MAX, 999_999);
        assert!(!ts.overflown());
        ts.increment();
        assert!(ts.overflown());
        // stays latched on further increments
        ts.increment();
        assert!(ts.overflown());
    }

    #[test]
    fn test_rebase_clears_overflow() {
        let mut ts = Timestamp::new(i64::MAX, 999_999);
        ts.increment();
        assert!(ts.overflown());

        ts.rebase(FileTime::from_unix_time(42, 0));
        assert!(!ts.overflown());
        assert_eq!(ts.file_time().unix_seconds(), 42);
    }

    #[test]
    fn test_file_time_round_trip() {
        let ft = FileTime::from_unix_time(1234, 567_000);
        let ts = Timestamp::from_file_time(ft);
        assert_eq!(ts.file_time(), ft);
    }
}
