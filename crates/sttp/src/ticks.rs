//! 100-nanosecond timestamps counted from 0001-01-01 00:00:00 UTC.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A point in time expressed in ticks.
///
/// One tick is 100 nanoseconds. Bits 1-62 carry the tick count since
/// 0001-01-01 00:00:00 UTC (Gregorian). The top two bits flag leap
/// seconds and survive masking:
///
/// - bit 64 set: this timestamp falls inside a leap second (second 60)
/// - bit 63 set: the leap second is negative
///
/// All wall-clock arithmetic must go through [`Ticks::value`] so the
/// flag bits never leak into the tick count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticks(pub u64);

impl Ticks {
    /// Ticks per second.
    pub const PER_SECOND: u64 = 10_000_000;
    /// Ticks per millisecond.
    pub const PER_MILLISECOND: u64 = Self::PER_SECOND / 1_000;
    /// Ticks per microsecond.
    pub const PER_MICROSECOND: u64 = Self::PER_SECOND / 1_000_000;

    /// Mask covering the 62 value bits.
    pub const VALUE_MASK: u64 = 0x3FFF_FFFF_FFFF_FFFF;
    /// Flag marking a timestamp inside a leap second.
    pub const LEAP_SECOND_FLAG: u64 = 1 << 63;
    /// Flag marking the leap second as negative.
    pub const LEAP_SECOND_DIRECTION: u64 = 1 << 62;

    /// Tick count of the Unix epoch, 1970-01-01 00:00:00 UTC.
    pub const UNIX_BASE_OFFSET: u64 = 621_355_968_000_000_000;

    /// Largest representable value, 9999-12-31 23:59:59.9999999 UTC.
    pub const MAX_VALUE: u64 = 3_155_378_975_999_999_999;

    /// The tick count with both leap-second bits cleared.
    pub fn value(self) -> u64 {
        self.0 & Self::VALUE_MASK
    }

    /// True if this timestamp falls inside a leap second.
    pub fn is_leap_second(self) -> bool {
        self.0 & Self::LEAP_SECOND_FLAG != 0
    }

    /// True if this timestamp falls inside a negative leap second.
    pub fn is_negative_leap_second(self) -> bool {
        self.is_leap_second() && self.0 & Self::LEAP_SECOND_DIRECTION != 0
    }

    /// Copy of this timestamp with the leap-second flag set.
    pub fn set_leap_second(self) -> Self {
        Self(self.0 | Self::LEAP_SECOND_FLAG)
    }

    /// Copy of this timestamp flagged as a negative leap second.
    pub fn set_negative_leap_second(self) -> Self {
        Self(self.0 | Self::LEAP_SECOND_FLAG | Self::LEAP_SECOND_DIRECTION)
    }

    /// Convert to wall time (UTC).
    ///
    /// Leap-second bits are ignored; timestamps before the Unix epoch
    /// resolve to instants before [`UNIX_EPOCH`].
    pub fn to_system_time(self) -> SystemTime {
        let value = self.value();

        if value >= Self::UNIX_BASE_OFFSET {
            let unix_ticks = value - Self::UNIX_BASE_OFFSET;
            UNIX_EPOCH + Self::ticks_to_duration(unix_ticks)
        } else {
            let unix_ticks = Self::UNIX_BASE_OFFSET - value;
            UNIX_EPOCH - Self::ticks_to_duration(unix_ticks)
        }
    }

    /// Convert wall time (UTC) to ticks.
    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(after) => Self(Self::UNIX_BASE_OFFSET + Self::duration_to_ticks(after)),
            Err(e) => Self(Self::UNIX_BASE_OFFSET - Self::duration_to_ticks(e.duration())),
        }
    }

    /// Current wall-clock time as ticks.
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    fn ticks_to_duration(ticks: u64) -> Duration {
        let secs = ticks / Self::PER_SECOND;
        let sub_nanos = (ticks % Self::PER_SECOND) * 100;
        Duration::new(secs, sub_nanos as u32)
    }

    fn duration_to_ticks(d: Duration) -> u64 {
        d.as_secs() * Self::PER_SECOND + u64::from(d.subsec_nanos()) / 100
    }
}

impl From<u64> for Ticks {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<Ticks> for u64 {
    fn from(ticks: Ticks) -> Self {
        ticks.0
    }
}
