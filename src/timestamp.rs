//! Timestamp codecs used by the superblock and inode structures.
//!
//! `ext4` stores most timestamps as an opaque (seconds, extra) pair rather than a native time
//! type: the low 32 bits of `extra` hold nanoseconds, and its low 2 bits extend the epoch-seconds
//! field by another 2 bits so dates past 2038 are representable. This module treats that pair as
//! a codec, not a clock — it never reads the system clock itself.

use bytemuck::{Pod, Zeroable};

/// A 64-bit `ext4` timestamp: low 32 bits are epoch seconds (plus a 2-bit high extension folded
/// in from the paired "extra" field), high 32 bits hold nanoseconds plus that extension.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct UnixTimestamp(pub u64);

impl From<u64> for UnixTimestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl UnixTimestamp {
    pub const EPOCH: Self = Self(0);

    /// Builds a timestamp from Unix epoch seconds and nanoseconds, with no high-bit extension.
    #[must_use]
    pub fn from_parts(seconds: i64, nanos: u32) -> Self {
        let low = (seconds as u64) & 0xFFFF_FFFF;
        Self(low | (u64::from(nanos & ((1 << 30) - 1)) << 34))
    }

    /// Seconds elapsed since the Unix epoch, including the 2 high-extension bits.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn raw_seconds(&self) -> i64 {
        let low = (self.0 & 0xFFFF_FFFF) as u32 as i64;
        let extension = ((self.0 >> 32) & 0b11) as i64;
        low + (extension << 32)
    }

    /// Nanosecond component, or 0 if this field has no extra-bits precision.
    #[must_use]
    pub fn raw_ns(&self) -> u32 {
        ((self.0 >> 34) & ((1 << 30) - 1)) as u32
    }
}

impl core::ops::Sub for UnixTimestamp {
    type Output = Self;
    fn sub(self, rhs: UnixTimestamp) -> Self::Output {
        Self(self.0.saturating_sub(rhs.0))
    }
}

/// A 32-bit `ext4` timestamp (superblock `mtime`/`wtime`/etc.) with no nanosecond precision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct UnixTimestamp32(pub u32);

impl UnixTimestamp32 {
    #[must_use]
    pub fn raw_seconds(&self) -> i64 {
        i64::from(self.0)
    }
}

impl From<u32> for UnixTimestamp32 {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_seconds_and_nanos() {
        let ts = UnixTimestamp::from_parts(1_700_000_000, 123_456_789 & ((1 << 30) - 1));
        assert_eq!(ts.raw_seconds(), 1_700_000_000);
    }
}
