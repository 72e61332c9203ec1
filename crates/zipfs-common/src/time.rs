//! Timestamp handling.
//!
//! ZIP stores times in three encodings:
//! - DOS date/time in the fixed headers (2 second resolution, 1980..=2107)
//! - NTFS ticks in the `0x000A` extra field (100ns units since 1601-01-01)
//! - Unix seconds in the extended timestamp (`0x5455`) extra field
//!
//! All of them convert through [`FileTime`], a millisecond count since the
//! Unix epoch. DOS times are interpreted as UTC.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MILLIS_PER_DAY: i64 = 86_400_000;

/// Milliseconds between 1601-01-01 and 1970-01-01.
const WINDOWS_EPOCH_OFFSET_MILLIS: i64 = 11_644_473_600_000;

/// DOS encoding used for any time before 1980-01-01 00:00:00.
pub const DOS_TIME_BEFORE_1980: u32 = (1 << 21) | (1 << 16);

/// A point in time with millisecond precision, relative to the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileTime(i64);

impl FileTime {
    /// Create a time from milliseconds since the Unix epoch.
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Milliseconds since the Unix epoch.
    #[inline]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Convert from a [`SystemTime`].
    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(after) => Self(after.as_millis() as i64),
            Err(before) => Self(-(before.duration().as_millis() as i64)),
        }
    }

    /// Convert to a [`SystemTime`].
    pub fn to_system_time(self) -> SystemTime {
        if self.0 >= 0 {
            UNIX_EPOCH + Duration::from_millis(self.0 as u64)
        } else {
            UNIX_EPOCH - Duration::from_millis(self.0.unsigned_abs())
        }
    }

    /// Decode a DOS date/time value.
    ///
    /// - Time: bits 0-4 = seconds/2, bits 5-10 = minutes, bits 11-15 = hours
    /// - Date: bits 16-20 = day, bits 21-24 = month, bits 25-31 = year-1980
    ///
    /// The fields are read as UTC wall-clock time, with no time zone
    /// applied. Tools that read them as local time see them shifted by the
    /// local offset; entries written here also carry an extended timestamp
    /// block holding the exact time.
    pub fn from_dos(datetime: u32) -> Self {
        let year = 1980 + ((datetime >> 25) & 0x7F) as i64;
        let month = ((datetime >> 21) & 0x0F).clamp(1, 12);
        let day = ((datetime >> 16) & 0x1F).max(1);
        let hour = ((datetime >> 11) & 0x1F) as i64;
        let minute = ((datetime >> 5) & 0x3F) as i64;
        let second = ((datetime & 0x1F) * 2) as i64;

        let days = days_from_civil(year, month, day);
        Self(days * MILLIS_PER_DAY + (hour * 3600 + minute * 60 + second) * 1000)
    }

    /// Encode as a DOS date/time value, clamping to the representable range.
    ///
    /// Fields are UTC wall-clock time, matching [`FileTime::from_dos`].
    pub fn to_dos(self) -> u32 {
        let days = self.0.div_euclid(MILLIS_PER_DAY);
        let secs_of_day = self.0.rem_euclid(MILLIS_PER_DAY) / 1000;
        let (year, month, day) = civil_from_days(days);

        if year < 1980 {
            return DOS_TIME_BEFORE_1980;
        }
        if year > 2107 {
            return dos_fields(2107, 12, 31, 23, 59, 58);
        }

        let hour = (secs_of_day / 3600) as u32;
        let minute = ((secs_of_day % 3600) / 60) as u32;
        let second = (secs_of_day % 60) as u32;
        dos_fields(year as u32, month, day, hour, minute, second)
    }

    /// Decode NTFS ticks (100ns intervals since 1601-01-01).
    pub fn from_ntfs(ticks: u64) -> Self {
        Self((ticks / 10_000) as i64 - WINDOWS_EPOCH_OFFSET_MILLIS)
    }

    /// Encode as NTFS ticks.
    pub fn to_ntfs(self) -> u64 {
        ((self.0 + WINDOWS_EPOCH_OFFSET_MILLIS).max(0) as u64) * 10_000
    }

    /// Decode Unix seconds as stored in the extended timestamp field.
    pub fn from_unix_secs(secs: u32) -> Self {
        Self(secs as i64 * 1000)
    }

    /// Encode as Unix seconds, saturating at the field's 32-bit range.
    pub fn to_unix_secs(self) -> u32 {
        (self.0.div_euclid(1000)).clamp(0, u32::MAX as i64) as u32
    }
}

impl From<SystemTime> for FileTime {
    fn from(time: SystemTime) -> Self {
        Self::from_system_time(time)
    }
}

impl From<FileTime> for SystemTime {
    fn from(time: FileTime) -> Self {
        time.to_system_time()
    }
}

fn dos_fields(year: u32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> u32 {
    ((year - 1980) << 25) | (month << 21) | (day << 16) | (hour << 11) | (minute << 5) | (second >> 1)
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = (if year >= 0 { year } else { year - 399 }) / 400;
    let yoe = year - era * 400;
    let month = month as i64;
    let doy = (153 * (if month > 2 { month - 3 } else { month + 9 }) + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Proleptic Gregorian date for a day count since 1970-01-01.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400;
    (if month <= 2 { year + 1 } else { year }, month, day)
}
