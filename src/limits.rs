use crate::model::Ms;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// A single window may not span more than a day.
pub const MAX_WINDOW_DURATION_MS: Ms = 24 * 3_600_000;

pub const MAX_IDENTITY_LEN: usize = 256;
pub const MAX_WINDOWS_PER_OWNER: usize = 50_000;
pub const MAX_BATCH_SIZE: usize = 1_000;

/// Calendar queries are limited to years chrono can represent comfortably.
pub const MIN_CALENDAR_YEAR: i32 = 1970;
pub const MAX_CALENDAR_YEAR: i32 = 9999;

/// UTC offsets beyond ±18h don't exist.
pub const MAX_UTC_OFFSET_MINUTES: i32 = 18 * 60;
