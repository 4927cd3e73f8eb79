use crate::model::Ms;

pub const MAX_PAGES: usize = 100_000;
pub const MAX_PRODUCTS_PER_PAGE: usize = 100;
pub const MAX_RULES_PER_PAGE: usize = 500;
pub const MAX_OVERRIDES_PER_PAGE: usize = 10_000;
pub const MAX_BOOKINGS_PER_PAGE: usize = 100_000;
pub const MAX_HOLDS_PER_PAGE: usize = 1_000;

pub const MAX_SLUG_LEN: usize = 64;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_TEXT_LEN: usize = 4_000;

/// A full day, so a product can at most fill its rule window.
pub const MAX_DURATION_MINUTES: i64 = 24 * 60;
pub const MAX_GAP_MINUTES: i64 = 24 * 60;
pub const MAX_WINDOW_DAYS: u32 = 366;

/// 1970-01-01T00:00 local.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999 local.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
/// Overrides may cover a holiday; nothing else gets close.
pub const MAX_SPAN_DURATION_MS: Ms = 92 * 86_400_000;
pub const MAX_HOLD_TTL_MS: Ms = 3_600_000;

/// Longest accepted protocol line in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;
