use ulid::Ulid;

use crate::model::{BookingStatus, Ms};

/// Malformed input. Always surfaced to the caller; nothing is silently coerced
/// except a missing product duration (60 minutes) and a missing gap (15 minutes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    BadTime(String),
    BadWeekday(u8),
    NonPositiveDuration(i64),
    NegativeGap(i64),
    BadWindow(u32),
    BadSpan { start: Ms, end: Ms },
    BadSlug(String),
    MissingField(&'static str),
    DateOutOfRange,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::BadTime(s) => write!(f, "malformed wall time: {s:?} (expected HH:MM)"),
            ValidationError::BadWeekday(d) => write!(f, "weekday {d} out of range (expected 1..=7)"),
            ValidationError::NonPositiveDuration(m) => {
                write!(f, "duration must be positive, got {m} minutes")
            }
            ValidationError::NegativeGap(m) => write!(f, "gap must not be negative, got {m} minutes"),
            ValidationError::BadWindow(days) => write!(f, "invalid window of {days} days"),
            ValidationError::BadSpan { start, end } => write!(f, "invalid span [{start}, {end})"),
            ValidationError::BadSlug(s) => write!(f, "invalid slug: {s:?}"),
            ValidationError::MissingField(name) => write!(f, "missing required field: {name}"),
            ValidationError::DateOutOfRange => write!(f, "date out of range"),
        }
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    UnknownSlug(String),
    SlugTaken(String),
    PageNotLive(Ulid),
    ProductInactive(Ulid),
    Conflict(Ulid),
    HoldExpired(Ulid),
    HoldMismatch(Ulid),
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    Validation(ValidationError),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Short machine-readable code for protocol responses and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) | EngineError::UnknownSlug(_) => "not_found",
            EngineError::SlugTaken(_) => "slug_taken",
            EngineError::PageNotLive(_) => "page_not_live",
            EngineError::ProductInactive(_) => "product_inactive",
            EngineError::Conflict(_) => "conflict",
            EngineError::HoldExpired(_) | EngineError::HoldMismatch(_) => "hold_invalid",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::Validation(_) => "validation",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "storage",
        }
    }
}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        EngineError::Validation(e)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::UnknownSlug(slug) => write!(f, "no live booking page at {slug:?}"),
            EngineError::SlugTaken(slug) => write!(f, "slug already taken: {slug}"),
            EngineError::PageNotLive(id) => write!(f, "booking page {id} is not live"),
            EngineError::ProductInactive(id) => write!(f, "product {id} is not active"),
            EngineError::Conflict(id) => write!(f, "conflict with: {id}"),
            EngineError::HoldExpired(id) => write!(f, "hold {id} has expired"),
            EngineError::HoldMismatch(id) => {
                write!(f, "hold {id} does not cover the requested slot")
            }
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "booking {id} cannot go from {from} to {to}")
            }
            EngineError::Validation(e) => write!(f, "validation error: {e}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Validation(e) => Some(e),
            _ => None,
        }
    }
}
