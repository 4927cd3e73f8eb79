use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{EngineError, ValidationError};

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(ValidationError::BadSpan { start: span.start, end: span.end }.into());
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Fail with the id of the first thing that makes `span` unbookable: a
/// requested/accepted booking, an unexpired hold other than `own_hold`, or an
/// `unavailable` override. Touching endpoints are fine.
pub(crate) fn check_no_conflict(
    ps: &PageState,
    span: &Span,
    now: Ms,
    own_hold: Option<Ulid>,
) -> Result<(), EngineError> {
    if let Some(b) = ps.blocking_bookings(*span).find(|b| b.span.overlaps(span)) {
        return Err(EngineError::Conflict(b.id));
    }
    if let Some(h) = ps
        .active_holds(*span, now)
        .find(|h| Some(h.id) != own_hold && h.span.overlaps(span))
    {
        return Err(EngineError::Conflict(h.id));
    }
    if let Some(o) = touching(&ps.overrides, *span)
        .find(|o| o.kind == OverrideKind::Unavailable && o.span.overlaps(span))
    {
        return Err(EngineError::Conflict(o.id));
    }
    Ok(())
}
