use std::collections::{BTreeMap, HashSet};

use chrono::{Days, NaiveDate};

use crate::calendar::{self, DAY_MS, MINUTE_MS};
use crate::limits::MAX_WINDOW_DAYS;
use crate::model::*;

use super::error::ValidationError;

pub const DEFAULT_DURATION_MINUTES: i64 = 60;
pub const DEFAULT_MIN_GAP_MINUTES: i64 = 15;
pub const DEFAULT_WINDOW_DAYS: u32 = 14;

// ── Slot Generation ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOptions {
    pub window_days: u32,
    /// Generate the day at `window_start + window_days` too (15 days for a
    /// 14 day window). On by default; this is how public pages have always behaved.
    pub inclusive_end: bool,
    /// Drop repeated slots when rules for the same day overlap.
    pub dedup: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            window_days: DEFAULT_WINDOW_DAYS,
            inclusive_end: true,
            dedup: false,
        }
    }
}

impl ResolveOptions {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.window_days == 0 || self.window_days > MAX_WINDOW_DAYS {
            return Err(ValidationError::BadWindow(self.window_days));
        }
        Ok(())
    }

    /// Number of calendar days that get slots.
    pub fn days_covered(&self) -> u32 {
        if self.inclusive_end {
            self.window_days + 1
        } else {
            self.window_days
        }
    }

    /// Local span from `window_start` midnight to the last millisecond of the
    /// last generated day. Callers fetch overrides and bookings over this range.
    pub fn fetch_range(&self, window_start: NaiveDate) -> Result<Span, ValidationError> {
        self.validate()?;
        let last_day = window_start
            .checked_add_days(Days::new(u64::from(self.days_covered() - 1)))
            .ok_or(ValidationError::DateOutOfRange)?;
        Ok(Span::new(
            calendar::day_start_ms(window_start),
            calendar::day_start_ms(last_day) + DAY_MS - 1,
        ))
    }
}

/// Everything one resolution needs, passed explicitly.
#[derive(Debug, Clone)]
pub struct SlotInputs<'a> {
    /// `None` means 15.
    pub min_gap_minutes: Option<i64>,
    /// `None` means 60.
    pub duration_minutes: Option<i64>,
    pub rules: &'a [AvailabilityRule],
    pub overrides: &'a [AvailabilityOverride],
    /// Bookings of any status; only requested/accepted ones block.
    pub bookings: &'a [Booking],
    /// Spans held by unexpired reservation holds.
    pub held: &'a [Span],
    /// First calendar day to consider (local midnight).
    pub window_start: NaiveDate,
}

impl<'a> SlotInputs<'a> {
    /// Inputs for `product` on `page` with no rules, overrides or bookings yet.
    pub fn new(page: &BookingPage, product: &BookingProduct, window_start: NaiveDate) -> Self {
        Self {
            min_gap_minutes: page.min_gap_minutes,
            duration_minutes: product.duration_minutes,
            rules: &[],
            overrides: &[],
            bookings: &[],
            held: &[],
            window_start,
        }
    }
}

pub fn effective_duration(duration_minutes: Option<i64>) -> Result<i64, ValidationError> {
    match duration_minutes {
        None => Ok(DEFAULT_DURATION_MINUTES),
        Some(m) if m > 0 => Ok(m),
        Some(m) => Err(ValidationError::NonPositiveDuration(m)),
    }
}

pub fn effective_gap(min_gap_minutes: Option<i64>) -> Result<i64, ValidationError> {
    match min_gap_minutes {
        None => Ok(DEFAULT_MIN_GAP_MINUTES),
        Some(m) if m >= 0 => Ok(m),
        Some(m) => Err(ValidationError::NegativeGap(m)),
    }
}

fn minutes_to_ms(minutes: i64) -> Result<Ms, ValidationError> {
    minutes.checked_mul(MINUTE_MS).ok_or(ValidationError::DateOutOfRange)
}

/// A rule with its strings parsed once per resolution.
struct DayRule {
    weekday: u32,
    start_minute: i64,
    end_minute: i64,
    valid_from: Option<NaiveDate>,
    valid_to: Option<NaiveDate>,
}

impl DayRule {
    fn parse(rule: &AvailabilityRule) -> Result<Self, ValidationError> {
        Ok(Self {
            weekday: calendar::sunday_based_weekday(rule.weekday)?,
            start_minute: calendar::parse_wall_time(&rule.start_time)?,
            end_minute: calendar::parse_wall_time(&rule.end_time)?,
            valid_from: rule.valid_from,
            valid_to: rule.valid_to,
        })
    }

    fn applies_on(&self, day: NaiveDate, weekday: u32) -> bool {
        self.weekday == weekday
            && self.valid_from.is_none_or(|from| day >= from)
            && self.valid_to.is_none_or(|to| day <= to)
    }
}

/// An `unavailable` override with the calendar days it is filed under.
struct Blackout {
    span: Span,
    first_day: NaiveDate,
    last_day: NaiveDate,
}

impl Blackout {
    fn covers_day(&self, day: NaiveDate) -> bool {
        self.first_day <= day && day <= self.last_day
    }

    fn blocks_whole_day(&self, day_start: Ms) -> bool {
        self.span.start <= day_start && self.span.end >= day_start + DAY_MS - 1
    }
}

/// Compute the bookable slots for a window.
///
/// For every day: pick the rules for that weekday that are valid on the date,
/// skip the day if an `unavailable` override blocks all of it, then walk each
/// rule from its start in steps of `duration + gap`, keeping candidates that
/// end by the rule's end and overlap no partial override, blocking booking or
/// active hold. Output is day-major, then rule order, then chronological.
pub fn resolve_slots(
    inputs: &SlotInputs<'_>,
    options: &ResolveOptions,
) -> Result<Vec<Slot>, ValidationError> {
    options.validate()?;
    let duration = minutes_to_ms(effective_duration(inputs.duration_minutes)?)?;
    let step = minutes_to_ms(effective_gap(inputs.min_gap_minutes)?)?
        .checked_add(duration)
        .ok_or(ValidationError::DateOutOfRange)?;

    // Parse everything up front so a malformed rule fails even on days it would not apply.
    let rules = inputs
        .rules
        .iter()
        .map(DayRule::parse)
        .collect::<Result<Vec<_>, _>>()?;

    let mut blackouts = Vec::new();
    for o in inputs.overrides.iter().filter(|o| o.kind == OverrideKind::Unavailable) {
        blackouts.push(Blackout {
            span: o.span,
            first_day: calendar::date_of(o.span.start)?,
            last_day: calendar::date_of(o.span.end)?,
        });
    }

    let busy: Vec<Span> = inputs
        .bookings
        .iter()
        .filter(|b| b.status.is_blocking())
        .map(|b| b.span)
        .chain(inputs.held.iter().copied())
        .collect();

    let mut slots = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for offset in 0..options.days_covered() {
        let day = inputs
            .window_start
            .checked_add_days(Days::new(u64::from(offset)))
            .ok_or(ValidationError::DateOutOfRange)?;
        let day_start = calendar::day_start_ms(day);
        let weekday = calendar::weekday_of(day);

        let day_blackouts: Vec<&Blackout> = blackouts.iter().filter(|b| b.covers_day(day)).collect();
        if day_blackouts.iter().any(|b| b.blocks_whole_day(day_start)) {
            continue;
        }

        let date_key = calendar::date_key(day);
        for rule in rules.iter().filter(|r| r.applies_on(day, weekday)) {
            let rule_end = day_start + rule.end_minute * MINUTE_MS;
            let mut slot_start = day_start + rule.start_minute * MINUTE_MS;

            while let Some(slot_end) = slot_start.checked_add(duration).filter(|&e| e <= rule_end) {
                let candidate = Span::new(slot_start, slot_end);
                slot_start = slot_start.checked_add(step).ok_or(ValidationError::DateOutOfRange)?;

                if day_blackouts.iter().any(|b| b.span.overlaps(&candidate))
                    || busy.iter().any(|b| b.overlaps(&candidate))
                {
                    continue;
                }

                let slot = Slot {
                    id: format!("{date_key}-{}", calendar::format_iso(candidate.start)),
                    date_key: date_key.clone(),
                    start: candidate.start,
                    end: candidate.end,
                };
                if options.dedup && !seen.insert(slot.id.clone()) {
                    continue;
                }
                slots.push(slot);
            }
        }
    }

    Ok(slots)
}

/// Group slots by date key, keeping each day's slots in output order.
pub fn slots_by_date(slots: &[Slot]) -> BTreeMap<&str, Vec<&Slot>> {
    let mut by_date: BTreeMap<&str, Vec<&Slot>> = BTreeMap::new();
    for slot in slots {
        by_date.entry(slot.date_key.as_str()).or_default().push(slot);
    }
    by_date
}

/// The earliest day with at least one slot, which public pages preselect.
pub fn first_available_date(slots: &[Slot]) -> Option<&str> {
    slots.iter().map(|s| s.date_key.as_str()).min()
}
