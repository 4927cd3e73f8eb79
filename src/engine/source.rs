use async_trait::async_trait;
use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::slots::{resolve_slots, ResolveOptions, SlotInputs};
use super::EngineError;

/// Read-only accessors the slot loader needs. Ranges are closed on both ends:
/// an item matches when `end >= range.start && start <= range.end`.
#[async_trait]
pub trait AvailabilitySource: Send + Sync {
    /// Rules in creation order.
    async fn list_rules(&self, page_id: Ulid) -> Result<Vec<AvailabilityRule>, EngineError>;

    async fn list_overrides(
        &self,
        page_id: Ulid,
        range: Span,
    ) -> Result<Vec<AvailabilityOverride>, EngineError>;

    /// Requested and accepted bookings only.
    async fn list_active_bookings(
        &self,
        page_id: Ulid,
        range: Span,
    ) -> Result<Vec<Booking>, EngineError>;

    async fn list_active_products(&self, page_id: Ulid) -> Result<Vec<BookingProduct>, EngineError>;
}

/// Fetch everything a page needs for the window and resolve it.
///
/// Overrides and bookings are fetched through the end of the last generated
/// day, so a booking late on the final day still blocks its slot.
pub async fn load_slots<S: AvailabilitySource + ?Sized>(
    source: &S,
    page: &BookingPage,
    product: &BookingProduct,
    window_start: NaiveDate,
    held: &[Span],
    options: &ResolveOptions,
) -> Result<Vec<Slot>, EngineError> {
    let range = options.fetch_range(window_start)?;
    let rules = source.list_rules(page.id).await?;
    let overrides = source.list_overrides(page.id, range).await?;
    let bookings = source.list_active_bookings(page.id, range).await?;

    let inputs = SlotInputs {
        rules: &rules,
        overrides: &overrides,
        bookings: &bookings,
        held,
        ..SlotInputs::new(page, product, window_start)
    };
    let slots = resolve_slots(&inputs, options)?;
    tracing::debug!(
        page = %page.id,
        product = %product.id,
        rules = rules.len(),
        overrides = overrides.len(),
        bookings = bookings.len(),
        slots = slots.len(),
        "resolved slots"
    );
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{self, DAY_MS};
    use crate::model::fixtures;
    use std::sync::Mutex;

    /// Vec-backed source that records the ranges it was asked for.
    #[derive(Default)]
    struct FakeSource {
        rules: Vec<AvailabilityRule>,
        overrides: Vec<AvailabilityOverride>,
        bookings: Vec<Booking>,
        products: Vec<BookingProduct>,
        ranges: Mutex<Vec<Span>>,
    }

    #[async_trait]
    impl AvailabilitySource for FakeSource {
        async fn list_rules(&self, page_id: Ulid) -> Result<Vec<AvailabilityRule>, EngineError> {
            Ok(self.rules.iter().filter(|r| r.page_id == page_id).cloned().collect())
        }

        async fn list_overrides(
            &self,
            page_id: Ulid,
            range: Span,
        ) -> Result<Vec<AvailabilityOverride>, EngineError> {
            self.ranges.lock().unwrap().push(range);
            Ok(self
                .overrides
                .iter()
                .filter(|o| o.page_id == page_id && o.span.touches(&range))
                .cloned()
                .collect())
        }

        async fn list_active_bookings(
            &self,
            page_id: Ulid,
            range: Span,
        ) -> Result<Vec<Booking>, EngineError> {
            Ok(self
                .bookings
                .iter()
                .filter(|b| b.page_id == page_id && b.status.is_blocking() && b.span.touches(&range))
                .cloned()
                .collect())
        }

        async fn list_active_products(&self, page_id: Ulid) -> Result<Vec<BookingProduct>, EngineError> {
            Ok(self
                .products
                .iter()
                .filter(|p| p.page_id == page_id && p.active)
                .cloned()
                .collect())
        }
    }

    fn product(page_id: Ulid) -> BookingProduct {
        BookingProduct {
            id: Ulid::new(),
            page_id,
            name: "Intro call".into(),
            description: None,
            duration_minutes: Some(60),
            active: true,
            price_cents: 5_000,
            currency: "GBP".into(),
            in_person: false,
            location: None,
        }
    }

    fn rule(page_id: Ulid, weekday: u8, start: &str, end: &str) -> AvailabilityRule {
        AvailabilityRule {
            id: Ulid::new(),
            page_id,
            weekday,
            start_time: start.into(),
            end_time: end.into(),
            valid_from: None,
            valid_to: None,
        }
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    #[tokio::test]
    async fn load_slots_resolves_fetched_inputs() {
        let page = fixtures::page("load");
        let product = product(page.id);
        let source = FakeSource {
            rules: vec![rule(page.id, 1, "09:00", "12:00")],
            products: vec![product.clone()],
            ..FakeSource::default()
        };
        let opts = ResolveOptions { window_days: 1, inclusive_end: false, dedup: false };
        let slots = load_slots(&source, &page, &product, monday(), &[], &opts).await.unwrap();
        assert_eq!(slots.len(), 2);
    }

    #[tokio::test]
    async fn load_slots_fetches_through_end_of_last_day() {
        let page = fixtures::page("range");
        let product = product(page.id);
        let last_day = NaiveDate::from_ymd_opt(2026, 11, 2).unwrap();
        let late = calendar::at_wall_time(last_day, "20:00").unwrap();
        let source = FakeSource {
            rules: vec![rule(page.id, 1, "19:00", "22:00")],
            bookings: vec![fixtures::booking(
                page.id,
                Span::new(late, late + 3_600_000),
                BookingStatus::Accepted,
            )],
            ..FakeSource::default()
        };

        let slots = load_slots(&source, &page, &product, monday(), &[], &ResolveOptions::default())
            .await
            .unwrap();

        let range = source.ranges.lock().unwrap()[0];
        assert_eq!(range.end, calendar::day_start_ms(last_day) + DAY_MS - 1);
        // The 20:15 slot on the last Monday overlaps the booking and is gone.
        let last: Vec<_> = slots.iter().filter(|s| s.date_key == "2026-11-02").collect();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].start, calendar::at_wall_time(last_day, "19:00").unwrap());
    }

    #[tokio::test]
    async fn load_slots_surfaces_validation_errors() {
        let page = fixtures::page("bad");
        let mut product = product(page.id);
        product.duration_minutes = Some(-30);
        let source = FakeSource {
            rules: vec![rule(page.id, 1, "09:00", "12:00")],
            ..FakeSource::default()
        };
        let result = load_slots(&source, &page, &product, monday(), &[], &ResolveOptions::default()).await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }
}
