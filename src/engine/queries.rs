use async_trait::async_trait;
use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::slots::ResolveOptions;
use super::source::{load_slots, AvailabilitySource};
use super::{Engine, EngineError};

impl Engine {
    async fn read_page<T>(&self, page_id: Ulid, f: impl FnOnce(&PageState) -> T) -> Result<T, EngineError> {
        let ps = self.get_page_state(&page_id).ok_or(EngineError::NotFound(page_id))?;
        let guard = ps.read().await;
        Ok(f(&guard))
    }

    pub async fn get_page(&self, id: Ulid) -> Result<BookingPage, EngineError> {
        self.read_page(id, |ps| ps.page.clone()).await
    }

    /// Public lookup. Hidden pages look exactly like missing ones.
    pub async fn get_live_page_by_slug(&self, slug: &str) -> Result<BookingPage, EngineError> {
        let unknown = || EngineError::UnknownSlug(slug.to_string());
        let page_id = self.page_id_for_slug(slug).ok_or_else(unknown)?;
        let page = self.get_page(page_id).await.map_err(|_| unknown())?;
        if !page.live {
            return Err(unknown());
        }
        Ok(page)
    }

    /// Whether `slug` is free, or already belongs to `for_page`.
    pub fn slug_available(&self, slug: &str, for_page: Option<Ulid>) -> Result<bool, EngineError> {
        let slug = super::mutations::validate_slug(slug)?;
        Ok(match self.slugs.get(&slug) {
            None => true,
            Some(owner) => Some(*owner.value()) == for_page,
        })
    }

    /// Pages sorted by slug, optionally only those of one owner.
    pub async fn list_pages(&self, owner_id: Option<Ulid>) -> Vec<BookingPage> {
        let states: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut pages = Vec::with_capacity(states.len());
        for ps in states {
            let guard = ps.read().await;
            if owner_id.is_none_or(|owner| guard.page.owner_id == owner) {
                pages.push(guard.page.clone());
            }
        }
        pages.sort_by(|a, b| a.slug.cmp(&b.slug));
        pages
    }

    /// All products, active or not, in creation order.
    pub async fn list_products(&self, page_id: Ulid) -> Result<Vec<BookingProduct>, EngineError> {
        self.read_page(page_id, |ps| ps.products.clone()).await
    }

    pub async fn list_all_overrides(&self, page_id: Ulid) -> Result<Vec<AvailabilityOverride>, EngineError> {
        self.read_page(page_id, |ps| ps.overrides.clone()).await
    }

    pub async fn list_holds(&self, page_id: Ulid) -> Result<Vec<Hold>, EngineError> {
        self.read_page(page_id, |ps| ps.holds.clone()).await
    }

    /// Bookings waiting for the practitioner, earliest first.
    pub async fn list_booking_requests(&self, page_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        self.read_page(page_id, |ps| {
            ps.bookings
                .iter()
                .filter(|b| b.status == BookingStatus::Requested)
                .cloned()
                .collect()
        })
        .await
    }

    /// Accepted bookings that have not ended by `now`, earliest first.
    pub async fn list_upcoming_sessions(&self, page_id: Ulid, now: Ms) -> Result<Vec<Booking>, EngineError> {
        self.read_page(page_id, |ps| {
            ps.bookings
                .iter()
                .filter(|b| b.status == BookingStatus::Accepted && b.span.end > now)
                .cloned()
                .collect()
        })
        .await
    }

    /// Accepted bookings that ended by `now`, most recent first.
    pub async fn list_past_sessions(&self, page_id: Ulid, now: Ms) -> Result<Vec<Booking>, EngineError> {
        self.read_page(page_id, |ps| {
            ps.bookings
                .iter()
                .rev()
                .filter(|b| b.status == BookingStatus::Accepted && b.span.end <= now)
                .cloned()
                .collect()
        })
        .await
    }

    /// Slots for one active product, starting at `today`. Unexpired holds block too.
    pub async fn compute_slots(
        &self,
        page_id: Ulid,
        product_id: Ulid,
        today: NaiveDate,
        now: Ms,
        options: &ResolveOptions,
    ) -> Result<Vec<Slot>, EngineError> {
        let range = options.fetch_range(today)?;
        let (page, product, held) = {
            let ps = self.get_page_state(&page_id).ok_or(EngineError::NotFound(page_id))?;
            let guard = ps.read().await;
            let product = guard
                .product(product_id)
                .cloned()
                .ok_or(EngineError::NotFound(product_id))?;
            if !product.active {
                return Err(EngineError::ProductInactive(product_id));
            }
            let held: Vec<Span> = guard.active_holds(range, now).map(|h| h.span).collect();
            (guard.page.clone(), product, held)
        };

        let slots = load_slots(self, &page, &product, today, &held, options).await?;
        metrics::histogram!(crate::observability::SLOTS_RESOLVED).record(slots.len() as f64);
        Ok(slots)
    }

    /// What a client sees on a public page: live pages only.
    pub async fn public_slots(
        &self,
        slug: &str,
        product_id: Ulid,
        today: NaiveDate,
        now: Ms,
        options: &ResolveOptions,
    ) -> Result<(BookingPage, Vec<Slot>), EngineError> {
        let page = self.get_live_page_by_slug(slug).await?;
        let slots = self.compute_slots(page.id, product_id, today, now, options).await?;
        Ok((page, slots))
    }
}

#[async_trait]
impl AvailabilitySource for Engine {
    async fn list_rules(&self, page_id: Ulid) -> Result<Vec<AvailabilityRule>, EngineError> {
        self.read_page(page_id, |ps| ps.rules.clone()).await
    }

    async fn list_overrides(
        &self,
        page_id: Ulid,
        range: Span,
    ) -> Result<Vec<AvailabilityOverride>, EngineError> {
        self.read_page(page_id, |ps| touching(&ps.overrides, range).cloned().collect())
            .await
    }

    async fn list_active_bookings(
        &self,
        page_id: Ulid,
        range: Span,
    ) -> Result<Vec<Booking>, EngineError> {
        self.read_page(page_id, |ps| ps.blocking_bookings(range).cloned().collect())
            .await
    }

    async fn list_active_products(&self, page_id: Ulid) -> Result<Vec<BookingProduct>, EngineError> {
        self.read_page(page_id, |ps| ps.products.iter().filter(|p| p.active).cloned().collect())
            .await
    }
}
