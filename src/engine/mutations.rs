use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::calendar;
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_span};
use super::{normalize_slug, owned_ids, Engine, EngineError, ValidationError, WalCommand};

pub const DEFAULT_PAGE_TITLE: &str = "Session bookings";
pub const DEFAULT_PAGE_DESCRIPTION: &str = "Book time with me.";
pub const DEFAULT_CURRENCY: &str = "GBP";

/// Editable page settings. Blank title/description fall back to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDraft {
    pub slug: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub logo_url: Option<String>,
    pub min_gap_minutes: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDraft {
    pub name: String,
    pub description: Option<String>,
    pub duration_minutes: Option<i64>,
    #[serde(default)]
    pub price_cents: i64,
    pub currency: Option<String>,
    #[serde(default)]
    pub in_person: bool,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDraft {
    pub weekday: u8,
    pub start_time: String,
    pub end_time: String,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
}

/// A client's submission for one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub page_id: Ulid,
    pub product_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub client_name: String,
    pub client_email: String,
    #[serde(default)]
    pub client_notes: String,
    /// Hold placed when the client picked the slot. Consumed on success.
    pub hold_id: Option<Ulid>,
}

// ── Input validation ─────────────────────────────────────

/// Trim, lowercase and check `[a-z0-9-]{1,MAX_SLUG_LEN}`.
pub(super) fn validate_slug(slug: &str) -> Result<String, ValidationError> {
    let normalized = normalize_slug(slug);
    let well_formed = !normalized.is_empty()
        && normalized.len() <= MAX_SLUG_LEN
        && normalized
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if well_formed {
        Ok(normalized)
    } else {
        Err(ValidationError::BadSlug(slug.to_string()))
    }
}

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn check_opt_len(value: Option<&str>, max: usize, what: &'static str) -> Result<(), EngineError> {
    value.map_or(Ok(()), |v| check_len(v, max, what))
}

fn validate_gap(min_gap_minutes: Option<i64>) -> Result<(), EngineError> {
    match min_gap_minutes {
        Some(m) if m < 0 => Err(ValidationError::NegativeGap(m).into()),
        Some(m) if m > MAX_GAP_MINUTES => Err(EngineError::LimitExceeded("gap too long")),
        _ => Ok(()),
    }
}

fn validate_duration(duration_minutes: Option<i64>) -> Result<(), EngineError> {
    match duration_minutes {
        Some(m) if m <= 0 => Err(ValidationError::NonPositiveDuration(m).into()),
        Some(m) if m > MAX_DURATION_MINUTES => Err(EngineError::LimitExceeded("duration too long")),
        _ => Ok(()),
    }
}

/// `Some` only when there is something besides whitespace.
fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn required(value: &str, field: &'static str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(trimmed.to_string())
}

impl PageDraft {
    fn validate(&self) -> Result<String, EngineError> {
        let slug = validate_slug(&self.slug)?;
        check_opt_len(self.title.as_deref(), MAX_NAME_LEN, "page title too long")?;
        check_opt_len(self.description.as_deref(), MAX_TEXT_LEN, "page description too long")?;
        check_opt_len(self.logo_url.as_deref(), MAX_TEXT_LEN, "logo url too long")?;
        validate_gap(self.min_gap_minutes)?;
        Ok(slug)
    }

    fn into_page(self, id: Ulid, owner_id: Ulid, slug: String, live: bool) -> BookingPage {
        BookingPage {
            id,
            owner_id,
            slug,
            live,
            min_gap_minutes: self.min_gap_minutes,
            title: non_blank(self.title).unwrap_or_else(|| DEFAULT_PAGE_TITLE.to_string()),
            description: non_blank(self.description)
                .unwrap_or_else(|| DEFAULT_PAGE_DESCRIPTION.to_string()),
            logo_url: non_blank(self.logo_url),
        }
    }
}

impl ProductDraft {
    fn into_product(self, id: Ulid, page_id: Ulid, active: bool) -> Result<BookingProduct, EngineError> {
        let name = required(&self.name, "name")?;
        check_len(&name, MAX_NAME_LEN, "product name too long")?;
        check_opt_len(self.description.as_deref(), MAX_TEXT_LEN, "product description too long")?;
        check_opt_len(self.location.as_deref(), MAX_TEXT_LEN, "location too long")?;
        validate_duration(self.duration_minutes)?;
        if self.price_cents < 0 {
            return Err(EngineError::LimitExceeded("negative price"));
        }
        let currency = non_blank(self.currency)
            .map(|c| c.to_uppercase())
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
        check_len(&currency, 8, "currency code too long")?;
        Ok(BookingProduct {
            id,
            page_id,
            name,
            description: non_blank(self.description),
            duration_minutes: self.duration_minutes,
            active,
            price_cents: self.price_cents,
            currency,
            in_person: self.in_person,
            location: non_blank(self.location),
        })
    }
}

impl Engine {
    // ── Pages ────────────────────────────────────────────

    /// New pages start hidden; `set_page_live` publishes them.
    pub async fn create_page(&self, owner_id: Ulid, draft: PageDraft) -> Result<BookingPage, EngineError> {
        let slug = draft.validate()?;
        let _catalog = self.catalog.lock().await;
        if self.state.len() >= MAX_PAGES {
            return Err(EngineError::LimitExceeded("too many booking pages"));
        }
        if self.slugs.contains_key(&slug) {
            return Err(EngineError::SlugTaken(slug));
        }

        let page = draft.into_page(Ulid::new(), owner_id, slug, false);
        let event = Event::PageCreated { page: page.clone() };
        self.wal_append(std::slice::from_ref(&event)).await?;
        self.slugs.insert(page.slug.clone(), page.id);
        self.state
            .insert(page.id, Arc::new(RwLock::new(PageState::new(page.clone()))));
        self.notify.send(page.id, &event);
        tracing::info!(page = %page.id, slug = %page.slug, "booking page created");
        Ok(page)
    }

    /// Replace a page's settings. The live flag and owner are kept.
    pub async fn update_page(&self, id: Ulid, draft: PageDraft) -> Result<BookingPage, EngineError> {
        let slug = draft.validate()?;
        let _catalog = self.catalog.lock().await;
        let mut guard = self.write_page(id).await?;

        let holder = self.slugs.get(&slug).map(|e| *e.value());
        if holder.is_some_and(|owner| owner != id) {
            return Err(EngineError::SlugTaken(slug));
        }

        let old_slug = guard.page.slug.clone();
        let page = draft.into_page(id, guard.page.owner_id, slug, guard.page.live);
        let event = Event::PageUpdated { page: page.clone() };
        self.persist_and_apply(id, &mut guard, &[event]).await?;
        if old_slug != page.slug {
            self.slugs.remove(&old_slug);
            self.slugs.insert(page.slug.clone(), id);
        }
        Ok(page)
    }

    pub async fn set_page_live(&self, id: Ulid, live: bool) -> Result<(), EngineError> {
        let mut guard = self.write_page(id).await?;
        let event = Event::PageLiveSet { id, live };
        self.persist_and_apply(id, &mut guard, &[event]).await?;
        tracing::info!(page = %id, live, "booking page visibility changed");
        Ok(())
    }

    /// Drop a page and everything it owns.
    pub async fn delete_page(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        let guard = self.write_page(id).await?;

        let event = Event::PageDeleted { id };
        self.wal_append(std::slice::from_ref(&event)).await?;
        self.slugs.remove(&guard.page.slug);
        for owned in owned_ids(&guard) {
            self.entity_to_page.remove(&owned);
        }
        self.state.remove(&id);
        drop(guard);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        tracing::info!(page = %id, "booking page deleted");
        Ok(())
    }

    // ── Products ─────────────────────────────────────────

    pub async fn add_product(&self, page_id: Ulid, draft: ProductDraft) -> Result<BookingProduct, EngineError> {
        let product = draft.into_product(Ulid::new(), page_id, true)?;
        let mut guard = self.write_page(page_id).await?;
        if guard.products.len() >= MAX_PRODUCTS_PER_PAGE {
            return Err(EngineError::LimitExceeded("too many products on page"));
        }
        let event = Event::ProductAdded { product: product.clone() };
        self.persist_and_apply(page_id, &mut guard, &[event]).await?;
        Ok(product)
    }

    /// Replace a product's details. Its active flag is kept.
    pub async fn update_product(&self, id: Ulid, draft: ProductDraft) -> Result<BookingProduct, EngineError> {
        let (page_id, mut guard) = self.resolve_entity_write(&id).await?;
        let active = guard.product(id).ok_or(EngineError::NotFound(id))?.active;
        let product = draft.into_product(id, page_id, active)?;
        let event = Event::ProductUpdated { product: product.clone() };
        self.persist_and_apply(page_id, &mut guard, &[event]).await?;
        Ok(product)
    }

    pub async fn set_product_active(&self, id: Ulid, active: bool) -> Result<BookingProduct, EngineError> {
        let (page_id, mut guard) = self.resolve_entity_write(&id).await?;
        let mut product = guard.product(id).cloned().ok_or(EngineError::NotFound(id))?;
        product.active = active;
        let event = Event::ProductUpdated { product: product.clone() };
        self.persist_and_apply(page_id, &mut guard, &[event]).await?;
        Ok(product)
    }

    pub async fn remove_product(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (page_id, mut guard) = self.resolve_entity_write(&id).await?;
        if guard.product(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::ProductRemoved { id, page_id };
        self.persist_and_apply(page_id, &mut guard, &[event]).await?;
        Ok(page_id)
    }

    // ── Availability ─────────────────────────────────────

    /// Weekday and times are checked here so a bad rule never reaches the resolver.
    pub async fn add_rule(&self, page_id: Ulid, draft: RuleDraft) -> Result<AvailabilityRule, EngineError> {
        calendar::sunday_based_weekday(draft.weekday)?;
        calendar::parse_wall_time(&draft.start_time)?;
        calendar::parse_wall_time(&draft.end_time)?;

        let mut guard = self.write_page(page_id).await?;
        if guard.rules.len() >= MAX_RULES_PER_PAGE {
            return Err(EngineError::LimitExceeded("too many availability rules on page"));
        }
        let rule = AvailabilityRule {
            id: Ulid::new(),
            page_id,
            weekday: draft.weekday,
            start_time: draft.start_time.trim().to_string(),
            end_time: draft.end_time.trim().to_string(),
            valid_from: draft.valid_from,
            valid_to: draft.valid_to,
        };
        let event = Event::RuleAdded { rule: rule.clone() };
        self.persist_and_apply(page_id, &mut guard, &[event]).await?;
        Ok(rule)
    }

    pub async fn remove_rule(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (page_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.rules.iter().any(|r| r.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::RuleRemoved { id, page_id };
        self.persist_and_apply(page_id, &mut guard, &[event]).await?;
        Ok(page_id)
    }

    pub async fn add_override(
        &self,
        page_id: Ulid,
        span: Span,
        kind: OverrideKind,
    ) -> Result<AvailabilityOverride, EngineError> {
        validate_span(&span)?;
        let mut guard = self.write_page(page_id).await?;
        if guard.overrides.len() >= MAX_OVERRIDES_PER_PAGE {
            return Err(EngineError::LimitExceeded("too many overrides on page"));
        }
        let entry = AvailabilityOverride { id: Ulid::new(), page_id, span, kind };
        let event = Event::OverrideAdded { entry: entry.clone() };
        self.persist_and_apply(page_id, &mut guard, &[event]).await?;
        Ok(entry)
    }

    /// Override on one date between two `HH:MM` wall times.
    pub async fn add_override_for_date(
        &self,
        page_id: Ulid,
        date: NaiveDate,
        start_time: &str,
        end_time: &str,
        kind: OverrideKind,
    ) -> Result<AvailabilityOverride, EngineError> {
        let start = calendar::at_wall_time(date, start_time)?;
        let end = calendar::at_wall_time(date, end_time)?;
        self.add_override(page_id, Span { start, end }, kind).await
    }

    pub async fn remove_override(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (page_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.overrides.iter().any(|o| o.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::OverrideRemoved { id, page_id };
        self.persist_and_apply(page_id, &mut guard, &[event]).await?;
        Ok(page_id)
    }

    // ── Holds ────────────────────────────────────────────

    /// Reserve `span` on a live page for `ttl_ms`. Fails on any overlap with a
    /// blocking booking, another active hold, or an unavailable override.
    pub async fn place_hold(&self, page_id: Ulid, span: Span, ttl_ms: Ms, now: Ms) -> Result<Hold, EngineError> {
        validate_span(&span)?;
        if ttl_ms <= 0 || ttl_ms > MAX_HOLD_TTL_MS {
            return Err(EngineError::LimitExceeded("hold ttl out of range"));
        }
        let mut guard = self.write_page(page_id).await?;
        if !guard.page.live {
            return Err(EngineError::PageNotLive(page_id));
        }
        if guard.holds.len() >= MAX_HOLDS_PER_PAGE {
            return Err(EngineError::LimitExceeded("too many holds on page"));
        }

        check_no_conflict(&guard, &span, now, None)?;

        let hold = Hold { id: Ulid::new(), page_id, span, expires_at: now + ttl_ms };
        let event = Event::HoldPlaced { hold: hold.clone() };
        self.persist_and_apply(page_id, &mut guard, &[event]).await?;
        Ok(hold)
    }

    pub async fn release_hold(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (page_id, mut guard) = self.resolve_entity_write(&id).await?;
        if guard.hold(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::HoldReleased { id, page_id };
        self.persist_and_apply(page_id, &mut guard, &[event]).await?;
        Ok(page_id)
    }

    /// `(hold id, page id)` for every hold that has expired by `now`.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.state.iter() {
            let ps = entry.value().clone();
            // A page under a write lock is skipped and picked up on the next sweep.
            if let Ok(guard) = ps.try_read() {
                expired.extend(
                    guard
                        .holds
                        .iter()
                        .filter(|h| !h.is_active(now))
                        .map(|h| (h.id, guard.page.id)),
                );
            }
        }
        expired
    }

    // ── Bookings ─────────────────────────────────────────

    /// Store a `requested` booking for a slot on a live page.
    pub async fn request_booking(&self, req: BookingRequest, now: Ms) -> Result<Booking, EngineError> {
        let span = Span { start: req.start, end: req.end };
        validate_span(&span)?;
        let client_name = required(&req.client_name, "client_name")?;
        let client_email = required(&req.client_email, "client_email")?;
        check_len(&client_name, MAX_NAME_LEN, "client name too long")?;
        check_len(&client_email, MAX_NAME_LEN, "client email too long")?;
        check_len(&req.client_notes, MAX_TEXT_LEN, "client notes too long")?;

        let page_id = req.page_id;
        let mut guard = self.write_page(page_id).await?;
        if !guard.page.live {
            return Err(EngineError::PageNotLive(page_id));
        }
        let product = guard
            .product(req.product_id)
            .cloned()
            .ok_or(EngineError::NotFound(req.product_id))?;
        if !product.active {
            return Err(EngineError::ProductInactive(product.id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_PAGE {
            return Err(EngineError::LimitExceeded("too many bookings on page"));
        }

        if let Some(hold_id) = req.hold_id {
            let hold = guard.hold(hold_id).ok_or(EngineError::NotFound(hold_id))?;
            if !hold.is_active(now) {
                return Err(EngineError::HoldExpired(hold_id));
            }
            if !hold.span.contains_span(&span) {
                return Err(EngineError::HoldMismatch(hold_id));
            }
        }

        if self.settings.recheck_on_submit {
            check_no_conflict(&guard, &span, now, req.hold_id)?;
        }

        let booking = Booking {
            id: Ulid::new(),
            page_id,
            product_id: product.id,
            host_id: guard.page.owner_id,
            client_name,
            client_email,
            client_notes: req.client_notes.trim().to_string(),
            span,
            price_cents: product.price_cents,
            currency: product.currency,
            status: BookingStatus::Requested,
        };

        let mut events = vec![Event::BookingRequested { booking: booking.clone() }];
        if let Some(hold_id) = req.hold_id {
            events.push(Event::HoldReleased { id: hold_id, page_id });
        }
        self.persist_and_apply(page_id, &mut guard, &events).await?;
        metrics::counter!(crate::observability::BOOKINGS_REQUESTED_TOTAL).increment(1);
        tracing::info!(page = %page_id, booking = %booking.id, "booking requested");
        Ok(booking)
    }

    pub async fn accept_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::Accepted).await
    }

    pub async fn decline_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::Declined).await
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::Cancelled).await
    }

    async fn transition_booking(&self, id: Ulid, to: BookingStatus) -> Result<Booking, EngineError> {
        let (page_id, mut guard) = self.resolve_entity_write(&id).await?;
        let from = guard.booking(id).ok_or(EngineError::NotFound(id))?.status;
        if !from.can_become(to) {
            return Err(EngineError::InvalidTransition { id, from, to });
        }
        let event = Event::BookingStatusChanged { id, page_id, status: to };
        self.persist_and_apply(page_id, &mut guard, &[event]).await?;
        tracing::info!(booking = %id, %from, %to, "booking status changed");
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let pages: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for ps in pages {
            let guard = ps.read().await;
            events.push(Event::PageCreated { page: guard.page.clone() });
            events.extend(guard.products.iter().map(|p| Event::ProductAdded { product: p.clone() }));
            events.extend(guard.rules.iter().map(|r| Event::RuleAdded { rule: r.clone() }));
            events.extend(guard.overrides.iter().map(|o| Event::OverrideAdded { entry: o.clone() }));
            events.extend(guard.holds.iter().map(|h| Event::HoldPlaced { hold: h.clone() }));
            // The stored status rides along, so one event per booking is enough.
            events.extend(guard.bookings.iter().map(|b| Event::BookingRequested { booking: b.clone() }));
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
