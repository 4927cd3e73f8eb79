use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Local wall-clock milliseconds since 1970-01-01T00:00. The only time type.
/// No time zone is attached; every timestamp is read in the practitioner's local time.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Closed-range intersection used by the store's range queries:
    /// `end >= range.start && start <= range.end`.
    pub fn touches(&self, range: &Span) -> bool {
        self.end >= range.start && self.start <= range.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Requested,
    Accepted,
    Declined,
    Cancelled,
}

impl BookingStatus {
    /// Requested and accepted bookings occupy their interval.
    pub fn is_blocking(self) -> bool {
        matches!(self, BookingStatus::Requested | BookingStatus::Accepted)
    }

    pub fn can_become(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Requested, Accepted) | (Requested, Declined) | (Requested, Cancelled) | (Accepted, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Requested => "requested",
            BookingStatus::Accepted => "accepted",
            BookingStatus::Declined => "declined",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Override type. Only `Unavailable` is interpreted when generating slots;
/// `Available` is stored as written and otherwise ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideKind {
    #[default]
    Unavailable,
    Available,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingPage {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub slug: String,
    pub live: bool,
    /// `None` means the default gap of 15 minutes.
    pub min_gap_minutes: Option<i64>,
    pub title: String,
    pub description: String,
    pub logo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingProduct {
    pub id: Ulid,
    pub page_id: Ulid,
    pub name: String,
    pub description: Option<String>,
    /// `None` means the 60 minute fallback.
    pub duration_minutes: Option<i64>,
    pub active: bool,
    pub price_cents: i64,
    pub currency: String,
    pub in_person: bool,
    pub location: Option<String>,
}

/// Recurring weekly open hours. Times are `HH:MM` (or `HH:MM:SS`) wall-clock strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub id: Ulid,
    pub page_id: Ulid,
    /// ISO weekday, 1 = Monday .. 7 = Sunday. 0 is also read as Sunday.
    pub weekday: u8,
    pub start_time: String,
    pub end_time: String,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityOverride {
    pub id: Ulid,
    pub page_id: Ulid,
    pub span: Span,
    pub kind: OverrideKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub page_id: Ulid,
    pub product_id: Ulid,
    pub host_id: Ulid,
    pub client_name: String,
    pub client_email: String,
    pub client_notes: String,
    pub span: Span,
    pub price_cents: i64,
    pub currency: String,
    pub status: BookingStatus,
}

/// Short-lived reservation of a span while a client fills in the booking form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: Ulid,
    pub page_id: Ulid,
    pub span: Span,
    pub expires_at: Ms,
}

impl Hold {
    pub fn is_active(&self, now: Ms) -> bool {
        self.expires_at > now
    }
}

/// A candidate bookable interval. Derived on every resolution, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    /// `"{date_key}-{YYYY-MM-DDTHH:MM:SS}"`.
    pub id: String,
    /// `YYYY-MM-DD` of the day the slot starts on.
    pub date_key: String,
    pub start: Ms,
    pub end: Ms,
}

impl Slot {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

/// Anything stored on a page that occupies a span.
pub trait Timed {
    fn span(&self) -> Span;
}

impl Timed for AvailabilityOverride {
    fn span(&self) -> Span {
        self.span
    }
}

impl Timed for Booking {
    fn span(&self) -> Span {
        self.span
    }
}

impl Timed for Hold {
    fn span(&self) -> Span {
        self.span
    }
}

/// Insert maintaining sort order by `span.start`.
fn insert_sorted<T: Timed>(items: &mut Vec<T>, item: T) {
    let start = item.span().start;
    let pos = items.partition_point(|i| i.span().start <= start);
    items.insert(pos, item);
}

fn remove_by<T>(items: &mut Vec<T>, pred: impl Fn(&T) -> bool) -> Option<T> {
    let pos = items.iter().position(pred)?;
    Some(items.remove(pos))
}

/// Items whose span touches `range` (closed on both ends).
/// Binary search skips everything starting after `range.end`.
pub fn touching<T: Timed>(items: &[T], range: Span) -> impl Iterator<Item = &T> {
    let right_bound = items.partition_point(|i| i.span().start <= range.end);
    items[..right_bound]
        .iter()
        .filter(move |i| i.span().end >= range.start)
}

/// A booking page and everything it owns.
#[derive(Debug, Clone)]
pub struct PageState {
    pub page: BookingPage,
    /// Creation order.
    pub products: Vec<BookingProduct>,
    /// Creation order; slot output follows it.
    pub rules: Vec<AvailabilityRule>,
    /// Sorted by `span.start`.
    pub overrides: Vec<AvailabilityOverride>,
    /// Sorted by `span.start`.
    pub bookings: Vec<Booking>,
    /// Sorted by `span.start`.
    pub holds: Vec<Hold>,
}

impl PageState {
    pub fn new(page: BookingPage) -> Self {
        Self {
            page,
            products: Vec::new(),
            rules: Vec::new(),
            overrides: Vec::new(),
            bookings: Vec::new(),
            holds: Vec::new(),
        }
    }

    pub fn product(&self, id: Ulid) -> Option<&BookingProduct> {
        self.products.iter().find(|p| p.id == id)
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn hold(&self, id: Ulid) -> Option<&Hold> {
        self.holds.iter().find(|h| h.id == id)
    }

    pub fn upsert_product(&mut self, product: BookingProduct) {
        match self.products.iter_mut().find(|p| p.id == product.id) {
            Some(existing) => *existing = product,
            None => self.products.push(product),
        }
    }

    pub fn remove_product(&mut self, id: Ulid) -> Option<BookingProduct> {
        remove_by(&mut self.products, |p| p.id == id)
    }

    pub fn add_rule(&mut self, rule: AvailabilityRule) {
        self.rules.push(rule);
    }

    pub fn remove_rule(&mut self, id: Ulid) -> Option<AvailabilityRule> {
        remove_by(&mut self.rules, |r| r.id == id)
    }

    pub fn insert_override(&mut self, entry: AvailabilityOverride) {
        insert_sorted(&mut self.overrides, entry);
    }

    pub fn remove_override(&mut self, id: Ulid) -> Option<AvailabilityOverride> {
        remove_by(&mut self.overrides, |o| o.id == id)
    }

    pub fn insert_booking(&mut self, booking: Booking) {
        insert_sorted(&mut self.bookings, booking);
    }

    pub fn set_booking_status(&mut self, id: Ulid, status: BookingStatus) -> bool {
        match self.bookings.iter_mut().find(|b| b.id == id) {
            Some(b) => {
                b.status = status;
                true
            }
            None => false,
        }
    }

    pub fn insert_hold(&mut self, hold: Hold) {
        insert_sorted(&mut self.holds, hold);
    }

    pub fn remove_hold(&mut self, id: Ulid) -> Option<Hold> {
        remove_by(&mut self.holds, |h| h.id == id)
    }

    /// Requested/accepted bookings touching `range`.
    pub fn blocking_bookings(&self, range: Span) -> impl Iterator<Item = &Booking> {
        touching(&self.bookings, range).filter(|b| b.status.is_blocking())
    }

    /// Unexpired holds touching `range`.
    pub fn active_holds(&self, range: Span, now: Ms) -> impl Iterator<Item = &Hold> {
        touching(&self.holds, range).filter(move |h| h.is_active(now))
    }
}

/// Store events. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    PageCreated { page: BookingPage },
    PageUpdated { page: BookingPage },
    PageLiveSet { id: Ulid, live: bool },
    PageDeleted { id: Ulid },
    ProductAdded { product: BookingProduct },
    ProductUpdated { product: BookingProduct },
    ProductRemoved { id: Ulid, page_id: Ulid },
    RuleAdded { rule: AvailabilityRule },
    RuleRemoved { id: Ulid, page_id: Ulid },
    OverrideAdded { entry: AvailabilityOverride },
    OverrideRemoved { id: Ulid, page_id: Ulid },
    HoldPlaced { hold: Hold },
    HoldReleased { id: Ulid, page_id: Ulid },
    BookingRequested { booking: Booking },
    BookingStatusChanged { id: Ulid, page_id: Ulid, status: BookingStatus },
}

impl Event {
    /// The page every event belongs to.
    pub fn page_id(&self) -> Ulid {
        match self {
            Event::PageCreated { page } | Event::PageUpdated { page } => page.id,
            Event::PageLiveSet { id, .. } | Event::PageDeleted { id } => *id,
            Event::ProductAdded { product } | Event::ProductUpdated { product } => product.page_id,
            Event::RuleAdded { rule } => rule.page_id,
            Event::OverrideAdded { entry } => entry.page_id,
            Event::HoldPlaced { hold } => hold.page_id,
            Event::BookingRequested { booking } => booking.page_id,
            Event::ProductRemoved { page_id, .. }
            | Event::RuleRemoved { page_id, .. }
            | Event::OverrideRemoved { page_id, .. }
            | Event::HoldReleased { page_id, .. }
            | Event::BookingStatusChanged { page_id, .. } => *page_id,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn page(slug: &str) -> BookingPage {
        BookingPage {
            id: Ulid::new(),
            owner_id: Ulid::new(),
            slug: slug.to_string(),
            live: true,
            min_gap_minutes: None,
            title: "Session bookings".into(),
            description: "Book time with me.".into(),
            logo_url: None,
        }
    }

    pub fn booking(page_id: Ulid, span: Span, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            page_id,
            product_id: Ulid::new(),
            host_id: Ulid::new(),
            client_name: "Ada".into(),
            client_email: "ada@example.com".into(),
            client_notes: String::new(),
            span,
            price_cents: 0,
            currency: "GBP".into(),
            status,
        }
    }

    pub fn hold(page_id: Ulid, span: Span, expires_at: Ms) -> Hold {
        Hold { id: Ulid::new(), page_id, span, expires_at }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        assert!(outer.contains_span(&Span::new(150, 300)));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&Span::new(50, 200)));
    }

    #[test]
    fn span_touches_is_closed() {
        let range = Span::new(200, 300);
        assert!(Span::new(100, 200).touches(&range));
        assert!(Span::new(300, 400).touches(&range));
        assert!(!Span::new(100, 199).touches(&range));
    }

    #[test]
    fn status_blocking_and_transitions() {
        assert!(BookingStatus::Requested.is_blocking());
        assert!(BookingStatus::Accepted.is_blocking());
        assert!(!BookingStatus::Declined.is_blocking());
        assert!(!BookingStatus::Cancelled.is_blocking());

        assert!(BookingStatus::Requested.can_become(BookingStatus::Accepted));
        assert!(BookingStatus::Accepted.can_become(BookingStatus::Cancelled));
        assert!(!BookingStatus::Accepted.can_become(BookingStatus::Declined));
        assert!(!BookingStatus::Declined.can_become(BookingStatus::Accepted));
        assert!(!BookingStatus::Cancelled.can_become(BookingStatus::Requested));
    }

    #[test]
    fn bookings_stay_sorted() {
        let mut ps = PageState::new(page("sorted"));
        let pid = ps.page.id;
        ps.insert_booking(booking(pid, Span::new(300, 400), BookingStatus::Accepted));
        ps.insert_booking(booking(pid, Span::new(100, 200), BookingStatus::Requested));
        ps.insert_booking(booking(pid, Span::new(200, 300), BookingStatus::Requested));
        let starts: Vec<Ms> = ps.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn touching_skips_later_and_earlier() {
        let mut ps = PageState::new(page("touch"));
        let pid = ps.page.id;
        ps.insert_booking(booking(pid, Span::new(100, 200), BookingStatus::Accepted));
        ps.insert_booking(booking(pid, Span::new(450, 600), BookingStatus::Accepted));
        ps.insert_booking(booking(pid, Span::new(1000, 1100), BookingStatus::Accepted));

        let hits: Vec<_> = touching(&ps.bookings, Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn blocking_bookings_skip_declined() {
        let mut ps = PageState::new(page("declined"));
        let pid = ps.page.id;
        ps.insert_booking(booking(pid, Span::new(100, 200), BookingStatus::Declined));
        ps.insert_booking(booking(pid, Span::new(150, 250), BookingStatus::Requested));
        let hits: Vec<_> = ps.blocking_bookings(Span::new(0, 1000)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].status, BookingStatus::Requested);
    }

    #[test]
    fn active_holds_respect_expiry() {
        let mut ps = PageState::new(page("holds"));
        let pid = ps.page.id;
        ps.insert_hold(hold(pid, Span::new(100, 200), 50));
        ps.insert_hold(hold(pid, Span::new(300, 400), 5_000));
        let active: Vec<_> = ps.active_holds(Span::new(0, 1000), 1_000).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].span, Span::new(300, 400));
    }

    #[test]
    fn remove_missing_returns_none() {
        let mut ps = PageState::new(page("remove"));
        assert!(ps.remove_rule(Ulid::new()).is_none());
        assert!(ps.remove_hold(Ulid::new()).is_none());
        assert!(!ps.set_booking_status(Ulid::new(), BookingStatus::Accepted));
    }

    #[test]
    fn event_page_id() {
        let p = page("evt");
        let created = Event::PageCreated { page: p.clone() };
        assert_eq!(created.page_id(), p.id);
        let changed = Event::BookingStatusChanged {
            id: Ulid::new(),
            page_id: p.id,
            status: BookingStatus::Accepted,
        };
        assert_eq!(changed.page_id(), p.id);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::PageCreated { page: page("roundtrip") };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
