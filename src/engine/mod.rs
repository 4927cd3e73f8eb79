mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;
mod source;

pub use error::{EngineError, ValidationError};
pub use mutations::{BookingRequest, PageDraft, ProductDraft, RuleDraft};
pub use slots::{
    effective_duration, effective_gap, first_available_date, resolve_slots, slots_by_date,
    ResolveOptions, SlotInputs, DEFAULT_DURATION_MINUTES, DEFAULT_MIN_GAP_MINUTES,
    DEFAULT_WINDOW_DAYS,
};
pub use source::{load_slots, AvailabilitySource};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedPageState = Arc<RwLock<PageState>>;

/// Engine behavior switches that come from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Re-check a submitted slot against bookings, holds and overrides under
    /// the page write lock. Off reproduces the plain insert.
    pub recheck_on_submit: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self { recheck_on_submit: true }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// Events of one mutation. They land in the same fsync.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends (the batch window).
/// 3. Single flush_sync for the whole batch.
/// 4. Respond to every sender with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed: {e}");
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    'outer: for (events, _) in batch {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                append_err = Some(e);
                break 'outer;
            }
        }
    }
    // Flush even after an append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => {
            let mut batch = vec![(events, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// In-memory store of booking pages, persisted through the WAL.
pub struct Engine {
    pub state: DashMap<Ulid, SharedPageState>,
    /// Normalized slug → page id.
    pub(super) slugs: DashMap<String, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: entity (product/rule/override/hold/booking) id → page id
    pub(super) entity_to_page: DashMap<Ulid, Ulid>,
    /// Serializes page create/update/delete so slug checks and inserts are atomic.
    pub(super) catalog: Mutex<()>,
    pub(super) settings: EngineSettings,
}

/// Apply an event directly to a PageState. The caller holds the write lock.
/// Page creation and deletion happen at the map level, not here.
fn apply_to_page(ps: &mut PageState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::PageUpdated { page } => ps.page = page.clone(),
        Event::PageLiveSet { live, .. } => ps.page.live = *live,
        Event::ProductAdded { product } | Event::ProductUpdated { product } => {
            entity_map.insert(product.id, product.page_id);
            ps.upsert_product(product.clone());
        }
        Event::ProductRemoved { id, .. } => {
            ps.remove_product(*id);
            entity_map.remove(id);
        }
        Event::RuleAdded { rule } => {
            entity_map.insert(rule.id, rule.page_id);
            ps.add_rule(rule.clone());
        }
        Event::RuleRemoved { id, .. } => {
            ps.remove_rule(*id);
            entity_map.remove(id);
        }
        Event::OverrideAdded { entry } => {
            entity_map.insert(entry.id, entry.page_id);
            ps.insert_override(entry.clone());
        }
        Event::OverrideRemoved { id, .. } => {
            ps.remove_override(*id);
            entity_map.remove(id);
        }
        Event::HoldPlaced { hold } => {
            entity_map.insert(hold.id, hold.page_id);
            ps.insert_hold(hold.clone());
        }
        Event::HoldReleased { id, .. } => {
            ps.remove_hold(*id);
            entity_map.remove(id);
        }
        Event::BookingRequested { booking } => {
            entity_map.insert(booking.id, booking.page_id);
            ps.insert_booking(booking.clone());
        }
        Event::BookingStatusChanged { id, status, .. } => {
            ps.set_booking_status(*id, *status);
        }
        Event::PageCreated { .. } | Event::PageDeleted { .. } => {}
    }
}

/// Every id a page owns, for dropping reverse-lookup entries on delete.
fn owned_ids(ps: &PageState) -> impl Iterator<Item = Ulid> + '_ {
    ps.products
        .iter()
        .map(|p| p.id)
        .chain(ps.rules.iter().map(|r| r.id))
        .chain(ps.overrides.iter().map(|o| o.id))
        .chain(ps.holds.iter().map(|h| h.id))
        .chain(ps.bookings.iter().map(|b| b.id))
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_settings(wal_path, notify, EngineSettings::default())
    }

    pub fn with_settings(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        settings: EngineSettings,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            slugs: DashMap::new(),
            wal_tx,
            notify,
            entity_to_page: DashMap::new(),
            catalog: Mutex::new(()),
            settings,
        };

        // Replay into plain values first; nothing else can see them yet.
        let mut pages: HashMap<Ulid, PageState> = HashMap::new();
        for event in &events {
            match event {
                Event::PageCreated { page } => {
                    engine.slugs.insert(page.slug.clone(), page.id);
                    pages.insert(page.id, PageState::new(page.clone()));
                }
                Event::PageDeleted { id } => {
                    if let Some(ps) = pages.remove(id) {
                        engine.slugs.remove(&ps.page.slug);
                        for owned in owned_ids(&ps) {
                            engine.entity_to_page.remove(&owned);
                        }
                    }
                }
                other => {
                    let Some(ps) = pages.get_mut(&other.page_id()) else {
                        tracing::warn!("WAL replay: event for unknown page {}", other.page_id());
                        continue;
                    };
                    if let Event::PageUpdated { page } = other
                        && page.slug != ps.page.slug
                    {
                        engine.slugs.remove(&ps.page.slug);
                        engine.slugs.insert(page.slug.clone(), page.id);
                    }
                    apply_to_page(ps, other, &engine.entity_to_page);
                }
            }
        }
        for (id, ps) in pages {
            engine.state.insert(id, Arc::new(RwLock::new(ps)));
        }

        tracing::info!(
            "replayed {} WAL events into {} booking pages",
            events.len(),
            engine.state.len()
        );
        Ok(engine)
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    /// Write events to the WAL via the background group-commit writer.
    async fn wal_append(&self, events: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_page_state(&self, id: &Ulid) -> Option<SharedPageState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_page_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_page.get(entity_id).map(|e| *e.value())
    }

    pub fn page_id_for_slug(&self, slug: &str) -> Option<Ulid> {
        self.slugs.get(&normalize_slug(slug)).map(|e| *e.value())
    }

    /// WAL-append + apply + notify for one mutation.
    pub(super) async fn persist_and_apply(
        &self,
        page_id: Ulid,
        ps: &mut PageState,
        events: &[Event],
    ) -> Result<(), EngineError> {
        self.wal_append(events).await?;
        for event in events {
            apply_to_page(ps, event, &self.entity_to_page);
            self.notify.send(page_id, event);
        }
        Ok(())
    }

    /// Lookup entity → page, then `write_page`.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<PageState>), EngineError> {
        let page_id = self
            .get_page_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let guard = self.write_page(page_id).await?;
        Ok((page_id, guard))
    }

    /// Write-lock a page. A page deleted while the caller waited for the lock
    /// is `NotFound`; its orphaned state must never take new events.
    pub(super) async fn write_page(
        &self,
        page_id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<PageState>, EngineError> {
        let ps = self
            .get_page_state(&page_id)
            .ok_or(EngineError::NotFound(page_id))?;
        let guard = ps.clone().write_owned().await;
        let current = self
            .state
            .get(&page_id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), &ps));
        if !current {
            return Err(EngineError::NotFound(page_id));
        }
        Ok(guard)
    }
}

/// Slugs are compared after trimming and lowercasing.
pub fn normalize_slug(slug: &str) -> String {
    slug.trim().to_lowercase()
}
