use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::AuthSource;
use crate::calendar;
use crate::config::Config;
use crate::engine::{AvailabilitySource, Engine, EngineError, ResolveOptions, first_available_date};
use crate::limits::MAX_LINE_LEN;
use crate::model::{Event, Ms, Span};
use crate::notify::PAGE_BACKLOG;
use crate::observability::{self, op_label};
use crate::protocol::{Notification, ProtocolError, Reply, Request, SlotListing, parse_request};

/// Everything a connection needs; shared by all of them.
pub struct SlotbookHandler {
    engine: Arc<Engine>,
    auth: Arc<dyn AuthSource>,
    options: ResolveOptions,
    hold_ttl_ms: Ms,
}

impl SlotbookHandler {
    pub fn new(engine: Arc<Engine>, auth: Arc<dyn AuthSource>, config: &Config) -> Self {
        Self {
            engine,
            auth,
            options: config.resolve_options(),
            hold_ttl_ms: config.hold_ttl_ms(),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    async fn execute(&self, session: &mut Session, request: Request) -> Reply {
        let engine = &self.engine;
        match request {
            // Answered before dispatch.
            Request::Auth { .. } | Request::Ping => Reply::empty(),

            Request::CreatePage { owner_id, page } => {
                Reply::from_result(engine.create_page(owner_id, page).await)
            }
            Request::UpdatePage { id, page } => Reply::from_result(engine.update_page(id, page).await),
            Request::SetPageLive { id, live } => {
                Reply::from_result(engine.set_page_live(id, live).await)
            }
            Request::DeletePage { id } => Reply::from_result(engine.delete_page(id).await),
            Request::SlugAvailable { slug, page_id } => {
                Reply::from_result(engine.slug_available(&slug, page_id))
            }
            Request::GetPage { id } => Reply::from_result(engine.get_page(id).await),
            Request::ListPages { owner_id } => Reply::data(&engine.list_pages(owner_id).await),

            Request::AddProduct { page_id, product } => {
                Reply::from_result(engine.add_product(page_id, product).await)
            }
            Request::UpdateProduct { id, product } => {
                Reply::from_result(engine.update_product(id, product).await)
            }
            Request::SetProductActive { id, active } => {
                Reply::from_result(engine.set_product_active(id, active).await)
            }
            Request::RemoveProduct { id } => Reply::from_result(engine.remove_product(id).await),
            Request::ListProducts { page_id } => {
                Reply::from_result(engine.list_products(page_id).await)
            }

            Request::AddRule { page_id, rule } => Reply::from_result(engine.add_rule(page_id, rule).await),
            Request::RemoveRule { id } => Reply::from_result(engine.remove_rule(id).await),
            Request::ListRules { page_id } => Reply::from_result(engine.list_rules(page_id).await),
            Request::AddOverride { page_id, date, start_time, end_time, kind } => Reply::from_result(
                engine
                    .add_override_for_date(page_id, date, &start_time, &end_time, kind)
                    .await,
            ),
            Request::RemoveOverride { id } => Reply::from_result(engine.remove_override(id).await),
            Request::ListOverrides { page_id } => {
                Reply::from_result(engine.list_all_overrides(page_id).await)
            }

            Request::Slots { slug, product_id, from } => {
                let today = from.unwrap_or_else(calendar::local_today);
                let listing = engine
                    .public_slots(&slug, product_id, today, calendar::local_now_ms(), &self.options)
                    .await
                    .map(|(page, slots)| SlotListing {
                        first_available_date: first_available_date(&slots).map(str::to_owned),
                        page,
                        slots,
                    });
                Reply::from_result(listing)
            }
            Request::PlaceHold { page_id, start, end } => Reply::from_result(
                engine
                    .place_hold(page_id, Span { start, end }, self.hold_ttl_ms, calendar::local_now_ms())
                    .await,
            ),
            Request::ReleaseHold { id } => Reply::from_result(engine.release_hold(id).await),
            Request::RequestBooking { booking } => {
                Reply::from_result(engine.request_booking(booking, calendar::local_now_ms()).await)
            }
            Request::AcceptBooking { id } => Reply::from_result(engine.accept_booking(id).await),
            Request::DeclineBooking { id } => Reply::from_result(engine.decline_booking(id).await),
            Request::CancelBooking { id } => Reply::from_result(engine.cancel_booking(id).await),
            Request::ListRequests { page_id } => {
                Reply::from_result(engine.list_booking_requests(page_id).await)
            }
            Request::ListUpcoming { page_id } => Reply::from_result(
                engine.list_upcoming_sessions(page_id, calendar::local_now_ms()).await,
            ),
            Request::ListPast { page_id } => Reply::from_result(
                engine.list_past_sessions(page_id, calendar::local_now_ms()).await,
            ),

            Request::Listen { page_id } => Reply::from_result(session.listen(engine, page_id)),
            Request::Unlisten { page_id } => {
                session.unlisten(&page_id);
                Reply::empty()
            }
        }
    }

    /// Reply to one request line, and whether to hang up afterwards.
    async fn handle_line(&self, session: &mut Session, line: &str) -> (Reply, bool) {
        let request = match parse_request(line) {
            Ok(request) => request,
            Err(e) => {
                // Parse details are for authenticated clients only.
                let e = if session.authenticated { e } else { ProtocolError::Unauthenticated };
                metrics::counter!(observability::REQUESTS_TOTAL, "op" => "invalid", "status" => e.code())
                    .increment(1);
                return (Reply::error(e.code(), e.to_string()), false);
            }
        };

        let op = op_label(&request);
        let started = Instant::now();
        let (reply, close) = match request {
            Request::Ping => (Reply::ok(serde_json::Value::from("pong")), false),
            Request::Auth { password } => {
                if self.auth.verify(&password).await {
                    session.authenticated = true;
                    (Reply::empty(), false)
                } else {
                    metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                    warn!("password authentication failed");
                    (Reply::error("auth_failed", "password authentication failed"), true)
                }
            }
            _ if !session.authenticated => {
                let e = ProtocolError::Unauthenticated;
                (Reply::error(e.code(), e.to_string()), false)
            }
            request => (self.execute(session, request).await, false),
        };

        metrics::counter!(
            observability::REQUESTS_TOTAL,
            "op" => op,
            "status" => reply.status_label().to_owned()
        )
        .increment(1);
        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
            .record(started.elapsed().as_secs_f64());
        (reply, close)
    }
}

/// Per-connection state.
struct Session {
    authenticated: bool,
    /// One forwarding task per LISTENed page.
    listeners: HashMap<Ulid, JoinHandle<()>>,
    /// Shared by all forwarders; full while the client is not reading.
    events: mpsc::Sender<Event>,
}

impl Session {
    fn new(events: mpsc::Sender<Event>) -> Self {
        Self { authenticated: false, listeners: HashMap::new(), events }
    }

    fn listen(&mut self, engine: &Engine, page_id: Ulid) -> Result<(), EngineError> {
        if engine.get_page_state(&page_id).is_none() {
            return Err(EngineError::NotFound(page_id));
        }
        if self.listeners.get(&page_id).is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        let mut rx = engine.notify.subscribe(page_id);
        let tx = self.events.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        // Blocking here leaves the backlog in the broadcast, which lags.
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(page = %page_id, "listener lagged, dropped {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.listeners.insert(page_id, handle);
        debug!(page = %page_id, listeners = engine.notify.listeners(&page_id), "listening");
        Ok(())
    }

    fn unlisten(&mut self, page_id: &Ulid) {
        if let Some(handle) = self.listeners.remove(page_id) {
            handle.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for handle in self.listeners.values() {
            handle.abort();
        }
    }
}

/// Serve one client until it disconnects or fails authentication.
pub async fn process_connection(
    socket: TcpStream,
    handler: Arc<SlotbookHandler>,
) -> Result<(), ProtocolError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (event_tx, mut event_rx) = mpsc::channel(PAGE_BACKLOG);
    let mut session = Session::new(event_tx);

    loop {
        tokio::select! {
            incoming = framed.next() => {
                let line = match incoming {
                    None => break,
                    Some(Ok(line)) => line,
                    // The codec skips ahead to the next newline; the connection stays usable.
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let e = ProtocolError::TooLong;
                        framed.send(Reply::error(e.code(), e.to_string()).to_line()).await?;
                        continue;
                    }
                    Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let (reply, close) = handler.handle_line(&mut session, &line).await;
                framed.send(reply.to_line()).await?;
                if close {
                    break;
                }
            }
            Some(event) = event_rx.recv() => {
                framed.send(Notification { event }.to_line()?).await?;
            }
        }
    }

    debug!("connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyHub;

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn stalled_listener_queue_stays_bounded() {
        let dir = std::env::temp_dir().join(format!("slotbook_wire_test_{}", Ulid::new()));
        std::fs::create_dir_all(&dir).unwrap();
        let engine = Engine::new(dir.join("wire.wal"), Arc::new(NotifyHub::new())).unwrap();
        let page = engine
            .create_page(Ulid::new(), crate::engine::PageDraft { slug: "stalled".into(), ..Default::default() })
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(PAGE_BACKLOG);
        let mut session = Session::new(tx);
        session.listen(&engine, page.id).unwrap();
        settle().await;

        // Nobody drains `rx` while events keep coming.
        for round in 0..12 {
            for _ in 0..64 {
                engine.notify.send(page.id, &Event::PageLiveSet { id: page.id, live: round % 2 == 0 });
            }
            settle().await;
        }

        let mut queued = 0;
        while rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, PAGE_BACKLOG);

        session.unlisten(&page.id);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
