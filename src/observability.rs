use std::net::SocketAddr;

use crate::protocol::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "slotbook_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "slotbook_request_duration_seconds";

/// Histogram: slots produced per resolution.
pub const SLOTS_RESOLVED: &str = "slotbook_slots_resolved";

/// Counter: bookings requested.
pub const BOOKINGS_REQUESTED_TOTAL: &str = "slotbook_bookings_requested_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Counter: failed password checks.
pub const AUTH_FAILURES_TOTAL: &str = "slotbook_auth_failures_total";

/// Counter: expired holds released by the reaper.
pub const HOLDS_REAPED_TOTAL: &str = "slotbook_holds_reaped_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (mutations per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a request to a short label for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Auth { .. } => "auth",
        Request::Ping => "ping",
        Request::CreatePage { .. } => "create_page",
        Request::UpdatePage { .. } => "update_page",
        Request::SetPageLive { .. } => "set_page_live",
        Request::DeletePage { .. } => "delete_page",
        Request::SlugAvailable { .. } => "slug_available",
        Request::GetPage { .. } => "get_page",
        Request::ListPages { .. } => "list_pages",
        Request::AddProduct { .. } => "add_product",
        Request::UpdateProduct { .. } => "update_product",
        Request::SetProductActive { .. } => "set_product_active",
        Request::RemoveProduct { .. } => "remove_product",
        Request::ListProducts { .. } => "list_products",
        Request::AddRule { .. } => "add_rule",
        Request::RemoveRule { .. } => "remove_rule",
        Request::ListRules { .. } => "list_rules",
        Request::AddOverride { .. } => "add_override",
        Request::RemoveOverride { .. } => "remove_override",
        Request::ListOverrides { .. } => "list_overrides",
        Request::Slots { .. } => "slots",
        Request::PlaceHold { .. } => "place_hold",
        Request::ReleaseHold { .. } => "release_hold",
        Request::RequestBooking { .. } => "request_booking",
        Request::AcceptBooking { .. } => "accept_booking",
        Request::DeclineBooking { .. } => "decline_booking",
        Request::CancelBooking { .. } => "cancel_booking",
        Request::ListRequests { .. } => "list_requests",
        Request::ListUpcoming { .. } => "list_upcoming",
        Request::ListPast { .. } => "list_past",
        Request::Listen { .. } => "listen",
        Request::Unlisten { .. } => "unlisten",
    }
}
