use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::calendar;
use crate::engine::Engine;
use crate::model::Ms;

const REAP_INTERVAL: Duration = Duration::from_secs(5);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Release every hold that has expired by `now`. Returns how many were released.
pub async fn reap_expired_holds(engine: &Engine, now: Ms) -> usize {
    let mut reaped = 0;
    for (hold_id, page_id) in engine.collect_expired_holds(now) {
        match engine.release_hold(hold_id).await {
            Ok(_) => {
                reaped += 1;
                debug!(hold = %hold_id, page = %page_id, "reaped expired hold");
            }
            // Consumed by a booking or released by the client in the meantime.
            Err(e) => debug!("reaper skip {hold_id}: {e}"),
        }
    }
    if reaped > 0 {
        metrics::counter!(crate::observability::HOLDS_REAPED_TOTAL).increment(reaped as u64);
        info!("reaped {reaped} expired holds");
    }
    reaped
}

/// Background task that periodically cleans up expired holds.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        interval.tick().await;
        reap_expired_holds(&engine, calendar::local_now_ms()).await;
    }
}

/// Background task that compacts the WAL once `threshold` appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PageDraft;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn reaper_releases_only_expired_holds() {
        let path = test_wal_path("reaper_collect.wal");
        let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();

        let page = engine
            .create_page(Ulid::new(), PageDraft { slug: "reaper".into(), ..PageDraft::default() })
            .await
            .unwrap();
        engine.set_page_live(page.id, true).await.unwrap();

        let now = 1_000_000;
        let short = engine
            .place_hold(page.id, Span::new(10_000_000, 11_000_000), 1_000, now)
            .await
            .unwrap();
        let long = engine
            .place_hold(page.id, Span::new(12_000_000, 13_000_000), 60_000, now)
            .await
            .unwrap();

        assert_eq!(reap_expired_holds(&engine, now + 5_000).await, 1);

        let remaining = engine.list_holds(page.id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, long.id);
        assert!(engine.get_page_for_entity(&short.id).is_none());

        assert_eq!(reap_expired_holds(&engine, now + 5_000).await, 0);
    }
}
