use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::{Engine, EngineError, now_ms};
use crate::model::Ms;

/// One pass over every trip: expire each active hold past its expiry.
/// Returns how many holds this pass expired.
pub async fn sweep_once(engine: &Engine, now: Ms) -> usize {
    let start = std::time::Instant::now();
    let mut expired = 0;
    for (hold_id, trip_id) in engine.collect_expired_holds(now) {
        match engine.expire_hold(hold_id, now).await {
            Ok(true) => expired += 1,
            // Lazily expired, released or finalized since it was collected.
            Ok(false) | Err(EngineError::HoldNotFound(_)) => {}
            Err(e) => warn!("sweeper failed to expire {hold_id} on trip {trip_id}, retrying next pass: {e}"),
        }
    }
    metrics::histogram!(crate::observability::SWEEP_DURATION_SECONDS)
        .record(start.elapsed().as_secs_f64());
    expired
}

/// Background task that expires lapsed holds every `interval` until `shutdown` fires.
pub async fn run_sweeper(engine: Arc<Engine>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => break,
        }
        let n = sweep_once(&engine, now_ms()).await;
        if n > 0 {
            info!("sweeper expired {n} holds");
        }
    }
}

/// Background task that compacts the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => break,
        }
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
    use crate::config::EngineConfig;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("seatd_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn sweep_returns_lapsed_seats() {
        let path = test_wal_path("sweep_lapsed.wal");
        let engine = Engine::new(path, Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap();

        let trip = Ulid::new();
        engine.create_trip(trip, None, 5).await.unwrap();
        let short = engine.acquire(trip, 3, "a".into(), Some(20)).await.unwrap();
        let long = engine.acquire(trip, 1, "b".into(), None).await.unwrap();

        let later = now_ms() + 1_000;
        assert_eq!(engine.collect_expired_holds(later), vec![(short.id, trip)]);
        assert_eq!(sweep_once(&engine, later).await, 1);

        let info = engine.trip_info(trip).await.unwrap();
        assert_eq!(info.available_seats, 4);
        assert_eq!(info.held_seats, 1);
        assert_eq!(engine.peek(short.id).await.unwrap().state, HoldState::Expired);
        assert_eq!(engine.peek(long.id).await.unwrap().state, HoldState::Active);

        // A second pass finds nothing left to do.
        assert!(engine.collect_expired_holds(later).is_empty());
        assert_eq!(sweep_once(&engine, later).await, 0);
    }

    #[tokio::test]
    async fn sweeper_skips_holds_settled_in_between() {
        let path = test_wal_path("sweep_race.wal");
        let engine = Engine::new(path, Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap();

        let trip = Ulid::new();
        engine.create_trip(trip, None, 2).await.unwrap();
        let hold = engine.acquire(trip, 2, "a".into(), Some(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Lazy expiry wins the race; the sweeper must not credit the seats again.
        engine.release(hold.id, "a").await.unwrap();
        assert!(!engine.expire_hold(hold.id, now_ms()).await.unwrap());
        assert_eq!(engine.trip_info(trip).await.unwrap().available_seats, 2);
    }

    #[tokio::test]
    async fn failed_expiry_retried_next_pass() {
        let path = test_wal_path("sweep_conflict.wal");
        let config = EngineConfig {
            lock_wait: Duration::from_millis(20),
            ..EngineConfig::default()
        };
        let engine = Engine::new(path, Arc::new(NotifyHub::new()), config).unwrap();

        let busy = Ulid::new();
        let idle = Ulid::new();
        engine.create_trip(busy, None, 2).await.unwrap();
        engine.create_trip(idle, None, 2).await.unwrap();
        engine.acquire(busy, 2, "a".into(), Some(10)).await.unwrap();
        engine.acquire(idle, 2, "b".into(), Some(10)).await.unwrap();
        let later = now_ms() + 1_000;

        // A reader still lets the hold be collected but blocks the write, so
        // that one hold fails with Conflict while the pass carries on.
        let rs = engine.get_trip(&busy).unwrap();
        let reader = rs.read().await;
        assert_eq!(sweep_once(&engine, later).await, 1);
        drop(reader);
        assert_eq!(engine.trip_info(idle).await.unwrap().available_seats, 2);
        assert_eq!(engine.trip_info(busy).await.unwrap().available_seats, 0);

        assert_eq!(sweep_once(&engine, later).await, 1);
        assert_eq!(engine.trip_info(busy).await.unwrap().available_seats, 2);
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let path = test_wal_path("sweep_shutdown.wal");
        let engine = Arc::new(
            Engine::new(path, Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap(),
        );

        let trip = Ulid::new();
        engine.create_trip(trip, None, 1).await.unwrap();
        engine.acquire(trip, 1, "a".into(), Some(10)).await.unwrap();

        let token = CancellationToken::new();
        let task = tokio::spawn(run_sweeper(engine.clone(), Duration::from_millis(15), token.clone()));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(engine.trip_info(trip).await.unwrap().available_seats, 1);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
