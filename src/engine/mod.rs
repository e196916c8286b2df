mod checks;
mod error;
mod mutations;
mod queries;

pub use checks::now_ms;
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{
    OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, broadcast, mpsc, oneshot,
};
use tracing::{info, warn};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedTripState = Arc<RwLock<TripState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
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

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then pays for a single fsync and answers every sender in the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
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
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch.as_slice());
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-buffered bytes don't leak into the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
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
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Seat inventory, hold ledger and booking ledger for one tenant.
///
/// Each trip sits behind its own lock; every mutation takes the trip's write
/// lock, validates, makes the event durable and only then applies it.
pub struct Engine {
    pub state: DashMap<Ulid, SharedTripState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) config: EngineConfig,
    /// Reverse lookup: hold or booking id → trip id
    pub(super) entity_to_trip: DashMap<Ulid, Ulid>,
    /// Mutations hold it shared for their whole lifetime; compaction takes it
    /// exclusively so no event slips between the snapshot and the file swap.
    pub(super) compaction_gate: Arc<RwLock<()>>,
}

/// Exclusive access to one trip. Always taken after the compaction gate.
pub(super) struct TripLock {
    guard: OwnedRwLockWriteGuard<TripState>,
    _gate: OwnedRwLockReadGuard<()>,
}

impl std::ops::Deref for TripLock {
    type Target = TripState;

    fn deref(&self) -> &TripState {
        &self.guard
    }
}

impl std::ops::DerefMut for TripLock {
    fn deref_mut(&mut self) -> &mut TripState {
        &mut self.guard
    }
}

/// Apply an event to a trip (no locking; caller holds the lock).
fn apply_to_trip(ts: &mut TripState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::HoldPlaced {
            id,
            trip_id,
            seats,
            holder_token,
            created_at,
            expires_at,
        } => {
            debug_assert!(ts.available_seats >= *seats);
            ts.available_seats = ts.available_seats.saturating_sub(*seats);
            ts.holds.insert(
                *id,
                Hold {
                    id: *id,
                    trip_id: *trip_id,
                    seats: *seats,
                    holder_token: holder_token.clone(),
                    state: HoldState::Active,
                    created_at: *created_at,
                    expires_at: *expires_at,
                    settled_at: None,
                    booking_id: None,
                },
            );
            entity_map.insert(*id, *trip_id);
        }
        Event::HoldExtended { id, seats, expires_at, .. } => {
            if let Some(hold) = ts.holds.get_mut(id) {
                ts.available_seats = (ts.available_seats + hold.seats).saturating_sub(*seats);
                hold.seats = *seats;
                hold.expires_at = *expires_at;
            }
        }
        Event::HoldReleased { id, at, .. } => {
            ts.settle_hold(*id, HoldState::Released, *at);
        }
        Event::HoldExpired { id, at, .. } => {
            ts.settle_hold(*id, HoldState::Expired, *at);
        }
        Event::HoldConsumed { trip_id, booking } => {
            if let Some(hold) = ts.holds.get_mut(&booking.hold_id) {
                hold.state = HoldState::Consumed;
                hold.settled_at = Some(booking.created_at);
                hold.booking_id = Some(booking.id);
            }
            ts.bookings.insert(booking.id, booking.clone());
            entity_map.insert(booking.id, *trip_id);
        }
        Event::BookingCancelled { id, .. } => {
            if let Some(booking) = ts.bookings.remove(id) {
                ts.available_seats += booking.seats;
            }
            entity_map.remove(id);
        }
        // Trip creation and deletion happen at the DashMap level.
        Event::TripCreated { .. } | Event::TripDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            config,
            entity_to_trip: DashMap::new(),
            compaction_gate: Arc::new(RwLock::new(())),
        };

        // Nobody else can see these locks yet, so try_write never contends.
        // blocking_write is off limits: this can run inside an async context.
        for event in &events {
            match event {
                Event::TripCreated { id, name, total_seats } => {
                    let ts = TripState::new(*id, name.clone(), *total_seats);
                    engine.state.insert(*id, Arc::new(RwLock::new(ts)));
                }
                Event::TripDeleted { id } => {
                    if let Some((_, rs)) = engine.state.remove(id)
                        && let Ok(guard) = rs.try_read()
                    {
                        engine.unmap_trip(&guard);
                    }
                }
                other => {
                    if let Some(entry) = engine.state.get(&other.trip_id())
                        && let Ok(mut guard) = entry.value().try_write()
                    {
                        apply_to_trip(&mut guard, other, &engine.entity_to_trip);
                    }
                }
            }
        }

        for entry in engine.state.iter() {
            if let Ok(guard) = entry.value().try_read()
                && !guard.is_conserved()
            {
                warn!(
                    "trip {} does not balance after replay: total={} available={} held={} booked={}",
                    guard.id,
                    guard.total_seats,
                    guard.available_seats,
                    guard.held_seats(),
                    guard.booked_seats()
                );
            }
        }
        if !events.is_empty() {
            info!("replayed {} events into {} trips", events.len(), engine.state.len());
        }

        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_trip(&self, id: &Ulid) -> Option<SharedTripState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_trip_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_trip.get(entity_id).map(|e| *e.value())
    }

    /// Follow every event applied to a trip from now on.
    pub fn subscribe(&self, trip_id: Ulid) -> broadcast::Receiver<Event> {
        self.notify.subscribe(trip_id)
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        trip_id: Ulid,
        ts: &mut TripState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_trip(ts, event, &self.entity_to_trip);
        self.notify.send(trip_id, event);
        Ok(())
    }

    /// Take the compaction gate, then the trip's write lock, waiting at most `lock_wait`.
    ///
    /// A trip deleted while we were queued on its lock reads as not found.
    pub(super) async fn lock_trip(&self, trip_id: Ulid) -> Result<TripLock, EngineError> {
        let rs = self.get_trip(&trip_id).ok_or(EngineError::TripNotFound(trip_id))?;
        let acquire = async move {
            let gate = self.compaction_gate.clone().read_owned().await;
            let guard = rs.write_owned().await;
            TripLock { guard, _gate: gate }
        };
        let lock = tokio::time::timeout(self.config.lock_wait, acquire)
            .await
            .map_err(|_| {
                metrics::counter!(crate::observability::LOCK_CONFLICTS_TOTAL).increment(1);
                EngineError::Conflict(trip_id)
            })?;
        if lock.deleted {
            return Err(EngineError::TripNotFound(trip_id));
        }
        Ok(lock)
    }

    /// Lookup hold → trip, then take that trip's write lock.
    pub(super) async fn resolve_hold_write(
        &self,
        hold_id: &Ulid,
    ) -> Result<(Ulid, TripLock), EngineError> {
        let trip_id = self
            .get_trip_for_entity(hold_id)
            .ok_or(EngineError::HoldNotFound(*hold_id))?;
        let guard = self.lock_trip(trip_id).await.map_err(|e| match e {
            EngineError::TripNotFound(_) => EngineError::HoldNotFound(*hold_id),
            other => other,
        })?;
        if !guard.holds.contains_key(hold_id) {
            return Err(EngineError::HoldNotFound(*hold_id));
        }
        Ok((trip_id, guard))
    }

    pub(super) fn unmap_trip(&self, ts: &TripState) {
        for id in ts.holds.keys().chain(ts.bookings.keys()) {
            self.entity_to_trip.remove(id);
        }
    }
}
