use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{RwLock, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability as obs;

use super::checks::*;
use super::{Engine, EngineError, TripLock, WalCommand};

impl Engine {
    pub async fn create_trip(
        &self,
        id: Ulid,
        name: Option<String>,
        total_seats: u32,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_TRIPS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many trips"));
        }
        if name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("trip name too long"));
        }
        if total_seats == 0 {
            return Err(EngineError::InvalidArgument("total_seats must be at least 1"));
        }
        if total_seats > MAX_SEATS_PER_TRIP {
            return Err(EngineError::LimitExceeded("too many seats on trip"));
        }

        let _gate = self.compaction_gate.read().await;
        let rs = Arc::new(RwLock::new(TripState::new(id, name.clone(), total_seats)));
        // Publish the trip already locked so nobody can touch it before it is durable.
        let guard = match self.state.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::TripExists(id)),
            Entry::Vacant(slot) => {
                let guard = rs
                    .clone()
                    .try_write_owned()
                    .map_err(|_| EngineError::Conflict(id))?;
                slot.insert(rs);
                guard
            }
        };

        let event = Event::TripCreated { id, name, total_seats };
        if let Err(e) = self.wal_append(&event).await {
            self.state.remove(&id);
            return Err(e);
        }
        drop(guard);
        self.notify.send(id, &event);
        info!("trip {id} created with {total_seats} seats");
        Ok(())
    }

    /// Remove a trip that no longer has live holds or bookings.
    pub async fn delete_trip(&self, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.lock_trip(id).await?;
        if guard.active_hold_count() > 0 || !guard.bookings.is_empty() {
            return Err(EngineError::TripInUse(id));
        }

        let event = Event::TripDeleted { id };
        self.wal_append(&event).await?;
        guard.deleted = true;
        self.unmap_trip(&guard);
        self.state.remove(&id);
        drop(guard);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        info!("trip {id} deleted");
        Ok(())
    }

    /// Place a new hold on `seats` seats of a trip.
    ///
    /// `ttl_ms` falls back to the configured hold TTL. Fails with
    /// `InsufficientInventory` without touching anything when the seats are not there.
    pub async fn acquire(
        &self,
        trip_id: Ulid,
        seats: u32,
        holder_token: String,
        ttl_ms: Option<Ms>,
    ) -> Result<Hold, EngineError> {
        validate_seats(seats)?;
        validate_holder_token(&holder_token)?;
        let ttl_ms = ttl_ms.unwrap_or(self.config.hold_ttl_ms);
        validate_ttl(ttl_ms)?;

        let mut trip = self.lock_trip(trip_id).await?;
        if trip.active_hold_count() >= MAX_HOLDS_PER_TRIP {
            return Err(EngineError::LimitExceeded("too many holds on trip"));
        }

        let now = now_ms();
        if trip.available_seats < seats {
            self.reclaim_lapsed(trip_id, &mut trip, now).await?;
        }
        if let Err(e) = check_capacity(&trip, seats) {
            metrics::counter!(obs::ACQUIRE_REJECTED_TOTAL).increment(1);
            return Err(e);
        }

        let id = Ulid::new();
        let event = Event::HoldPlaced {
            id,
            trip_id,
            seats,
            holder_token,
            created_at: now,
            expires_at: now + ttl_ms,
        };
        self.persist_and_apply(trip_id, &mut trip, &event).await?;
        metrics::counter!(obs::HOLDS_ACQUIRED_TOTAL).increment(1);
        info!("hold {id} placed on trip {trip_id}: {seats} seats, ttl {ttl_ms}ms");
        trip.holds.get(&id).cloned().ok_or(EngineError::HoldNotFound(id))
    }

    /// Push a hold's expiry to `now + ttl` and optionally resize it.
    ///
    /// Growing re-checks availability for the extra seats only; if they are
    /// not there the hold is left exactly as it was.
    pub async fn extend(
        &self,
        hold_id: Ulid,
        holder_token: &str,
        seats: Option<u32>,
        ttl_ms: Option<Ms>,
    ) -> Result<Hold, EngineError> {
        if let Some(s) = seats {
            validate_seats(s)?;
        }
        let ttl_ms = ttl_ms.unwrap_or(self.config.hold_ttl_ms);
        validate_ttl(ttl_ms)?;

        let (trip_id, mut trip) = self.resolve_hold_write(&hold_id).await?;
        let now = now_ms();
        let hold = self.checked_hold(trip_id, &mut trip, hold_id, holder_token, now).await?;
        match hold.state {
            HoldState::Active => {}
            HoldState::Expired => return Err(EngineError::HoldExpired(hold_id)),
            HoldState::Released => return Err(EngineError::HoldNotFound(hold_id)),
            HoldState::Consumed => return Err(EngineError::HoldAlreadyConsumed(hold_id)),
        }

        let new_seats = seats.unwrap_or(hold.seats);
        if new_seats > hold.seats {
            let extra = new_seats - hold.seats;
            if trip.available_seats < extra {
                self.reclaim_lapsed(trip_id, &mut trip, now).await?;
            }
            if let Err(e) = check_capacity(&trip, extra) {
                metrics::counter!(obs::ACQUIRE_REJECTED_TOTAL).increment(1);
                return Err(e);
            }
        }

        let event = Event::HoldExtended {
            id: hold_id,
            trip_id,
            seats: new_seats,
            expires_at: now + ttl_ms,
        };
        self.persist_and_apply(trip_id, &mut trip, &event).await?;
        metrics::counter!(obs::HOLDS_EXTENDED_TOTAL).increment(1);
        info!("hold {hold_id} extended: {} -> {new_seats} seats, ttl {ttl_ms}ms", hold.seats);
        trip.holds.get(&hold_id).cloned().ok_or(EngineError::HoldNotFound(hold_id))
    }

    /// Give a hold's seats back. Releasing a settled hold is a no-op.
    pub async fn release(&self, hold_id: Ulid, holder_token: &str) -> Result<(), EngineError> {
        let (trip_id, mut trip) = self.resolve_hold_write(&hold_id).await?;
        let now = now_ms();
        let hold = self.checked_hold(trip_id, &mut trip, hold_id, holder_token, now).await?;
        if hold.state != HoldState::Active {
            return Ok(());
        }

        let event = Event::HoldReleased { id: hold_id, trip_id, at: now };
        self.persist_and_apply(trip_id, &mut trip, &event).await?;
        metrics::counter!(obs::HOLDS_RELEASED_TOTAL).increment(1);
        info!("hold {hold_id} released, {} seats back on trip {trip_id}", hold.seats);
        Ok(())
    }

    /// Turn a live hold into a booking. Seats were taken at acquire time, so
    /// inventory is not touched. A retry after success returns the same booking.
    pub async fn finalize(
        &self,
        hold_id: Ulid,
        holder_token: &str,
        payload: Option<String>,
    ) -> Result<FinalizeOutcome, EngineError> {
        validate_payload(payload.as_deref())?;

        let (trip_id, mut trip) = self.resolve_hold_write(&hold_id).await?;
        let now = now_ms();
        let hold = self.checked_hold(trip_id, &mut trip, hold_id, holder_token, now).await?;
        match hold.state {
            HoldState::Active => {}
            HoldState::Expired => return Err(EngineError::HoldExpired(hold_id)),
            HoldState::Released => return Err(EngineError::HoldNotFound(hold_id)),
            HoldState::Consumed => {
                // The booking may have been cancelled since; then there is nothing to replay.
                let booking = hold
                    .booking_id
                    .and_then(|bid| trip.bookings.get(&bid).cloned())
                    .ok_or(EngineError::HoldAlreadyConsumed(hold_id))?;
                metrics::counter!(obs::FINALIZE_REPLAYS_TOTAL).increment(1);
                return Ok(FinalizeOutcome { booking, replayed: true });
            }
        }

        let booking = Booking {
            id: Ulid::new(),
            trip_id,
            hold_id,
            seats: hold.seats,
            holder_token: hold.holder_token,
            created_at: now,
            payload,
        };
        let event = Event::HoldConsumed { trip_id, booking: booking.clone() };
        self.persist_and_apply(trip_id, &mut trip, &event).await?;
        metrics::counter!(obs::BOOKINGS_FINALIZED_TOTAL).increment(1);
        info!("hold {hold_id} finalized as booking {} ({} seats)", booking.id, booking.seats);
        Ok(FinalizeOutcome { booking, replayed: false })
    }

    /// Cancel a confirmed booking and return its seats to the trip. Only the
    /// token that made the booking may cancel it; anyone else sees not found.
    pub async fn cancel_booking(&self, booking_id: Ulid, holder_token: &str) -> Result<Ulid, EngineError> {
        let trip_id = self
            .get_trip_for_entity(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let mut trip = self.lock_trip(trip_id).await.map_err(|e| match e {
            EngineError::TripNotFound(_) => EngineError::BookingNotFound(booking_id),
            other => other,
        })?;
        if trip
            .bookings
            .get(&booking_id)
            .is_none_or(|b| b.holder_token != holder_token)
        {
            return Err(EngineError::BookingNotFound(booking_id));
        }

        let event = Event::BookingCancelled { id: booking_id, trip_id };
        self.persist_and_apply(trip_id, &mut trip, &event).await?;
        info!("booking {booking_id} on trip {trip_id} cancelled");
        Ok(trip_id)
    }

    /// Sweeper entry point. Expires the hold only if it is still active and
    /// past its expiry once the lock is held; `Ok(false)` means someone else
    /// already settled it.
    pub async fn expire_hold(&self, hold_id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let (trip_id, mut trip) = self.resolve_hold_write(&hold_id).await?;
        let lapsed = trip.holds.get(&hold_id).is_some_and(|h| h.is_lapsed(now));
        if !lapsed {
            return Ok(false);
        }
        self.expire_locked(trip_id, &mut trip, hold_id, now, "sweeper").await?;
        Ok(true)
    }

    /// Active holds past their expiry, as `(hold_id, trip_id)`. Trips that are
    /// locked right now are skipped and picked up on a later pass.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.state.iter() {
            if let Ok(guard) = entry.value().try_read() {
                expired.extend(
                    guard
                        .holds
                        .values()
                        .filter(|h| h.is_lapsed(now))
                        .map(|h| (h.id, guard.id)),
                );
            }
        }
        expired
    }

    /// Token check plus lazy expiry. A lapsed hold is expired on the spot and
    /// returned in its new state; the caller decides what that means.
    async fn checked_hold(
        &self,
        trip_id: Ulid,
        trip: &mut TripLock,
        hold_id: Ulid,
        holder_token: &str,
        now: Ms,
    ) -> Result<Hold, EngineError> {
        let hold = trip
            .holds
            .get(&hold_id)
            .cloned()
            .ok_or(EngineError::HoldNotFound(hold_id))?;
        check_holder(&hold, holder_token)?;
        if !hold.is_lapsed(now) {
            return Ok(hold);
        }
        self.expire_locked(trip_id, trip, hold_id, now, "lazy").await?;
        trip.holds.get(&hold_id).cloned().ok_or(EngineError::HoldNotFound(hold_id))
    }

    /// Expire every lapsed hold on a trip the caller has locked.
    async fn reclaim_lapsed(&self, trip_id: Ulid, trip: &mut TripState, now: Ms) -> Result<(), EngineError> {
        let lapsed: Vec<Ulid> = trip
            .holds
            .values()
            .filter(|h| h.is_lapsed(now))
            .map(|h| h.id)
            .collect();
        for hold_id in lapsed {
            self.expire_locked(trip_id, trip, hold_id, now, "lazy").await?;
        }
        Ok(())
    }

    async fn expire_locked(
        &self,
        trip_id: Ulid,
        trip: &mut TripState,
        hold_id: Ulid,
        now: Ms,
        source: &'static str,
    ) -> Result<(), EngineError> {
        let event = Event::HoldExpired { id: hold_id, trip_id, at: now };
        self.persist_and_apply(trip_id, trip, &event).await?;
        metrics::counter!(obs::HOLDS_EXPIRED_TOTAL, "source" => source).increment(1);
        info!("hold {hold_id} on trip {trip_id} expired ({source})");
        Ok(())
    }

    /// Rewrite the WAL as the minimal event set for the current state, dropping
    /// settled holds older than the history retention window or past the
    /// per-trip history cap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Every mutation holds the gate shared, so with it held exclusively no
        // trip is mid-write and nothing can append behind the snapshot.
        let _gate = self.compaction_gate.write().await;
        let horizon = now_ms() - self.config.history_retention_ms;

        let mut trips: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        let mut pruned_total = 0usize;
        for rs in trips.drain(..) {
            let mut guard = rs.write().await;
            for id in prune_history(&mut guard, horizon) {
                self.entity_to_trip.remove(&id);
                pruned_total += 1;
            }
            snapshot_events(&guard, &mut events);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        if pruned_total > 0 {
            info!("compaction dropped {pruned_total} settled holds");
        }
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

/// Drop settled holds that left `Active` before `horizon`, then the oldest
/// of the rest until at most `MAX_SETTLED_HOLDS_PER_TRIP` remain. Consumed
/// holds whose booking still exists are kept so a finalize retry can be answered.
fn prune_history(trip: &mut TripState, horizon: Ms) -> Vec<Ulid> {
    let bookings = &trip.bookings;
    let mut settled: Vec<(Ms, Ulid)> = trip
        .holds
        .values()
        .filter(|h| h.booking_id.is_none_or(|bid| !bookings.contains_key(&bid)))
        .filter_map(|h| h.settled_at.map(|at| (at, h.id)))
        .collect();
    settled.sort_unstable();

    let over_cap = settled.len().saturating_sub(MAX_SETTLED_HOLDS_PER_TRIP);
    let stale: Vec<Ulid> = settled
        .iter()
        .enumerate()
        .take_while(|(i, (at, _))| *i < over_cap || *at < horizon)
        .map(|(_, (_, id))| *id)
        .collect();
    for id in &stale {
        trip.holds.remove(id);
    }
    stale
}

/// Events that rebuild `trip` from nothing.
///
/// Settled holds go first, each placed and settled back to back, so replay
/// never takes out more seats than the trip has.
fn snapshot_events(trip: &TripState, events: &mut Vec<Event>) {
    events.push(Event::TripCreated {
        id: trip.id,
        name: trip.name.clone(),
        total_seats: trip.total_seats,
    });

    let mut holds: Vec<&Hold> = trip.holds.values().collect();
    holds.sort_by_key(|h| {
        let live_booking = h.booking_id.is_some_and(|b| trip.bookings.contains_key(&b));
        let rank = match h.state {
            HoldState::Released | HoldState::Expired => 0,
            HoldState::Consumed if !live_booking => 0,
            HoldState::Consumed => 1,
            HoldState::Active => 2,
        };
        (rank, h.id)
    });

    for hold in holds {
        events.push(Event::HoldPlaced {
            id: hold.id,
            trip_id: trip.id,
            seats: hold.seats,
            holder_token: hold.holder_token.clone(),
            created_at: hold.created_at,
            expires_at: hold.expires_at,
        });
        let at = hold.settled_at.unwrap_or(hold.expires_at);
        match hold.state {
            HoldState::Active => {}
            HoldState::Released => events.push(Event::HoldReleased { id: hold.id, trip_id: trip.id, at }),
            HoldState::Expired => events.push(Event::HoldExpired { id: hold.id, trip_id: trip.id, at }),
            HoldState::Consumed => {
                let Some(booking_id) = hold.booking_id else { continue };
                match trip.bookings.get(&booking_id) {
                    Some(booking) => events.push(Event::HoldConsumed {
                        trip_id: trip.id,
                        booking: booking.clone(),
                    }),
                    None => {
                        // Booking was cancelled: keep the hold consumed, give the seats back.
                        events.push(Event::HoldConsumed {
                            trip_id: trip.id,
                            booking: Booking {
                                id: booking_id,
                                trip_id: trip.id,
                                hold_id: hold.id,
                                seats: hold.seats,
                                holder_token: hold.holder_token.clone(),
                                created_at: at,
                                payload: None,
                            },
                        });
                        events.push(Event::BookingCancelled { id: booking_id, trip_id: trip.id });
                    }
                }
            }
        }
    }
}
