use tokio::sync::OwnedRwLockReadGuard;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, now_ms};

impl Engine {
    /// Current state of a hold. Read-only: a hold past its expiry reads as
    /// `Expired` here but is only transitioned by a mutation or the sweeper.
    pub async fn peek(&self, hold_id: Ulid) -> Result<HoldStatus, EngineError> {
        let trip_id = self
            .get_trip_for_entity(&hold_id)
            .ok_or(EngineError::HoldNotFound(hold_id))?;
        let rs = self.get_trip(&trip_id).ok_or(EngineError::HoldNotFound(hold_id))?;
        let guard = rs.read().await;
        let hold = guard
            .holds
            .get(&hold_id)
            .filter(|_| !guard.deleted)
            .ok_or(EngineError::HoldNotFound(hold_id))?;
        Ok(HoldStatus::observe(hold, now_ms()))
    }

    pub async fn trip_info(&self, trip_id: Ulid) -> Result<TripInfo, EngineError> {
        let guard = self.read_trip(trip_id).await?;
        Ok(guard.info())
    }

    pub async fn list_trips(&self) -> Vec<TripInfo> {
        let trips: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(trips.len());
        for rs in trips {
            let guard = rs.read().await;
            if !guard.deleted {
                infos.push(guard.info());
            }
        }
        infos.sort_by_key(|t| t.id);
        infos
    }

    /// Every remembered hold of a trip, oldest first.
    pub async fn get_holds(&self, trip_id: Ulid) -> Result<Vec<HoldStatus>, EngineError> {
        let guard = self.read_trip(trip_id).await?;
        let now = now_ms();
        let mut holds: Vec<HoldStatus> = guard
            .holds
            .values()
            .map(|h| HoldStatus::observe(h, now))
            .collect();
        holds.sort_by_key(|h| h.id);
        Ok(holds)
    }

    pub async fn get_bookings(&self, trip_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let guard = self.read_trip(trip_id).await?;
        let mut bookings: Vec<Booking> = guard.bookings.values().cloned().collect();
        bookings.sort_by_key(|b| b.id);
        Ok(bookings)
    }

    async fn read_trip(&self, trip_id: Ulid) -> Result<OwnedRwLockReadGuard<TripState>, EngineError> {
        let rs = self.get_trip(&trip_id).ok_or(EngineError::TripNotFound(trip_id))?;
        let guard = rs.read_owned().await;
        if guard.deleted {
            return Err(EngineError::TripNotFound(trip_id));
        }
        Ok(guard)
    }
}
