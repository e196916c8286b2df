use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Lifecycle of a seat hold. Everything except `Active` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HoldState {
    Active,
    Expired,
    Released,
    Consumed,
}

impl HoldState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HoldState::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HoldState::Active => "ACTIVE",
            HoldState::Expired => "EXPIRED",
            HoldState::Released => "RELEASED",
            HoldState::Consumed => "CONSUMED",
        }
    }
}

impl std::fmt::Display for HoldState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A temporary, expiring claim on seats of one trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: Ulid,
    pub trip_id: Ulid,
    pub seats: u32,
    pub holder_token: String,
    pub state: HoldState,
    pub created_at: Ms,
    pub expires_at: Ms,
    /// When the hold left `Active`.
    pub settled_at: Option<Ms>,
    /// Set once the hold was consumed by a booking.
    pub booking_id: Option<Ulid>,
}

impl Hold {
    /// Still counted against inventory but past its expiry.
    pub fn is_lapsed(&self, now: Ms) -> bool {
        self.state == HoldState::Active && now > self.expires_at
    }

    pub fn remaining_ms(&self, now: Ms) -> Ms {
        (self.expires_at - now).max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub trip_id: Ulid,
    pub hold_id: Ulid,
    pub seats: u32,
    pub holder_token: String,
    pub created_at: Ms,
    /// Opaque JSON document owned by the checkout flow.
    pub payload: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TripState {
    pub id: Ulid,
    pub name: Option<String>,
    pub total_seats: u32,
    pub available_seats: u32,
    /// Every hold still remembered for this trip, settled ones included.
    pub holds: HashMap<Ulid, Hold>,
    /// Confirmed bookings by booking id.
    pub bookings: HashMap<Ulid, Booking>,
    /// Set under the write lock when the trip is deleted, for callers that
    /// were already queued on the lock.
    pub deleted: bool,
}

impl TripState {
    pub fn new(id: Ulid, name: Option<String>, total_seats: u32) -> Self {
        Self {
            id,
            name,
            total_seats,
            available_seats: total_seats,
            holds: HashMap::new(),
            bookings: HashMap::new(),
            deleted: false,
        }
    }

    pub fn held_seats(&self) -> u32 {
        self.holds
            .values()
            .filter(|h| h.state == HoldState::Active)
            .map(|h| h.seats)
            .sum()
    }

    pub fn booked_seats(&self) -> u32 {
        self.bookings.values().map(|b| b.seats).sum()
    }

    pub fn active_hold_count(&self) -> usize {
        self.holds.values().filter(|h| h.state == HoldState::Active).count()
    }

    /// available + held + booked == total
    pub fn is_conserved(&self) -> bool {
        let accounted = self.available_seats as u64
            + self.held_seats() as u64
            + self.booked_seats() as u64;
        accounted == self.total_seats as u64
    }

    /// Mark an active hold settled and hand its seats back. Returns false if
    /// the hold was already terminal, so seats are never credited twice.
    pub fn settle_hold(&mut self, hold_id: Ulid, state: HoldState, at: Ms) -> bool {
        debug_assert!(state == HoldState::Expired || state == HoldState::Released);
        let Some(hold) = self.holds.get_mut(&hold_id) else {
            return false;
        };
        if hold.state != HoldState::Active {
            return false;
        }
        hold.state = state;
        hold.settled_at = Some(at);
        self.available_seats += hold.seats;
        true
    }

    pub fn info(&self) -> TripInfo {
        TripInfo {
            id: self.id,
            name: self.name.clone(),
            total_seats: self.total_seats,
            available_seats: self.available_seats,
            held_seats: self.held_seats(),
            booked_seats: self.booked_seats(),
        }
    }
}

/// The event types: flat, no nesting. This is the WAL record format.
///
/// Every event carries the timestamps it needs so replay never consults the clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TripCreated {
        id: Ulid,
        name: Option<String>,
        total_seats: u32,
    },
    TripDeleted {
        id: Ulid,
    },
    HoldPlaced {
        id: Ulid,
        trip_id: Ulid,
        seats: u32,
        holder_token: String,
        created_at: Ms,
        expires_at: Ms,
    },
    HoldExtended {
        id: Ulid,
        trip_id: Ulid,
        seats: u32,
        expires_at: Ms,
    },
    HoldReleased {
        id: Ulid,
        trip_id: Ulid,
        at: Ms,
    },
    HoldExpired {
        id: Ulid,
        trip_id: Ulid,
        at: Ms,
    },
    HoldConsumed {
        trip_id: Ulid,
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        trip_id: Ulid,
    },
}

impl Event {
    /// The trip an event belongs to.
    pub fn trip_id(&self) -> Ulid {
        match self {
            Event::TripCreated { id, .. } | Event::TripDeleted { id } => *id,
            Event::HoldPlaced { trip_id, .. }
            | Event::HoldExtended { trip_id, .. }
            | Event::HoldReleased { trip_id, .. }
            | Event::HoldExpired { trip_id, .. }
            | Event::HoldConsumed { trip_id, .. }
            | Event::BookingCancelled { trip_id, .. } => *trip_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub total_seats: u32,
    pub available_seats: u32,
    pub held_seats: u32,
    pub booked_seats: u32,
}

/// Client-facing view of a hold. Never carries the holder token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldStatus {
    pub id: Ulid,
    pub trip_id: Ulid,
    pub seats: u32,
    pub state: HoldState,
    pub expires_at: Ms,
    pub seconds_remaining: i64,
}

impl HoldStatus {
    /// Snapshot of `hold` as seen at `now`. A lapsed hold reads as expired even
    /// before anything has transitioned it.
    pub fn observe(hold: &Hold, now: Ms) -> Self {
        let state = if hold.is_lapsed(now) { HoldState::Expired } else { hold.state };
        let seconds_remaining = if state == HoldState::Active {
            hold.remaining_ms(now) / 1000
        } else {
            0
        };
        Self {
            id: hold.id,
            trip_id: hold.trip_id,
            seats: hold.seats,
            state,
            expires_at: hold.expires_at,
            seconds_remaining,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeOutcome {
    pub booking: Booking,
    /// True when this call returned a booking created by an earlier call.
    pub replayed: bool,
}
