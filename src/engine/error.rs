use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    TripNotFound(Ulid),
    TripExists(Ulid),
    /// Trip still has active holds or bookings.
    TripInUse(Ulid),
    InsufficientInventory { requested: u32, available: u32 },
    HoldNotFound(Ulid),
    HoldExpired(Ulid),
    HoldForbidden(Ulid),
    HoldAlreadyConsumed(Ulid),
    BookingNotFound(Ulid),
    /// Trip lock not obtained in time. Safe to retry.
    Conflict(Ulid),
    InvalidArgument(&'static str),
    InvalidPayload(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::TripNotFound(id) => write!(f, "trip not found: {id}"),
            EngineError::TripExists(id) => write!(f, "trip already exists: {id}"),
            EngineError::TripInUse(id) => {
                write!(f, "trip {id} still has active holds or bookings")
            }
            EngineError::InsufficientInventory { requested, available } => {
                write!(f, "insufficient inventory: requested {requested}, available {available}")
            }
            EngineError::HoldNotFound(id) => write!(f, "hold not found: {id}"),
            EngineError::HoldExpired(id) => write!(f, "hold expired: {id}"),
            EngineError::HoldForbidden(id) => write!(f, "hold {id} belongs to another holder"),
            EngineError::HoldAlreadyConsumed(id) => write!(f, "hold already consumed: {id}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::Conflict(id) => write!(f, "trip {id} is busy, retry"),
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::InvalidPayload(e) => write!(f, "booking payload is not valid JSON: {e}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
