use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Wall clock as Unix milliseconds.
pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

pub(crate) fn validate_seats(seats: u32) -> Result<(), EngineError> {
    if seats == 0 {
        return Err(EngineError::InvalidArgument("seats must be at least 1"));
    }
    if seats > MAX_SEATS_PER_HOLD {
        return Err(EngineError::LimitExceeded("too many seats in one hold"));
    }
    Ok(())
}

pub(crate) fn validate_ttl(ttl_ms: Ms) -> Result<(), EngineError> {
    if ttl_ms < MIN_HOLD_TTL_MS {
        return Err(EngineError::InvalidArgument("ttl must be positive"));
    }
    if ttl_ms > MAX_HOLD_TTL_MS {
        return Err(EngineError::LimitExceeded("ttl too long"));
    }
    Ok(())
}

pub(crate) fn validate_holder_token(token: &str) -> Result<(), EngineError> {
    if token.is_empty() {
        return Err(EngineError::InvalidArgument("holder token must not be empty"));
    }
    if token.len() > MAX_HOLDER_TOKEN_LEN {
        return Err(EngineError::LimitExceeded("holder token too long"));
    }
    Ok(())
}

/// Payloads are opaque but must at least be a JSON document.
pub(crate) fn validate_payload(payload: Option<&str>) -> Result<(), EngineError> {
    let Some(p) = payload else { return Ok(()) };
    if p.len() > MAX_PAYLOAD_LEN {
        return Err(EngineError::LimitExceeded("booking payload too large"));
    }
    serde_json::from_str::<serde_json::Value>(p)
        .map(|_| ())
        .map_err(|e| EngineError::InvalidPayload(e.to_string()))
}

/// Fail unless `seats` more can come out of the trip right now.
pub(crate) fn check_capacity(trip: &TripState, seats: u32) -> Result<(), EngineError> {
    if trip.available_seats < seats {
        return Err(EngineError::InsufficientInventory {
            requested: seats,
            available: trip.available_seats,
        });
    }
    Ok(())
}

pub(crate) fn check_holder(hold: &Hold, holder_token: &str) -> Result<(), EngineError> {
    if hold.holder_token != holder_token {
        return Err(EngineError::HoldForbidden(hold.id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn seats_bounds() {
        assert!(matches!(validate_seats(0), Err(EngineError::InvalidArgument(_))));
        assert!(validate_seats(1).is_ok());
        assert!(validate_seats(MAX_SEATS_PER_HOLD).is_ok());
        assert!(matches!(
            validate_seats(MAX_SEATS_PER_HOLD + 1),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn ttl_bounds() {
        assert!(validate_ttl(0).is_err());
        assert!(validate_ttl(-5).is_err());
        assert!(validate_ttl(600_000).is_ok());
        assert!(validate_ttl(MAX_HOLD_TTL_MS + 1).is_err());
    }

    #[test]
    fn payload_must_be_json() {
        assert!(validate_payload(None).is_ok());
        assert!(validate_payload(Some(r#"{"travelers":[{"name":"Ana"}],"price":1200}"#)).is_ok());
        assert!(matches!(
            validate_payload(Some("traveler=Ana")),
            Err(EngineError::InvalidPayload(_))
        ));
    }

    #[test]
    fn capacity_reports_what_is_left() {
        let mut trip = TripState::new(Ulid::new(), None, 4);
        trip.available_seats = 1;
        assert!(check_capacity(&trip, 1).is_ok());
        assert_eq!(
            check_capacity(&trip, 2),
            Err(EngineError::InsufficientInventory { requested: 2, available: 1 })
        );
    }

    #[test]
    fn empty_token_rejected() {
        assert!(validate_holder_token("").is_err());
        assert!(validate_holder_token("anon-7f3a").is_ok());
        assert!(validate_holder_token(&"x".repeat(MAX_HOLDER_TOKEN_LEN + 1)).is_err());
    }
}
