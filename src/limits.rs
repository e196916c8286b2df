//! Hard limits. Everything a client can grow is capped here.

use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_TRIPS_PER_TENANT: usize = 100_000;
pub const MAX_SEATS_PER_TRIP: u32 = 100_000;
pub const MAX_SEATS_PER_HOLD: u32 = 1_000;
/// Active holds on one trip at any moment.
pub const MAX_HOLDS_PER_TRIP: usize = 50_000;
/// Settled holds remembered per trip; compaction drops the oldest beyond this.
pub const MAX_SETTLED_HOLDS_PER_TRIP: usize = 50_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_HOLDER_TOKEN_LEN: usize = 256;
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

pub const MIN_HOLD_TTL_MS: Ms = 1;
pub const MAX_HOLD_TTL_MS: Ms = 24 * 3_600_000;
