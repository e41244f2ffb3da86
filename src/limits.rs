use crate::model::Ms;

// ── Tenants ──────────────────────────────────────────────────────

pub const MAX_TENANTS: usize = 10_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;

// ── Catalog ──────────────────────────────────────────────────────

pub const MAX_SERVICES_PER_BUSINESS: usize = 1_000;
pub const MAX_CLIENTS_PER_BUSINESS: usize = 1_000_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_NOTES_LEN: usize = 4_096;

/// A service never runs longer than a day.
pub const MAX_SERVICE_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_SERVICE_CAPACITY: u32 = 10_000;

// ── Calendar ─────────────────────────────────────────────────────

pub const MAX_APPOINTMENTS_PER_SERVICE: usize = 500_000;
pub const MAX_TIME_BLOCKS: usize = 100_000;

/// Slot grid granularity.
pub const SLOT_STEP_MINUTES: i64 = 15;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Time blocks are bounded to one year.
pub const MAX_BLOCK_DURATION_MS: Ms = 366 * 24 * 3_600_000;

/// Range listings (appointments, time blocks) are bounded to 92 days.
pub const MAX_LISTING_WINDOW_MS: Ms = 92 * 24 * 3_600_000;
