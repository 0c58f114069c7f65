use crate::model::Ms;

/// Max length of doctor names, specializations, emails and patient names.
pub const MAX_NAME_LEN: usize = 256;

/// Shortest bookable slot a doctor may declare.
pub const MIN_SLOT_MINUTES: u32 = 5;

/// Longest bookable slot a doctor may declare (one full day).
pub const MAX_SLOT_MINUTES: u32 = 24 * 60;

pub const MAX_DOCTORS: usize = 100_000;

/// Rows per doctor ledger, CANCELLED rows included.
pub const MAX_APPOINTMENTS_PER_DOCTOR: usize = 1_000_000;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;

/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
