//! Hard caps that keep one tenant from exhausting memory or CPU.

use crate::model::{MINUTES_PER_DAY, Min};

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_PROVIDERS_PER_TENANT: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;

pub const MAX_OVERRIDES_PER_PROVIDER: usize = 5_000;
pub const MAX_APPOINTMENTS_PER_PROVIDER: usize = 100_000;

/// Work or break intervals per weekday.
pub const MAX_INTERVALS_PER_DAY: usize = 48;

/// Longest appointment the store accepts (one week).
pub const MAX_APPOINTMENT_MINUTES: Min = 7 * MINUTES_PER_DAY;

/// Widest date range for `available_dates`.
pub const MAX_QUERY_DAYS: i64 = 366;

pub const MAX_BATCH_SIZE: usize = 1_000;

/// Buffers wider than a day would only ever block the whole day.
pub const MAX_BUFFER_MINUTES: Min = MINUTES_PER_DAY;

/// Size of a working-plan JSON document.
pub const MAX_PLAN_JSON_LEN: usize = 64 * 1024;
