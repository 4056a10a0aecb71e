use crate::model::Ms;

pub const MAX_USERS: usize = 100_000;
pub const MAX_MEETINGS_PER_USER: usize = 50_000;

/// Display names are 2..=100 characters after trimming.
pub const MIN_USER_NAME_LEN: usize = 2;
pub const MAX_USER_NAME_LEN: usize = 100;
pub const MAX_EMAIL_LEN: usize = 100;

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 10_000;

/// Accepted meeting instants run from 2000-01-01T00:00:00Z to
/// 2200-01-01T00:00:00Z inclusive. This is a deliberate limit, narrower
/// than what the ISO parser accepts: a start before it or an end after it
/// fails with `LimitExceeded`, even for an otherwise valid timestamp such
/// as 1999-12-31.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z, see `MIN_VALID_TIMESTAMP_MS`.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Attempts for a WAL append that fails with a transient I/O error.
pub const STORAGE_RETRY_ATTEMPTS: u32 = 3;
