use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug)]
pub enum EngineError {
    /// Start is not strictly before end.
    InvalidInterval { start: Ms, end: Ms },
    InvalidDate(String),
    /// A field failed validation (empty title, bad email, empty patch).
    Validation(String),
    UserNotFound(Ulid),
    MeetingNotFound(Ulid),
    /// Overlaps the named meeting of the same user.
    SlotConflict(Ulid),
    DuplicateUser(String),
    LimitExceeded(&'static str),
    Storage(String),
}

impl EngineError {
    /// Stable machine-readable kind, used for metrics labels and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval { .. } => "invalid_interval",
            EngineError::InvalidDate(_) => "invalid_date",
            EngineError::Validation(_) => "validation",
            EngineError::UserNotFound(_) => "user_not_found",
            EngineError::MeetingNotFound(_) => "meeting_not_found",
            EngineError::SlotConflict(_) => "slot_conflict",
            EngineError::DuplicateUser(_) => "duplicate_user",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Storage(_) => "storage",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval { start, end } => write!(
                f,
                "start time must be before end time: [{}, {})",
                crate::time::format_ms(*start),
                crate::time::format_ms(*end)
            ),
            EngineError::InvalidDate(msg) => write!(f, "invalid date: {msg}"),
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::UserNotFound(id) => write!(f, "user not found: {id}"),
            EngineError::MeetingNotFound(id) => write!(f, "meeting not found: {id}"),
            EngineError::SlotConflict(id) => {
                write!(f, "time slot already booked: overlaps meeting {id}")
            }
            EngineError::DuplicateUser(email) => write!(f, "email already exists: {email}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
