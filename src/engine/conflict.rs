use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Build a span from raw instants: `start < end` and both inside the
/// accepted timestamp range.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidInterval { start, end });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(Span::new(start, end))
}

/// True if any meeting of `us` other than `exclude` overlaps `span`.
pub(crate) fn has_conflict(us: &UserState, span: &Span, exclude: Option<MeetingId>) -> bool {
    us.overlapping(span, exclude).next().is_some()
}

/// Fails with the first meeting that overlaps `span`. Only meaningful while
/// the caller holds the user's write lock through the following write.
pub(crate) fn check_no_conflict(
    us: &UserState,
    span: &Span,
    exclude: Option<MeetingId>,
) -> Result<(), EngineError> {
    match us.overlapping(span, exclude).next() {
        Some(existing) => {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            tracing::debug!(
                user = %us.user.id,
                existing = %existing.id,
                "rejected [{}, {}): overlaps [{}, {})",
                span.start,
                span.end,
                existing.span.start,
                existing.span.end
            );
            Err(EngineError::SlotConflict(existing.id))
        }
        None => Ok(()),
    }
}

pub(crate) fn validate_title(title: &str) -> Result<String, EngineError> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(EngineError::Validation("title cannot be empty".into()));
    }
    if trimmed.chars().count() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    Ok(trimmed.to_string())
}

pub(crate) fn validate_description(description: Option<&str>) -> Result<(), EngineError> {
    if description.is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    Ok(())
}

pub(crate) fn validate_user_name(name: &str) -> Result<String, EngineError> {
    let trimmed = name.trim();
    let len = trimmed.chars().count();
    if !(MIN_USER_NAME_LEN..=MAX_USER_NAME_LEN).contains(&len) {
        return Err(EngineError::Validation(format!(
            "name must be between {MIN_USER_NAME_LEN} and {MAX_USER_NAME_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// `local@domain.tld` with no whitespace, at most `MAX_EMAIL_LEN` bytes.
pub(crate) fn validate_email(email: &str) -> Result<String, EngineError> {
    let trimmed = email.trim();
    if trimmed.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    let invalid = || EngineError::Validation(format!("not a valid email address: {trimmed}"));
    if trimmed.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = trimmed.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) if !host.is_empty() && !tld.is_empty() => Ok(trimmed.to_string()),
        _ => Err(invalid()),
    }
}
