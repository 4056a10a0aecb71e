use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{
    check_no_conflict, now_ms, validate_description, validate_email, validate_span,
    validate_title, validate_user_name,
};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Register a user. Emails are unique ignoring case.
    pub async fn create_user(&self, name: &str, email: &str) -> Result<User, EngineError> {
        let name = validate_user_name(name)?;
        let email = validate_email(email)?;

        let _directory = self.directory.lock().await;
        if self.store.user_count() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.store.user_for_email(&email).is_some() {
            return Err(EngineError::DuplicateUser(email));
        }

        let user = User {
            id: Ulid::new(),
            name,
            email,
            created_at: now_ms(),
        };
        let event = Event::UserCreated {
            id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            created_at: user.created_at,
        };
        self.wal_append(&event).await?;
        self.store.insert_user(user.clone());
        info!(user = %user.id, "user created");
        Ok(user)
    }

    /// Book `[start, end)` for a user. The existence check, conflict check
    /// and durable insert all happen under the user's write lock, so two
    /// concurrent bookings for one user cannot both pass the check.
    pub async fn create_meeting(
        &self,
        user_id: UserId,
        title: &str,
        description: Option<String>,
        start: Ms,
        end: Ms,
    ) -> Result<MeetingRecord, EngineError> {
        let span = validate_span(start, end)?;
        let title = validate_title(title)?;
        validate_description(description.as_deref())?;

        let us = self
            .store
            .get_user_state(&user_id)
            .ok_or(EngineError::UserNotFound(user_id))?;
        let mut guard = us.write().await;
        if guard.meetings.len() >= MAX_MEETINGS_PER_USER {
            return Err(EngineError::LimitExceeded("too many meetings for user"));
        }

        check_no_conflict(&guard, &span, None)?;

        let now = now_ms();
        let meeting = Meeting {
            id: Ulid::new(),
            user_id,
            title,
            description,
            span,
            created_at: now,
            updated_at: now,
        };
        self.persist_and_apply(&mut guard, &Event::meeting_created(&meeting))
            .await?;
        info!(meeting = %meeting.id, user = %user_id, "meeting booked");
        Ok(MeetingRecord::new(&meeting, guard.summary()))
    }

    /// Change the supplied fields of a meeting. The effective interval is
    /// checked against the user's other meetings, never against itself.
    pub async fn update_meeting(
        &self,
        id: MeetingId,
        patch: MeetingPatch,
    ) -> Result<MeetingRecord, EngineError> {
        if patch.is_empty() {
            return Err(EngineError::Validation(
                "at least one field must be provided for update".into(),
            ));
        }
        let title = patch.title.as_deref().map(validate_title).transpose()?;
        if let Some(description) = &patch.description {
            validate_description(description.as_deref())?;
        }

        let mut guard = self.resolve_meeting_write(&id).await?;
        let existing = guard
            .get_meeting(&id)
            .cloned()
            .ok_or(EngineError::MeetingNotFound(id))?;

        let span = validate_span(
            patch.start.unwrap_or(existing.span.start),
            patch.end.unwrap_or(existing.span.end),
        )?;
        check_no_conflict(&guard, &span, Some(id))?;

        let updated = Meeting {
            title: title.unwrap_or(existing.title),
            description: patch.description.unwrap_or(existing.description),
            span,
            // Strictly advances even within one millisecond.
            updated_at: now_ms().max(existing.updated_at + 1),
            ..existing
        };
        let event = Event::MeetingUpdated {
            id,
            user_id: updated.user_id,
            title: updated.title.clone(),
            description: updated.description.clone(),
            span: updated.span,
            updated_at: updated.updated_at,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(meeting = %id, "meeting updated");
        Ok(MeetingRecord::new(&updated, guard.summary()))
    }

    pub async fn delete_meeting(&self, id: MeetingId) -> Result<(), EngineError> {
        let mut guard = self.resolve_meeting_write(&id).await?;
        let user_id = guard
            .get_meeting(&id)
            .map(|m| m.user_id)
            .ok_or(EngineError::MeetingNotFound(id))?;
        let event = Event::MeetingDeleted { id, user_id };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(meeting = %id, "meeting deleted");
        Ok(())
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    ///
    /// Holds the directory lock and a read lock on every user until the new
    /// file is in place, so no mutation can land in the old WAL after the
    /// snapshot was taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _directory = self.directory.lock().await;
        let states = self.store.user_states();
        let mut guards = Vec::with_capacity(states.len());
        for us in &states {
            guards.push(us.read().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            let user = &guard.user;
            events.push(Event::UserCreated {
                id: user.id,
                name: user.name.clone(),
                email: user.email.clone(),
                created_at: user.created_at,
            });
            events.extend(guard.meetings.iter().map(Event::meeting_created));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        drop(guards);
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
