use crate::model::*;

use super::conflict::has_conflict;
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_user(&self, id: UserId) -> Result<User, EngineError> {
        let us = self
            .store
            .get_user_state(&id)
            .ok_or(EngineError::UserNotFound(id))?;
        let guard = us.read().await;
        Ok(guard.user.clone())
    }

    /// All users, newest first.
    pub async fn list_users(&self) -> Vec<User> {
        let mut users = Vec::new();
        for us in self.store.user_states() {
            users.push(us.read().await.user.clone());
        }
        users.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        users
    }

    pub async fn get_meeting(&self, id: MeetingId) -> Result<MeetingRecord, EngineError> {
        let us = self
            .store
            .user_for_meeting(&id)
            .and_then(|uid| self.store.get_user_state(&uid))
            .ok_or(EngineError::MeetingNotFound(id))?;
        let guard = us.read().await;
        let meeting = guard
            .get_meeting(&id)
            .ok_or(EngineError::MeetingNotFound(id))?;
        Ok(MeetingRecord::new(meeting, guard.summary()))
    }

    /// Meetings matching every supplied filter, by start ascending.
    /// An unknown `user_id` yields an empty list.
    pub async fn list_meetings(&self, filter: MeetingFilter) -> Vec<MeetingRecord> {
        let states: Vec<_> = match filter.user_id {
            Some(uid) => self.store.get_user_state(&uid).into_iter().collect(),
            None => self.store.user_states(),
        };

        let mut records = Vec::new();
        for us in states {
            let guard = us.read().await;
            let summary = guard.summary();
            records.extend(
                guard
                    .within(filter.start_date, filter.end_date)
                    .map(|m| MeetingRecord::new(m, summary.clone())),
            );
        }
        records.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));
        records
    }

    /// Meetings of `user_id` overlapping `[start, end)`, skipping `exclude`.
    pub async fn find_overlapping(
        &self,
        user_id: UserId,
        start: Ms,
        end: Ms,
        exclude: Option<MeetingId>,
    ) -> Result<Vec<Meeting>, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidInterval { start, end });
        }
        self.store
            .find_overlapping(&user_id, &Span::new(start, end), exclude)
            .await
    }

    /// Advisory check: the answer can be stale as soon as the read lock is
    /// released. Bookings re-check under the write lock.
    pub async fn has_conflict(
        &self,
        user_id: UserId,
        start: Ms,
        end: Ms,
        exclude: Option<MeetingId>,
    ) -> Result<bool, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidInterval { start, end });
        }
        let us = self
            .store
            .get_user_state(&user_id)
            .ok_or(EngineError::UserNotFound(user_id))?;
        let guard = us.read().await;
        Ok(has_conflict(&guard, &Span::new(start, end), exclude))
    }
}
