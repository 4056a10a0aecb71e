use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::model::*;

use super::EngineError;

pub type SharedUserState = Arc<RwLock<UserState>>;

/// In-memory view of the WAL: every user's calendar plus the lookup indexes.
///
/// Mutations never touch this directly; they append an event to the WAL and
/// then call [`IntervalStore::apply`] while holding the user's write lock.
pub struct IntervalStore {
    users: DashMap<UserId, SharedUserState>,
    /// Reverse lookup: meeting id → owning user id.
    meeting_to_user: DashMap<MeetingId, UserId>,
    /// Lowercased email → user id.
    emails: DashMap<String, UserId>,
}

impl Default for IntervalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IntervalStore {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            meeting_to_user: DashMap::new(),
            emails: DashMap::new(),
        }
    }

    /// Rebuild the store from replayed events. Runs before any lock is shared,
    /// so states are built unlocked and wrapped at the end.
    pub fn from_events(events: &[Event]) -> Self {
        let store = Self::new();
        let mut states: HashMap<UserId, UserState> = HashMap::new();
        for event in events {
            match event {
                Event::UserCreated { id, name, email, created_at } => {
                    store.emails.insert(email_key(email), *id);
                    states.entry(*id).or_insert_with(|| {
                        UserState::new(User {
                            id: *id,
                            name: name.clone(),
                            email: email.clone(),
                            created_at: *created_at,
                        })
                    });
                }
                other => {
                    if let Some(us) = states.get_mut(&other.user_id()) {
                        apply_to_user(us, other, &store.meeting_to_user);
                    }
                }
            }
        }
        for (id, us) in states {
            store.users.insert(id, Arc::new(RwLock::new(us)));
        }
        store
    }

    // ── Users ────────────────────────────────────────────────

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn get_user_state(&self, id: &UserId) -> Option<SharedUserState> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn user_for_email(&self, email: &str) -> Option<UserId> {
        self.emails.get(&email_key(email)).map(|e| *e.value())
    }

    pub fn insert_user(&self, user: User) {
        self.emails.insert(email_key(&user.email), user.id);
        self.users
            .insert(user.id, Arc::new(RwLock::new(UserState::new(user))));
    }

    /// Snapshot of every user's shared state, sorted by user id.
    /// Clones the Arcs so no map shard is held across an await.
    pub fn user_states(&self) -> Vec<SharedUserState> {
        let mut entries: Vec<(UserId, SharedUserState)> = self
            .users
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, rs)| rs).collect()
    }

    // ── Meetings ─────────────────────────────────────────────

    pub fn user_for_meeting(&self, meeting_id: &MeetingId) -> Option<UserId> {
        self.meeting_to_user.get(meeting_id).map(|e| *e.value())
    }

    /// Apply a meeting event to a user's state. Caller holds the write lock.
    pub fn apply(&self, us: &mut UserState, event: &Event) {
        apply_to_user(us, event, &self.meeting_to_user);
    }

    pub async fn find_by_id(&self, meeting_id: &MeetingId) -> Result<Meeting, EngineError> {
        let us = self
            .user_for_meeting(meeting_id)
            .and_then(|uid| self.get_user_state(&uid))
            .ok_or(EngineError::MeetingNotFound(*meeting_id))?;
        let guard = us.read().await;
        guard
            .get_meeting(meeting_id)
            .cloned()
            .ok_or(EngineError::MeetingNotFound(*meeting_id))
    }

    /// A user's meetings inside the optional window, by start ascending.
    pub async fn find_by_user(
        &self,
        user_id: &UserId,
        from: Option<Ms>,
        to: Option<Ms>,
    ) -> Result<Vec<Meeting>, EngineError> {
        let us = self
            .get_user_state(user_id)
            .ok_or(EngineError::UserNotFound(*user_id))?;
        let guard = us.read().await;
        Ok(guard.within(from, to).cloned().collect())
    }

    pub async fn find_overlapping(
        &self,
        user_id: &UserId,
        span: &Span,
        exclude: Option<MeetingId>,
    ) -> Result<Vec<Meeting>, EngineError> {
        let us = self
            .get_user_state(user_id)
            .ok_or(EngineError::UserNotFound(*user_id))?;
        let guard = us.read().await;
        Ok(guard.overlapping(span, exclude).cloned().collect())
    }
}

/// Apply a meeting event directly to a UserState (no locking, caller holds it).
/// Idempotent: created/updated replace by id, deleted tolerates absence.
fn apply_to_user(us: &mut UserState, event: &Event, index: &DashMap<MeetingId, UserId>) {
    match event {
        Event::MeetingCreated {
            id,
            user_id,
            title,
            description,
            span,
            created_at,
            updated_at,
        } => {
            us.insert_meeting(Meeting {
                id: *id,
                user_id: *user_id,
                title: title.clone(),
                description: description.clone(),
                span: *span,
                created_at: *created_at,
                updated_at: *updated_at,
            });
            index.insert(*id, *user_id);
        }
        Event::MeetingUpdated {
            id,
            user_id,
            title,
            description,
            span,
            updated_at,
        } => {
            let created_at = us
                .get_meeting(id)
                .map_or(*updated_at, |m| m.created_at);
            us.insert_meeting(Meeting {
                id: *id,
                user_id: *user_id,
                title: title.clone(),
                description: description.clone(),
                span: *span,
                created_at,
                updated_at: *updated_at,
            });
            index.insert(*id, *user_id);
        }
        Event::MeetingDeleted { id, .. } => {
            us.remove_meeting(*id);
            index.remove(id);
        }
        // Users are created at the map level, not here.
        Event::UserCreated { .. } => {}
    }
}

pub(crate) fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}
