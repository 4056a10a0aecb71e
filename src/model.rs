use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. The only time type inside the engine.
pub type Ms = i64;

pub type UserId = Ulid;
pub type MeetingId = Ulid;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Back-to-back spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meeting {
    pub id: MeetingId,
    pub user_id: UserId,
    pub title: String,
    pub description: Option<String>,
    pub span: Span,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// One user's profile plus their meetings. This is the unit of locking:
/// every check-then-write on a user's calendar happens under its write lock.
#[derive(Debug, Clone)]
pub struct UserState {
    pub user: User,
    /// Sorted by `span.start`.
    pub meetings: Vec<Meeting>,
}

impl UserState {
    pub fn new(user: User) -> Self {
        Self {
            user,
            meetings: Vec::new(),
        }
    }

    /// Insert keeping sort order by start. Replaces a meeting with the same id.
    pub fn insert_meeting(&mut self, meeting: Meeting) {
        self.remove_meeting(meeting.id);
        let pos = self
            .meetings
            .partition_point(|m| m.span.start <= meeting.span.start);
        self.meetings.insert(pos, meeting);
    }

    pub fn remove_meeting(&mut self, id: MeetingId) -> Option<Meeting> {
        let pos = self.meetings.iter().position(|m| m.id == id)?;
        Some(self.meetings.remove(pos))
    }

    pub fn get_meeting(&self, id: &MeetingId) -> Option<&Meeting> {
        self.meetings.iter().find(|m| m.id == *id)
    }

    /// Meetings whose span overlaps `query`, skipping `exclude`.
    /// Binary search drops everything starting at or after `query.end`.
    pub fn overlapping<'a>(
        &'a self,
        query: &Span,
        exclude: Option<MeetingId>,
    ) -> impl Iterator<Item = &'a Meeting> + 'a {
        let right_bound = self.meetings.partition_point(|m| m.span.start < query.end);
        let query_start = query.start;
        self.meetings[..right_bound]
            .iter()
            .filter(move |m| m.span.end > query_start && Some(m.id) != exclude)
    }

    /// Meetings fully inside the optional `[from, to]` window.
    pub fn within(&self, from: Option<Ms>, to: Option<Ms>) -> impl Iterator<Item = &Meeting> {
        self.meetings.iter().filter(move |m| {
            from.is_none_or(|f| m.span.start >= f) && to.is_none_or(|t| m.span.end <= t)
        })
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.user.id,
            name: self.user.name.clone(),
            email: self.user.email.clone(),
        }
    }
}

/// The event types. This is the WAL record format.
///
/// Meeting events carry the full post-mutation row so replaying one twice
/// leaves the same state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserCreated {
        id: UserId,
        name: String,
        email: String,
        created_at: Ms,
    },
    MeetingCreated {
        id: MeetingId,
        user_id: UserId,
        title: String,
        description: Option<String>,
        span: Span,
        created_at: Ms,
        updated_at: Ms,
    },
    MeetingUpdated {
        id: MeetingId,
        user_id: UserId,
        title: String,
        description: Option<String>,
        span: Span,
        updated_at: Ms,
    },
    MeetingDeleted {
        id: MeetingId,
        user_id: UserId,
    },
}

impl Event {
    pub fn user_id(&self) -> UserId {
        match self {
            Event::UserCreated { id, .. } => *id,
            Event::MeetingCreated { user_id, .. }
            | Event::MeetingUpdated { user_id, .. }
            | Event::MeetingDeleted { user_id, .. } => *user_id,
        }
    }

    pub fn meeting_created(m: &Meeting) -> Self {
        Event::MeetingCreated {
            id: m.id,
            user_id: m.user_id,
            title: m.title.clone(),
            description: m.description.clone(),
            span: m.span,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

// ── Query / command types ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSummary {
    pub id: UserId,
    pub name: String,
    pub email: String,
}

/// A meeting joined with its owner's summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingRecord {
    pub id: MeetingId,
    pub user_id: UserId,
    pub title: String,
    pub description: Option<String>,
    pub start: Ms,
    pub end: Ms,
    pub user: UserSummary,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl MeetingRecord {
    pub fn new(meeting: &Meeting, user: UserSummary) -> Self {
        Self {
            id: meeting.id,
            user_id: meeting.user_id,
            title: meeting.title.clone(),
            description: meeting.description.clone(),
            start: meeting.span.start,
            end: meeting.span.end,
            user,
            created_at: meeting.created_at,
            updated_at: meeting.updated_at,
        }
    }
}

/// Fields to change on a meeting. `None` leaves the field as it is;
/// `description: Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeetingPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
}

impl MeetingPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none() && self.start.is_none() && self.end.is_none()
    }
}

/// All supplied filters must match. The date window is inclusive and a
/// meeting partly outside it is excluded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeetingFilter {
    pub user_id: Option<UserId>,
    pub start_date: Option<Ms>,
    pub end_date: Option<Ms>,
}
