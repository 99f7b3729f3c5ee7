//! Session state machines.
//!
//! Every session kind is an [`Aggregate`]: commands are validated against the
//! current state by `decide`, which yields a self-contained event, and events are
//! folded into the state by `apply`. Replaying the creation snapshot followed by
//! the event log rebuilds a session exactly.

mod breakout;
mod content;
mod discussion;
mod live;
mod poll;
mod view;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::store::StoredEvent;

pub use discussion::{
    DiscussionCommand, DiscussionEvent, DiscussionSession, MessageKind, SessionStatus, Visibility,
    MAIN_ROOM,
};
pub use live::{LeaderboardEntry, LiveCommand, LiveEvent, LiveSession};
pub use view::{SessionSnapshot, Transcript};

/// Who issued a command. Student commands always act on the actor's own id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", content = "id", rename_all = "snake_case")]
pub enum Actor {
    Teacher(String),
    Student(String),
}

impl Actor {
    pub fn id(&self) -> &str {
        match self {
            Actor::Teacher(id) | Actor::Student(id) => id,
        }
    }

    pub fn is_teacher(&self) -> bool {
        matches!(self, Actor::Teacher(_))
    }
}

pub trait Aggregate: Send + 'static {
    type Command: Send + 'static;
    type Event: Clone + Send + Into<StoredEvent> + 'static;

    fn decide(
        &self,
        actor: &Actor,
        command: Self::Command,
        now: DateTime<Utc>,
    ) -> Result<Self::Event, SessionError>;

    fn apply(&mut self, event: &Self::Event);
}

pub(crate) fn require_text(value: &str, what: &str) -> Result<String, SessionError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SessionError::validation(format!("{what} must not be empty")));
    }
    Ok(trimmed.to_string())
}
