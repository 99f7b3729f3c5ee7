//! Read-side projections of a discussion session.
//!
//! Redaction is computed here, at read time, from the session's current
//! visibility mode. Stored messages are never rewritten, so switching the mode
//! changes what viewers see of messages that were already sent.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::discussion::{
    BreakoutRoom, ChatMessage, DiscussionSession, MessageKind, Participant, Round, SessionStatus,
    Visibility,
};
use super::poll::PollView;
use crate::error::SessionError;

pub const ANONYMOUS_NAME: &str = "Anonymous";
pub const REDACTED_CONTENT: &str = "Message hidden";

#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub id: String,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub is_own: bool,
    pub is_redacted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Transcript {
    pub room_id: String,
    pub round_id: String,
    pub visibility: Visibility,
    /// False for historical rounds and finished sessions.
    pub writable: bool,
    /// All messages in this room and round, including ones withheld from `messages`.
    pub message_count: usize,
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub title: String,
    pub teacher_id: String,
    pub status: SessionStatus,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
    pub rounds: Vec<Round>,
    pub active_round_id: String,
    pub participants: Vec<Participant>,
    pub breakout_rooms: Vec<BreakoutRoom>,
    pub polls: Vec<PollView>,
    pub raised_hands: Vec<String>,
}

enum Rendering {
    Shown,
    Withheld,
    NameOnly,
    ContentOnly,
}

fn rendering(visibility: Visibility, message: &ChatMessage, viewer_id: &str) -> Rendering {
    if message.kind == MessageKind::System || message.sender_id == viewer_id {
        return Rendering::Shown;
    }
    match visibility {
        Visibility::Full => Rendering::Shown,
        Visibility::HiddenAll => Rendering::Withheld,
        Visibility::NameOnly => Rendering::NameOnly,
        Visibility::ContentOnly => Rendering::ContentOnly,
    }
}

fn render(message: &ChatMessage, viewer_id: &str, rendering: &Rendering) -> MessageView {
    let is_own = message.sender_id == viewer_id;
    let system = message.kind == MessageKind::System;
    let mut view = MessageView {
        id: message.id.clone(),
        sender_id: (!system).then(|| message.sender_id.clone()),
        sender_name: (!system).then(|| message.sender_name.clone()),
        content: message.content.clone(),
        kind: message.kind,
        timestamp: message.timestamp,
        is_own,
        is_redacted: false,
    };
    match rendering {
        Rendering::NameOnly => {
            view.content = REDACTED_CONTENT.to_string();
            view.is_redacted = true;
        }
        Rendering::ContentOnly => {
            view.sender_id = None;
            view.sender_name = Some(ANONYMOUS_NAME.to_string());
            view.is_redacted = true;
        }
        Rendering::Shown | Rendering::Withheld => {}
    }
    view
}

impl DiscussionSession {
    /// What `viewer_id` may see of one room in one round. Any room id is accepted
    /// so that dissolved rooms stay readable in history.
    pub fn transcript(
        &self,
        viewer_id: &str,
        room_id: &str,
        round_id: &str,
    ) -> Result<Transcript, SessionError> {
        if self.round(round_id).is_none() {
            return Err(SessionError::not_found(format!("round {round_id}")));
        }
        let in_scope: Vec<&ChatMessage> = self
            .messages
            .iter()
            .filter(|m| m.room_id == room_id && m.round_id == round_id)
            .collect();
        let messages = in_scope
            .iter()
            .filter_map(|m| match rendering(self.visibility, m, viewer_id) {
                Rendering::Withheld => None,
                r => Some(render(m, viewer_id, &r)),
            })
            .collect();

        Ok(Transcript {
            room_id: room_id.to_string(),
            round_id: round_id.to_string(),
            visibility: self.visibility,
            writable: self.is_writable(round_id),
            message_count: in_scope.len(),
            messages,
        })
    }

    pub fn snapshot_for(&self, viewer_id: &str) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            title: self.title.clone(),
            teacher_id: self.teacher_id.clone(),
            status: self.status,
            visibility: self.visibility,
            created_at: self.created_at,
            rounds: self.rounds.clone(),
            active_round_id: self.active_round_id.clone(),
            participants: self.participants.clone(),
            breakout_rooms: self.breakout_rooms.clone(),
            polls: self.polls.iter().map(|p| p.view_for(viewer_id)).collect(),
            raised_hands: self
                .raised_hands()
                .into_iter()
                .map(|p| p.student_id.clone())
                .collect(),
        }
    }
}
