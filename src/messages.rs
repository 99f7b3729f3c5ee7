use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::export::ExportDocument;
use crate::session::{
    LeaderboardEntry, LiveSession, MessageKind, SessionSnapshot, Transcript, Visibility,
};

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    CreateDiscussion {
        title: String,
        teacher_id: String,
    },
    CreateLive {
        title: String,
        exam_id: String,
        teacher_id: String,
    },
    /// Teacher (re)attaches to a session they own.
    OpenSession {
        pin: String,
        teacher_id: String,
    },
    /// Student joins by PIN. The name falls back to the directory when omitted.
    Join {
        pin: String,
        student_id: String,
        name: Option<String>,
    },
    Leave,
    ViewRound {
        round_id: String,
    },
    ViewRoom {
        room_id: String,
    },
    SendChat {
        #[serde(default)]
        kind: MessageKind,
        content: String,
    },
    PostSystemMessage {
        room_id: String,
        content: String,
    },
    AddRound {
        name: String,
        #[serde(default)]
        activate: bool,
    },
    SetActiveRound {
        round_id: String,
    },
    SetVisibility {
        mode: Visibility,
    },
    CreateBreakoutRooms {
        names: Vec<String>,
    },
    SplitIntoGroups {
        group_count: usize,
        #[serde(default)]
        class_id: Option<String>,
        #[serde(default)]
        shuffle: bool,
    },
    AssignToRoom {
        student_id: String,
        room_id: String,
    },
    DissolveRooms,
    CreatePoll {
        question: String,
        options: Vec<String>,
        #[serde(default)]
        is_anonymous: bool,
    },
    Vote {
        poll_id: String,
        option_id: String,
    },
    SetPollActive {
        poll_id: String,
        is_active: bool,
    },
    ToggleHand {
        #[serde(default)]
        student_id: Option<String>,
    },
    LowerAllHands,
    EndSession,
    DeleteSession,
    ExportSession,
    StartLive,
    FinishLive,
    ReportProgress {
        answered_count: u32,
        correct_count: u32,
        wrong_count: u32,
        score: f64,
    },
}

#[derive(Serialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    DiscussionCreated {
        pin: String,
    },
    LiveCreated {
        pin: String,
    },
    Joined {
        pin: String,
        student_id: String,
    },
    DiscussionState {
        session: SessionSnapshot,
        transcript: Transcript,
        viewing_room_id: String,
        viewing_round_id: String,
    },
    LiveState {
        session: LiveSession,
        leaderboard: Vec<LeaderboardEntry>,
    },
    SessionDeleted {
        pin: String,
    },
    Export {
        document: ExportDocument,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_client_messages() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"send_chat","content":"hello"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::SendChat { kind: MessageKind::Text, .. }));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"set_visibility","mode":"HIDDEN_ALL"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::SetVisibility { mode: Visibility::HiddenAll }));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"dissolve_rooms"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::DissolveRooms));
    }

    #[test]
    fn errors_carry_their_kind() {
        let text = serde_json::to_string(&ServerMessage::Error {
            kind: ErrorKind::InvalidState,
            message: "session has finished".into(),
        })
        .unwrap();
        assert_eq!(
            text,
            r#"{"type":"error","kind":"invalid_state","message":"session has finished"}"#
        );
    }
}
