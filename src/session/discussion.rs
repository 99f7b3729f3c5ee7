use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::breakout::{round_robin, RoomAssignment};
use super::poll::Poll;
use super::{content, require_text, Actor, Aggregate};
use crate::error::SessionError;

/// The implicit room every participant starts in. Never stored among breakout rooms.
pub const MAIN_ROOM: &str = "MAIN";
pub const TEACHER_NAME: &str = "Teacher";
pub const SYSTEM_SENDER: &str = "system";
/// Upper bound on breakout rooms opened by one command.
pub const MAX_BREAKOUT_ROOMS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    Full,
    HiddenAll,
    NameOnly,
    ContentOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub student_id: String,
    pub name: String,
    pub is_hand_raised: bool,
    pub current_room_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakoutRoom {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    #[default]
    Text,
    Sticker,
    Image,
    System,
}

/// A chat line, permanently tagged with the room and round it was sent in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub room_id: String,
    pub round_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscussionSession {
    pub id: String,
    pub title: String,
    pub teacher_id: String,
    pub status: SessionStatus,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
    pub rounds: Vec<Round>,
    pub active_round_id: String,
    pub participants: Vec<Participant>,
    pub messages: Vec<ChatMessage>,
    pub polls: Vec<Poll>,
    pub breakout_rooms: Vec<BreakoutRoom>,
    /// Every breakout room ever opened, so torn-down rooms keep their names in history.
    #[serde(default)]
    pub room_history: Vec<BreakoutRoom>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DiscussionCommand {
    Join {
        name: String,
    },
    AddRound {
        name: String,
    },
    SetActiveRound {
        round_id: String,
    },
    /// `viewing_round_id` is the round the sender is looking at; sends are only
    /// accepted while it is the active round. `viewing_room_id` is only
    /// consulted for the teacher, students always post into their own room.
    SendMessage {
        viewing_round_id: String,
        viewing_room_id: Option<String>,
        kind: MessageKind,
        content: String,
    },
    PostSystemMessage {
        room_id: String,
        content: String,
    },
    SetVisibility {
        mode: Visibility,
    },
    CreateBreakoutRooms {
        names: Vec<String>,
    },
    /// Opens `group_count` rooms and deals participants into them round-robin.
    /// `order` lists student ids to deal first; everyone else follows in join order.
    SplitIntoGroups {
        group_count: usize,
        order: Vec<String>,
    },
    AssignToRoom {
        student_id: String,
        room_id: String,
    },
    DissolveRooms,
    CreatePoll {
        question: String,
        options: Vec<String>,
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
    ToggleHandRaise {
        student_id: String,
    },
    LowerAllHands,
    End,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DiscussionEvent {
    ParticipantJoined { participant: Participant },
    RoundAdded { round: Round },
    ActiveRoundChanged { round_id: String },
    MessagePosted { message: ChatMessage },
    VisibilityChanged { mode: Visibility },
    BreakoutRoomsReplaced { rooms: Vec<BreakoutRoom> },
    GroupsSplit { rooms: Vec<BreakoutRoom>, assignments: Vec<RoomAssignment> },
    ParticipantMoved { student_id: String, room_id: String },
    RoomsDissolved,
    PollCreated { poll: Poll },
    VoteCast { poll_id: String, option_id: String, student_id: String },
    PollActiveChanged { poll_id: String, is_active: bool },
    HandToggled { student_id: String, raised: bool },
    HandsLowered,
    SessionEnded { at: DateTime<Utc> },
}

impl DiscussionSession {
    pub fn new(
        pin: String,
        title: &str,
        teacher_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, SessionError> {
        let title = require_text(title, "session title")?;
        let teacher_id = require_text(teacher_id, "teacher id")?;
        let first_round = Round {
            id: Uuid::new_v4().to_string(),
            name: "Round 1".to_string(),
            created_at: now,
        };

        Ok(DiscussionSession {
            id: pin,
            title,
            teacher_id,
            status: SessionStatus::Active,
            visibility: Visibility::Full,
            created_at: now,
            active_round_id: first_round.id.clone(),
            rounds: vec![first_round],
            participants: Vec::new(),
            messages: Vec::new(),
            polls: Vec::new(),
            breakout_rooms: Vec::new(),
            room_history: Vec::new(),
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn active_round(&self) -> Option<&Round> {
        self.round(&self.active_round_id)
    }

    pub fn round(&self, round_id: &str) -> Option<&Round> {
        self.rounds.iter().find(|r| r.id == round_id)
    }

    pub fn participant(&self, student_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.student_id == student_id)
    }

    pub fn poll(&self, poll_id: &str) -> Option<&Poll> {
        self.polls.iter().find(|p| p.id == poll_id)
    }

    pub fn room_exists(&self, room_id: &str) -> bool {
        room_id == MAIN_ROOM || self.breakout_rooms.iter().any(|r| r.id == room_id)
    }

    /// Display name for a room id, including rooms that have since been dissolved.
    pub fn room_name(&self, room_id: &str) -> Option<&str> {
        if room_id == MAIN_ROOM {
            return Some("Main room");
        }
        self.breakout_rooms
            .iter()
            .chain(self.room_history.iter().rev())
            .find(|r| r.id == room_id)
            .map(|r| r.name.as_str())
    }

    /// Chat is writable only in the active round of an active session.
    pub fn is_writable(&self, round_id: &str) -> bool {
        self.is_active() && round_id == self.active_round_id
    }

    /// Raised hands in participant-list order.
    pub fn raised_hands(&self) -> Vec<&Participant> {
        self.participants.iter().filter(|p| p.is_hand_raised).collect()
    }

    fn require_active(&self) -> Result<(), SessionError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(SessionError::invalid_state("session has finished"))
        }
    }

    fn require_teacher(&self, actor: &Actor) -> Result<(), SessionError> {
        match actor {
            Actor::Teacher(id) if *id == self.teacher_id => Ok(()),
            _ => Err(SessionError::forbidden("only the session teacher can do that")),
        }
    }

    fn require_participant(&self, actor: &Actor) -> Result<&Participant, SessionError> {
        match actor {
            Actor::Student(id) => self
                .participant(id)
                .ok_or_else(|| SessionError::not_found(format!("participant {id}"))),
            Actor::Teacher(_) => Err(SessionError::forbidden("only students can do that")),
        }
    }

    fn require_room(&self, room_id: &str) -> Result<(), SessionError> {
        if self.room_exists(room_id) {
            Ok(())
        } else {
            Err(SessionError::not_found(format!("room {room_id}")))
        }
    }

    fn new_rooms(names: Vec<String>) -> Result<Vec<BreakoutRoom>, SessionError> {
        if names.len() > MAX_BREAKOUT_ROOMS {
            return Err(SessionError::validation(format!(
                "at most {MAX_BREAKOUT_ROOMS} breakout rooms are allowed"
            )));
        }
        let rooms = names
            .into_iter()
            .map(|name| {
                Ok(BreakoutRoom {
                    id: Uuid::new_v4().to_string(),
                    name: require_text(&name, "room name")?,
                })
            })
            .collect::<Result<Vec<_>, SessionError>>()?;
        if rooms.is_empty() {
            return Err(SessionError::validation("at least one breakout room is required"));
        }
        Ok(rooms)
    }

    fn split_order(&self, order: &[String]) -> Vec<String> {
        let mut ordered: Vec<String> = Vec::with_capacity(self.participants.len());
        for id in order {
            if self.participant(id).is_some() && !ordered.contains(id) {
                ordered.push(id.clone());
            }
        }
        for p in &self.participants {
            if !ordered.contains(&p.student_id) {
                ordered.push(p.student_id.clone());
            }
        }
        ordered
    }

    fn decide_message(
        &self,
        actor: &Actor,
        viewing_round_id: &str,
        viewing_room_id: Option<String>,
        kind: MessageKind,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<DiscussionEvent, SessionError> {
        self.require_active()?;
        if self.round(viewing_round_id).is_none() {
            return Err(SessionError::not_found(format!("round {viewing_round_id}")));
        }
        if viewing_round_id != self.active_round_id {
            return Err(SessionError::invalid_state(
                "this round is read-only; switch to the active round to chat",
            ));
        }
        let (sender_id, sender_name, room_id) = match actor {
            Actor::Teacher(_) => {
                self.require_teacher(actor)?;
                let room_id = viewing_room_id.unwrap_or_else(|| MAIN_ROOM.to_string());
                self.require_room(&room_id)?;
                (self.teacher_id.clone(), TEACHER_NAME.to_string(), room_id)
            }
            Actor::Student(_) => {
                let participant = self.require_participant(actor)?;
                (
                    participant.student_id.clone(),
                    participant.name.clone(),
                    participant.current_room_id.clone(),
                )
            }
        };
        let content = content::validate(kind, content)?;

        Ok(DiscussionEvent::MessagePosted {
            message: ChatMessage {
                id: Uuid::new_v4().to_string(),
                sender_id,
                sender_name,
                content,
                kind,
                timestamp: now,
                room_id,
                round_id: self.active_round_id.clone(),
            },
        })
    }

    fn reset_stale_rooms(&mut self) {
        for p in &mut self.participants {
            let stale = p.current_room_id != MAIN_ROOM
                && !self.breakout_rooms.iter().any(|r| r.id == p.current_room_id);
            if stale {
                p.current_room_id = MAIN_ROOM.to_string();
            }
        }
    }

    fn replace_rooms(&mut self, rooms: &[BreakoutRoom]) {
        self.breakout_rooms = rooms.to_vec();
        self.room_history.extend(rooms.iter().cloned());
    }

    fn participant_mut(&mut self, student_id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.student_id == student_id)
    }
}

impl Aggregate for DiscussionSession {
    type Command = DiscussionCommand;
    type Event = DiscussionEvent;

    #[allow(clippy::too_many_lines)]
    fn decide(
        &self,
        actor: &Actor,
        command: DiscussionCommand,
        now: DateTime<Utc>,
    ) -> Result<DiscussionEvent, SessionError> {
        match command {
            DiscussionCommand::Join { name } => {
                self.require_active()?;
                let Actor::Student(student_id) = actor else {
                    return Err(SessionError::forbidden("teachers do not join as participants"));
                };
                let name = require_text(&name, "participant name")?;
                let participant = match self.participant(student_id) {
                    Some(existing) => Participant {
                        name,
                        ..existing.clone()
                    },
                    None => Participant {
                        student_id: student_id.clone(),
                        name,
                        is_hand_raised: false,
                        current_room_id: MAIN_ROOM.to_string(),
                    },
                };
                Ok(DiscussionEvent::ParticipantJoined { participant })
            }

            DiscussionCommand::AddRound { name } => {
                self.require_teacher(actor)?;
                let name = require_text(&name, "round name")?;
                self.require_active()?;
                Ok(DiscussionEvent::RoundAdded {
                    round: Round {
                        id: Uuid::new_v4().to_string(),
                        name,
                        created_at: now,
                    },
                })
            }

            DiscussionCommand::SetActiveRound { round_id } => {
                self.require_teacher(actor)?;
                if self.round(&round_id).is_none() {
                    return Err(SessionError::not_found(format!("round {round_id}")));
                }
                self.require_active()?;
                Ok(DiscussionEvent::ActiveRoundChanged { round_id })
            }

            DiscussionCommand::SendMessage {
                viewing_round_id,
                viewing_room_id,
                kind,
                content,
            } => {
                self.decide_message(actor, &viewing_round_id, viewing_room_id, kind, &content, now)
            }

            DiscussionCommand::PostSystemMessage { room_id, content } => {
                self.require_teacher(actor)?;
                self.require_active()?;
                self.require_room(&room_id)?;
                let content = require_text(&content, "system message")?;
                Ok(DiscussionEvent::MessagePosted {
                    message: ChatMessage {
                        id: Uuid::new_v4().to_string(),
                        sender_id: SYSTEM_SENDER.to_string(),
                        sender_name: String::new(),
                        content,
                        kind: MessageKind::System,
                        timestamp: now,
                        room_id,
                        round_id: self.active_round_id.clone(),
                    },
                })
            }

            DiscussionCommand::SetVisibility { mode } => {
                self.require_teacher(actor)?;
                self.require_active()?;
                Ok(DiscussionEvent::VisibilityChanged { mode })
            }

            DiscussionCommand::CreateBreakoutRooms { names } => {
                self.require_teacher(actor)?;
                self.require_active()?;
                let rooms = Self::new_rooms(names)?;
                Ok(DiscussionEvent::BreakoutRoomsReplaced { rooms })
            }

            DiscussionCommand::SplitIntoGroups { group_count, order } => {
                self.require_teacher(actor)?;
                self.require_active()?;
                if group_count == 0 {
                    return Err(SessionError::validation("group count must be at least 1"));
                }
                if group_count > MAX_BREAKOUT_ROOMS {
                    return Err(SessionError::validation(format!(
                        "at most {MAX_BREAKOUT_ROOMS} groups are allowed"
                    )));
                }
                let names = (1..=group_count).map(|i| format!("Group {i}")).collect();
                let rooms = Self::new_rooms(names)?;
                let room_ids: Vec<String> = rooms.iter().map(|r| r.id.clone()).collect();
                let assignments = round_robin(&self.split_order(&order), &room_ids);
                Ok(DiscussionEvent::GroupsSplit { rooms, assignments })
            }

            DiscussionCommand::AssignToRoom { student_id, room_id } => {
                self.require_teacher(actor)?;
                self.require_active()?;
                if self.participant(&student_id).is_none() {
                    return Err(SessionError::not_found(format!("participant {student_id}")));
                }
                self.require_room(&room_id)?;
                Ok(DiscussionEvent::ParticipantMoved { student_id, room_id })
            }

            DiscussionCommand::DissolveRooms => {
                self.require_teacher(actor)?;
                self.require_active()?;
                Ok(DiscussionEvent::RoomsDissolved)
            }

            DiscussionCommand::CreatePoll {
                question,
                options,
                is_anonymous,
            } => {
                self.require_teacher(actor)?;
                self.require_active()?;
                let poll = Poll::new(&question, &options, is_anonymous, now)?;
                Ok(DiscussionEvent::PollCreated { poll })
            }

            DiscussionCommand::Vote { poll_id, option_id } => {
                self.require_active()?;
                let student_id = self.require_participant(actor)?.student_id.clone();
                let poll = self
                    .poll(&poll_id)
                    .ok_or_else(|| SessionError::not_found(format!("poll {poll_id}")))?;
                poll.check_vote(&option_id, &student_id)?;
                Ok(DiscussionEvent::VoteCast {
                    poll_id,
                    option_id,
                    student_id,
                })
            }

            DiscussionCommand::SetPollActive { poll_id, is_active } => {
                self.require_teacher(actor)?;
                self.require_active()?;
                if self.poll(&poll_id).is_none() {
                    return Err(SessionError::not_found(format!("poll {poll_id}")));
                }
                Ok(DiscussionEvent::PollActiveChanged { poll_id, is_active })
            }

            DiscussionCommand::ToggleHandRaise { student_id } => {
                self.require_active()?;
                match actor {
                    Actor::Student(id) if *id != student_id => {
                        return Err(SessionError::forbidden(
                            "students can only raise their own hand",
                        ));
                    }
                    Actor::Teacher(_) => self.require_teacher(actor)?,
                    Actor::Student(_) => {}
                }
                let participant = self
                    .participant(&student_id)
                    .ok_or_else(|| SessionError::not_found(format!("participant {student_id}")))?;
                Ok(DiscussionEvent::HandToggled {
                    raised: !participant.is_hand_raised,
                    student_id,
                })
            }

            DiscussionCommand::LowerAllHands => {
                self.require_teacher(actor)?;
                self.require_active()?;
                Ok(DiscussionEvent::HandsLowered)
            }

            DiscussionCommand::End => {
                self.require_teacher(actor)?;
                if !self.is_active() {
                    return Err(SessionError::invalid_state("session has already finished"));
                }
                Ok(DiscussionEvent::SessionEnded { at: now })
            }
        }
    }

    fn apply(&mut self, event: &DiscussionEvent) {
        match event {
            DiscussionEvent::ParticipantJoined { participant } => {
                match self.participant_mut(&participant.student_id) {
                    Some(existing) => *existing = participant.clone(),
                    None => self.participants.push(participant.clone()),
                }
            }
            DiscussionEvent::RoundAdded { round } => self.rounds.push(round.clone()),
            DiscussionEvent::ActiveRoundChanged { round_id } => {
                if self.round(round_id).is_some() {
                    self.active_round_id.clone_from(round_id);
                }
            }
            DiscussionEvent::MessagePosted { message } => self.messages.push(message.clone()),
            DiscussionEvent::VisibilityChanged { mode } => self.visibility = *mode,
            DiscussionEvent::BreakoutRoomsReplaced { rooms } => {
                self.replace_rooms(rooms);
                self.reset_stale_rooms();
            }
            DiscussionEvent::GroupsSplit { rooms, assignments } => {
                self.replace_rooms(rooms);
                for p in &mut self.participants {
                    p.current_room_id = MAIN_ROOM.to_string();
                }
                for a in assignments {
                    if let Some(p) = self.participant_mut(&a.student_id) {
                        p.current_room_id.clone_from(&a.room_id);
                    }
                }
            }
            DiscussionEvent::ParticipantMoved { student_id, room_id } => {
                if let Some(p) = self.participant_mut(student_id) {
                    p.current_room_id.clone_from(room_id);
                }
            }
            DiscussionEvent::RoomsDissolved => {
                self.breakout_rooms.clear();
                for p in &mut self.participants {
                    p.current_room_id = MAIN_ROOM.to_string();
                }
            }
            DiscussionEvent::PollCreated { poll } => self.polls.push(poll.clone()),
            DiscussionEvent::VoteCast {
                poll_id,
                option_id,
                student_id,
            } => {
                if let Some(poll) = self.polls.iter_mut().find(|p| p.id == *poll_id) {
                    poll.record_vote(option_id, student_id);
                }
            }
            DiscussionEvent::PollActiveChanged { poll_id, is_active } => {
                if let Some(poll) = self.polls.iter_mut().find(|p| p.id == *poll_id) {
                    poll.is_active = *is_active;
                }
            }
            DiscussionEvent::HandToggled { student_id, raised } => {
                if let Some(p) = self.participant_mut(student_id) {
                    p.is_hand_raised = *raised;
                }
            }
            DiscussionEvent::HandsLowered => {
                for p in &mut self.participants {
                    p.is_hand_raised = false;
                }
            }
            DiscussionEvent::SessionEnded { .. } => self.status = SessionStatus::Finished,
        }
    }
}
