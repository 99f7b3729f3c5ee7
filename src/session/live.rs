//! Proctored exam sessions: a strictly linear WAITING -> RUNNING -> FINISHED
//! machine. Progress counters are reported by the exam client; this module only
//! records and ranks them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{require_text, Actor, Aggregate};
use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LiveStatus {
    Waiting,
    Running,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveParticipant {
    pub student_id: String,
    pub name: String,
    pub answered_count: u32,
    pub correct_count: u32,
    pub wrong_count: u32,
    pub score: f64,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSession {
    pub id: String,
    pub exam_id: String,
    pub title: String,
    pub teacher_id: String,
    pub status: LiveStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub participants: Vec<LiveParticipant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum LiveCommand {
    Join {
        name: String,
    },
    Start,
    Finish,
    ReportProgress {
        answered_count: u32,
        correct_count: u32,
        wrong_count: u32,
        score: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LiveEvent {
    ParticipantJoined {
        participant: LiveParticipant,
    },
    Started {
        at: DateTime<Utc>,
    },
    Finished {
        at: DateTime<Utc>,
    },
    ProgressReported {
        student_id: String,
        answered_count: u32,
        correct_count: u32,
        wrong_count: u32,
        score: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub student_id: String,
    pub name: String,
    pub score: f64,
    pub answered_count: u32,
    pub correct_count: u32,
    pub wrong_count: u32,
}

impl LiveSession {
    pub fn new(
        pin: String,
        title: &str,
        exam_id: &str,
        teacher_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, SessionError> {
        Ok(LiveSession {
            id: pin,
            exam_id: require_text(exam_id, "exam id")?,
            title: require_text(title, "session title")?,
            teacher_id: require_text(teacher_id, "teacher id")?,
            status: LiveStatus::Waiting,
            created_at: now,
            started_at: None,
            finished_at: None,
            participants: Vec::new(),
        })
    }

    pub fn participant(&self, student_id: &str) -> Option<&LiveParticipant> {
        self.participants.iter().find(|p| p.student_id == student_id)
    }

    /// Highest score first; equal scores keep join order.
    pub fn leaderboard(&self) -> Vec<LeaderboardEntry> {
        let mut ranked: Vec<&LiveParticipant> = self.participants.iter().collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked
            .into_iter()
            .enumerate()
            .map(|(index, p)| LeaderboardEntry {
                rank: index + 1,
                student_id: p.student_id.clone(),
                name: p.name.clone(),
                score: p.score,
                answered_count: p.answered_count,
                correct_count: p.correct_count,
                wrong_count: p.wrong_count,
            })
            .collect()
    }

    fn require_teacher(&self, actor: &Actor) -> Result<(), SessionError> {
        match actor {
            Actor::Teacher(id) if *id == self.teacher_id => Ok(()),
            _ => Err(SessionError::forbidden("only the session teacher can do that")),
        }
    }

    fn transition(&self, from: LiveStatus, to: LiveStatus) -> Result<(), SessionError> {
        if self.status == from {
            Ok(())
        } else {
            Err(SessionError::invalid_state(format!(
                "cannot move from {:?} to {:?}",
                self.status, to
            )))
        }
    }
}

impl Aggregate for LiveSession {
    type Command = LiveCommand;
    type Event = LiveEvent;

    fn decide(
        &self,
        actor: &Actor,
        command: LiveCommand,
        now: DateTime<Utc>,
    ) -> Result<LiveEvent, SessionError> {
        match command {
            LiveCommand::Join { name } => {
                let Actor::Student(student_id) = actor else {
                    return Err(SessionError::forbidden("teachers do not join as participants"));
                };
                let name = require_text(&name, "participant name")?;
                // Reconnecting students may rejoin a running exam, newcomers may not.
                let participant = match self.participant(student_id) {
                    Some(existing) if self.status != LiveStatus::Finished => LiveParticipant {
                        name,
                        ..existing.clone()
                    },
                    None if self.status == LiveStatus::Waiting => LiveParticipant {
                        student_id: student_id.clone(),
                        name,
                        answered_count: 0,
                        correct_count: 0,
                        wrong_count: 0,
                        score: 0.0,
                        joined_at: now,
                    },
                    _ => {
                        return Err(SessionError::invalid_state(
                            "session is no longer accepting participants",
                        ))
                    }
                };
                Ok(LiveEvent::ParticipantJoined { participant })
            }
            LiveCommand::Start => {
                self.require_teacher(actor)?;
                self.transition(LiveStatus::Waiting, LiveStatus::Running)?;
                Ok(LiveEvent::Started { at: now })
            }
            LiveCommand::Finish => {
                self.require_teacher(actor)?;
                self.transition(LiveStatus::Running, LiveStatus::Finished)?;
                Ok(LiveEvent::Finished { at: now })
            }
            LiveCommand::ReportProgress {
                answered_count,
                correct_count,
                wrong_count,
                score,
            } => {
                let Actor::Student(student_id) = actor else {
                    return Err(SessionError::forbidden("progress is reported by the exam client"));
                };
                if self.status != LiveStatus::Running {
                    return Err(SessionError::invalid_state("exam is not running"));
                }
                if self.participant(student_id).is_none() {
                    return Err(SessionError::not_found(format!("participant {student_id}")));
                }
                if correct_count.saturating_add(wrong_count) > answered_count {
                    return Err(SessionError::validation(
                        "correct and wrong answers exceed answered count",
                    ));
                }
                if !score.is_finite() || score < 0.0 {
                    return Err(SessionError::validation("score must be a non-negative number"));
                }
                Ok(LiveEvent::ProgressReported {
                    student_id: student_id.clone(),
                    answered_count,
                    correct_count,
                    wrong_count,
                    score,
                })
            }
        }
    }

    fn apply(&mut self, event: &LiveEvent) {
        match event {
            LiveEvent::ParticipantJoined { participant } => {
                match self
                    .participants
                    .iter_mut()
                    .find(|p| p.student_id == participant.student_id)
                {
                    Some(existing) => *existing = participant.clone(),
                    None => self.participants.push(participant.clone()),
                }
            }
            LiveEvent::Started { at } => {
                self.status = LiveStatus::Running;
                self.started_at = Some(*at);
            }
            LiveEvent::Finished { at } => {
                self.status = LiveStatus::Finished;
                self.finished_at = Some(*at);
            }
            LiveEvent::ProgressReported {
                student_id,
                answered_count,
                correct_count,
                wrong_count,
                score,
            } => {
                if let Some(p) =
                    self.participants.iter_mut().find(|p| p.student_id == *student_id)
                {
                    p.answered_count = *answered_count;
                    p.correct_count = *correct_count;
                    p.wrong_count = *wrong_count;
                    p.score = *score;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn teacher() -> Actor {
        Actor::Teacher("t-1".into())
    }

    fn run(s: &mut LiveSession, actor: &Actor, command: LiveCommand) -> Result<(), SessionError> {
        let event = s.decide(actor, command, Utc::now())?;
        s.apply(&event);
        Ok(())
    }

    fn exam() -> LiveSession {
        LiveSession::new("111222".into(), "Midterm", "exam-9", "t-1", Utc::now()).unwrap()
    }

    fn progress(score: f64) -> LiveCommand {
        LiveCommand::ReportProgress {
            answered_count: 3,
            correct_count: 2,
            wrong_count: 1,
            score,
        }
    }

    #[test]
    fn moves_forward_only() {
        let mut s = exam();
        assert!(run(&mut s, &teacher(), LiveCommand::Finish).is_err());
        run(&mut s, &teacher(), LiveCommand::Start).unwrap();
        assert_eq!(s.status, LiveStatus::Running);
        assert!(run(&mut s, &teacher(), LiveCommand::Start).is_err());
        run(&mut s, &teacher(), LiveCommand::Finish).unwrap();
        assert_eq!(s.status, LiveStatus::Finished);
        assert!(s.started_at.is_some() && s.finished_at.is_some());
        assert!(matches!(
            run(&mut s, &teacher(), LiveCommand::Start),
            Err(SessionError::InvalidState(_))
        ));
    }

    #[test]
    fn joins_are_accepted_while_waiting() {
        let mut s = exam();
        let a = Actor::Student("a".into());
        run(&mut s, &a, LiveCommand::Join { name: "Ana".into() }).unwrap();
        run(&mut s, &a, LiveCommand::Join { name: "Ana B".into() }).unwrap();
        assert_eq!(s.participants.len(), 1);
        run(&mut s, &teacher(), LiveCommand::Start).unwrap();
        run(&mut s, &a, LiveCommand::Join { name: "Ana".into() }).unwrap();
        let late =
            run(&mut s, &Actor::Student("z".into()), LiveCommand::Join { name: "Zed".into() });
        assert!(matches!(late, Err(SessionError::InvalidState(_))));
    }

    #[test]
    fn progress_only_while_running() {
        let mut s = exam();
        let a = Actor::Student("a".into());
        run(&mut s, &a, LiveCommand::Join { name: "Ana".into() }).unwrap();
        assert!(run(&mut s, &a, progress(5.0)).is_err());
        run(&mut s, &teacher(), LiveCommand::Start).unwrap();
        run(&mut s, &a, progress(5.0)).unwrap();
        assert_eq!(s.participants[0].correct_count, 2);
        let bad = LiveCommand::ReportProgress {
            answered_count: 1,
            correct_count: 1,
            wrong_count: 1,
            score: 1.0,
        };
        assert!(matches!(run(&mut s, &a, bad), Err(SessionError::Validation(_))));
    }

    #[test]
    fn leaderboard_sorts_by_score_then_join_order() {
        let mut s = exam();
        for (id, name) in [("a", "Ana"), ("b", "Bo"), ("c", "Cy")] {
            run(&mut s, &Actor::Student(id.into()), LiveCommand::Join { name: name.into() })
                .unwrap();
        }
        run(&mut s, &teacher(), LiveCommand::Start).unwrap();
        run(&mut s, &Actor::Student("a".into()), progress(4.0)).unwrap();
        run(&mut s, &Actor::Student("b".into()), progress(9.0)).unwrap();
        run(&mut s, &Actor::Student("c".into()), progress(4.0)).unwrap();
        let board: Vec<(usize, String)> = s
            .leaderboard()
            .into_iter()
            .map(|e| (e.rank, e.student_id))
            .collect();
        assert_eq!(board, [(1, "b".to_string()), (2, "a".to_string()), (3, "c".to_string())]);
    }
}
