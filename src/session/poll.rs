use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::require_text;
use crate::error::SessionError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollOption {
    pub id: String,
    pub text: String,
    pub vote_count: u32,
    pub voter_ids: BTreeSet<String>,
}

/// Polls belong to the whole session, not to a round or a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poll {
    pub id: String,
    pub question: String,
    pub options: Vec<PollOption>,
    pub is_anonymous: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollOptionView {
    pub id: String,
    pub text: String,
    pub vote_count: u32,
    pub percent: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voter_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollView {
    pub id: String,
    pub question: String,
    pub options: Vec<PollOptionView>,
    pub is_anonymous: bool,
    pub is_active: bool,
    pub total_votes: u32,
    pub my_option_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Poll {
    pub fn new(
        question: &str,
        options: &[String],
        is_anonymous: bool,
        now: DateTime<Utc>,
    ) -> Result<Self, SessionError> {
        let question = require_text(question, "poll question")?;
        let options: Vec<PollOption> = options
            .iter()
            .map(|text| text.trim())
            .filter(|text| !text.is_empty())
            .map(|text| PollOption {
                id: Uuid::new_v4().to_string(),
                text: text.to_string(),
                vote_count: 0,
                voter_ids: BTreeSet::new(),
            })
            .collect();
        if options.len() < 2 {
            return Err(SessionError::validation(
                "a poll needs at least two non-empty options",
            ));
        }

        Ok(Poll {
            id: Uuid::new_v4().to_string(),
            question,
            options,
            is_anonymous,
            is_active: true,
            created_at: now,
        })
    }

    pub fn option(&self, option_id: &str) -> Option<&PollOption> {
        self.options.iter().find(|o| o.id == option_id)
    }

    pub fn voted_option(&self, student_id: &str) -> Option<&PollOption> {
        self.options.iter().find(|o| o.voter_ids.contains(student_id))
    }

    pub fn total_votes(&self) -> u32 {
        self.options.iter().map(|o| o.vote_count).sum()
    }

    /// Share of all votes cast for `option`, rounded to a whole percent. An
    /// empty poll reports 0 for every option.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn percent(&self, option: &PollOption) -> u32 {
        let total = self.total_votes();
        if total == 0 {
            return 0;
        }
        (f64::from(option.vote_count) / f64::from(total) * 100.0).round() as u32
    }

    pub fn check_vote(&self, option_id: &str, student_id: &str) -> Result<(), SessionError> {
        if self.option(option_id).is_none() {
            return Err(SessionError::not_found(format!("poll option {option_id}")));
        }
        if !self.is_active {
            return Err(SessionError::invalid_state("poll is closed"));
        }
        if self.voted_option(student_id).is_some() {
            return Err(SessionError::DuplicateVote);
        }
        Ok(())
    }

    pub(crate) fn record_vote(&mut self, option_id: &str, student_id: &str) {
        if self.voted_option(student_id).is_some() {
            return;
        }
        if let Some(option) = self.options.iter_mut().find(|o| o.id == option_id) {
            option.voter_ids.insert(student_id.to_string());
            option.vote_count += 1;
        }
    }

    pub fn view_for(&self, viewer_id: &str) -> PollView {
        PollView {
            id: self.id.clone(),
            question: self.question.clone(),
            options: self
                .options
                .iter()
                .map(|o| PollOptionView {
                    id: o.id.clone(),
                    text: o.text.clone(),
                    vote_count: o.vote_count,
                    percent: self.percent(o),
                    voter_ids: (!self.is_anonymous)
                        .then(|| o.voter_ids.iter().cloned().collect()),
                })
                .collect(),
            is_anonymous: self.is_anonymous,
            is_active: self.is_active,
            total_votes: self.total_votes(),
            my_option_id: self.voted_option(viewer_id).map(|o| o.id.clone()),
            created_at: self.created_at,
        }
    }
}
