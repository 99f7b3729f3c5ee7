use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::session::{DiscussionSession, MessageKind, SessionStatus, MAIN_ROOM};

#[derive(Debug, Clone, Serialize)]
pub struct ExportDocument {
    pub file_name: String,
    pub mime_type: String,
    pub content: String,
    pub sha256: String,
    pub generated_at: DateTime<Utc>,
}

/// Renders poll results and the full, unredacted transcript as Markdown.
pub fn render(session: &DiscussionSession, now: DateTime<Utc>) -> ExportDocument {
    let mut out = String::new();
    let status = match session.status {
        SessionStatus::Active => "active",
        SessionStatus::Finished => "finished",
    };
    let _ = writeln!(out, "# {}", session.title);
    let _ = writeln!(out);
    let _ = writeln!(out, "- PIN: {}", session.id);
    let _ = writeln!(out, "- Status: {status}");
    let _ = writeln!(out, "- Created: {}", session.created_at.to_rfc3339());
    if let Some(round) = session.active_round() {
        let _ = writeln!(out, "- Active round: {}", round.name);
    }
    let _ = writeln!(out, "- Participants: {}", session.participants.len());
    let _ = writeln!(out, "- Messages: {}", session.messages.len());

    if !session.polls.is_empty() {
        let _ = writeln!(out, "\n## Polls");
        for poll in &session.polls {
            let mut flags = vec![if poll.is_active { "open" } else { "closed" }];
            if poll.is_anonymous {
                flags.push("anonymous");
            }
            let _ = writeln!(out, "\n### {} ({})", poll.question, flags.join(", "));
            for option in &poll.options {
                let _ = writeln!(
                    out,
                    "- {}: {} votes ({}%)",
                    option.text,
                    option.vote_count,
                    poll.percent(option)
                );
            }
        }
    }

    let _ = writeln!(out, "\n## Transcript");
    for round in &session.rounds {
        let _ = writeln!(out, "\n### {}", round.name);
        let in_round: Vec<_> = session.messages.iter().filter(|m| m.round_id == round.id).collect();
        if in_round.is_empty() {
            let _ = writeln!(out, "\n_No messages._");
            continue;
        }

        let mut rooms: Vec<&str> = Vec::new();
        for m in &in_round {
            if !rooms.contains(&m.room_id.as_str()) {
                rooms.push(&m.room_id);
            }
        }
        rooms.sort_by_key(|room| *room != MAIN_ROOM);

        for room in rooms {
            let label = session.room_name(room).unwrap_or(room);
            let _ = writeln!(out, "\n#### {label}\n");
            for m in in_round.iter().filter(|m| m.room_id == room) {
                let time = m.timestamp.format("%H:%M:%S");
                let body = match m.kind {
                    MessageKind::Text => m.content.clone(),
                    MessageKind::Sticker => format!(":{}:", m.content),
                    MessageKind::Image => "[image]".to_string(),
                    MessageKind::System => format!("_{}_", m.content),
                };
                if m.kind == MessageKind::System {
                    let _ = writeln!(out, "- [{time}] {body}");
                } else {
                    let _ = writeln!(out, "- [{time}] **{}**: {body}", m.sender_name);
                }
            }
        }
    }

    let mut hasher = Sha256::new();
    hasher.update(out.as_bytes());
    let sha256 = format!("{:x}", hasher.finalize());

    ExportDocument {
        file_name: format!("discussion-{}-{}.md", session.id, now.format("%Y%m%d-%H%M%S")),
        mime_type: "text/markdown".to_string(),
        content: out,
        sha256,
        generated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Actor, Aggregate, DiscussionCommand, Visibility};

    fn exec(s: &mut DiscussionSession, actor: &Actor, command: DiscussionCommand) {
        let event = s.decide(actor, command, Utc::now()).unwrap();
        s.apply(&event);
    }

    fn sample() -> DiscussionSession {
        let teacher = Actor::Teacher("t-1".into());
        let ana = Actor::Student("a".into());
        let mut s =
            DiscussionSession::new("777888".into(), "Debate Club", "t-1", Utc::now()).unwrap();
        exec(&mut s, &ana, DiscussionCommand::Join { name: "Ana".into() });
        let round = s.active_round_id.clone();
        exec(
            &mut s,
            &ana,
            DiscussionCommand::SendMessage {
                viewing_round_id: round,
                viewing_room_id: None,
                kind: MessageKind::Text,
                content: "hello".into(),
            },
        );
        exec(
            &mut s,
            &teacher,
            DiscussionCommand::CreatePoll {
                question: "Agree?".into(),
                options: vec!["Yes".into(), "No".into()],
                is_anonymous: true,
            },
        );
        let poll_id = s.polls[0].id.clone();
        let option_id = s.polls[0].options[0].id.clone();
        exec(&mut s, &ana, DiscussionCommand::Vote { poll_id, option_id });
        exec(&mut s, &teacher, DiscussionCommand::SetVisibility { mode: Visibility::HiddenAll });
        exec(&mut s, &teacher, DiscussionCommand::AddRound { name: "Round 2".into() });
        s
    }

    #[test]
    fn export_includes_polls_and_unredacted_transcript() {
        let doc = render(&sample(), Utc::now());
        assert!(doc.content.starts_with("# Debate Club"));
        assert!(doc.content.contains("- Active round: Round 1"));
        assert!(doc.content.contains("### Agree? (open, anonymous)"));
        assert!(doc.content.contains("- Yes: 1 votes (100%)"));
        assert!(doc.content.contains("#### Main room"));
        assert!(doc.content.contains("**Ana**: hello"));
        assert!(doc.content.contains("### Round 2\n\n_No messages._"));
        assert!(doc.file_name.starts_with("discussion-777888-"));
    }

    #[test]
    fn digest_matches_content() {
        let doc = render(&sample(), Utc::now());
        let mut hasher = Sha256::new();
        hasher.update(doc.content.as_bytes());
        assert_eq!(doc.sha256, format!("{:x}", hasher.finalize()));
        assert_eq!(doc.sha256.len(), 64);
    }
}
