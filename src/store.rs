use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::session::{Aggregate, DiscussionEvent, DiscussionSession, LiveEvent, LiveSession};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "event", rename_all = "snake_case")]
pub enum StoredEvent {
    Discussion(DiscussionEvent),
    Live(LiveEvent),
}

impl From<DiscussionEvent> for StoredEvent {
    fn from(event: DiscussionEvent) -> Self {
        StoredEvent::Discussion(event)
    }
}

impl From<LiveEvent> for StoredEvent {
    fn from(event: LiveEvent) -> Self {
        StoredEvent::Live(event)
    }
}

/// One line of a session log: the creation snapshot first, then its events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum Record {
    DiscussionCreated { session: DiscussionSession },
    LiveCreated { session: LiveSession },
    Event { event: StoredEvent },
}

/// Persistence collaborator. Each call commits one discrete change; the engine
/// only applies a change in memory after its commit succeeded.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_discussion(&self, session: &DiscussionSession) -> Result<(), StoreError>;
    async fn create_live(&self, session: &LiveSession) -> Result<(), StoreError>;
    async fn append(&self, pin: &str, event: &StoredEvent) -> Result<(), StoreError>;
    async fn delete_session(&self, pin: &str) -> Result<(), StoreError>;
    /// Every stored session, rebuilt from its log.
    async fn load_all(&self) -> Result<Vec<StoredSession>, StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoredSession {
    Discussion(DiscussionSession),
    Live(LiveSession),
}

impl StoredSession {
    pub fn pin(&self) -> &str {
        match self {
            StoredSession::Discussion(session) => &session.id,
            StoredSession::Live(session) => &session.id,
        }
    }
}

fn fold<A: Aggregate>(mut session: A, events: impl Iterator<Item = A::Event>) -> A {
    for event in events {
        session.apply(&event);
    }
    session
}

/// Rebuilds a session from its log. Events of the other session kind are ignored.
fn replay(records: &[Record]) -> Option<StoredSession> {
    let (first, rest) = records.split_first()?;
    let session = match first {
        Record::DiscussionCreated { session } => StoredSession::Discussion(fold(
            session.clone(),
            rest.iter().filter_map(|r| match r {
                Record::Event { event: StoredEvent::Discussion(e) } => Some(e.clone()),
                _ => None,
            }),
        )),
        Record::LiveCreated { session } => StoredSession::Live(fold(
            session.clone(),
            rest.iter().filter_map(|r| match r {
                Record::Event { event: StoredEvent::Live(e) } => Some(e.clone()),
                _ => None,
            }),
        )),
        Record::Event { .. } => return None,
    };
    Some(session)
}

#[derive(Default)]
pub struct MemoryStore {
    logs: RwLock<HashMap<String, Vec<Record>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemoryStore {
    pub async fn event_count(&self, pin: &str) -> usize {
        let logs = self.logs.read().await;
        logs.get(pin).map_or(0, |log| log.len().saturating_sub(1))
    }

    pub async fn load(&self, pin: &str) -> Option<StoredSession> {
        let logs = self.logs.read().await;
        replay(logs.get(pin)?)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_discussion(&self, session: &DiscussionSession) -> Result<(), StoreError> {
        let mut logs = self.logs.write().await;
        logs.insert(
            session.id.clone(),
            vec![Record::DiscussionCreated { session: session.clone() }],
        );
        Ok(())
    }

    async fn create_live(&self, session: &LiveSession) -> Result<(), StoreError> {
        let mut logs = self.logs.write().await;
        logs.insert(
            session.id.clone(),
            vec![Record::LiveCreated { session: session.clone() }],
        );
        Ok(())
    }

    async fn append(&self, pin: &str, event: &StoredEvent) -> Result<(), StoreError> {
        let mut logs = self.logs.write().await;
        logs.entry(pin.to_string())
            .or_default()
            .push(Record::Event { event: event.clone() });
        Ok(())
    }

    async fn delete_session(&self, pin: &str) -> Result<(), StoreError> {
        let mut logs = self.logs.write().await;
        logs.remove(pin);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<StoredSession>, StoreError> {
        let logs = self.logs.read().await;
        Ok(logs.values().filter_map(|records| replay(records)).collect())
    }
}

/// Keeps one JSON-lines log per session under `dir`, named `<pin>.jsonl`.
pub struct JsonlStore {
    dir: PathBuf,
}

impl JsonlStore {
    pub async fn new(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(JsonlStore { dir })
    }

    fn path(&self, pin: &str) -> PathBuf {
        self.dir.join(format!("{pin}.jsonl"))
    }

    async fn write_first(&self, pin: &str, record: &Record) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        // Truncates any log left by an earlier session with the same PIN.
        fs::write(self.path(pin), line).await?;
        Ok(())
    }

    /// Parses a session log. A torn final line, left by a crash in the middle of
    /// an append, is dropped; damage anywhere else fails the whole log.
    async fn read_records_at(path: &Path) -> Result<Vec<Record>, StoreError> {
        let text = fs::read_to_string(path).await?;
        let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
        let mut records = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) if index + 1 == lines.len() => {
                    log::warn!("dropping torn last line of {}: {e}", path.display());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl SessionStore for JsonlStore {
    async fn create_discussion(&self, session: &DiscussionSession) -> Result<(), StoreError> {
        self.write_first(&session.id, &Record::DiscussionCreated { session: session.clone() })
            .await
    }

    async fn create_live(&self, session: &LiveSession) -> Result<(), StoreError> {
        self.write_first(&session.id, &Record::LiveCreated { session: session.clone() })
            .await
    }

    async fn append(&self, pin: &str, event: &StoredEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(&Record::Event { event: event.clone() })?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(self.path(pin))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn delete_session(&self, pin: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path(pin)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_all(&self) -> Result<Vec<StoredSession>, StoreError> {
        let mut sessions = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
                continue;
            }
            let records = match Self::read_records_at(&path).await {
                Ok(records) => records,
                Err(e) => {
                    log::warn!("skipping damaged session log {}: {e}", path.display());
                    continue;
                }
            };
            match replay(&records) {
                Some(session) => sessions.push(session),
                None => log::warn!("skipping unreadable session log {}", path.display()),
            }
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Actor, DiscussionCommand, LiveCommand};
    use chrono::Utc;
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("open_lms_store_{}", Uuid::new_v4()))
    }

    async fn exercise(store: &dyn SessionStore) -> DiscussionSession {
        let mut session =
            DiscussionSession::new("246810".into(), "History", "t-1", Utc::now()).unwrap();
        store.create_discussion(&session).await.unwrap();
        let commands = [
            (Actor::Student("a".into()), DiscussionCommand::Join { name: "Ana".into() }),
            (Actor::Teacher("t-1".into()), DiscussionCommand::AddRound { name: "Round 2".into() }),
            (
                Actor::Teacher("t-1".into()),
                DiscussionCommand::SplitIntoGroups { group_count: 2, order: vec![] },
            ),
        ];
        for (actor, command) in commands {
            let event = session.decide(&actor, command, Utc::now()).unwrap();
            store.append(&session.id, &event.clone().into()).await.unwrap();
            session.apply(&event);
        }
        session
    }

    #[tokio::test]
    async fn memory_store_replays_sessions() {
        let store = MemoryStore::new();
        let session = exercise(&store).await;
        assert_eq!(store.event_count("246810").await, 3);
        assert_eq!(store.load("246810").await, Some(StoredSession::Discussion(session)));
        store.delete_session("246810").await.unwrap();
        assert!(store.load("246810").await.is_none());
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn jsonl_store_round_trips_a_log() {
        let dir = temp_dir();
        let store = JsonlStore::new(&dir).await.unwrap();
        let session = exercise(&store).await;
        assert_eq!(store.load_all().await.unwrap(), vec![StoredSession::Discussion(session)]);

        store.delete_session("246810").await.unwrap();
        assert!(!store.path("246810").exists());
        // deleting twice is fine
        store.delete_session("246810").await.unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn jsonl_store_handles_live_sessions() {
        let dir = temp_dir();
        let store = JsonlStore::new(&dir).await.unwrap();
        let mut live =
            LiveSession::new("135790".into(), "Quiz", "exam-1", "t-1", Utc::now()).unwrap();
        store.create_live(&live).await.unwrap();
        let event = live
            .decide(
                &Actor::Student("a".into()),
                LiveCommand::Join { name: "Ana".into() },
                Utc::now(),
            )
            .unwrap();
        store.append(&live.id, &event.clone().into()).await.unwrap();
        live.apply(&event);
        std::fs::write(dir.join("notes.txt"), "not a log").unwrap();
        assert_eq!(store.load_all().await.unwrap(), vec![StoredSession::Live(live)]);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn recreating_a_pin_starts_a_fresh_log() {
        let store = MemoryStore::new();
        exercise(&store).await;
        let fresh = DiscussionSession::new("246810".into(), "Reused", "t-2", Utc::now()).unwrap();
        store.create_discussion(&fresh).await.unwrap();
        assert_eq!(store.event_count("246810").await, 0);
        let Some(StoredSession::Discussion(reloaded)) = store.load("246810").await else {
            panic!("expected a discussion log");
        };
        assert_eq!(reloaded.title, "Reused");
    }

    #[tokio::test]
    async fn jsonl_store_truncates_a_reused_pin() {
        let dir = temp_dir();
        let store = JsonlStore::new(&dir).await.unwrap();
        exercise(&store).await;
        let fresh = DiscussionSession::new("246810".into(), "Reused", "t-2", Utc::now()).unwrap();
        store.create_discussion(&fresh).await.unwrap();

        let text = std::fs::read_to_string(store.path("246810")).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert_eq!(store.load_all().await.unwrap(), vec![StoredSession::Discussion(fresh)]);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn jsonl_store_drops_a_torn_last_line() {
        let dir = temp_dir();
        let store = JsonlStore::new(&dir).await.unwrap();
        let session = exercise(&store).await;
        let healthy =
            DiscussionSession::new("111111".into(), "Chemistry", "t-2", Utc::now()).unwrap();
        store.create_discussion(&healthy).await.unwrap();

        let mut log = std::fs::OpenOptions::new().append(true).open(store.path("246810")).unwrap();
        std::io::Write::write_all(&mut log, br#"{"record":"event","event":{"ki"#).unwrap();
        drop(log);

        let mut loaded = store.load_all().await.unwrap();
        loaded.sort_by(|a, b| a.pin().cmp(b.pin()));
        assert_eq!(
            loaded,
            vec![StoredSession::Discussion(healthy), StoredSession::Discussion(session)]
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn jsonl_store_skips_a_log_damaged_in_the_middle() {
        let dir = temp_dir();
        let store = JsonlStore::new(&dir).await.unwrap();
        let session = exercise(&store).await;
        let text = std::fs::read_to_string(store.path("246810")).unwrap();
        let mut lines: Vec<&str> = text.lines().collect();
        lines.insert(1, "not json");
        std::fs::write(dir.join("135135.jsonl"), lines.join("\n")).unwrap();

        assert_eq!(store.load_all().await.unwrap(), vec![StoredSession::Discussion(session)]);
        let _ = std::fs::remove_dir_all(dir);
    }
}
