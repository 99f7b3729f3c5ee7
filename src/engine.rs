//! Per-session command queues.
//!
//! Each live session is owned by one tokio task that drains an mpsc queue, so
//! commands and reads for a session are handled strictly one after another.
//! A command is decided, committed to the store, and only then applied.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::error::SessionError;
use crate::pin::allocate_pin;
use crate::session::{
    Actor, Aggregate, DiscussionCommand, DiscussionEvent, DiscussionSession, LiveCommand,
    LiveEvent, LiveSession,
};
use crate::store::{SessionStore, StoredSession};

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Request<A: Aggregate> {
    Execute {
        actor: Actor,
        command: A::Command,
        reply: Reply<A::Event>,
    },
    Query(Box<dyn FnOnce(&A) + Send>),
}

pub struct SessionHandle<A: Aggregate> {
    tx: mpsc::UnboundedSender<Request<A>>,
}

impl<A: Aggregate> Clone for SessionHandle<A> {
    fn clone(&self) -> Self {
        SessionHandle {
            tx: self.tx.clone(),
        }
    }
}

fn closed() -> SessionError {
    SessionError::not_found("session")
}

impl<A: Aggregate> SessionHandle<A> {
    fn spawn(pin: String, state: A, store: Arc<dyn SessionStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Request<A>>();
        tokio::spawn(async move {
            let mut state = state;
            while let Some(request) = rx.recv().await {
                match request {
                    Request::Execute {
                        actor,
                        command,
                        reply,
                    } => {
                        let result =
                            Self::commit(&pin, &mut state, store.as_ref(), &actor, command).await;
                        let _ = reply.send(result);
                    }
                    Request::Query(read) => read(&state),
                }
            }
            log::debug!("command queue for session {pin} closed");
        });
        SessionHandle { tx }
    }

    async fn commit(
        pin: &str,
        state: &mut A,
        store: &dyn SessionStore,
        actor: &Actor,
        command: A::Command,
    ) -> Result<A::Event, SessionError> {
        let event = state.decide(actor, command, Utc::now())?;
        if let Err(e) = store.append(pin, &event.clone().into()).await {
            log::error!("failed to persist event for session {pin}: {e}");
            return Err(e.into());
        }
        state.apply(&event);
        Ok(event)
    }

    pub async fn execute(
        &self,
        actor: Actor,
        command: A::Command,
    ) -> Result<A::Event, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Execute {
                actor,
                command,
                reply,
            })
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())?
    }

    /// Runs `read` against the latest committed state, in queue order.
    pub async fn query<R, F>(&self, read: F) -> Result<R, SessionError>
    where
        R: Send + 'static,
        F: FnOnce(&A) -> R + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Query(Box::new(move |state: &A| {
                let _ = reply.send(read(state));
            })))
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Discussion,
    Live,
}

#[derive(Default)]
struct Registry {
    discussions: HashMap<String, SessionHandle<DiscussionSession>>,
    lives: HashMap<String, SessionHandle<LiveSession>>,
    /// PINs handed out to sessions whose creation is still being written.
    reserved: HashSet<String>,
}

impl Registry {
    fn contains(&self, pin: &str) -> bool {
        self.discussions.contains_key(pin)
            || self.lives.contains_key(pin)
            || self.reserved.contains(pin)
    }

    fn reserve_pin(&mut self) -> Result<String, SessionError> {
        let pin = {
            let mut rng = rand::thread_rng();
            allocate_pin(&mut rng, |pin| self.contains(pin))?
        };
        self.reserved.insert(pin.clone());
        Ok(pin)
    }
}

#[derive(Clone)]
pub struct SessionEngine {
    registry: Arc<RwLock<Registry>>,
    store: Arc<dyn SessionStore>,
}

impl SessionEngine {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        SessionEngine {
            registry: Arc::new(RwLock::new(Registry::default())),
            store,
        }
    }

    /// Starts an engine with every session the store still holds.
    pub async fn restore(store: Arc<dyn SessionStore>) -> Result<Self, SessionError> {
        let sessions = store.load_all().await?;
        let engine = Self::new(store);
        {
            let mut registry = engine.registry.write().await;
            for session in sessions {
                let pin = session.pin().to_string();
                match session {
                    StoredSession::Discussion(s) => {
                        let handle = SessionHandle::spawn(pin.clone(), s, engine.store.clone());
                        registry.discussions.insert(pin, handle);
                    }
                    StoredSession::Live(s) => {
                        let handle = SessionHandle::spawn(pin.clone(), s, engine.store.clone());
                        registry.lives.insert(pin, handle);
                    }
                }
            }
            log::info!(
                "restored {} discussion and {} live sessions",
                registry.discussions.len(),
                registry.lives.len()
            );
        }
        Ok(engine)
    }

    pub async fn kind_of(&self, pin: &str) -> Option<SessionKind> {
        let registry = self.registry.read().await;
        if registry.discussions.contains_key(pin) {
            Some(SessionKind::Discussion)
        } else if registry.lives.contains_key(pin) {
            Some(SessionKind::Live)
        } else {
            None
        }
    }

    async fn reserve_pin(&self) -> Result<String, SessionError> {
        self.registry.write().await.reserve_pin()
    }

    async fn release_pin(&self, pin: &str) {
        self.registry.write().await.reserved.remove(pin);
    }

    pub async fn create_discussion(
        &self,
        title: &str,
        teacher_id: &str,
    ) -> Result<DiscussionSession, SessionError> {
        let pin = self.reserve_pin().await?;
        let created = match DiscussionSession::new(pin.clone(), title, teacher_id, Utc::now()) {
            Ok(session) => self.store.create_discussion(&session).await.map(|()| session),
            Err(e) => {
                self.release_pin(&pin).await;
                return Err(e);
            }
        };

        let mut registry = self.registry.write().await;
        registry.reserved.remove(&pin);
        let session = created?;
        registry.discussions.insert(
            pin.clone(),
            SessionHandle::spawn(pin.clone(), session.clone(), self.store.clone()),
        );
        log::info!("discussion {pin} \"{}\" created by {}", session.title, session.teacher_id);
        Ok(session)
    }

    pub async fn create_live(
        &self,
        title: &str,
        exam_id: &str,
        teacher_id: &str,
    ) -> Result<LiveSession, SessionError> {
        let pin = self.reserve_pin().await?;
        let created = match LiveSession::new(pin.clone(), title, exam_id, teacher_id, Utc::now()) {
            Ok(session) => self.store.create_live(&session).await.map(|()| session),
            Err(e) => {
                self.release_pin(&pin).await;
                return Err(e);
            }
        };

        let mut registry = self.registry.write().await;
        registry.reserved.remove(&pin);
        let session = created?;
        registry.lives.insert(
            pin.clone(),
            SessionHandle::spawn(pin.clone(), session.clone(), self.store.clone()),
        );
        log::info!("live exam session {pin} for exam {} created", session.exam_id);
        Ok(session)
    }

    pub async fn discussion(
        &self,
        pin: &str,
    ) -> Result<SessionHandle<DiscussionSession>, SessionError> {
        let registry = self.registry.read().await;
        registry
            .discussions
            .get(pin)
            .cloned()
            .ok_or_else(|| SessionError::not_found(format!("session {pin}")))
    }

    pub async fn live(&self, pin: &str) -> Result<SessionHandle<LiveSession>, SessionError> {
        let registry = self.registry.read().await;
        registry
            .lives
            .get(pin)
            .cloned()
            .ok_or_else(|| SessionError::not_found(format!("session {pin}")))
    }

    pub async fn execute_discussion(
        &self,
        pin: &str,
        actor: Actor,
        command: DiscussionCommand,
    ) -> Result<DiscussionEvent, SessionError> {
        log::debug!("session {pin}: {command:?} from {actor:?}");
        self.discussion(pin).await?.execute(actor, command).await
    }

    pub async fn execute_live(
        &self,
        pin: &str,
        actor: Actor,
        command: LiveCommand,
    ) -> Result<LiveEvent, SessionError> {
        log::debug!("live session {pin}: {command:?} from {actor:?}");
        self.live(pin).await?.execute(actor, command).await
    }

    /// Permanently removes a session and everything it owns. Only its teacher may do this.
    pub async fn delete(&self, pin: &str, actor: &Actor) -> Result<SessionKind, SessionError> {
        let (kind, teacher_id) = match self.kind_of(pin).await {
            Some(SessionKind::Discussion) => (
                SessionKind::Discussion,
                self.discussion(pin).await?.query(|s| s.teacher_id.clone()).await?,
            ),
            Some(SessionKind::Live) => (
                SessionKind::Live,
                self.live(pin).await?.query(|s| s.teacher_id.clone()).await?,
            ),
            None => return Err(SessionError::not_found(format!("session {pin}"))),
        };
        if *actor != Actor::Teacher(teacher_id) {
            return Err(SessionError::forbidden("only the session teacher can delete it"));
        }

        self.store.delete_session(pin).await?;
        // Dropping the handle closes the queue, which ends the session task.
        let mut registry = self.registry.write().await;
        match kind {
            SessionKind::Discussion => {
                registry.discussions.remove(pin);
            }
            SessionKind::Live => {
                registry.lives.remove(pin);
            }
        }
        log::info!("session {pin} deleted");
        Ok(kind)
    }
}
