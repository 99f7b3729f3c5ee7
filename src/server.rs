use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;
use warp::ws::{Message, WebSocket};
use warp::Filter;

use crate::directory::Directory;
use crate::engine::{SessionEngine, SessionKind};
use crate::error::SessionError;
use crate::export;
use crate::messages::{ClientMessage, ServerMessage};
use crate::pin::is_valid_pin;
use crate::session::{
    Actor, DiscussionCommand, DiscussionEvent, DiscussionSession, LiveCommand, MAIN_ROOM,
};

#[derive(Clone, Debug)]
enum View {
    /// The round being looked at only changes when the viewer asks; the room is
    /// only tracked for the teacher, students see the room they are in.
    Discussion { round_id: String, room_id: String },
    Live,
}

#[derive(Clone, Debug)]
struct Attachment {
    pin: String,
    actor: Actor,
    view: View,
}

struct Connection {
    tx: mpsc::UnboundedSender<Message>,
    attachment: Option<Attachment>,
}

type Connections = Arc<RwLock<HashMap<String, Connection>>>;

#[derive(Clone)]
pub struct Server {
    engine: SessionEngine,
    directory: Arc<dyn Directory>,
    connections: Connections,
}

pub fn ws_route(
    server: Server,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::path("ws")
        .and(warp::ws())
        .map(move |ws: warp::ws::Ws| {
            let server = server.clone();
            ws.on_upgrade(move |socket| async move {
                server.handle_connection(socket).await;
            })
        })
}

fn send_raw(tx: &mpsc::UnboundedSender<Message>, message: &ServerMessage) {
    match serde_json::to_string(message) {
        Ok(text) => {
            let _ = tx.send(Message::text(text));
        }
        Err(e) => log::error!("failed to serialize server message: {e}"),
    }
}

fn discussion_view(
    session: &DiscussionSession,
    attachment: &Attachment,
) -> Result<ServerMessage, SessionError> {
    let View::Discussion { round_id, room_id } = &attachment.view else {
        return Err(SessionError::invalid_state("not attached to a discussion"));
    };
    let viewer = attachment.actor.id();
    let room_id = match &attachment.actor {
        Actor::Student(id) => session
            .participant(id)
            .map_or(MAIN_ROOM, |p| p.current_room_id.as_str())
            .to_string(),
        Actor::Teacher(_) => room_id.clone(),
    };
    let transcript = session.transcript(viewer, &room_id, round_id)?;
    Ok(ServerMessage::DiscussionState {
        session: session.snapshot_for(viewer),
        transcript,
        viewing_room_id: room_id,
        viewing_round_id: round_id.clone(),
    })
}

impl Server {
    pub fn new(engine: SessionEngine, directory: Arc<dyn Directory>) -> Self {
        Server {
            engine,
            directory,
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn handle_connection(&self, ws: WebSocket) {
        let connection_id = Uuid::new_v4().to_string();
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        {
            let mut connections = self.connections.write().await;
            connections.insert(
                connection_id.clone(),
                Connection {
                    tx,
                    attachment: None,
                },
            );
        }
        log::debug!("connection {connection_id} opened");

        let server = self.clone();
        tokio::spawn(async move {
            while let Some(result) = ws_rx.next().await {
                match result {
                    Ok(msg) => {
                        if msg.is_close() {
                            break;
                        }
                        let Ok(text) = msg.to_str() else {
                            continue;
                        };
                        match serde_json::from_str::<ClientMessage>(text) {
                            Ok(client_msg) => {
                                server.handle_client_message(&connection_id, client_msg).await;
                            }
                            Err(e) => {
                                let err =
                                    SessionError::validation(format!("malformed message: {e}"));
                                server.send_error(&connection_id, &err).await;
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("WebSocket error on {connection_id}: {e}");
                        break;
                    }
                }
            }

            server.handle_disconnect(&connection_id).await;
        });

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = ws_tx.send(message).await {
                    log::warn!("failed to send WebSocket message: {e}");
                    break;
                }
            }
        });
    }

    async fn handle_client_message(&self, connection_id: &str, message: ClientMessage) {
        if let Err(e) = self.dispatch(connection_id, message).await {
            if e.is_benign() {
                log::debug!("ignoring {e} from {connection_id}");
            } else {
                log::debug!("command from {connection_id} failed: {e}");
                self.send_error(connection_id, &e).await;
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn dispatch(
        &self,
        connection_id: &str,
        message: ClientMessage,
    ) -> Result<(), SessionError> {
        match message {
            ClientMessage::CreateDiscussion { title, teacher_id } => {
                let session = self.engine.create_discussion(&title, &teacher_id).await?;
                self.attach(
                    connection_id,
                    Attachment {
                        pin: session.id.clone(),
                        actor: Actor::Teacher(session.teacher_id.clone()),
                        view: View::Discussion {
                            round_id: session.active_round_id.clone(),
                            room_id: MAIN_ROOM.to_string(),
                        },
                    },
                )
                .await;
                let created = ServerMessage::DiscussionCreated { pin: session.id.clone() };
                self.send(connection_id, &created).await;
                self.push_discussion(&session.id, None).await;
            }

            ClientMessage::CreateLive {
                title,
                exam_id,
                teacher_id,
            } => {
                let session = self.engine.create_live(&title, &exam_id, &teacher_id).await?;
                self.attach(
                    connection_id,
                    Attachment {
                        pin: session.id.clone(),
                        actor: Actor::Teacher(session.teacher_id.clone()),
                        view: View::Live,
                    },
                )
                .await;
                self.send(connection_id, &ServerMessage::LiveCreated { pin: session.id.clone() })
                    .await;
                self.push_live(&session.id).await;
            }

            ClientMessage::OpenSession { pin, teacher_id } => {
                let actor = Actor::Teacher(teacher_id);
                let view = match self.engine.kind_of(&pin).await {
                    Some(SessionKind::Discussion) => {
                        let (owner, round_id) = self
                            .engine
                            .discussion(&pin)
                            .await?
                            .query(|s| (s.teacher_id.clone(), s.active_round_id.clone()))
                            .await?;
                        if owner != actor.id() {
                            return Err(SessionError::forbidden(
                                "this session belongs to another teacher",
                            ));
                        }
                        View::Discussion {
                            round_id,
                            room_id: MAIN_ROOM.to_string(),
                        }
                    }
                    Some(SessionKind::Live) => {
                        let owner = self
                            .engine
                            .live(&pin)
                            .await?
                            .query(|s| s.teacher_id.clone())
                            .await?;
                        if owner != actor.id() {
                            return Err(SessionError::forbidden(
                                "this session belongs to another teacher",
                            ));
                        }
                        View::Live
                    }
                    None => return Err(SessionError::not_found(format!("session {pin}"))),
                };
                let is_live = matches!(view, View::Live);
                self.attach(connection_id, Attachment { pin: pin.clone(), actor, view }).await;
                if is_live {
                    self.push_live(&pin).await;
                } else {
                    self.push_discussion(&pin, Some(connection_id)).await;
                }
            }

            ClientMessage::Join {
                pin,
                student_id,
                name,
            } => self.join(connection_id, pin, student_id, name).await?,

            ClientMessage::Leave => {
                self.detach(connection_id).await;
            }

            ClientMessage::ViewRound { round_id } => {
                let attachment = self.discussion_attachment(connection_id).await?;
                let wanted = round_id.clone();
                let exists = self
                    .engine
                    .discussion(&attachment.pin)
                    .await?
                    .query(move |s| s.round(&wanted).is_some())
                    .await?;
                if !exists {
                    return Err(SessionError::not_found(format!("round {round_id}")));
                }
                self.update_view(connection_id, Some(round_id), None).await;
                self.push_discussion(&attachment.pin, Some(connection_id)).await;
            }

            ClientMessage::ViewRoom { room_id } => {
                let attachment = self.discussion_attachment(connection_id).await?;
                if !attachment.actor.is_teacher() {
                    return Err(SessionError::forbidden(
                        "students see the room they are assigned to",
                    ));
                }
                let wanted = room_id.clone();
                let known = self
                    .engine
                    .discussion(&attachment.pin)
                    .await?
                    .query(move |s| s.room_name(&wanted).is_some())
                    .await?;
                if !known {
                    return Err(SessionError::not_found(format!("room {room_id}")));
                }
                self.update_view(connection_id, None, Some(room_id)).await;
                self.push_discussion(&attachment.pin, Some(connection_id)).await;
            }

            ClientMessage::SendChat { kind, content } => {
                let attachment = self.discussion_attachment(connection_id).await?;
                let View::Discussion { round_id, room_id } = attachment.view.clone() else {
                    return Err(SessionError::invalid_state("not attached to a discussion"));
                };
                let command = DiscussionCommand::SendMessage {
                    viewing_round_id: round_id,
                    viewing_room_id: attachment.actor.is_teacher().then_some(room_id),
                    kind,
                    content,
                };
                self.run_discussion(connection_id, &attachment, command).await?;
            }

            ClientMessage::PostSystemMessage { room_id, content } => {
                self.discussion_command(
                    connection_id,
                    DiscussionCommand::PostSystemMessage { room_id, content },
                )
                .await?;
            }

            ClientMessage::AddRound { name, activate } => {
                let event = self
                    .discussion_command(connection_id, DiscussionCommand::AddRound { name })
                    .await?;
                if let (true, DiscussionEvent::RoundAdded { round }) = (activate, event) {
                    self.discussion_command(
                        connection_id,
                        DiscussionCommand::SetActiveRound { round_id: round.id },
                    )
                    .await?;
                }
            }

            ClientMessage::SetActiveRound { round_id } => {
                self.discussion_command(
                    connection_id,
                    DiscussionCommand::SetActiveRound { round_id },
                )
                .await?;
            }

            ClientMessage::SetVisibility { mode } => {
                self.discussion_command(connection_id, DiscussionCommand::SetVisibility { mode })
                    .await?;
            }

            ClientMessage::CreateBreakoutRooms { names } => {
                self.discussion_command(
                    connection_id,
                    DiscussionCommand::CreateBreakoutRooms { names },
                )
                .await?;
            }

            ClientMessage::SplitIntoGroups {
                group_count,
                class_id,
                shuffle,
            } => {
                let attachment = self.discussion_attachment(connection_id).await?;
                let mut order: Vec<String> = match class_id {
                    Some(class_id) => self
                        .directory
                        .class_roster(&class_id)
                        .await
                        .into_iter()
                        .map(|student| student.id)
                        .collect(),
                    None => self
                        .engine
                        .discussion(&attachment.pin)
                        .await?
                        .query(|s| {
                            s.participants.iter().map(|p| p.student_id.clone()).collect::<Vec<_>>()
                        })
                        .await?,
                };
                if shuffle {
                    let mut rng = rand::thread_rng();
                    order.shuffle(&mut rng);
                }
                self.run_discussion(
                    connection_id,
                    &attachment,
                    DiscussionCommand::SplitIntoGroups { group_count, order },
                )
                .await?;
            }

            ClientMessage::AssignToRoom { student_id, room_id } => {
                self.discussion_command(
                    connection_id,
                    DiscussionCommand::AssignToRoom { student_id, room_id },
                )
                .await?;
            }

            ClientMessage::DissolveRooms => {
                self.discussion_command(connection_id, DiscussionCommand::DissolveRooms).await?;
            }

            ClientMessage::CreatePoll {
                question,
                options,
                is_anonymous,
            } => {
                self.discussion_command(
                    connection_id,
                    DiscussionCommand::CreatePoll {
                        question,
                        options,
                        is_anonymous,
                    },
                )
                .await?;
            }

            ClientMessage::Vote { poll_id, option_id } => {
                self.discussion_command(
                    connection_id,
                    DiscussionCommand::Vote { poll_id, option_id },
                )
                .await?;
            }

            ClientMessage::SetPollActive { poll_id, is_active } => {
                self.discussion_command(
                    connection_id,
                    DiscussionCommand::SetPollActive { poll_id, is_active },
                )
                .await?;
            }

            ClientMessage::ToggleHand { student_id } => {
                let attachment = self.discussion_attachment(connection_id).await?;
                let student_id = student_id.unwrap_or_else(|| attachment.actor.id().to_string());
                self.run_discussion(
                    connection_id,
                    &attachment,
                    DiscussionCommand::ToggleHandRaise { student_id },
                )
                .await?;
            }

            ClientMessage::LowerAllHands => {
                self.discussion_command(connection_id, DiscussionCommand::LowerAllHands).await?;
            }

            ClientMessage::EndSession => {
                self.discussion_command(connection_id, DiscussionCommand::End).await?;
            }

            ClientMessage::DeleteSession => {
                let attachment = self.attachment(connection_id).await?;
                self.engine.delete(&attachment.pin, &attachment.actor).await?;
                self.close_session(&attachment.pin).await;
            }

            ClientMessage::ExportSession => {
                let attachment = self.discussion_attachment(connection_id).await?;
                let teacher = attachment.actor.clone();
                let document = self
                    .engine
                    .discussion(&attachment.pin)
                    .await?
                    .query(move |s| {
                        if teacher == Actor::Teacher(s.teacher_id.clone()) {
                            Ok(export::render(s, chrono::Utc::now()))
                        } else {
                            Err(SessionError::forbidden("only the session teacher can export it"))
                        }
                    })
                    .await??;
                log::info!("session {} exported ({})", attachment.pin, document.sha256);
                self.send(connection_id, &ServerMessage::Export { document }).await;
            }

            ClientMessage::StartLive => self.live_command(connection_id, LiveCommand::Start).await?,
            ClientMessage::FinishLive => {
                self.live_command(connection_id, LiveCommand::Finish).await?;
            }
            ClientMessage::ReportProgress {
                answered_count,
                correct_count,
                wrong_count,
                score,
            } => {
                self.live_command(
                    connection_id,
                    LiveCommand::ReportProgress {
                        answered_count,
                        correct_count,
                        wrong_count,
                        score,
                    },
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn join(
        &self,
        connection_id: &str,
        pin: String,
        student_id: String,
        name: Option<String>,
    ) -> Result<(), SessionError> {
        let name = match name.filter(|n| !n.trim().is_empty()) {
            Some(name) => name,
            None => self
                .directory
                .lookup(&student_id)
                .await
                .map(|record| record.name)
                .ok_or_else(|| SessionError::validation("a display name is required"))?,
        };
        if !is_valid_pin(&pin) {
            return Err(SessionError::validation("a PIN is six digits"));
        }
        let actor = Actor::Student(student_id.clone());

        match self.engine.kind_of(&pin).await {
            Some(SessionKind::Discussion) => {
                self.engine
                    .execute_discussion(&pin, actor.clone(), DiscussionCommand::Join { name })
                    .await?;
                let round_id = self
                    .engine
                    .discussion(&pin)
                    .await?
                    .query(|s| s.active_round_id.clone())
                    .await?;
                self.attach(
                    connection_id,
                    Attachment {
                        pin: pin.clone(),
                        actor,
                        view: View::Discussion {
                            round_id,
                            room_id: MAIN_ROOM.to_string(),
                        },
                    },
                )
                .await;
                self.send(connection_id, &ServerMessage::Joined { pin: pin.clone(), student_id })
                    .await;
                self.push_discussion(&pin, None).await;
            }
            Some(SessionKind::Live) => {
                self.engine
                    .execute_live(&pin, actor.clone(), LiveCommand::Join { name })
                    .await?;
                self.attach(
                    connection_id,
                    Attachment {
                        pin: pin.clone(),
                        actor,
                        view: View::Live,
                    },
                )
                .await;
                self.send(connection_id, &ServerMessage::Joined { pin: pin.clone(), student_id })
                    .await;
                self.push_live(&pin).await;
            }
            None => return Err(SessionError::not_found(format!("session {pin}"))),
        }
        log::info!("student joined session {pin}");
        Ok(())
    }

    async fn discussion_command(
        &self,
        connection_id: &str,
        command: DiscussionCommand,
    ) -> Result<DiscussionEvent, SessionError> {
        let attachment = self.discussion_attachment(connection_id).await?;
        self.run_discussion(connection_id, &attachment, command).await
    }

    async fn run_discussion(
        &self,
        connection_id: &str,
        attachment: &Attachment,
        command: DiscussionCommand,
    ) -> Result<DiscussionEvent, SessionError> {
        let event = self
            .engine
            .execute_discussion(&attachment.pin, attachment.actor.clone(), command)
            .await?;
        match &event {
            DiscussionEvent::ActiveRoundChanged { round_id } if attachment.actor.is_teacher() => {
                self.update_view(connection_id, Some(round_id.clone()), None).await;
            }
            DiscussionEvent::BreakoutRoomsReplaced { rooms }
            | DiscussionEvent::GroupsSplit { rooms, .. } => {
                let open: Vec<&str> = rooms.iter().map(|r| r.id.as_str()).collect();
                self.reset_teacher_rooms(&attachment.pin, &open).await;
            }
            DiscussionEvent::RoomsDissolved => self.reset_teacher_rooms(&attachment.pin, &[]).await,
            DiscussionEvent::SessionEnded { .. } => log::info!("session {} ended", attachment.pin),
            _ => {}
        }
        self.push_discussion(&attachment.pin, None).await;
        Ok(event)
    }

    async fn live_command(
        &self,
        connection_id: &str,
        command: LiveCommand,
    ) -> Result<(), SessionError> {
        let attachment = self.attachment(connection_id).await?;
        if !matches!(attachment.view, View::Live) {
            return Err(SessionError::invalid_state("not attached to a live exam session"));
        }
        self.engine
            .execute_live(&attachment.pin, attachment.actor.clone(), command)
            .await?;
        self.push_live(&attachment.pin).await;
        Ok(())
    }

    async fn attachment(&self, connection_id: &str) -> Result<Attachment, SessionError> {
        let connections = self.connections.read().await;
        connections
            .get(connection_id)
            .and_then(|c| c.attachment.clone())
            .ok_or_else(|| SessionError::invalid_state("join or open a session first"))
    }

    async fn discussion_attachment(&self, connection_id: &str) -> Result<Attachment, SessionError> {
        let attachment = self.attachment(connection_id).await?;
        match attachment.view {
            View::Discussion { .. } => Ok(attachment),
            View::Live => Err(SessionError::invalid_state("not attached to a discussion")),
        }
    }

    async fn attach(&self, connection_id: &str, attachment: Attachment) {
        let mut connections = self.connections.write().await;
        if let Some(connection) = connections.get_mut(connection_id) {
            connection.attachment = Some(attachment);
        }
    }

    async fn detach(&self, connection_id: &str) {
        let mut connections = self.connections.write().await;
        if let Some(connection) = connections.get_mut(connection_id) {
            connection.attachment = None;
        }
    }

    /// Moves teachers looking at a room that just closed back to the main room.
    async fn reset_teacher_rooms(&self, pin: &str, open_rooms: &[&str]) {
        let mut connections = self.connections.write().await;
        for attachment in connections.values_mut().filter_map(|c| c.attachment.as_mut()) {
            if attachment.pin != pin || !attachment.actor.is_teacher() {
                continue;
            }
            if let View::Discussion { room_id, .. } = &mut attachment.view {
                if room_id.as_str() != MAIN_ROOM && !open_rooms.contains(&room_id.as_str()) {
                    *room_id = MAIN_ROOM.to_string();
                }
            }
        }
    }

    async fn update_view(
        &self,
        connection_id: &str,
        round_id: Option<String>,
        room_id: Option<String>,
    ) {
        let mut connections = self.connections.write().await;
        let view = connections
            .get_mut(connection_id)
            .and_then(|c| c.attachment.as_mut())
            .map(|a| &mut a.view);
        if let Some(View::Discussion {
            round_id: current_round,
            room_id: current_room,
        }) = view
        {
            if let Some(round_id) = round_id {
                *current_round = round_id;
            }
            if let Some(room_id) = room_id {
                *current_room = room_id;
            }
        }
    }

    fn attached_to(
        connections: &HashMap<String, Connection>,
        pin: &str,
    ) -> Vec<(String, mpsc::UnboundedSender<Message>, Attachment)> {
        connections
            .iter()
            .filter_map(|(id, c)| {
                c.attachment
                    .as_ref()
                    .filter(|a| a.pin == pin)
                    .map(|a| (id.clone(), c.tx.clone(), a.clone()))
            })
            .collect()
    }

    /// Sends every viewer of `pin` (or just `only`) their own redacted view.
    async fn push_discussion(&self, pin: &str, only: Option<&str>) {
        let targets = {
            let connections = self.connections.read().await;
            Self::attached_to(&connections, pin)
        };
        let Ok(handle) = self.engine.discussion(pin).await else {
            return;
        };
        for (id, tx, attachment) in targets {
            if only.is_some_and(|only| only != id) {
                continue;
            }
            match handle.query(move |s| discussion_view(s, &attachment)).await {
                Ok(Ok(view)) => send_raw(&tx, &view),
                Ok(Err(e)) => log::debug!("no view for connection {id}: {e}"),
                Err(_) => return,
            }
        }
    }

    async fn push_live(&self, pin: &str) {
        let targets = {
            let connections = self.connections.read().await;
            Self::attached_to(&connections, pin)
        };
        let Ok(handle) = self.engine.live(pin).await else {
            return;
        };
        let Ok((session, leaderboard)) = handle.query(|s| (s.clone(), s.leaderboard())).await else {
            return;
        };
        let message = ServerMessage::LiveState { session, leaderboard };
        for (_, tx, _) in targets {
            send_raw(&tx, &message);
        }
    }

    async fn close_session(&self, pin: &str) {
        let mut connections = self.connections.write().await;
        for connection in connections.values_mut() {
            if connection.attachment.as_ref().is_some_and(|a| a.pin == pin) {
                connection.attachment = None;
                send_raw(&connection.tx, &ServerMessage::SessionDeleted { pin: pin.to_string() });
            }
        }
    }

    async fn send(&self, connection_id: &str, message: &ServerMessage) {
        let connections = self.connections.read().await;
        if let Some(connection) = connections.get(connection_id) {
            send_raw(&connection.tx, message);
        }
    }

    async fn send_error(&self, connection_id: &str, error: &SessionError) {
        self.send(
            connection_id,
            &ServerMessage::Error {
                kind: error.kind(),
                message: error.to_string(),
            },
        )
        .await;
    }

    async fn handle_disconnect(&self, connection_id: &str) {
        let mut connections = self.connections.write().await;
        if let Some(connection) = connections.remove(connection_id) {
            if let Some(attachment) = connection.attachment {
                log::debug!("connection {connection_id} left session {}", attachment.pin);
            }
        }
        log::debug!("connection {connection_id} closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryDirectory, StudentRecord};
    use crate::store::MemoryStore;
    use serde_json::{json, Value};

    fn server() -> Server {
        let directory = MemoryDirectory::new(vec![StudentRecord {
            id: "s-dir".into(),
            name: "Dana".into(),
            avatar_url: None,
            class_id: Some("10A".into()),
        }]);
        Server::new(SessionEngine::new(Arc::new(MemoryStore::new())), Arc::new(directory))
    }

    async fn connect(server: &Server) -> (String, mpsc::UnboundedReceiver<Message>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        server
            .connections
            .write()
            .await
            .insert(id.clone(), Connection { tx, attachment: None });
        (id, rx)
    }

    async fn send(server: &Server, id: &str, message: Value) {
        let message: ClientMessage = serde_json::from_value(message).unwrap();
        server.handle_client_message(id, message).await;
    }

    async fn join_as(server: &Server, id: &str, pin: &str, student_id: &str, name: &str) {
        let message = json!({"type": "join", "pin": pin, "student_id": student_id, "name": name});
        send(server, id, message).await;
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(serde_json::from_str(msg.to_str().unwrap()).unwrap());
        }
        out
    }

    fn last_state(frames: &[Value]) -> Value {
        frames
            .iter()
            .rev()
            .find(|f| f["type"] == "discussion_state")
            .cloned()
            .expect("a discussion_state frame")
    }

    async fn classroom(server: &Server) -> (String, String, mpsc::UnboundedReceiver<Message>) {
        let (teacher, mut rx) = connect(server).await;
        let create =
            json!({"type": "create_discussion", "title": "Debate Club", "teacher_id": "t-1"});
        send(server, &teacher, create).await;
        let frames = drain(&mut rx);
        assert_eq!(frames[0]["type"], "discussion_created");
        let pin = frames[0]["pin"].as_str().unwrap().to_string();
        (teacher, pin, rx)
    }

    #[tokio::test]
    async fn visibility_change_reaches_every_viewer() {
        let server = server();
        let (teacher, pin, mut teacher_rx) = classroom(&server).await;
        let (ana, mut ana_rx) = connect(&server).await;
        let (bo, mut bo_rx) = connect(&server).await;
        join_as(&server, &ana, &pin, "a", "Ana").await;
        join_as(&server, &bo, &pin, "b", "Bo").await;
        send(&server, &ana, json!({"type": "send_chat", "content": "hello"})).await;

        let bo_state = last_state(&drain(&mut bo_rx));
        assert_eq!(bo_state["transcript"]["messages"][0]["content"], "hello");

        send(&server, &teacher, json!({"type": "set_visibility", "mode": "HIDDEN_ALL"})).await;
        let teacher_state = last_state(&drain(&mut teacher_rx));
        assert_eq!(teacher_state["transcript"]["message_count"], 1);
        assert_eq!(teacher_state["transcript"]["messages"].as_array().unwrap().len(), 0);

        let bo_state = last_state(&drain(&mut bo_rx));
        assert_eq!(bo_state["transcript"]["messages"].as_array().unwrap().len(), 0);
        let ana_state = last_state(&drain(&mut ana_rx));
        assert_eq!(ana_state["transcript"]["messages"][0]["content"], "hello");
    }

    #[tokio::test]
    async fn students_stay_on_their_round_until_they_switch() {
        let server = server();
        let (teacher, pin, mut teacher_rx) = classroom(&server).await;
        let (ana, mut ana_rx) = connect(&server).await;
        join_as(&server, &ana, &pin, "a", "Ana").await;
        let add_round = json!({"type": "add_round", "name": "Round 2", "activate": true});
        send(&server, &teacher, add_round).await;

        let teacher_state = last_state(&drain(&mut teacher_rx));
        let round_two = teacher_state["session"]["active_round_id"].as_str().unwrap().to_string();
        assert_eq!(teacher_state["viewing_round_id"], round_two.as_str());

        let ana_state = last_state(&drain(&mut ana_rx));
        assert_eq!(ana_state["transcript"]["writable"], false);
        send(&server, &ana, json!({"type": "send_chat", "content": "hi"})).await;
        let frames = drain(&mut ana_rx);
        assert_eq!(frames[0]["type"], "error");
        assert_eq!(frames[0]["kind"], "invalid_state");

        send(&server, &ana, json!({"type": "view_round", "round_id": round_two})).await;
        assert_eq!(last_state(&drain(&mut ana_rx))["transcript"]["writable"], true);
        send(&server, &ana, json!({"type": "send_chat", "content": "hi"})).await;
        let state = last_state(&drain(&mut ana_rx));
        assert_eq!(state["transcript"]["messages"][0]["content"], "hi");
    }

    #[tokio::test]
    async fn duplicate_votes_are_silent() {
        let server = server();
        let (teacher, pin, mut teacher_rx) = classroom(&server).await;
        let (ana, mut ana_rx) = connect(&server).await;
        join_as(&server, &ana, &pin, "a", "Ana").await;
        send(
            &server,
            &teacher,
            json!({"type": "create_poll", "question": "Agree?", "options": ["Yes", "No"]}),
        )
        .await;
        let poll = last_state(&drain(&mut teacher_rx))["session"]["polls"][0].clone();
        let vote = json!({
            "type": "vote",
            "poll_id": poll["id"],
            "option_id": poll["options"][0]["id"]
        });
        send(&server, &ana, vote.clone()).await;
        drain(&mut ana_rx);
        send(&server, &ana, vote).await;
        assert!(drain(&mut ana_rx).is_empty());

        let poll = last_state(&drain(&mut teacher_rx))["session"]["polls"][0].clone();
        assert_eq!(poll["options"][0]["vote_count"], 1);
        assert_eq!(poll["options"][0]["percent"], 100);
    }

    #[tokio::test]
    async fn join_uses_directory_name_and_rejects_unknown_pins() {
        let server = server();
        let (_, pin, _teacher_rx) = classroom(&server).await;
        let (dana, mut rx) = connect(&server).await;
        send(&server, &dana, json!({"type": "join", "pin": "000000", "student_id": "s-dir"})).await;
        assert_eq!(drain(&mut rx)[0]["kind"], "not_found");

        send(&server, &dana, json!({"type": "join", "pin": pin, "student_id": "s-dir"})).await;
        let frames = drain(&mut rx);
        assert_eq!(frames[0]["type"], "joined");
        assert_eq!(last_state(&frames)["session"]["participants"][0]["name"], "Dana");

        let (nobody, mut rx) = connect(&server).await;
        send(&server, &nobody, json!({"type": "join", "pin": pin, "student_id": "ghost"})).await;
        assert_eq!(drain(&mut rx)[0]["kind"], "validation");
    }

    #[tokio::test]
    async fn breakout_split_moves_student_views() {
        let server = server();
        let (teacher, pin, mut teacher_rx) = classroom(&server).await;
        let (ana, mut ana_rx) = connect(&server).await;
        join_as(&server, &ana, &pin, "a", "Ana").await;
        send(&server, &teacher, json!({"type": "split_into_groups", "group_count": 2})).await;
        let room = last_state(&drain(&mut teacher_rx))["session"]["breakout_rooms"][0]["id"]
            .clone();
        assert_eq!(last_state(&drain(&mut ana_rx))["viewing_room_id"], room);

        send(&server, &teacher, json!({"type": "dissolve_rooms"})).await;
        assert_eq!(last_state(&drain(&mut ana_rx))["viewing_room_id"], MAIN_ROOM);
    }

    #[tokio::test]
    async fn teacher_leaves_a_closed_room() {
        let server = server();
        let (teacher, pin, mut teacher_rx) = classroom(&server).await;
        let (ana, _ana_rx) = connect(&server).await;
        join_as(&server, &ana, &pin, "a", "Ana").await;
        send(&server, &teacher, json!({"type": "split_into_groups", "group_count": 2})).await;
        let room = last_state(&drain(&mut teacher_rx))["session"]["breakout_rooms"][1]["id"]
            .clone();
        send(&server, &teacher, json!({"type": "view_room", "room_id": room})).await;
        assert_eq!(last_state(&drain(&mut teacher_rx))["viewing_room_id"], room);

        send(&server, &teacher, json!({"type": "dissolve_rooms"})).await;
        assert_eq!(last_state(&drain(&mut teacher_rx))["viewing_room_id"], MAIN_ROOM);
        send(&server, &teacher, json!({"type": "send_chat", "content": "back together"})).await;
        let state = last_state(&drain(&mut teacher_rx));
        assert_eq!(state["transcript"]["messages"][0]["content"], "back together");

        let rooms = json!({"type": "create_breakout_rooms", "names": ["Red", "Blue"]});
        send(&server, &teacher, rooms).await;
        let room = last_state(&drain(&mut teacher_rx))["session"]["breakout_rooms"][0]["id"]
            .clone();
        send(&server, &teacher, json!({"type": "view_room", "room_id": room})).await;
        send(&server, &teacher, json!({"type": "split_into_groups", "group_count": 3})).await;
        assert_eq!(last_state(&drain(&mut teacher_rx))["viewing_room_id"], MAIN_ROOM);
    }

    #[tokio::test]
    async fn delete_detaches_everyone() {
        let server = server();
        let (teacher, pin, mut teacher_rx) = classroom(&server).await;
        let (ana, mut ana_rx) = connect(&server).await;
        join_as(&server, &ana, &pin, "a", "Ana").await;
        send(&server, &ana, json!({"type": "delete_session"})).await;
        assert_eq!(drain(&mut ana_rx).last().unwrap()["kind"], "forbidden");

        send(&server, &teacher, json!({"type": "export_session"})).await;
        let export = drain(&mut teacher_rx).into_iter().find(|f| f["type"] == "export").unwrap();
        assert!(export["document"]["content"].as_str().unwrap().contains("Debate Club"));

        send(&server, &teacher, json!({"type": "delete_session"})).await;
        assert_eq!(drain(&mut ana_rx).last().unwrap()["type"], "session_deleted");
        send(&server, &ana, json!({"type": "send_chat", "content": "anyone?"})).await;
        assert_eq!(drain(&mut ana_rx)[0]["kind"], "invalid_state");
        assert!(server.engine.kind_of(&pin).await.is_none());
    }

    #[tokio::test]
    async fn live_exam_leaderboard_is_pushed() {
        let server = server();
        let (teacher, mut teacher_rx) = connect(&server).await;
        let create =
            json!({"type": "create_live", "title": "Quiz", "exam_id": "e-1", "teacher_id": "t-1"});
        send(&server, &teacher, create).await;
        let pin = drain(&mut teacher_rx)[0]["pin"].as_str().unwrap().to_string();
        let (ana, mut ana_rx) = connect(&server).await;
        join_as(&server, &ana, &pin, "a", "Ana").await;
        send(&server, &teacher, json!({"type": "start_live"})).await;
        assert_eq!(drain(&mut ana_rx).last().unwrap()["session"]["status"], "RUNNING");
        send(
            &server,
            &ana,
            json!({
                "type": "report_progress",
                "answered_count": 1,
                "correct_count": 1,
                "wrong_count": 0,
                "score": 2.5
            }),
        )
        .await;
        let frames = drain(&mut teacher_rx);
        let state = frames.last().unwrap();
        assert_eq!(state["type"], "live_state");
        assert_eq!(state["leaderboard"][0]["score"], 2.5);
    }

    #[tokio::test]
    async fn websocket_route_speaks_json() {
        let route = ws_route(server());
        let mut client = warp::test::ws().path("/ws").handshake(route).await.expect("handshake");
        client
            .send_text(
                json!({"type": "create_discussion", "title": "Debate Club", "teacher_id": "t-1"})
                    .to_string(),
            )
            .await;
        let frame = client.recv().await.expect("frame");
        let created: Value = serde_json::from_str(frame.to_str().unwrap()).unwrap();
        assert_eq!(created["type"], "discussion_created");

        client.send_text("not json").await;
        let mut kinds = Vec::new();
        for _ in 0..2 {
            let frame = client.recv().await.expect("frame");
            let value: Value = serde_json::from_str(frame.to_str().unwrap()).unwrap();
            kinds.push(value["type"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds, ["discussion_state", "error"]);
    }
}
