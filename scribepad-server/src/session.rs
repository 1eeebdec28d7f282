//! Per-connection session handling: handshake, event routing, throttling.

use std::sync::Arc;

use anyhow::Context;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{info, warn};

use crate::fabric::{BusEvent, Room};
use crate::ot::Operation;
use crate::permissions::Role;
use crate::ratelimit::{EventClass, EventLimiter};
use crate::{Identifier, OpenError, ServerState};

/// A message received from the client over WebSocket.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMsg {
    /// Establishes the session identity; must be the first message.
    Handshake {
        user_id: Identifier,
        username: String,
    },
    /// Joins (and loads or creates) a document.
    GetDocument {
        document_id: Identifier,
        document_name: String,
    },
    /// Submits an operation set produced against `base_version`.
    SendChanges {
        base_version: u64,
        ops: Vec<Operation>,
    },
    /// Requests a coalesced persist of the current document.
    SaveDocument {
        #[serde(default)]
        data: Option<String>,
    },
}

impl ClientMsg {
    fn name(&self) -> &'static str {
        match self {
            ClientMsg::Handshake { .. } => "handshake",
            ClientMsg::GetDocument { .. } => "get_document",
            ClientMsg::SendChanges { .. } => "send_changes",
            ClientMsg::SaveDocument { .. } => "save_document",
        }
    }

    fn class(&self) -> EventClass {
        match self {
            ClientMsg::GetDocument { .. }
            | ClientMsg::SendChanges { .. }
            | ClientMsg::SaveDocument { .. } => EventClass::Document,
            ClientMsg::Handshake { .. } => EventClass::General,
        }
    }
}

/// A message sent to the client over WebSocket.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMsg {
    /// One-shot reply to a join.
    LoadDocument {
        data: String,
        version: u64,
        role: Role,
        can_edit: bool,
    },
    /// Broadcast of an accepted operation set.
    ReceiveChanges {
        ops: Vec<Operation>,
        version: u64,
        origin: u64,
    },
    /// Acknowledgment to the originator of a submission.
    Ack { version: u64, transformed: bool },
    /// Permission gate rejection at join.
    AccessDenied { error: String },
    /// Permission gate rejection at edit.
    PermissionError { error: String },
    /// An inbound event was dropped by a throttle.
    RateLimitExceeded { event: String },
    /// A participant left the room.
    UserLeft {
        user_id: Identifier,
        username: String,
    },
}

impl From<ServerMsg> for Message {
    fn from(msg: ServerMsg) -> Self {
        let serialized = serde_json::to_string(&msg).expect("failed serialize");
        Message::text(serialized)
    }
}

struct JoinedDoc {
    id: Identifier,
    engine: Arc<crate::engine::Engine>,
    room: Arc<Room>,
}

struct Session {
    id: u64,
    user_id: Identifier,
    username: String,
    doc: Option<JoinedDoc>,
    limiter: EventLimiter,
}

/// Drive one WebSocket connection from handshake to teardown.
pub async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let session_id = state.next_session_id();
    let (mut sink, mut stream) = socket.split();

    // The handshake must arrive first and within the load timeout;
    // anything else closes the connection.
    let first = time::timeout(state.config().load_timeout, stream.next()).await;
    let (user_id, username) = match first {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str(&text) {
            Ok(ClientMsg::Handshake { user_id, username })
                if !user_id.as_ref().is_empty() && !username.is_empty() =>
            {
                (user_id, username)
            }
            _ => {
                info!(session = session_id, "rejecting connection without identity");
                return;
            }
        },
        _ => {
            info!(session = session_id, "no handshake before timeout");
            return;
        }
    };
    info!(session = session_id, user = %user_id, "session established");

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMsg>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg.into()).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session {
        id: session_id,
        user_id,
        username,
        doc: None,
        limiter: EventLimiter::new(state.config()),
    };

    while let Some(Ok(msg)) = stream.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let msg: ClientMsg = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(session = session.id, "unparseable client message: {e}");
                break;
            }
        };
        if !session.limiter.allow(msg.class()) {
            tx.send(ServerMsg::RateLimitExceeded {
                event: msg.name().to_string(),
            })
            .ok();
            continue;
        }
        if let Err(e) = handle_message(&state, &mut session, &tx, msg).await {
            // The client must resync from current state; closing the
            // connection forces exactly that.
            warn!(session = session.id, "closing session: {e:#}");
            break;
        }
    }

    leave_current(&state, &mut session).await;
    writer.abort();
}

async fn handle_message(
    state: &Arc<ServerState>,
    session: &mut Session,
    tx: &mpsc::UnboundedSender<ServerMsg>,
    msg: ClientMsg,
) -> anyhow::Result<()> {
    match msg {
        ClientMsg::Handshake { .. } => {
            // Identity is fixed at connection time.
        }
        ClientMsg::GetDocument {
            document_id,
            document_name,
        } => {
            leave_current(state, session).await;
            match state.open_document(&session.user_id, &document_id, &document_name).await {
                Ok(opened) => {
                    opened.room.join(
                        session.id,
                        session.user_id.clone(),
                        session.username.clone(),
                        tx.clone(),
                    );
                    tx.send(ServerMsg::LoadDocument {
                        data: opened.data,
                        version: opened.version,
                        role: opened.check.role,
                        can_edit: opened.check.can_edit,
                    })
                    .ok();
                    session.doc = Some(JoinedDoc {
                        id: document_id,
                        engine: opened.engine,
                        room: opened.room,
                    });
                }
                Err(OpenError::Denied) => {
                    tx.send(ServerMsg::AccessDenied {
                        error: "insufficient role".to_string(),
                    })
                    .ok();
                }
                Err(OpenError::Internal(e)) => return Err(e),
            }
        }
        ClientMsg::SendChanges { base_version, ops } => {
            let Some(doc) = &session.doc else {
                tx.send(ServerMsg::PermissionError {
                    error: "join a document first".to_string(),
                })
                .ok();
                return Ok(());
            };
            let check = doc.engine.access(&session.user_id, &state.config().admin_user).await;
            if !check.can_edit {
                tx.send(ServerMsg::PermissionError {
                    error: "write access required".to_string(),
                })
                .ok();
                return Ok(());
            }
            // The engine enqueues the delta onto the bus itself; only the
            // acknowledgment flows back on this connection.
            let accepted = doc
                .engine
                .submit(session.id, &session.user_id, base_version, ops)
                .await
                .context("edit rejected")?;
            tx.send(ServerMsg::Ack {
                version: accepted.version,
                transformed: accepted.transformed,
            })
            .ok();
        }
        ClientMsg::SaveDocument { .. } => {
            let Some(doc) = &session.doc else {
                tx.send(ServerMsg::PermissionError {
                    error: "join a document first".to_string(),
                })
                .ok();
                return Ok(());
            };
            let check = doc.engine.access(&session.user_id, &state.config().admin_user).await;
            if !check.can_edit {
                tx.send(ServerMsg::PermissionError {
                    error: "write access required".to_string(),
                })
                .ok();
                return Ok(());
            }
            // The engine-owned content is authoritative; the client payload
            // only requests a persist.
            doc.engine.touch_save(&session.user_id).await;
        }
    }
    Ok(())
}

async fn leave_current(state: &Arc<ServerState>, session: &mut Session) {
    let Some(doc) = session.doc.take() else {
        return;
    };
    doc.room.leave(session.id);
    state.bus().publish(
        doc.id.as_ref(),
        BusEvent::UserLeft {
            doc: doc.id.clone(),
            origin_instance: state.instance_id(),
            origin_session: session.id,
            user_id: session.user_id.clone(),
            username: session.username.clone(),
        }
        .encode(),
    );
    if doc.room.is_empty() {
        state.retire_document(&doc.id).await;
    }
}
