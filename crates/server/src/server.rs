// Relay server: WebSocket fan-out for broadcast, presence and durable writes

use crate::session::{Session, SharedSession};
use crate::storage::Storage;
use anyhow::{anyhow, Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt}; // For split() and next()
use protocol::{ClientId, ClientMessage, ServerMessage, SessionKey};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

// Server state shared across connections
#[derive(Clone)]
pub struct ServerState {
    // Live sessions with at least one member
    sessions: Arc<RwLock<HashMap<SessionKey, SharedSession>>>,

    // Durable document storage
    storage: Arc<Storage>,
}

// The session a connection has joined, and as whom
struct Membership {
    session: SessionKey,
    client_id: ClientId,
}

impl ServerState {
    pub fn new(storage: Storage) -> Self {
        ServerState {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            storage: Arc::new(storage),
        }
    }

    async fn get_session(&self, key: &SessionKey) -> Option<SharedSession> {
        self.sessions.read().await.get(key).cloned()
    }

    // Add a member, opening the session if needed. The map lock is held
    // throughout so a concurrent cleanup cannot drop the session under us.
    async fn join(
        &self,
        key: &SessionKey,
        client_id: ClientId,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::info!("Opened session {}", key);
                Arc::new(RwLock::new(Session::new(key.clone())))
            })
            .clone();
        session.write().await.add_member(client_id, sender).await;
    }

    // Remove session if empty
    async fn cleanup_session(&self, key: &SessionKey) {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get(key).cloned() else {
            return;
        };

        let session = session.read().await;
        if session.is_empty() {
            let open_for = chrono::Utc::now() - session.created_at;
            sessions.remove(key);
            tracing::info!(
                "Closed empty session {} after {}s",
                key,
                open_for.num_seconds()
            );
        }
    }

    async fn leave(&self, membership: Membership) {
        if let Some(session) = self.get_session(&membership.session).await {
            session.write().await.remove_member(membership.client_id).await;
        }
        self.cleanup_session(&membership.session).await;
    }
}

// Handle WebSocket upgrade
pub async fn websocket_handler(State(state): State<ServerState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, state: ServerState) {
    let connection = uuid::Uuid::new_v4();
    tracing::info!("New WebSocket connection: {}", connection);

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // SEND TASK: ServerMessage -> JSON text frame
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to serialize ServerMessage: {}", e);
                    continue;
                }
            };

            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut membership: Option<Membership> = None;

    // Receiving loop
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(client_msg) => {
                    if let Err(e) =
                        handle_client_message(&state, &tx, client_msg, &mut membership).await
                    {
                        tracing::error!("Error handling message: {}", e);
                        let _ = tx.send(ServerMessage::error(None, e.to_string()));
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to parse ClientMessage: {}", e);
                    let _ = tx.send(ServerMessage::error(
                        None,
                        format!("Invalid message format: {}", e),
                    ));
                }
            },
            Message::Close(_) => break,
            _ => {} // Ping/pong frames are answered by axum
        }
    }

    // Cleanup on disconnect
    if let Some(membership) = membership {
        state.leave(membership).await;
    }

    send_task.abort();
    tracing::info!("WebSocket connection closed: {}", connection);
}

fn joined(membership: &Option<Membership>) -> Result<&Membership> {
    membership
        .as_ref()
        .ok_or_else(|| anyhow!("Not in a session"))
}

// Handle a client message
async fn handle_client_message(
    state: &ServerState,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    message: ClientMessage,
    membership: &mut Option<Membership>,
) -> Result<()> {
    match message {
        ClientMessage::Join {
            session,
            client_id,
        } => {
            if !session.is_valid() {
                return Err(anyhow!("Invalid session key: {:?}", session.as_str()));
            }

            // One session per connection
            if let Some(previous) = membership.take() {
                state.leave(previous).await;
            }

            state.join(&session, client_id, tx.clone()).await;

            *membership = Some(Membership {
                session: session.clone(),
                client_id,
            });

            tx.send(ServerMessage::Joined { session, client_id })?;
        }

        ClientMessage::Leave => {
            if let Some(previous) = membership.take() {
                state.leave(previous).await;
            }
        }

        ClientMessage::Publish { message } => {
            let current = joined(membership)?;
            if let Some(session) = state.get_session(&current.session).await {
                session.read().await.publish(current.client_id, message).await;
            }
        }

        ClientMessage::Track { record } => {
            let current = joined(membership)?;
            if let Some(session) = state.get_session(&current.session).await {
                session.write().await.track(current.client_id, record).await;
            }
        }

        ClientMessage::Untrack => {
            let current = joined(membership)?;
            if let Some(session) = state.get_session(&current.session).await {
                session.write().await.untrack(current.client_id).await;
            }
        }

        ClientMessage::Select { request_id } => {
            let current = joined(membership)?;
            match state.storage.select(&current.session).await {
                Ok(document) => tx.send(ServerMessage::Selected {
                    request_id,
                    document,
                })?,
                Err(e) => {
                    tracing::warn!("Select for {} failed: {:#}", current.session, e);
                    tx.send(ServerMessage::error(Some(request_id), e.to_string()))?;
                }
            }
        }

        ClientMessage::Upsert {
            request_id,
            document,
        } => {
            let current = joined(membership)?;
            let Some(session) = state.get_session(&current.session).await else {
                let closed = format!("Session {} is closed", current.session);
                tx.send(ServerMessage::error(Some(request_id), closed))?;
                return Ok(());
            };

            // One write per session at a time, fan-out included
            let writes = session.read().await.write_lock();
            let _write = writes.lock().await;

            if let Err(e) = state.storage.upsert(&current.session, &document).await {
                tracing::warn!("Upsert for {} failed: {:#}", current.session, e);
                tx.send(ServerMessage::error(Some(request_id), e.to_string()))?;
                return Ok(());
            }

            tx.send(ServerMessage::Upserted { request_id })?;
            session.read().await.document_changed(document).await;
        }

        ClientMessage::Ping => {
            tx.send(ServerMessage::Pong)?;
        }
    }

    Ok(())
}

// Build the router
pub fn router(state: ServerState) -> Router {
    // Configure CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(websocket_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Serve on an already bound listener
pub async fn serve(listener: TcpListener, state: ServerState) -> Result<()> {
    axum::serve(listener, router(state))
        .await
        .context("Server error")
}

// Create and configure the server
pub async fn create_server(state: ServerState, addr: SocketAddr) -> Result<()> {
    tracing::info!("Starting server on {}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    serve(listener, state).await
}
