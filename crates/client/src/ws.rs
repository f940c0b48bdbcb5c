// WebSocket transport to the relay
//
// One connection carries all three engine contracts. Requests that expect a
// reply (join, select, upsert) are correlated through oneshot channels; pushes
// from the relay are routed to whichever engine channel subscribed to them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use engine::{BroadcastTransport, DurableStore, PresenceTransport, StoreError, TransportError};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use protocol::{
    BroadcastMessage, ClientId, ClientMessage, Document, PresenceRecord, ServerMessage,
    SessionKey,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Outcome of a correlated request
#[derive(Debug)]
enum Reply {
    Selected(Option<Document>),
    Upserted,
    Failed(String),
}

/// Where relay pushes go
#[derive(Default)]
struct Routes {
    joined: Option<(SessionKey, ClientId)>,
    join_waiter: Option<oneshot::Sender<Result<(), String>>>,

    broadcast: Option<mpsc::UnboundedSender<BroadcastMessage>>,
    presence: Option<mpsc::UnboundedSender<Vec<PresenceRecord>>>,
    /// Latest presence set, replayed to a late presence subscriber
    last_presence: Option<Vec<PresenceRecord>>,
    documents: Vec<mpsc::UnboundedSender<Document>>,

    pending: HashMap<u64, oneshot::Sender<Reply>>,
}

impl Routes {
    fn route(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Joined { session, client_id } => {
                tracing::debug!("Joined {} as {}", session, client_id);
                self.joined = Some((session, client_id));
                if let Some(waiter) = self.join_waiter.take() {
                    let _ = waiter.send(Ok(()));
                }
            }
            ServerMessage::Broadcast { message } => {
                if let Some(tx) = &self.broadcast {
                    let _ = tx.send(message);
                }
            }
            ServerMessage::PresenceSync { records } => {
                if let Some(tx) = &self.presence {
                    let _ = tx.send(records.clone());
                }
                self.last_presence = Some(records);
            }
            ServerMessage::DocumentChanged { document } => {
                self.documents.retain(|tx| tx.send(document.clone()).is_ok());
            }
            ServerMessage::Selected {
                request_id,
                document,
            } => self.reply(request_id, Reply::Selected(document)),
            ServerMessage::Upserted { request_id } => self.reply(request_id, Reply::Upserted),
            ServerMessage::Error {
                request_id: Some(request_id),
                message,
            } => self.reply(request_id, Reply::Failed(message)),
            ServerMessage::Error {
                request_id: None,
                message,
            } => {
                tracing::warn!("Relay error: {}", message);
                // An uncorrelated error while joining is the join's answer
                if let Some(waiter) = self.join_waiter.take() {
                    let _ = waiter.send(Err(message));
                }
            }
            ServerMessage::Pong => tracing::trace!("Pong"),
        }
    }

    fn reply(&mut self, request_id: u64, reply: Reply) {
        match self.pending.remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => tracing::debug!("Reply to unknown request {}", request_id),
        }
    }

    /// Connection lost: end every subscription and pending request
    fn close_all(&mut self) {
        *self = Routes::default();
    }
}

/// Relay connection implementing every collaborator contract
pub struct WsTransport {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    routes: Arc<Mutex<Routes>>,
    next_request: AtomicU64,
    request_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl WsTransport {
    /// Connect to the relay at `url` (e.g. `ws://127.0.0.1:9001/ws`).
    pub async fn connect(url: &str, request_timeout: Duration) -> Result<Self> {
        let (ws_stream, _) = connect_async(url)
            .await
            .context("Failed to connect to server")?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let routes = Arc::new(Mutex::new(Routes::default()));

        // Spawn task to send messages to server
        let send_task = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("Failed to serialize ClientMessage: {}", e);
                        continue;
                    }
                };
                if ws_tx.send(Message::text(json)).await.is_err() {
                    break;
                }
            }
        });

        // Spawn task to route messages from server
        let routes_for_recv = routes.clone();
        let recv_task = tokio::spawn(async move {
            while let Some(Ok(msg)) = ws_rx.next().await {
                let Message::Text(text) = msg else {
                    continue;
                };
                match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(server_msg) => routes_for_recv.lock().route(server_msg),
                    Err(e) => tracing::warn!("Failed to parse server message: {}", e),
                }
            }
            tracing::warn!("Disconnected from server");
            routes_for_recv.lock().close_all();
        });

        Ok(WsTransport {
            outgoing,
            routes,
            next_request: AtomicU64::new(1),
            request_timeout,
            tasks: vec![send_task, recv_task],
        })
    }

    fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        self.outgoing
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    /// Join `session` unless this connection already has.
    async fn ensure_joined(
        &self,
        session: &SessionKey,
        client_id: ClientId,
    ) -> Result<(), TransportError> {
        let done = {
            let mut routes = self.routes.lock();
            if routes.joined.as_ref() == Some(&(session.clone(), client_id)) {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            routes.join_waiter = Some(tx);
            rx
        };

        self.send(ClientMessage::Join {
            session: session.clone(),
            client_id,
        })?;

        match tokio::time::timeout(self.request_timeout, done).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(message))) => Err(TransportError::Send(message)),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    fn check_session(&self, session: &SessionKey) -> Result<(), TransportError> {
        match &self.routes.lock().joined {
            Some((joined, _)) if joined == session => Ok(()),
            _ => Err(TransportError::WrongSession(session.to_string())),
        }
    }

    /// Send a correlated request and wait for its reply.
    async fn request<F>(&self, session: &SessionKey, build: F) -> Result<Reply, StoreError>
    where
        F: FnOnce(u64) -> ClientMessage,
    {
        self.check_session(session)?;

        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.routes.lock().pending.insert(request_id, tx);
        self.send(build(request_id))?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Reply::Failed(message))) => Err(StoreError::Backend(message)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Closed.into()),
            Err(_) => {
                self.routes.lock().pending.remove(&request_id);
                Err(StoreError::Timeout)
            }
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl BroadcastTransport for WsTransport {
    async fn subscribe(
        &self,
        session: &SessionKey,
        client: ClientId,
    ) -> Result<mpsc::UnboundedReceiver<BroadcastMessage>, TransportError> {
        self.ensure_joined(session, client).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().broadcast = Some(tx);
        Ok(rx)
    }

    async fn publish(
        &self,
        session: &SessionKey,
        message: BroadcastMessage,
    ) -> Result<(), TransportError> {
        self.check_session(session)?;
        self.send(ClientMessage::Publish { message })
    }

    async fn close(&self, session: &SessionKey, _client: ClientId) -> Result<(), TransportError> {
        self.check_session(session)?;
        {
            let mut routes = self.routes.lock();
            routes.joined = None;
            routes.broadcast = None;
            routes.documents.clear();
        }
        self.send(ClientMessage::Leave)
    }
}

#[async_trait]
impl PresenceTransport for WsTransport {
    async fn subscribe(
        &self,
        session: &SessionKey,
        client: ClientId,
    ) -> Result<mpsc::UnboundedReceiver<Vec<PresenceRecord>>, TransportError> {
        self.ensure_joined(session, client).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.routes.lock();
        if let Some(records) = &routes.last_presence {
            let _ = tx.send(records.clone());
        }
        routes.presence = Some(tx);
        Ok(rx)
    }

    async fn track(
        &self,
        session: &SessionKey,
        record: PresenceRecord,
    ) -> Result<(), TransportError> {
        self.check_session(session)?;
        self.send(ClientMessage::Track { record })
    }

    async fn untrack(&self, session: &SessionKey, _client: ClientId) -> Result<(), TransportError> {
        self.check_session(session)?;
        {
            let mut routes = self.routes.lock();
            routes.presence = None;
            routes.last_presence = None;
        }
        self.send(ClientMessage::Untrack)
    }
}

#[async_trait]
impl DurableStore for WsTransport {
    async fn select(&self, session: &SessionKey) -> Result<Option<Document>, StoreError> {
        match self
            .request(session, |request_id| ClientMessage::Select { request_id })
            .await?
        {
            Reply::Selected(document) => Ok(document),
            other => Err(StoreError::Backend(format!("Unexpected reply: {:?}", other))),
        }
    }

    async fn upsert(&self, session: &SessionKey, document: &Document) -> Result<(), StoreError> {
        let document = document.clone();
        match self
            .request(session, move |request_id| ClientMessage::Upsert {
                request_id,
                document,
            })
            .await?
        {
            Reply::Upserted => Ok(()),
            other => Err(StoreError::Backend(format!("Unexpected reply: {:?}", other))),
        }
    }

    async fn watch(
        &self,
        session: &SessionKey,
    ) -> Result<mpsc::UnboundedReceiver<Document>, StoreError> {
        self.check_session(session)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().documents.push(tx);
        Ok(rx)
    }
}
