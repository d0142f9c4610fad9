//! WebSocket session runtime hosting a persistence [`Extension`].
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (workspace, document) ── Yrs Doc ── broadcast fan-out
//! Client B ──┘            │
//!                         ├── first join  → Extension::on_load_document
//!                         ├── last leave  → Extension::on_store_document
//!                         └── flush tick  → Extension::on_store_document (if dirty)
//! ```
//!
//! Each room maintains:
//! - the live Yrs `Doc`
//! - the session context of the peer that opened it
//! - a dirty flag, set by every applied update
//! - a store lock, so stores for one document never overlap
//!
//! The room map lock is never held while the extension performs I/O.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, OnceCell, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact};

use crate::context::{SessionContext, TokenIssuer};
use crate::extension::{apply_update, encode_state, Extension};
use crate::protocol::{MessageType, SyncMessage};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Interval between flushes of dirty rooms
    pub flush_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3078".to_string(),
            broadcast_capacity: 256,
            flush_interval: Duration::from_secs(10),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub stores_completed: u64,
    pub stores_failed: u64,
}

/// Rooms are scoped per workspace so equal document ids never share state.
type RoomKey = (String, String);

/// Loaded at most once; concurrent joiners wait on the same cell.
type RoomSlot = Arc<OnceCell<Arc<DocumentRoom>>>;

/// Fan-out payload: sender peer id + encoded message.
type Outgoing = (Uuid, Arc<Vec<u8>>);

struct DocumentRoom {
    document: String,
    doc: Doc,
    context: SessionContext,
    broadcast: broadcast::Sender<Outgoing>,
    peers: RwLock<HashSet<Uuid>>,
    dirty: AtomicBool,
    store_lock: Mutex<()>,
}

impl DocumentRoom {
    fn new(document: String, doc: Doc, context: SessionContext, broadcast_capacity: usize) -> Self {
        let (broadcast, _) = broadcast::channel(broadcast_capacity);
        Self {
            document,
            doc,
            context,
            broadcast,
            peers: RwLock::new(HashSet::new()),
            dirty: AtomicBool::new(false),
            store_lock: Mutex::new(()),
        }
    }

    fn key(&self) -> RoomKey {
        (self.context.token.workspace.clone(), self.document.clone())
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }
}

struct ServerInner {
    config: ServerConfig,
    extension: Arc<dyn Extension>,
    issuer: Arc<TokenIssuer>,
    rooms: RwLock<HashMap<RoomKey, RoomSlot>>,
    stats: RwLock<ServerStats>,
}

/// The session runtime.
pub struct SyncServer {
    inner: Arc<ServerInner>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, extension: Arc<dyn Extension>, issuer: Arc<TokenIssuer>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                extension,
                issuer,
                rooms: RwLock::new(HashMap::new()),
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.inner.config.bind_addr).await?;
        log::info!("Collaborator listening on {}", self.inner.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let flusher = {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(inner.config.flush_interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    Self::flush_rooms(&inner).await;
                }
            })
        };

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");

            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, inner).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        flusher.abort();
        result
    }

    /// Store every dirty room now and drop rooms nobody is connected to.
    pub async fn flush_all(&self) {
        Self::flush_rooms(&self.inner).await;
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.inner.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.inner.config.bind_addr
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        inner: Arc<ServerInner>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = inner.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Peers are tracked by a server-assigned id; the client's peer id is
        // only echoed back in messages and may collide across connections.
        let connection_id = Uuid::new_v4();
        let mut room: Option<Arc<DocumentRoom>> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Outgoing>> = None;

        let outcome = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                {
                                    let mut s = inner.stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }

                                let sync_msg = match SyncMessage::decode(&bytes) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        continue;
                                    }
                                };

                                match sync_msg.msg_type {
                                    MessageType::Join => {
                                        if room.is_some() {
                                            log::warn!("Connection {connection_id} sent a second join, ignoring");
                                            continue;
                                        }
                                        match Self::accept_join(&inner, &sync_msg, connection_id).await {
                                            Ok(joined) => {
                                                log::info!(
                                                    "Peer {} ({connection_id}) joined {}/{}",
                                                    sync_msg.peer_id,
                                                    joined.context.token.workspace,
                                                    joined.document
                                                );
                                                // Subscribe before snapshotting so no update falls in between
                                                broadcast_rx = Some(joined.broadcast.subscribe());
                                                let state = encode_state(&joined.doc);
                                                let reply = SyncMessage::sync_step2(Uuid::nil(), joined.document.clone(), state);
                                                // Registered before the send so a failed reply still leaves the room
                                                room = Some(joined);
                                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                            }
                                            Err(reason) => {
                                                log::warn!("Rejected join for {} from {addr}: {reason}", sync_msg.document);
                                                let reply = SyncMessage::error(sync_msg.document.clone(), &reason);
                                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                                break;
                                            }
                                        }
                                    }

                                    MessageType::Update => {
                                        let Some(r) = &room else {
                                            log::debug!("Update before join from {addr}, ignoring");
                                            continue;
                                        };
                                        match apply_update(&r.doc, &sync_msg.payload) {
                                            Ok(()) => {
                                                r.dirty.store(true, Ordering::SeqCst);
                                                let _ = r.broadcast.send((connection_id, Arc::new(bytes)));
                                            }
                                            Err(e) => log::warn!("Dropping invalid update for {}: {e}", r.document),
                                        }
                                    }

                                    MessageType::SyncStep1 => {
                                        let Some(r) = &room else { continue };
                                        let diff = match StateVector::decode_v1(&sync_msg.payload) {
                                            Ok(remote_sv) => {
                                                let txn = r.doc.transact();
                                                txn.encode_diff_v1(&remote_sv)
                                            }
                                            Err(e) => {
                                                log::warn!("Invalid state vector for {}: {e}", r.document);
                                                continue;
                                            }
                                        };
                                        let reply = SyncMessage::sync_step2(Uuid::nil(), r.document.clone(), diff);
                                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                    }

                                    MessageType::Ping => {
                                        let pong = SyncMessage::pong(sync_msg.peer_id);
                                        ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                    }

                                    _ => {
                                        log::debug!("Unhandled message type: {:?}", sync_msg.msg_type);
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    msg = async {
                        match broadcast_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match msg {
                            Ok((sender, data)) => {
                                if sender == connection_id {
                                    continue;
                                }
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Connection {connection_id} lagged by {n} messages");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        if let Some(r) = room {
            Self::leave_room(&inner, r, connection_id).await;
        }
        {
            let mut s = inner.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        outcome
    }

    /// Validate a join and attach the connection to its room.
    async fn accept_join(
        inner: &Arc<ServerInner>,
        msg: &SyncMessage,
        connection_id: Uuid,
    ) -> Result<Arc<DocumentRoom>, String> {
        if msg.document.is_empty() {
            return Err("document name is empty".into());
        }
        let request = msg.join_request().map_err(|e| e.to_string())?;
        let token = inner.issuer.verify(&request.token).map_err(|e| e.to_string())?;

        let mut context = SessionContext::new(token);
        context.initial_content_id = request.initial_content_id;

        Ok(Self::join_room(inner, &msg.document, context, connection_id).await)
    }

    /// Get or load the room and register `connection_id` in it.
    async fn join_room(
        inner: &Arc<ServerInner>,
        document: &str,
        context: SessionContext,
        connection_id: Uuid,
    ) -> Arc<DocumentRoom> {
        let key: RoomKey = (context.token.workspace.clone(), document.to_string());
        loop {
            let slot = {
                let mut rooms = inner.rooms.write().await;
                rooms.entry(key.clone()).or_default().clone()
            };

            let room = slot
                .get_or_init(|| async {
                    let doc = inner.extension.on_load_document(document, &context).await;
                    Arc::new(DocumentRoom::new(
                        document.to_string(),
                        doc,
                        context.clone(),
                        inner.config.broadcast_capacity,
                    ))
                })
                .await
                .clone();

            // A concurrent last-leave may have evicted the slot while it loaded
            let rooms = inner.rooms.read().await;
            if rooms.get(&key).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                room.peers.write().await.insert(connection_id);
                drop(rooms);
                let count = inner.rooms.read().await.len();
                inner.stats.write().await.active_rooms = count;
                return room;
            }
        }
    }

    /// Detach `connection_id`; the last connection out stores the document.
    async fn leave_room(inner: &Arc<ServerInner>, room: Arc<DocumentRoom>, connection_id: Uuid) {
        let remaining = {
            let mut peers = room.peers.write().await;
            peers.remove(&connection_id);
            peers.len()
        };
        log::info!("Connection {connection_id} left {} ({remaining} remaining)", room.document);
        if remaining > 0 {
            return;
        }

        Self::flush_room(inner, &room).await;
        Self::evict_if_idle(inner, &room).await;
    }

    /// Store the room if it has unsaved changes. Returns `false` on a failed store.
    async fn flush_room(inner: &Arc<ServerInner>, room: &DocumentRoom) -> bool {
        let _guard = room.store_lock.lock().await;
        if !room.dirty.swap(false, Ordering::SeqCst) {
            return true;
        }

        match inner
            .extension
            .on_store_document(&room.document, &room.context, &room.doc)
            .await
        {
            Ok(()) => {
                inner.stats.write().await.stores_completed += 1;
                true
            }
            Err(e) => {
                // Keep the changes pending for the next flush
                room.dirty.store(true, Ordering::SeqCst);
                inner.stats.write().await.stores_failed += 1;
                log::error!("Failed to store {}: {e}", room.document);
                false
            }
        }
    }

    async fn evict_if_idle(inner: &Arc<ServerInner>, room: &Arc<DocumentRoom>) {
        let mut rooms = inner.rooms.write().await;
        let key = room.key();
        let is_current = rooms
            .get(&key)
            .and_then(|slot| slot.get())
            .is_some_and(|current| Arc::ptr_eq(current, room));
        if is_current && !room.is_dirty() && room.peers.read().await.is_empty() {
            rooms.remove(&key);
            log::info!("Room {}/{} closed", key.0, key.1);
        }
        let count = rooms.len();
        drop(rooms);
        inner.stats.write().await.active_rooms = count;
    }

    async fn flush_rooms(inner: &Arc<ServerInner>) {
        let loaded: Vec<Arc<DocumentRoom>> = {
            let rooms = inner.rooms.read().await;
            rooms.values().filter_map(|slot| slot.get().cloned()).collect()
        };

        for room in loaded {
            if Self::flush_room(inner, &room).await && room.peers.read().await.is_empty() {
                Self::evict_if_idle(inner, &room).await;
            }
        }
    }
}
