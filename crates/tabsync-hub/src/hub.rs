use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tabsync_core::snapshot::{SnapshotError, SnapshotFile};
use tabsync_core::sync_ipc::{
    decode_message, encode_message, MessageSource, MutateResultPayload, WireEnvelope, WireMsg,
    CURRENT_PROTOCOL_VERSION, HUB_SENDER_ID,
};
use tabsync_core::{Commit, Mutation, Origin, StateStore, SyncError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const RESULT_CACHE_MAX: usize = 512;
pub const RESULT_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub session_id: String,
    pub debug: bool,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
}

struct CachedResult {
    stored_at: Instant,
    payload: MutateResultPayload,
}

pub struct HubState {
    config: HubConfig,
    store: Arc<StateStore>,
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<String, String>>,
    result_cache: RwLock<HashMap<String, CachedResult>>,
    result_cache_order: RwLock<VecDeque<String>>,
}

impl HubState {
    pub fn new(config: HubConfig, store: Arc<StateStore>) -> Self {
        Self {
            config,
            store,
            conn_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
            result_cache: RwLock::new(HashMap::new()),
            result_cache_order: RwLock::new(VecDeque::new()),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    fn envelope(&self, source: MessageSource, msg: WireMsg) -> WireEnvelope {
        WireEnvelope::new(&self.config.session_id, HUB_SENDER_ID, source, msg)
    }

    fn encode(&self, envelope: &WireEnvelope) -> Option<String> {
        match encode_message(envelope, self.config.max_frame_bytes) {
            Ok(frame) => Some(frame),
            Err(err) => {
                warn!(event = "frame_encode_error", kind = envelope.msg.kind(), error = %err);
                None
            }
        }
    }

    /// Apply one client mutation. A request id already answered for the
    /// same client is served from the cache instead of being applied again.
    pub async fn mutate(
        &self,
        client_id: &str,
        request_id: &str,
        mutation: Mutation,
    ) -> MutateResultPayload {
        let key = Self::result_cache_key(client_id, request_id);
        if let Some(cached) = self.cached_result(&key).await {
            debug!(event = "mutate_result_cached", client_id = client_id, request_id = request_id);
            return cached;
        }

        let name = mutation.name();
        let origin = Origin {
            client_id: client_id.to_string(),
            request_id: Some(request_id.to_string()),
        };
        let payload = match self.store.apply_from(origin, mutation) {
            Ok(commit) => {
                debug!(
                    event = "mutate_applied",
                    client_id = client_id,
                    mutation = name,
                    seq = commit.seq
                );
                MutateResultPayload::ok(commit.seq, commit.created_id.clone())
            }
            Err(err) => {
                warn!(
                    event = "mutate_rejected",
                    client_id = client_id,
                    mutation = name,
                    code = err.code(),
                    error = %err
                );
                MutateResultPayload::error(err.to_error_info())
            }
        };
        self.cache_result(key, payload.clone()).await;
        payload
    }

    fn result_cache_key(client_id: &str, request_id: &str) -> String {
        format!("{client_id}:{request_id}")
    }

    async fn cached_result(&self, key: &str) -> Option<MutateResultPayload> {
        {
            let cache = self.result_cache.read().await;
            match cache.get(key) {
                Some(entry) if entry.stored_at.elapsed() <= RESULT_CACHE_TTL => {
                    return Some(entry.payload.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        self.result_cache.write().await.remove(key);
        None
    }

    async fn cache_result(&self, key: String, payload: MutateResultPayload) {
        self.result_cache.write().await.insert(
            key.clone(),
            CachedResult {
                stored_at: Instant::now(),
                payload,
            },
        );

        let evicted: Vec<String> = {
            let mut order = self.result_cache_order.write().await;
            order.push_back(key);
            let mut evicted = Vec::new();
            while order.len() > RESULT_CACHE_MAX {
                if let Some(oldest) = order.pop_front() {
                    evicted.push(oldest);
                }
            }
            evicted
        };

        let mut cache = self.result_cache.write().await;
        for key in evicted {
            cache.remove(&key);
        }
        cache.retain(|_, entry| entry.stored_at.elapsed() <= RESULT_CACHE_TTL);
    }

    fn start_ping(&self, conn_id: String, sender: mpsc::Sender<Message>) -> Option<JoinHandle<()>> {
        if self.config.ping_interval.is_zero() {
            return None;
        }
        let interval = self.config.ping_interval;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    debug!(event = "ping_stopped", conn_id = %conn_id);
                    return;
                }
            }
        }))
    }

    /// One websocket connection: hello, snapshot, then mutations in and
    /// commits out until either side goes away.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(self.config.queue_capacity.max(1));
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let send = ws_sender.send(msg);
                if tokio::time::timeout(write_timeout, send).await.is_err() {
                    warn!(event = "write_timeout");
                    return;
                }
            }
        });

        let Some(client_id) = self.read_hello(&mut ws_receiver, remote).await else {
            drop(tx);
            let _ = write_task.await;
            return;
        };

        // Subscribe before taking the snapshot so no commit falls between
        // the two; the client drops broadcasts the snapshot already holds.
        let mut commits = self.store.subscribe();
        let snapshot = self.store.snapshot();
        let seq = snapshot.seq;
        let envelope = self.envelope(MessageSource::Hub, WireMsg::Snapshot(snapshot));
        let sent = match self.encode(&envelope) {
            Some(frame) => tx.send(Message::Text(frame)).await.is_ok(),
            None => false,
        };
        if !sent {
            warn!(event = "snapshot_send_failed", client_id = %client_id);
            drop(tx);
            let _ = write_task.await;
            return;
        }

        let conn_id = self.next_conn_id();
        let connections = {
            let mut clients = self.clients.write().await;
            clients.insert(conn_id.clone(), client_id.clone());
            clients.len()
        };
        info!(
            event = "client_connected",
            conn_id = %conn_id,
            client_id = %client_id,
            seq = seq,
            connections = connections
        );
        let ping = self.start_ping(conn_id.clone(), tx.clone());

        let reason = loop {
            tokio::select! {
                incoming = ws_receiver.next() => {
                    let text = match incoming {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => break "client_close",
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            warn!(event = "read_error", conn_id = %conn_id, error = %err);
                            break "read_error";
                        }
                    };
                    if let Err(reason) = self.handle_frame(&conn_id, &client_id, &text, &tx).await {
                        break reason;
                    }
                }
                commit = commits.recv() => match commit {
                    Ok(commit) => {
                        if let Err(reason) = self.forward_commit(&conn_id, &commit, &tx) {
                            break reason;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(event = "slow_consumer", conn_id = %conn_id, skipped = skipped);
                        break "lagged";
                    }
                    Err(RecvError::Closed) => break "store_closed",
                },
            }
        };

        if let Some(ping) = ping {
            ping.abort();
        }
        self.clients.write().await.remove(&conn_id);
        info!(
            event = "client_disconnected",
            conn_id = %conn_id,
            client_id = %client_id,
            reason = reason
        );
        drop(tx);
        let _ = write_task.await;
    }

    async fn read_hello(
        &self,
        ws_receiver: &mut futures_util::stream::SplitStream<WebSocket>,
        remote: SocketAddr,
    ) -> Option<String> {
        let text = match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => text,
            _ => {
                warn!(event = "expected_hello", remote = %remote);
                return None;
            }
        };
        let envelope = match decode_message(&text, self.config.max_frame_bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(event = "hello_parse", remote = %remote, error = %err);
                return None;
            }
        };
        if envelope.version.0 > CURRENT_PROTOCOL_VERSION {
            warn!(event = "unsupported_version", remote = %remote, version = envelope.version.0);
            return None;
        }
        if envelope.session_id != self.config.session_id {
            warn!(
                event = "session_id_mismatch",
                remote = %remote,
                session_id = %envelope.session_id
            );
            return None;
        }
        let WireMsg::Hello(hello) = envelope.msg else {
            warn!(event = "expected_hello", remote = %remote, kind = envelope.msg.kind());
            return None;
        };
        if hello.client_id.is_empty() || hello.client_id != envelope.sender_id {
            warn!(event = "client_id_mismatch", remote = %remote);
            return None;
        }
        Some(hello.client_id)
    }

    async fn handle_frame(
        &self,
        conn_id: &str,
        client_id: &str,
        text: &str,
        tx: &mpsc::Sender<Message>,
    ) -> Result<(), &'static str> {
        if self.config.debug {
            debug!(event = "message_received", conn_id = conn_id, raw = text);
        }
        let envelope = match decode_message(text, self.config.max_frame_bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(event = "message_invalid", conn_id = conn_id, error = %err);
                return Ok(());
            }
        };
        if envelope.session_id != self.config.session_id {
            warn!(
                event = "session_mismatch",
                conn_id = conn_id,
                msg_session = %envelope.session_id
            );
            return Err("session_mismatch");
        }
        let WireMsg::Mutate(mutation) = envelope.msg else {
            warn!(event = "unexpected_message", conn_id = conn_id, kind = envelope.msg.kind());
            return Ok(());
        };

        let (request_id, payload) = match envelope.request_id {
            Some(request_id) => {
                let payload = self.mutate(client_id, &request_id, mutation).await;
                (Some(request_id), payload)
            }
            None => {
                let err = SyncError::validation("mutate requires a request_id");
                (None, MutateResultPayload::error(err.to_error_info()))
            }
        };
        let mut reply = self.envelope(MessageSource::Hub, WireMsg::MutateResult(payload));
        reply.request_id = request_id;
        let Some(frame) = self.encode(&reply) else {
            return Ok(());
        };
        enqueue(conn_id, tx, frame)
    }

    fn forward_commit(
        &self,
        conn_id: &str,
        commit: &Commit,
        tx: &mpsc::Sender<Message>,
    ) -> Result<(), &'static str> {
        let mut envelope =
            self.envelope(MessageSource::Broadcast, WireMsg::Broadcast(commit.clone()));
        envelope.request_id = commit.origin.as_ref().and_then(|origin| origin.request_id.clone());
        match self.encode(&envelope) {
            Some(frame) => enqueue(conn_id, tx, frame),
            // A commit the client can never receive leaves it with a gap;
            // dropping the connection makes it resync.
            None => Err("encode_error"),
        }
    }
}

fn enqueue(conn_id: &str, tx: &mpsc::Sender<Message>, frame: String) -> Result<(), &'static str> {
    match tx.try_send(Message::Text(frame)) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(event = "slow_consumer", conn_id = conn_id);
            Err("slow_consumer")
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Err("writer_closed"),
    }
}

pub fn router(hub: Arc<HubState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/snapshot", get(snapshot_handler))
        .with_state(hub)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<HubState>>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket, addr).await;
    })
}

async fn snapshot_handler(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<HubState>>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    Json(hub.store.snapshot().state).into_response()
}

/// Writes the store to disk a short while after commits settle.
#[derive(Clone)]
pub struct Persister {
    store: Arc<StateStore>,
    file: SnapshotFile,
}

impl Persister {
    pub fn new(store: Arc<StateStore>, file: SnapshotFile) -> Self {
        Self { store, file }
    }

    pub async fn save_now(&self) -> Result<(), SnapshotError> {
        let state = self.store.snapshot().state;
        let file = self.file.clone();
        match tokio::task::spawn_blocking(move || file.save(&state)).await {
            Ok(result) => result,
            Err(err) => Err(SnapshotError::Io(std::io::Error::other(err.to_string()))),
        }
    }

    pub fn spawn(self, debounce: Duration) -> JoinHandle<()> {
        let mut commits = self.store.subscribe();
        tokio::spawn(async move {
            loop {
                match commits.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return,
                }
                tokio::time::sleep(debounce).await;
                // Everything that arrived during the wait is in this save.
                loop {
                    match commits.try_recv() {
                        Ok(_) | Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => {}
                        Err(_) => break,
                    }
                }
                match self.save_now().await {
                    Ok(()) => debug!(
                        event = "state_persisted",
                        path = %self.file.path().display(),
                        seq = self.store.seq()
                    ),
                    Err(err) => warn!(event = "state_persist_failed", error = %err),
                }
            }
        })
    }
}
