use futures_util::future::{self, BoxFuture, FutureExt};
use futures_util::stream::{self, StreamExt};
use futures_util::SinkExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tabsync_core::store::StateSnapshot;
use tabsync_core::sync_ipc::{
    decode_message, encode_message, HelloPayload, MessageSource, MutateResultPayload,
    ResultStatus, WireEnvelope, WireMsg, CURRENT_PROTOCOL_VERSION,
};
use tabsync_core::{Mutation, SyncError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::HubTransportConfig;
use crate::transport::{Ack, EventStream, Transport, TransportEvent};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

type PendingAcks = HashMap<String, oneshot::Sender<Result<Ack, SyncError>>>;

struct Shared {
    config: HubTransportConfig,
    connected: AtomicBool,
    pending: Mutex<PendingAcks>,
    events: broadcast::Sender<TransportEvent>,
    snapshot: watch::Sender<Option<Arc<StateSnapshot>>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingAcks> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fail_pending(&self, error: SyncError) {
        let drained: Vec<_> = self.pending().drain().collect();
        for (_, waiter) in drained {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

/// Transport to a `tabsync-hub` over a persistent WebSocket. A background
/// task owns the socket, reconnects with backoff and resynchronizes from a
/// fresh snapshot on every connect.
pub struct HubTransport {
    shared: Arc<Shared>,
    out_tx: mpsc::Sender<String>,
    task: JoinHandle<()>,
}

impl HubTransport {
    pub fn connect(config: HubTransportConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (snapshot, _) = watch::channel(None);
        let (out_tx, out_rx) = mpsc::channel(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            config,
            connected: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            events,
            snapshot,
        });
        let task = tokio::spawn(connection_loop(shared.clone(), out_rx));
        Self {
            shared,
            out_tx,
            task,
        }
    }

    /// Resolves once the first snapshot has arrived, or fails after
    /// `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), SyncError> {
        let mut rx = self.shared.snapshot.subscribe();
        match tokio::time::timeout(timeout, await_snapshot(&mut rx)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(SyncError::AckTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

async fn await_snapshot(
    rx: &mut watch::Receiver<Option<Arc<StateSnapshot>>>,
) -> Result<Arc<StateSnapshot>, SyncError> {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(snapshot) = current {
            return Ok(snapshot);
        }
        if rx.changed().await.is_err() {
            return Err(SyncError::NotConnected);
        }
    }
}

impl Drop for HubTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Transport for HubTransport {
    fn client_id(&self) -> &str {
        &self.shared.config.client_id
    }

    fn send(
        &self,
        request_id: String,
        mutation: Mutation,
    ) -> BoxFuture<'static, Result<Ack, SyncError>> {
        if !self.is_connected() {
            return future::ready(Err(SyncError::NotConnected)).boxed();
        }
        let config = &self.shared.config;
        let envelope = WireEnvelope::new(
            &config.session_id,
            &config.client_id,
            MessageSource::Client,
            WireMsg::Mutate(mutation),
        )
        .with_request_id(request_id.clone());
        let frame = match encode_message(&envelope, config.max_frame_bytes) {
            Ok(frame) => frame,
            Err(err) => return future::ready(Err(SyncError::Validation(err.to_string()))).boxed(),
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        self.shared.pending().insert(request_id.clone(), ack_tx);
        if self.out_tx.try_send(frame).is_err() {
            self.shared.pending().remove(&request_id);
            let err = SyncError::Transport("outbound queue full".to_string());
            return future::ready(Err(err)).boxed();
        }

        let shared = self.shared.clone();
        let timeout = config.ack_timeout;
        async move {
            match tokio::time::timeout(timeout, ack_rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(SyncError::NotConnected),
                Err(_) => {
                    shared.pending().remove(&request_id);
                    warn!(event = "ack_timeout", request_id = %request_id);
                    Err(SyncError::AckTimeout {
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            }
        }
        .boxed()
    }

    fn snapshot(&self) -> BoxFuture<'static, Result<StateSnapshot, SyncError>> {
        let mut rx = self.shared.snapshot.subscribe();
        let timeout = self.shared.config.ack_timeout;
        async move {
            match tokio::time::timeout(timeout, await_snapshot(&mut rx)).await {
                Ok(result) => result.map(|snapshot| snapshot.as_ref().clone()),
                Err(_) => Err(SyncError::AckTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                }),
            }
        }
        .boxed()
    }

    fn events(&self) -> EventStream {
        let rx = self.shared.events.subscribe();
        stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(event) => Some((event, rx)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(event = "hub_events_lagged", skipped = skipped);
                    Some((TransportEvent::Lagged, rx))
                }
                Err(RecvError::Closed) => None,
            }
        })
        .boxed()
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

fn mutate_result(payload: MutateResultPayload) -> Result<Ack, SyncError> {
    match (payload.status, payload.seq, payload.error) {
        (ResultStatus::Ok, Some(seq), _) => Ok(Ack {
            seq,
            created_id: payload.created_id,
        }),
        (_, _, Some(error)) => Err(SyncError::from_error_info(error)),
        _ => Err(SyncError::Transport("malformed mutate_result".to_string())),
    }
}

async fn connection_loop(shared: Arc<Shared>, mut out_rx: mpsc::Receiver<String>) {
    let config = shared.config.clone();
    let mut backoff = config.reconnect.base;

    loop {
        let (ws, _) = match connect_async(config.url.as_str()).await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "hub_connect_error", url = %config.url, error = %err);
                tokio::time::sleep(backoff).await;
                backoff = config.reconnect.next(backoff);
                continue;
            }
        };
        backoff = config.reconnect.base;
        let (mut writer, mut reader) = ws.split();

        let hello = WireEnvelope::new(
            &config.session_id,
            &config.client_id,
            MessageSource::Client,
            WireMsg::Hello(HelloPayload {
                client_id: config.client_id.clone(),
                capabilities: vec!["mutate".to_string(), "broadcast".to_string()],
            }),
        );
        let sent = match encode_message(&hello, config.max_frame_bytes) {
            Ok(frame) => writer.send(Message::Text(frame)).await.is_ok(),
            Err(_) => false,
        };
        if !sent {
            warn!(event = "hub_hello_error");
            tokio::time::sleep(backoff).await;
            backoff = config.reconnect.next(backoff);
            continue;
        }

        let mut last_seq: Option<u64> = None;
        loop {
            tokio::select! {
                incoming = reader.next() => {
                    let text = match incoming {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            warn!(event = "hub_read_error", error = %err);
                            break;
                        }
                    };
                    let envelope = match decode_message(&text, config.max_frame_bytes) {
                        Ok(envelope) => envelope,
                        Err(err) => {
                            warn!(event = "hub_decode_error", error = %err);
                            continue;
                        }
                    };
                    if envelope.session_id != config.session_id
                        || envelope.version.0 > CURRENT_PROTOCOL_VERSION
                    {
                        continue;
                    }
                    match envelope.msg {
                        WireMsg::Snapshot(snapshot) => {
                            last_seq = Some(snapshot.seq);
                            let snapshot = Arc::new(snapshot);
                            shared.snapshot.send_replace(Some(snapshot.clone()));
                            if !shared.connected.swap(true, Ordering::SeqCst) {
                                info!(event = "hub_connected", seq = snapshot.seq);
                            }
                            let _ = shared.events.send(TransportEvent::Resync(snapshot));
                        }
                        WireMsg::MutateResult(payload) => {
                            let Some(request_id) = envelope.request_id else {
                                continue;
                            };
                            let waiter = shared.pending().remove(&request_id);
                            match waiter {
                                Some(waiter) => {
                                    let _ = waiter.send(mutate_result(payload));
                                }
                                None => {
                                    debug!(event = "late_mutate_result", request_id = %request_id)
                                }
                            }
                        }
                        WireMsg::Broadcast(commit) => {
                            let Some(last) = last_seq else {
                                continue;
                            };
                            if commit.seq <= last {
                                continue;
                            }
                            if commit.seq > last + 1 {
                                warn!(
                                    event = "hub_seq_gap",
                                    last_seq = last,
                                    next_seq = commit.seq
                                );
                                break;
                            }
                            last_seq = Some(commit.seq);
                            let _ = shared.events.send(TransportEvent::Commit(Arc::new(commit)));
                        }
                        WireMsg::Hello(_) | WireMsg::Mutate(_) => {}
                    }
                }
                outgoing = out_rx.recv() => {
                    let Some(frame) = outgoing else {
                        let _ = writer.close().await;
                        return;
                    };
                    if let Err(err) = writer.send(Message::Text(frame)).await {
                        warn!(event = "hub_write_error", error = %err);
                        break;
                    }
                }
            }
        }

        shared.connected.store(false, Ordering::SeqCst);
        shared.fail_pending(SyncError::NotConnected);
        let _ = shared.events.send(TransportEvent::Disconnected);
        info!(event = "hub_disconnected");
        tokio::time::sleep(backoff).await;
        backoff = config.reconnect.next(backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::coordinator::SyncHandle;
    use std::net::SocketAddr;
    use tabsync_core::error::CODE_LAST_TAB;
    use tabsync_core::model::DEFAULT_PROJECT_TAB_ID;
    use tabsync_core::sync_ipc::{ErrorInfo, DEFAULT_MAX_FRAME_BYTES, HUB_SENDER_ID};
    use tabsync_core::{Commit, EntityKey, Partial, StateStore, TabId};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{accept_async, WebSocketStream};

    const SESSION: &str = "transport-test";

    type HubSide = WebSocketStream<TcpStream>;

    fn client_config(client_id: &str) -> ClientConfig {
        ClientConfig {
            session_id: SESSION.to_string(),
            client_id: client_id.to_string(),
            debounce: Duration::from_millis(20),
            ack_timeout: Duration::from_millis(100),
            backoff: crate::Backoff {
                base: Duration::from_millis(20),
                factor: 2,
                cap: Duration::from_millis(200),
            },
            ..ClientConfig::default()
        }
    }

    fn transport_config(addr: SocketAddr, client: &ClientConfig) -> HubTransportConfig {
        let url = url::Url::parse(&format!("ws://{addr}/ws")).expect("url");
        let mut config = HubTransportConfig::new(url, client);
        config.reconnect.base = Duration::from_millis(10);
        config
    }

    async fn accept_client(listener: &TcpListener) -> HubSide {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("handshake");
        let hello = next_envelope(&mut ws).await;
        assert!(matches!(hello.msg, WireMsg::Hello(_)));
        ws
    }

    async fn next_envelope(ws: &mut HubSide) -> WireEnvelope {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return decode_message(&text, DEFAULT_MAX_FRAME_BYTES).expect("decode")
                }
                Some(Ok(_)) => continue,
                other => panic!("client socket ended: {other:?}"),
            }
        }
    }

    async fn push(ws: &mut HubSide, msg: WireMsg, request_id: Option<String>) {
        let mut envelope = WireEnvelope::new(SESSION, HUB_SENDER_ID, MessageSource::Hub, msg);
        envelope.request_id = request_id;
        let frame = encode_message(&envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        ws.send(Message::Text(frame)).await.expect("push");
    }

    fn snapshot_at(seq: u64) -> WireMsg {
        let mut snapshot = StateStore::new().snapshot();
        snapshot.seq = seq;
        WireMsg::Snapshot(snapshot)
    }

    fn broadcast(seq: u64) -> WireMsg {
        WireMsg::Broadcast(Commit {
            seq,
            mutation: "update_settings".to_string(),
            origin: None,
            created_id: None,
            changes: Vec::new(),
        })
    }

    async fn next_event(events: &mut EventStream) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("event in time")
            .expect("stream open")
    }

    #[test]
    fn mutate_results_map_to_acks_and_errors() {
        let ack = mutate_result(MutateResultPayload::ok(7, Some(TabId::new("c1")))).expect("ack");
        assert_eq!(ack.seq, 7);
        assert_eq!(ack.created_id, Some(TabId::new("c1")));

        let err = mutate_result(MutateResultPayload::error(ErrorInfo {
            code: CODE_LAST_TAB.to_string(),
            message: "cannot delete".to_string(),
            target: Some("defaultTab".to_string()),
        }))
        .expect_err("error");
        assert_eq!(
            err,
            SyncError::LastTab {
                tab_id: TabId::new("defaultTab")
            }
        );
    }

    #[tokio::test]
    async fn send_before_connect_fails_fast() {
        let client = crate::config::ClientConfig::default();
        let url = url::Url::parse("ws://127.0.0.1:9/ws").expect("url");
        let transport = HubTransport::connect(HubTransportConfig::new(url, &client));
        assert!(!transport.is_connected());
        let err = transport
            .send(
                "r1".to_string(),
                Mutation::DeleteChatTab {
                    tab_id: TabId::new("c1"),
                },
            )
            .await
            .expect_err("not connected");
        assert_eq!(err, SyncError::NotConnected);
    }

    #[tokio::test]
    async fn duplicates_are_dropped_and_a_seq_gap_forces_a_resync() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let hub = tokio::spawn(async move {
            let mut first = accept_client(&listener).await;
            push(&mut first, snapshot_at(0), None).await;
            push(&mut first, broadcast(1), None).await;
            push(&mut first, broadcast(1), None).await;
            push(&mut first, broadcast(3), None).await;
            let mut second = accept_client(&listener).await;
            push(&mut second, snapshot_at(3), None).await;
            (first, second)
        });

        let client = client_config("tab-a");
        let transport = HubTransport::connect(transport_config(addr, &client));
        let mut events = transport.events();

        assert!(matches!(next_event(&mut events).await, TransportEvent::Resync(s) if s.seq == 0));
        assert!(matches!(next_event(&mut events).await, TransportEvent::Commit(c) if c.seq == 1));
        assert!(matches!(next_event(&mut events).await, TransportEvent::Disconnected));
        assert!(matches!(next_event(&mut events).await, TransportEvent::Resync(s) if s.seq == 3));
        assert!(transport.is_connected());
        let _sockets = hub.await.expect("hub task");
    }

    #[tokio::test]
    async fn an_unanswered_edit_is_retried_with_the_same_request_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let hub = tokio::spawn(async move {
            let mut ws = accept_client(&listener).await;
            push(&mut ws, snapshot_at(0), None).await;
            let mut seen = Vec::new();
            while seen.len() < 2 {
                let envelope = next_envelope(&mut ws).await;
                if let WireMsg::Mutate(_) = envelope.msg {
                    seen.push(envelope.request_id);
                }
            }
            // Only the retry is answered; the first attempt timed out.
            let result = WireMsg::MutateResult(MutateResultPayload::ok(1, None));
            push(&mut ws, result, seen[1].clone()).await;
            (ws, seen)
        });

        let client = client_config("tab-a");
        let transport = HubTransport::connect(transport_config(addr, &client));
        transport
            .wait_connected(Duration::from_secs(5))
            .await
            .expect("connected");
        let handle = SyncHandle::start(client, Arc::new(transport))
            .await
            .expect("start");
        let key = EntityKey::ProjectTab(TabId::new(DEFAULT_PROJECT_TAB_ID));
        handle
            .edit(key.clone(), Partial::new().with("userPrompt", "slow hub"))
            .await
            .expect("edit");
        handle.flush(key.clone()).await.expect("flush after retry");

        let (_ws, seen) = hub.await.expect("hub task");
        assert!(seen[0].is_some());
        assert_eq!(seen[0], seen[1]);
        assert!(handle.status(key).await.expect("status").is_clean());
    }
}
