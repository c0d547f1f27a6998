use futures_util::future::{self, BoxFuture, FutureExt};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use tabsync_core::store::{Commit, Origin, StateSnapshot, StateStore};
use tabsync_core::{Mutation, SyncError, TabId};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{info, warn};

/// Positive answer to a sent mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub seq: u64,
    pub created_id: Option<TabId>,
}

impl From<&Commit> for Ack {
    fn from(commit: &Commit) -> Self {
        Self {
            seq: commit.seq,
            created_id: commit.created_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Commit(Arc<Commit>),
    /// A fresh authoritative snapshot replaces whatever the client held,
    /// after a connect or a detected sequence gap.
    Resync(Arc<StateSnapshot>),
    /// Events were dropped; the listener must fetch a snapshot.
    Lagged,
    Disconnected,
}

pub type EventStream = BoxStream<'static, TransportEvent>;

/// Moves mutations to the authoritative store and commits back. The
/// coordinator only ever talks to this trait.
pub trait Transport: Send + Sync + 'static {
    fn client_id(&self) -> &str;

    fn send(
        &self,
        request_id: String,
        mutation: Mutation,
    ) -> BoxFuture<'static, Result<Ack, SyncError>>;

    fn snapshot(&self) -> BoxFuture<'static, Result<StateSnapshot, SyncError>>;

    fn events(&self) -> EventStream;

    fn is_connected(&self) -> bool;
}

/// Same-process transport: `send` applies straight to the store and the
/// store's commit channel is the broadcast stream.
pub struct LocalTransport {
    store: Arc<StateStore>,
    client_id: String,
    link: watch::Sender<bool>,
}

impl LocalTransport {
    pub fn new(store: Arc<StateStore>, client_id: impl Into<String>) -> Self {
        Self {
            store,
            client_id: client_id.into(),
            link: watch::Sender::new(true),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Simulates losing and regaining the link; while down, `send` fails
    /// with `NotConnected`. Coming back up emits a resync.
    pub fn set_connected(&self, connected: bool) {
        let changed = self.link.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
        if changed {
            info!(event = "local_link_changed", client_id = %self.client_id, connected = connected);
        }
    }
}

impl Transport for LocalTransport {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn send(
        &self,
        request_id: String,
        mutation: Mutation,
    ) -> BoxFuture<'static, Result<Ack, SyncError>> {
        if !self.is_connected() {
            return future::ready(Err(SyncError::NotConnected)).boxed();
        }
        let origin = Origin {
            client_id: self.client_id.clone(),
            request_id: Some(request_id),
        };
        let result = self
            .store
            .apply_from(origin, mutation)
            .map(|commit| Ack::from(commit.as_ref()));
        future::ready(result).boxed()
    }

    fn snapshot(&self) -> BoxFuture<'static, Result<StateSnapshot, SyncError>> {
        future::ready(Ok(self.store.snapshot())).boxed()
    }

    fn events(&self) -> EventStream {
        let rx = self.store.subscribe();
        let commits = stream::unfold((self.store.clone(), rx), |(store, mut rx)| async move {
            match rx.recv().await {
                Ok(commit) => Some((TransportEvent::Commit(commit), (store, rx))),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(event = "local_broadcast_lagged", skipped = skipped);
                    let snapshot = Arc::new(store.snapshot());
                    Some((TransportEvent::Resync(snapshot), (store, rx)))
                }
                Err(RecvError::Closed) => None,
            }
        });
        let link_rx = self.link.subscribe();
        let link = stream::unfold((self.store.clone(), link_rx), |(store, mut link_rx)| async move {
            link_rx.changed().await.ok()?;
            let up = *link_rx.borrow_and_update();
            let event = if up {
                TransportEvent::Resync(Arc::new(store.snapshot()))
            } else {
                TransportEvent::Disconnected
            };
            Some((event, (store, link_rx)))
        });
        stream::select(commits, link).boxed()
    }

    fn is_connected(&self) -> bool {
        *self.link.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabsync_core::{Partial, SlicePath};

    #[tokio::test]
    async fn local_send_applies_and_streams_the_commit() {
        let store = Arc::new(StateStore::new());
        let transport = LocalTransport::new(store.clone(), "tab-a");
        let mut events = transport.events();

        let ack = transport
            .send(
                "tab-a-1".to_string(),
                Mutation::CreateChatTab {
                    data: Partial::new(),
                },
            )
            .await
            .expect("ack");
        assert_eq!(ack.seq, 1);
        let created = ack.created_id.expect("created id");

        match events.next().await {
            Some(TransportEvent::Commit(commit)) => {
                assert!(commit.is_from("tab-a"));
                assert_eq!(commit.created_id.as_ref(), Some(&created));
                assert!(commit
                    .changes
                    .iter()
                    .any(|change| change.path == SlicePath::ChatTab(created.clone())));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnected_local_transport_fails_fast() {
        let store = Arc::new(StateStore::new());
        let transport = LocalTransport::new(store.clone(), "tab-a");
        transport.set_connected(false);
        let err = transport
            .send(
                "r".to_string(),
                Mutation::UpdateSettings {
                    partial: Partial::new().with("language", "fr"),
                },
            )
            .await
            .expect_err("offline");
        assert_eq!(err, SyncError::NotConnected);
        assert_eq!(store.seq(), 0);
    }
}
