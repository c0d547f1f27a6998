use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tabsync_core::{
    EntityKey, Mutation, Partial, Selector, Slice, SlicePath, Subscription, SyncError,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::transport::{Ack, EventStream, Transport, TransportEvent};
use crate::view::{LocalView, Protected};

const FAILURE_CHANNEL_CAPACITY: usize = 64;
const IDLE_WAKE: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldState {
    Clean,
    Dirty,
    Committing,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EntityStatus {
    /// Only non-clean fields are listed.
    pub fields: BTreeMap<String, FieldState>,
    pub last_error: Option<SyncError>,
}

impl EntityStatus {
    pub fn field(&self, name: &str) -> FieldState {
        self.fields.get(name).copied().unwrap_or(FieldState::Clean)
    }

    pub fn is_clean(&self) -> bool {
        self.fields.is_empty()
    }
}

/// An edit the coordinator gave up on. Its fields stay dirty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditFailure {
    pub key: EntityKey,
    pub error: SyncError,
}

type ViewJob = Box<dyn FnOnce(&LocalView) + Send>;
type FlushReply = oneshot::Sender<Result<u64, SyncError>>;

enum Command {
    Edit {
        key: EntityKey,
        partial: Partial,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Flush {
        key: Option<EntityKey>,
        reply: FlushReply,
    },
    Dispatch {
        mutation: Mutation,
        reply: oneshot::Sender<Result<Ack, SyncError>>,
    },
    Status {
        key: EntityKey,
        reply: oneshot::Sender<EntityStatus>,
    },
    WithView(ViewJob),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Completion {
    Edit {
        key: EntityKey,
        request_id: String,
        result: Result<Ack, SyncError>,
    },
    Structural {
        mutation: Mutation,
        reply: oneshot::Sender<Result<Ack, SyncError>>,
        result: Result<Ack, SyncError>,
    },
}

struct InFlight {
    request_id: String,
    partial: Partial,
    attempt: u32,
    retry_at: Option<Instant>,
}

#[derive(Default)]
struct EntityEdits {
    pending: Partial,
    deadline: Option<Instant>,
    in_flight: Option<InFlight>,
    waiters: Vec<FlushReply>,
    last_seq: u64,
    last_error: Option<SyncError>,
}

impl EntityEdits {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_none()
    }

    fn protected_fields(&self) -> BTreeSet<String> {
        let mut fields: BTreeSet<String> = self.pending.keys().cloned().collect();
        if let Some(in_flight) = &self.in_flight {
            fields.extend(in_flight.partial.keys().cloned());
        }
        fields
    }

    fn next_wake(&self) -> Option<Instant> {
        match &self.in_flight {
            Some(in_flight) => in_flight.retry_at,
            None if !self.pending.is_empty() => self.deadline,
            None => None,
        }
    }

    fn resolve_waiters(&mut self, result: Result<u64, SyncError>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }
}

struct SeqWaiter {
    seq: u64,
    ack: Ack,
    reply: oneshot::Sender<Result<Ack, SyncError>>,
}

/// Cloneable front door to a running coordinator. All state lives in the
/// actor task; every call here is a message to it.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<Command>,
    failures: broadcast::Sender<EditFailure>,
}

fn stopped() -> SyncError {
    SyncError::Transport("coordinator stopped".to_string())
}

impl SyncHandle {
    /// Load the initial snapshot through `transport` and start the actor.
    pub async fn start(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, SyncError> {
        let events = transport.events();
        let snapshot = transport.snapshot().await?;
        info!(
            event = "coordinator_started",
            client_id = %transport.client_id(),
            seq = snapshot.seq
        );
        let (tx, cmd_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (done_tx, done_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        let actor = Actor {
            config,
            transport,
            view: LocalView::new(snapshot),
            edits: HashMap::new(),
            done_tx,
            seq_waiters: Vec::new(),
            failures: failures.clone(),
            next_request: 0,
            structural_in_flight: 0,
        };
        tokio::spawn(actor.run(cmd_rx, done_rx, events));
        Ok(Self { tx, failures })
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    /// Apply `partial` locally now and commit it after the debounce window.
    pub async fn edit(&self, key: EntityKey, partial: Partial) -> Result<(), SyncError> {
        self.call(|reply| Command::Edit {
            key,
            partial,
            reply,
        })
        .await?
    }

    /// Commit pending edits of `key` now and wait until they are acked.
    pub async fn flush(&self, key: EntityKey) -> Result<(), SyncError> {
        self.call(|reply| Command::Flush {
            key: Some(key),
            reply,
        })
        .await?
        .map(|_| ())
    }

    pub async fn flush_all(&self) -> Result<(), SyncError> {
        self.call(|reply| Command::Flush { key: None, reply })
            .await?
            .map(|_| ())
    }

    /// Send a mutation right away. Resolves once the local view includes
    /// the commit. Field updates sent this way still join any pending edits
    /// of the same entity.
    pub async fn dispatch(&self, mutation: Mutation) -> Result<Ack, SyncError> {
        self.call(|reply| Command::Dispatch { mutation, reply })
            .await?
    }

    pub async fn status(&self, key: EntityKey) -> Result<EntityStatus, SyncError> {
        self.call(|reply| Command::Status { key, reply }).await
    }

    pub async fn slice(&self, path: SlicePath) -> Result<Slice, SyncError> {
        self.with_view(move |view| view.slice(&path)).await
    }

    pub async fn subscribe(
        &self,
        path: SlicePath,
        callback: impl FnMut(&Slice) + Send + 'static,
    ) -> Result<Subscription, SyncError> {
        self.with_view(move |view| view.observers().subscribe(path, callback))
            .await
    }

    pub async fn select<T, F>(&self, path: SlicePath, map: F) -> Result<Selector<T>, SyncError>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&Slice) -> T + Send + 'static,
    {
        self.with_view(move |view| {
            let current = view.slice(&path);
            view.observers().select(path, &current, map)
        })
        .await
    }

    async fn with_view<T: Send + 'static>(
        &self,
        job: impl FnOnce(&LocalView) -> T + Send + 'static,
    ) -> Result<T, SyncError> {
        let (reply, rx) = oneshot::channel();
        let job: ViewJob = Box::new(move |view| {
            let _ = reply.send(job(view));
        });
        self.tx.send(Command::WithView(job)).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    pub fn failures(&self) -> broadcast::Receiver<EditFailure> {
        self.failures.subscribe()
    }

    /// Flush everything, then stop the actor.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.call(|reply| Command::Shutdown { reply }).await
    }
}

struct Actor {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    view: LocalView,
    edits: HashMap<EntityKey, EntityEdits>,
    done_tx: mpsc::Sender<Completion>,
    seq_waiters: Vec<SeqWaiter>,
    failures: broadcast::Sender<EditFailure>,
    next_request: u64,
    structural_in_flight: usize,
}

impl Actor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut done_rx: mpsc::Receiver<Completion>,
        mut events: EventStream,
    ) {
        let mut events_open = true;
        let mut shutdown: Option<oneshot::Sender<()>> = None;

        loop {
            let wake = self.next_wake();
            let wake_at = wake.unwrap_or_else(|| Instant::now() + IDLE_WAKE);
            tokio::select! {
                command = cmd_rx.recv(), if shutdown.is_none() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.flush_now(None);
                        shutdown = Some(reply);
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.flush_now(None);
                        shutdown = Some(oneshot::channel().0);
                    }
                },
                Some(done) = done_rx.recv() => self.handle_completion(done),
                event = events.next(), if events_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!(event = "transport_events_closed");
                        events_open = false;
                    }
                },
                _ = tokio::time::sleep_until(wake_at), if wake.is_some() => {
                    self.fire_due(Instant::now())
                }
            }

            if shutdown.is_some() && self.is_quiet() {
                break;
            }
        }
        self.fail_all_waiters();
        if let Some(reply) = shutdown {
            let _ = reply.send(());
        }
        info!(event = "coordinator_stopped");
    }

    fn is_quiet(&self) -> bool {
        self.structural_in_flight == 0
            && self.edits.values().all(|edits| {
                edits.in_flight.is_none() && (edits.pending.is_empty() || edits.deadline.is_none())
            })
    }

    fn next_wake(&self) -> Option<Instant> {
        self.edits.values().filter_map(EntityEdits::next_wake).min()
    }

    fn protected(&self) -> Protected {
        self.edits
            .iter()
            .map(|(key, edits)| (key.clone(), edits.protected_fields()))
            .filter(|(_, fields)| !fields.is_empty())
            .collect()
    }

    fn next_request_id(&mut self) -> String {
        self.next_request += 1;
        format!("{}-{}", self.transport.client_id(), self.next_request)
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Edit {
                key,
                partial,
                reply,
            } => {
                let _ = reply.send(self.edit(key, partial));
            }
            Command::Flush { key, reply } => match key {
                Some(key) => self.flush(key, reply),
                None => {
                    let keys: Vec<EntityKey> = self.edits.keys().cloned().collect();
                    self.flush_many(keys, reply);
                }
            },
            Command::Dispatch { mutation, reply } => self.dispatch(mutation, reply),
            Command::Status { key, reply } => {
                let _ = reply.send(self.status(&key));
            }
            Command::WithView(job) => job(&self.view),
            Command::Shutdown { .. } => {}
        }
    }

    fn edit(&mut self, key: EntityKey, partial: Partial) -> Result<(), SyncError> {
        key.update(partial.clone()).validate()?;
        if partial.is_empty() {
            return Ok(());
        }
        match self.view.apply_local(&key, &partial) {
            Ok(()) => {}
            Err(err @ SyncError::StaleTarget { .. }) => {
                warn!(event = "edit_on_missing_target", target = %key.path(), error = %err);
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        let deadline = Instant::now() + self.config.debounce;
        let edits = self.edits.entry(key).or_default();
        edits.pending.extend(partial);
        edits.deadline = Some(deadline);
        edits.last_error = None;
        Ok(())
    }

    fn flush(&mut self, key: EntityKey, reply: FlushReply) {
        let Some(edits) = self.edits.get_mut(&key) else {
            let _ = reply.send(Ok(self.view.seq()));
            return;
        };
        if edits.is_idle() {
            let _ = reply.send(Ok(edits.last_seq));
            return;
        }
        edits.waiters.push(reply);
        self.flush_now(Some(&key));
    }

    fn flush_many(&mut self, keys: Vec<EntityKey>, reply: FlushReply) {
        // Each key gets its own waiter; the combined reply resolves once all do.
        let mut receivers = Vec::new();
        for key in keys {
            let (tx, rx) = oneshot::channel();
            self.flush(key, tx);
            receivers.push(rx);
        }
        tokio::spawn(async move {
            let mut last_seq = 0;
            for rx in receivers {
                match rx.await {
                    Ok(Ok(seq)) => last_seq = last_seq.max(seq),
                    Ok(Err(err)) => {
                        let _ = reply.send(Err(err));
                        return;
                    }
                    Err(_) => {
                        let _ = reply.send(Err(stopped()));
                        return;
                    }
                }
            }
            let _ = reply.send(Ok(last_seq));
        });
    }

    /// Make the debounce deadline of one entity (or all) due immediately.
    fn flush_now(&mut self, key: Option<&EntityKey>) {
        let now = Instant::now();
        for (edits_key, edits) in self.edits.iter_mut() {
            if key.is_some_and(|key| key != edits_key) {
                continue;
            }
            if !edits.pending.is_empty() {
                edits.deadline = Some(now);
            }
            if let Some(in_flight) = edits.in_flight.as_mut() {
                if in_flight.retry_at.is_some() {
                    in_flight.retry_at = Some(now);
                }
            }
        }
        self.fire_due(now);
    }

    fn fire_due(&mut self, now: Instant) {
        let due: Vec<EntityKey> = self
            .edits
            .iter()
            .filter(|(_, edits)| edits.next_wake().is_some_and(|at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            self.send_edit(key);
        }
    }

    /// Start (or retry) the commit of one entity's edits. At most one commit
    /// per entity is in flight so per-entity order is kept.
    fn send_edit(&mut self, key: EntityKey) {
        let request_id = self.next_request_id();
        let Some(edits) = self.edits.get_mut(&key) else {
            return;
        };
        let (request_id, partial) = match edits.in_flight.as_mut() {
            Some(in_flight) => {
                // Retry with the same request id so the hub can dedupe.
                in_flight.retry_at = None;
                in_flight.attempt += 1;
                (in_flight.request_id.clone(), in_flight.partial.clone())
            }
            None => {
                if edits.pending.is_empty() {
                    return;
                }
                let partial = std::mem::take(&mut edits.pending);
                edits.deadline = None;
                edits.in_flight = Some(InFlight {
                    request_id: request_id.clone(),
                    partial: partial.clone(),
                    attempt: 1,
                    retry_at: None,
                });
                (request_id, partial)
            }
        };
        debug!(
            event = "edit_commit_sent",
            target = %key.path(),
            request_id = %request_id,
            fields = partial.len()
        );
        let send = self.transport.send(request_id.clone(), key.update(partial));
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let result = send.await;
            let _ = done_tx
                .send(Completion::Edit {
                    key,
                    request_id,
                    result,
                })
                .await;
        });
    }

    fn dispatch(&mut self, mutation: Mutation, reply: oneshot::Sender<Result<Ack, SyncError>>) {
        if let Err(err) = mutation.validate() {
            let _ = reply.send(Err(err));
            return;
        }
        if let Some((key, partial)) = mutation.update_target() {
            let partial = partial.clone();
            if let Err(err) = self.edit(key.clone(), partial) {
                let _ = reply.send(Err(err));
                return;
            }
            let (tx, rx) = oneshot::channel();
            self.flush(key, tx);
            tokio::spawn(async move {
                let result = match rx.await {
                    Ok(result) => result.map(|seq| Ack {
                        seq,
                        created_id: None,
                    }),
                    Err(_) => Err(stopped()),
                };
                let _ = reply.send(result);
            });
            return;
        }
        if let Mutation::DeleteProjectTab { tab_id } = &mutation {
            let key = EntityKey::ProjectTab(tab_id.clone());
            if self.view.contains(&key) && self.view.project_tab_count() <= 1 {
                let _ = reply.send(Err(SyncError::LastTab {
                    tab_id: tab_id.clone(),
                }));
                return;
            }
        }

        let request_id = self.next_request_id();
        let transport = self.transport.clone();
        let done_tx = self.done_tx.clone();
        let backoff = self.config.backoff;
        let max_attempts = self.config.max_attempts.max(1);
        self.structural_in_flight += 1;
        debug!(event = "structural_sent", mutation = mutation.name(), request_id = %request_id);
        tokio::spawn(async move {
            let mut attempt = 1;
            let result = loop {
                let result = transport.send(request_id.clone(), mutation.clone()).await;
                match result {
                    Err(err) if err.is_retryable() && attempt < max_attempts => {
                        tokio::time::sleep(backoff.delay(attempt)).await;
                        attempt += 1;
                    }
                    other => break other,
                }
            };
            let _ = done_tx
                .send(Completion::Structural {
                    mutation,
                    reply,
                    result,
                })
                .await;
        });
    }

    /// Pending and in-flight edits of a deleted entity become no-ops.
    fn drop_edits(&mut self, key: &EntityKey) {
        if let Some(mut edits) = self.edits.remove(key) {
            debug!(
                event = "edits_dropped",
                target = %key.path(),
                fields = edits.protected_fields().len()
            );
            edits.resolve_waiters(Ok(edits.last_seq));
        }
    }

    fn handle_completion(&mut self, done: Completion) {
        match done {
            Completion::Edit {
                key,
                request_id,
                result,
            } => self.edit_completed(key, request_id, result),
            Completion::Structural {
                mutation,
                reply,
                result,
            } => {
                self.structural_in_flight = self.structural_in_flight.saturating_sub(1);
                match result {
                    Ok(ack) => {
                        // Edits of a deleted entity only become no-ops once
                        // the delete is acked; a failed delete keeps them.
                        if let Some(deleted) = mutation.deleted_entity() {
                            self.drop_edits(&deleted);
                        }
                        if ack.seq <= self.view.seq() {
                            let _ = reply.send(Ok(ack));
                        } else {
                            self.seq_waiters.push(SeqWaiter {
                                seq: ack.seq,
                                ack,
                                reply,
                            });
                        }
                    }
                    Err(err) => {
                        warn!(
                            event = "structural_failed",
                            mutation = mutation.name(),
                            code = err.code(),
                            error = %err
                        );
                        let _ = reply.send(Err(err));
                    }
                }
            }
        }
    }

    fn edit_completed(
        &mut self,
        key: EntityKey,
        request_id: String,
        result: Result<Ack, SyncError>,
    ) {
        let max_attempts = self.config.max_attempts.max(1);
        let backoff = self.config.backoff;
        let Some(edits) = self.edits.get_mut(&key) else {
            debug!(event = "edit_result_for_dropped_entity", request_id = %request_id);
            return;
        };
        let Some(in_flight) = edits.in_flight.as_mut() else {
            return;
        };
        if in_flight.request_id != request_id {
            return;
        }

        match result {
            Ok(ack) => {
                edits.in_flight = None;
                edits.last_seq = ack.seq;
                edits.last_error = None;
                if edits.pending.is_empty() {
                    edits.resolve_waiters(Ok(ack.seq));
                    self.edits.remove(&key);
                } else if !edits.waiters.is_empty() {
                    edits.deadline = Some(Instant::now());
                }
            }
            Err(err @ SyncError::StaleTarget { .. }) => {
                warn!(event = "edit_target_gone", target = %key.path(), error = %err);
                self.drop_edits(&key);
            }
            Err(err) if err.is_retryable() && in_flight.attempt < max_attempts => {
                let delay = backoff.delay(in_flight.attempt);
                debug!(
                    event = "edit_retry_scheduled",
                    target = %key.path(),
                    attempt = in_flight.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err
                );
                in_flight.retry_at = Some(Instant::now() + delay);
            }
            Err(err) => {
                warn!(
                    event = "edit_failed",
                    target = %key.path(),
                    code = err.code(),
                    error = %err
                );
                // Back to dirty: the failed fields rejoin the pending set,
                // later edits of the same field win.
                if let Some(failed) = edits.in_flight.take() {
                    let mut pending = failed.partial;
                    pending.extend(std::mem::take(&mut edits.pending));
                    edits.pending = pending;
                }
                // Dirty without a deadline: the next edit, flush, or
                // reconnect tries again.
                edits.deadline = None;
                edits.last_error = Some(err.clone());
                edits.resolve_waiters(Err(err.clone()));
                let _ = self.failures.send(EditFailure { key, error: err });
            }
        }
        self.fire_due(Instant::now());
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Commit(commit) => {
                let protected = self.protected();
                let changed = self.view.apply_commit(&commit, &protected);
                debug!(
                    event = "commit_applied",
                    seq = commit.seq,
                    own = commit.is_from(self.transport.client_id()),
                    changed = changed.len()
                );
                self.after_view_change();
            }
            TransportEvent::Resync(snapshot) => {
                self.resync(snapshot.as_ref().clone());
            }
            TransportEvent::Lagged => match self.transport.snapshot().await {
                Ok(snapshot) => self.resync(snapshot),
                Err(err) => warn!(event = "resync_failed", error = %err),
            },
            TransportEvent::Disconnected => {
                info!(event = "transport_disconnected");
            }
        }
    }

    fn resync(&mut self, snapshot: tabsync_core::StateSnapshot) {
        let protected = self.protected();
        let changed = self.view.replace(snapshot, &protected);
        info!(event = "view_resynced", seq = self.view.seq(), changed = changed.len());
        let gone: Vec<EntityKey> = self
            .edits
            .keys()
            .filter(|key| !self.view.contains(key))
            .cloned()
            .collect();
        for key in gone {
            self.drop_edits(&key);
        }
        // Connectivity is back: retry anything left dirty by a failure and
        // pull scheduled retries forward.
        let now = Instant::now();
        for edits in self.edits.values_mut() {
            match edits.in_flight.as_mut() {
                Some(in_flight) => {
                    if in_flight.retry_at.is_some() {
                        in_flight.retry_at = Some(now);
                    }
                }
                None => {
                    if !edits.pending.is_empty() && edits.deadline.is_none() {
                        edits.deadline = Some(now);
                    }
                }
            }
        }
        self.after_view_change();
    }

    fn after_view_change(&mut self) {
        let seq = self.view.seq();
        let (ready, waiting): (Vec<SeqWaiter>, Vec<SeqWaiter>) =
            std::mem::take(&mut self.seq_waiters)
                .into_iter()
                .partition(|waiter| waiter.seq <= seq);
        self.seq_waiters = waiting;
        for waiter in ready {
            let _ = waiter.reply.send(Ok(waiter.ack));
        }
    }

    fn status(&self, key: &EntityKey) -> EntityStatus {
        let Some(edits) = self.edits.get(key) else {
            return EntityStatus::default();
        };
        let mut fields = BTreeMap::new();
        if let Some(in_flight) = &edits.in_flight {
            for field in in_flight.partial.keys() {
                fields.insert(field.clone(), FieldState::Committing);
            }
        }
        for field in edits.pending.keys() {
            fields.insert(field.clone(), FieldState::Dirty);
        }
        EntityStatus {
            fields,
            last_error: edits.last_error.clone(),
        }
    }

    fn fail_all_waiters(&mut self) {
        for edits in self.edits.values_mut() {
            if !edits.waiters.is_empty() {
                let err = edits.last_error.clone().unwrap_or_else(stopped);
                edits.resolve_waiters(Err(err));
            }
        }
        for waiter in self.seq_waiters.drain(..) {
            let _ = waiter.reply.send(Ok(waiter.ack));
        }
    }
}
