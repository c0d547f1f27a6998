use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::model::{ChatTabState, GlobalState, ProjectTabState, Settings, TabId};
use crate::mutation::{parse_link_settings, Mutation};
use crate::partial::{merge_shallow, Partial};
use crate::path::{Change, Slice, SlicePath};

pub const COMMIT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    pub client_id: String,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Result of one applied mutation. `seq` is contiguous across the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub seq: u64,
    pub mutation: String,
    #[serde(default)]
    pub origin: Option<Origin>,
    #[serde(default)]
    pub created_id: Option<TabId>,
    pub changes: Vec<Change>,
}

impl Commit {
    pub fn is_from(&self, client_id: &str) -> bool {
        self.origin
            .as_ref()
            .is_some_and(|origin| origin.client_id == client_id)
    }
}

/// Point-in-time copy of the whole store, consistent with `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub seq: u64,
    pub state: GlobalState,
    #[serde(default)]
    pub revisions: BTreeMap<SlicePath, u64>,
    #[serde(default)]
    pub project_tab_ids: Vec<TabId>,
    #[serde(default)]
    pub chat_tab_ids: Vec<TabId>,
}

impl StateSnapshot {
    pub fn revision(&self, path: &SlicePath) -> u64 {
        self.revisions.get(path).copied().unwrap_or(0)
    }

    pub fn slice(&self, path: &SlicePath) -> Slice {
        match path {
            SlicePath::Settings => Slice::Settings(self.state.settings.clone()),
            SlicePath::ProjectTab(id) => {
                Slice::ProjectTab(self.state.project_tabs.get(id).cloned())
            }
            SlicePath::ChatTab(id) => Slice::ChatTab(self.state.chat_tabs.get(id).cloned()),
            SlicePath::ProjectActiveTabId => {
                Slice::ActiveTab(self.state.project_active_tab_id.clone())
            }
            SlicePath::ChatActiveTabId => Slice::ActiveTab(self.state.chat_active_tab_id.clone()),
            SlicePath::ProjectTabIds => Slice::TabIds(self.project_tab_ids.clone()),
            SlicePath::ChatTabIds => Slice::TabIds(self.chat_tab_ids.clone()),
        }
    }

    /// Write one committed change into this copy. Returns false when the
    /// change is older than what is already held.
    pub fn apply_change(&mut self, change: &Change) -> bool {
        if change.revision <= self.revision(&change.path) {
            return false;
        }
        let mut removed = false;
        match (&change.path, &change.slice) {
            (SlicePath::Settings, Slice::Settings(settings)) => {
                self.state.settings = settings.clone();
            }
            (SlicePath::ProjectTab(id), Slice::ProjectTab(tab)) => match tab {
                Some(tab) => {
                    self.state.project_tabs.insert(id.clone(), tab.clone());
                }
                None => {
                    self.state.project_tabs.remove(id);
                    removed = true;
                }
            },
            (SlicePath::ChatTab(id), Slice::ChatTab(tab)) => match tab {
                Some(tab) => {
                    self.state.chat_tabs.insert(id.clone(), tab.clone());
                }
                None => {
                    self.state.chat_tabs.remove(id);
                    removed = true;
                }
            },
            (SlicePath::ProjectActiveTabId, Slice::ActiveTab(id)) => {
                self.state.project_active_tab_id = id.clone();
            }
            (SlicePath::ChatActiveTabId, Slice::ActiveTab(id)) => {
                self.state.chat_active_tab_id = id.clone();
            }
            (SlicePath::ProjectTabIds, Slice::TabIds(ids)) => self.project_tab_ids = ids.clone(),
            (SlicePath::ChatTabIds, Slice::TabIds(ids)) => self.chat_tab_ids = ids.clone(),
            (path, _) => {
                warn!(event = "change_shape_mismatch", path = %path);
                return false;
            }
        }
        // A removed tab keeps no revision so a later tab with the same id
        // starts fresh.
        if removed {
            self.revisions.remove(&change.path);
        } else {
            self.revisions.insert(change.path.clone(), change.revision);
        }
        true
    }
}

struct Versioned<T> {
    value: T,
    revision: u64,
}

struct Table<T> {
    tabs: HashMap<TabId, Arc<Mutex<Versioned<T>>>>,
    order: Vec<TabId>,
    active: Option<TabId>,
    active_revision: u64,
    ids_revision: u64,
}

trait Tab: Clone + PartialEq + Serialize + DeserializeOwned {
    const KIND: &'static str;
    fn path(id: &TabId) -> SlicePath;
    fn slice(value: Option<Self>) -> Slice;
    fn ids_path() -> SlicePath;
    fn active_path() -> SlicePath;
    fn seeded(settings: &Settings, ordinal: usize) -> Self;
    fn sort_order(&self) -> i64;
    fn check(&self) -> Result<(), String>;
}

impl Tab for ProjectTabState {
    const KIND: &'static str = "project";

    fn path(id: &TabId) -> SlicePath {
        SlicePath::ProjectTab(id.clone())
    }

    fn slice(value: Option<Self>) -> Slice {
        Slice::ProjectTab(value)
    }

    fn ids_path() -> SlicePath {
        SlicePath::ProjectTabIds
    }

    fn active_path() -> SlicePath {
        SlicePath::ProjectActiveTabId
    }

    fn seeded(_settings: &Settings, ordinal: usize) -> Self {
        Self {
            display_name: format!("Project Tab {}", ordinal + 1),
            sort_order: ordinal as i64,
            ..Self::default()
        }
    }

    fn sort_order(&self) -> i64 {
        self.sort_order
    }

    fn check(&self) -> Result<(), String> {
        self.validate()
    }
}

impl Tab for ChatTabState {
    const KIND: &'static str = "chat";

    fn path(id: &TabId) -> SlicePath {
        SlicePath::ChatTab(id.clone())
    }

    fn slice(value: Option<Self>) -> Slice {
        Slice::ChatTab(value)
    }

    fn ids_path() -> SlicePath {
        SlicePath::ChatTabIds
    }

    fn active_path() -> SlicePath {
        SlicePath::ChatActiveTabId
    }

    fn seeded(settings: &Settings, ordinal: usize) -> Self {
        Self {
            display_name: format!("Chat {}", ordinal + 1),
            model: settings.model.clone(),
            provider: settings.provider,
            sort_order: ordinal as i64,
            ..Self::default()
        }
    }

    fn sort_order(&self) -> i64 {
        self.sort_order
    }

    fn check(&self) -> Result<(), String> {
        self.validate()
    }
}

impl<T: Tab> Table<T> {
    fn from_tabs(tabs: BTreeMap<TabId, T>, active: Option<TabId>) -> Self {
        let order = ordered_ids(&tabs);
        let tabs = tabs
            .into_iter()
            .map(|(id, value)| (id, Arc::new(Mutex::new(Versioned { value, revision: 1 }))))
            .collect();
        Self {
            tabs,
            order,
            active,
            active_revision: 1,
            ids_revision: 1,
        }
    }

    fn entry(&self, id: &TabId) -> Result<&Arc<Mutex<Versioned<T>>>, SyncError> {
        self.tabs.get(id).ok_or_else(|| SyncError::stale(T::path(id)))
    }

    fn ids_change(&self) -> Change {
        Change {
            path: T::ids_path(),
            revision: self.ids_revision,
            slice: Slice::TabIds(self.order.clone()),
        }
    }

    fn active_change(&self) -> Change {
        Change {
            path: T::active_path(),
            revision: self.active_revision,
            slice: Slice::ActiveTab(self.active.clone()),
        }
    }

    /// Lowest sortOrder wins; creation order breaks ties. Only called with
    /// the table write-locked, so entry locks are uncontended.
    fn replacement_active(&self) -> Option<TabId> {
        self.order
            .iter()
            .enumerate()
            .filter_map(|(created, id)| {
                self.tabs
                    .get(id)
                    .map(|entry| (lock(entry).value.sort_order(), created, id))
            })
            .min_by_key(|(sort_order, created, _)| (*sort_order, *created))
            .map(|(_, _, id)| id.clone())
    }

    fn replace_all(
        &mut self,
        tabs: BTreeMap<TabId, T>,
        active: Option<TabId>,
        changes: &mut Vec<Change>,
    ) {
        let old: HashMap<TabId, u64> = self
            .tabs
            .drain()
            .map(|(id, entry)| {
                let revision = lock(&entry).revision;
                (id, revision)
            })
            .collect();
        for (id, revision) in &old {
            if !tabs.contains_key(id) {
                changes.push(Change {
                    path: T::path(id),
                    revision: revision + 1,
                    slice: T::slice(None),
                });
            }
        }
        self.order = ordered_ids(&tabs);
        for (id, value) in tabs {
            let revision = old.get(&id).map_or(1, |revision| revision + 1);
            changes.push(Change {
                path: T::path(&id),
                revision,
                slice: T::slice(Some(value.clone())),
            });
            self.tabs
                .insert(id, Arc::new(Mutex::new(Versioned { value, revision })));
        }
        self.ids_revision += 1;
        changes.push(self.ids_change());
        self.active = active;
        self.active_revision += 1;
        changes.push(self.active_change());
    }
}

fn ordered_ids<T: Tab>(tabs: &BTreeMap<TabId, T>) -> Vec<TabId> {
    let mut ids: Vec<(&TabId, i64)> = tabs.iter().map(|(id, tab)| (id, tab.sort_order())).collect();
    ids.sort_by(|(a_id, a_order), (b_id, b_order)| a_order.cmp(b_order).then(a_id.cmp(b_id)));
    ids.into_iter().map(|(id, _)| id.clone()).collect()
}

/// Authoritative store. Field updates lock only the entity they touch;
/// structural mutations write-lock the affected table.
///
/// Lock order, always: project table, chat table, settings, entities,
/// sequencer.
pub struct StateStore {
    project: RwLock<Table<ProjectTabState>>,
    chat: RwLock<Table<ChatTabState>>,
    settings: Mutex<Versioned<Settings>>,
    sequencer: Mutex<u64>,
    commits: broadcast::Sender<Arc<Commit>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self::from_state(GlobalState::initial())
    }

    /// Build a store from a previously saved document, repairing anything
    /// that breaks the invariants.
    pub fn from_state(mut state: GlobalState) -> Self {
        for fix in state.repair() {
            warn!(event = "state_repaired", fix = %fix);
        }
        let (commits, _) = broadcast::channel(COMMIT_CHANNEL_CAPACITY);
        Self {
            project: RwLock::new(Table::from_tabs(state.project_tabs, state.project_active_tab_id)),
            chat: RwLock::new(Table::from_tabs(state.chat_tabs, state.chat_active_tab_id)),
            settings: Mutex::new(Versioned {
                value: state.settings,
                revision: 1,
            }),
            sequencer: Mutex::new(0),
            commits,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Commit>> {
        self.commits.subscribe()
    }

    pub fn seq(&self) -> u64 {
        *lock(&self.sequencer)
    }

    pub fn apply_mutation(&self, mutation: Mutation) -> Result<Arc<Commit>, SyncError> {
        self.apply(None, mutation)
    }

    pub fn apply_from(&self, origin: Origin, mutation: Mutation) -> Result<Arc<Commit>, SyncError> {
        self.apply(Some(origin), mutation)
    }

    fn apply(&self, origin: Option<Origin>, mutation: Mutation) -> Result<Arc<Commit>, SyncError> {
        let name = mutation.name();
        mutation.validate().inspect_err(|err| log_rejected(name, err))?;
        let result = match mutation {
            Mutation::UpdateSettings { partial } => self.update_settings(origin, &partial),
            Mutation::CreateProjectTab { data } => {
                self.create_tab(&self.project, name, origin, &data)
            }
            Mutation::UpdateProjectTab { tab_id, partial } => {
                self.update_tab(&self.project, name, origin, &tab_id, &partial)
            }
            Mutation::DeleteProjectTab { tab_id } => self.delete_project_tab(origin, &tab_id),
            Mutation::SetActiveProjectTab { tab_id } => {
                self.set_active(&self.project, name, origin, &tab_id)
            }
            Mutation::CreateChatTab { data } => self.create_tab(&self.chat, name, origin, &data),
            Mutation::UpdateChatTab { tab_id, partial } => {
                self.update_tab(&self.chat, name, origin, &tab_id, &partial)
            }
            Mutation::DeleteChatTab { tab_id } => self.delete_chat_tab(origin, &tab_id),
            Mutation::SetActiveChatTab { tab_id } => {
                self.set_active(&self.chat, name, origin, &tab_id)
            }
            Mutation::LinkChatTab {
                tab_id,
                project_tab_id,
                settings,
            } => self.link_chat_tab(origin, &tab_id, &project_tab_id, &settings),
            Mutation::UnlinkChatTab { tab_id } => self.unlink_chat_tab(origin, &tab_id),
        };
        match &result {
            Ok(commit) => debug!(
                event = "mutation_applied",
                mutation = name,
                seq = commit.seq,
                changes = commit.changes.len()
            ),
            Err(err) => log_rejected(name, err),
        }
        result
    }

    fn update_settings(
        &self,
        origin: Option<Origin>,
        partial: &Partial,
    ) -> Result<Arc<Commit>, SyncError> {
        let mut settings = lock(&self.settings);
        let merged = merge_shallow(&settings.value, partial)?;
        merged.validate().map_err(SyncError::Validation)?;
        settings.value = merged;
        settings.revision += 1;
        let change = Change {
            path: SlicePath::Settings,
            revision: settings.revision,
            slice: Slice::Settings(settings.value.clone()),
        };
        Ok(self.publish("update_settings", origin, None, vec![change]))
    }

    fn create_tab<T: Tab>(
        &self,
        table: &RwLock<Table<T>>,
        name: &'static str,
        origin: Option<Origin>,
        data: &Partial,
    ) -> Result<Arc<Commit>, SyncError> {
        let mut table = write(table);
        let seeded = {
            let settings = lock(&self.settings);
            T::seeded(&settings.value, table.order.len())
        };
        let value = merge_shallow(&seeded, data)?;
        value.check().map_err(SyncError::Validation)?;

        let id = TabId::generate();
        let mut changes = vec![Change {
            path: T::path(&id),
            revision: 1,
            slice: T::slice(Some(value.clone())),
        }];
        table
            .tabs
            .insert(id.clone(), Arc::new(Mutex::new(Versioned { value, revision: 1 })));
        table.order.push(id.clone());
        table.ids_revision += 1;
        changes.push(table.ids_change());
        if table.active.is_none() {
            table.active = Some(id.clone());
            table.active_revision += 1;
            changes.push(table.active_change());
        }
        info!(event = "tab_created", kind = T::KIND, tab_id = %id);
        Ok(self.publish(name, origin, Some(id), changes))
    }

    fn update_tab<T: Tab>(
        &self,
        table: &RwLock<Table<T>>,
        name: &'static str,
        origin: Option<Origin>,
        tab_id: &TabId,
        partial: &Partial,
    ) -> Result<Arc<Commit>, SyncError> {
        let table = read(table);
        let mut entry = lock(table.entry(tab_id)?);
        let merged = merge_shallow(&entry.value, partial)?;
        merged.check().map_err(SyncError::Validation)?;
        entry.value = merged;
        entry.revision += 1;
        let change = Change {
            path: T::path(tab_id),
            revision: entry.revision,
            slice: T::slice(Some(entry.value.clone())),
        };
        Ok(self.publish(name, origin, None, vec![change]))
    }

    fn set_active<T: Tab>(
        &self,
        table: &RwLock<Table<T>>,
        name: &'static str,
        origin: Option<Origin>,
        tab_id: &TabId,
    ) -> Result<Arc<Commit>, SyncError> {
        let mut table = write(table);
        table.entry(tab_id)?;
        table.active = Some(tab_id.clone());
        table.active_revision += 1;
        let change = table.active_change();
        Ok(self.publish(name, origin, None, vec![change]))
    }

    /// Removes the entry and fixes up ids and the active pointer. The
    /// caller holds the table write lock.
    fn remove_tab<T: Tab>(table: &mut Table<T>, tab_id: &TabId, changes: &mut Vec<Change>) {
        let Some(entry) = table.tabs.remove(tab_id) else {
            return;
        };
        let revision = lock(&entry).revision + 1;
        changes.push(Change {
            path: T::path(tab_id),
            revision,
            slice: T::slice(None),
        });
        table.order.retain(|id| id != tab_id);
        table.ids_revision += 1;
        changes.push(table.ids_change());
        if table.active.as_ref() == Some(tab_id) {
            table.active = table.replacement_active();
            table.active_revision += 1;
            changes.push(table.active_change());
        }
        info!(event = "tab_deleted", kind = T::KIND, tab_id = %tab_id);
    }

    fn delete_project_tab(
        &self,
        origin: Option<Origin>,
        tab_id: &TabId,
    ) -> Result<Arc<Commit>, SyncError> {
        let mut projects = write(&self.project);
        projects.entry(tab_id)?;
        if projects.tabs.len() == 1 {
            return Err(SyncError::LastTab {
                tab_id: tab_id.clone(),
            });
        }
        let mut changes = Vec::new();
        Self::remove_tab(&mut *projects, tab_id, &mut changes);

        let chats = read(&self.chat);
        for chat_id in &chats.order {
            let Some(entry) = chats.tabs.get(chat_id) else {
                continue;
            };
            let mut entry = lock(entry);
            if entry.value.linked_project_tab_id.as_ref() == Some(tab_id) {
                entry.value.unlink();
                entry.revision += 1;
                changes.push(Change {
                    path: SlicePath::ChatTab(chat_id.clone()),
                    revision: entry.revision,
                    slice: Slice::ChatTab(Some(entry.value.clone())),
                });
                debug!(event = "chat_unlinked", chat_tab_id = %chat_id, project_tab_id = %tab_id);
            }
        }
        Ok(self.publish("delete_project_tab", origin, None, changes))
    }

    fn delete_chat_tab(
        &self,
        origin: Option<Origin>,
        tab_id: &TabId,
    ) -> Result<Arc<Commit>, SyncError> {
        let mut chats = write(&self.chat);
        chats.entry(tab_id)?;
        let mut changes = Vec::new();
        Self::remove_tab(&mut *chats, tab_id, &mut changes);
        Ok(self.publish("delete_chat_tab", origin, None, changes))
    }

    fn link_chat_tab(
        &self,
        origin: Option<Origin>,
        tab_id: &TabId,
        project_tab_id: &TabId,
        settings: &Partial,
    ) -> Result<Arc<Commit>, SyncError> {
        let link_settings = parse_link_settings(settings)?;
        // Holding the project read lock keeps the target alive until publish.
        let projects = read(&self.project);
        projects.entry(project_tab_id)?;
        let chats = read(&self.chat);
        let mut entry = lock(chats.entry(tab_id)?);
        entry.value.linked_project_tab_id = Some(project_tab_id.clone());
        entry.value.link_settings = Some(link_settings);
        entry.revision += 1;
        let change = Change {
            path: SlicePath::ChatTab(tab_id.clone()),
            revision: entry.revision,
            slice: Slice::ChatTab(Some(entry.value.clone())),
        };
        Ok(self.publish("link_chat_tab", origin, None, vec![change]))
    }

    fn unlink_chat_tab(
        &self,
        origin: Option<Origin>,
        tab_id: &TabId,
    ) -> Result<Arc<Commit>, SyncError> {
        let chats = read(&self.chat);
        let mut entry = lock(chats.entry(tab_id)?);
        entry.value.unlink();
        entry.revision += 1;
        let change = Change {
            path: SlicePath::ChatTab(tab_id.clone()),
            revision: entry.revision,
            slice: Slice::ChatTab(Some(entry.value.clone())),
        };
        Ok(self.publish("unlink_chat_tab", origin, None, vec![change]))
    }

    /// Assigns the next seq and fans the commit out. Called with the locks
    /// of every touched entity still held, so per-entity commit order and
    /// broadcast order agree.
    fn publish(
        &self,
        mutation: &str,
        origin: Option<Origin>,
        created_id: Option<TabId>,
        changes: Vec<Change>,
    ) -> Arc<Commit> {
        let mut seq = lock(&self.sequencer);
        *seq += 1;
        let commit = Arc::new(Commit {
            seq: *seq,
            mutation: mutation.to_string(),
            origin,
            created_id,
            changes,
        });
        // No receivers is fine; nobody is listening yet.
        let _ = self.commits.send(commit.clone());
        commit
    }

    pub fn get_slice(&self, path: &SlicePath) -> Slice {
        match path {
            SlicePath::Settings => Slice::Settings(lock(&self.settings).value.clone()),
            SlicePath::ProjectTab(id) => {
                let table = read(&self.project);
                Slice::ProjectTab(table.tabs.get(id).map(|entry| lock(entry).value.clone()))
            }
            SlicePath::ChatTab(id) => {
                let table = read(&self.chat);
                Slice::ChatTab(table.tabs.get(id).map(|entry| lock(entry).value.clone()))
            }
            SlicePath::ProjectActiveTabId => Slice::ActiveTab(read(&self.project).active.clone()),
            SlicePath::ChatActiveTabId => Slice::ActiveTab(read(&self.chat).active.clone()),
            SlicePath::ProjectTabIds => Slice::TabIds(read(&self.project).order.clone()),
            SlicePath::ChatTabIds => Slice::TabIds(read(&self.chat).order.clone()),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let projects = read(&self.project);
        let chats = read(&self.chat);
        let settings = lock(&self.settings);
        let mut revisions = BTreeMap::new();
        let mut state = GlobalState {
            settings: settings.value.clone(),
            project_tabs: BTreeMap::new(),
            chat_tabs: BTreeMap::new(),
            project_active_tab_id: projects.active.clone(),
            chat_active_tab_id: chats.active.clone(),
        };
        revisions.insert(SlicePath::Settings, settings.revision);
        revisions.insert(SlicePath::ProjectActiveTabId, projects.active_revision);
        revisions.insert(SlicePath::ChatActiveTabId, chats.active_revision);
        revisions.insert(SlicePath::ProjectTabIds, projects.ids_revision);
        revisions.insert(SlicePath::ChatTabIds, chats.ids_revision);

        // Entity guards stay held until seq is read.
        let mut held: Vec<MutexGuard<'_, Versioned<ProjectTabState>>> = Vec::new();
        for (id, entry) in &projects.tabs {
            let guard = lock(entry);
            state.project_tabs.insert(id.clone(), guard.value.clone());
            revisions.insert(SlicePath::ProjectTab(id.clone()), guard.revision);
            held.push(guard);
        }
        let mut held_chats: Vec<MutexGuard<'_, Versioned<ChatTabState>>> = Vec::new();
        for (id, entry) in &chats.tabs {
            let guard = lock(entry);
            state.chat_tabs.insert(id.clone(), guard.value.clone());
            revisions.insert(SlicePath::ChatTab(id.clone()), guard.revision);
            held_chats.push(guard);
        }
        let seq = *lock(&self.sequencer);
        StateSnapshot {
            seq,
            state,
            revisions,
            project_tab_ids: projects.order.clone(),
            chat_tab_ids: chats.order.clone(),
        }
    }

    /// Back to the initial document. Emitted as one commit covering every
    /// slice that changed.
    pub fn reset(&self) -> Arc<Commit> {
        info!(event = "store_reset");
        self.replace_state("reset", GlobalState::initial())
    }

    /// Replace the whole document, e.g. from a saved snapshot.
    pub fn restore(&self, state: GlobalState) -> Arc<Commit> {
        info!(
            event = "store_restored",
            project_tabs = state.project_tabs.len(),
            chat_tabs = state.chat_tabs.len()
        );
        self.replace_state("restore", state)
    }

    fn replace_state(&self, name: &str, mut state: GlobalState) -> Arc<Commit> {
        for fix in state.repair() {
            warn!(event = "state_repaired", fix = %fix);
        }
        let mut projects = write(&self.project);
        let mut chats = write(&self.chat);
        let mut settings = lock(&self.settings);
        let mut changes = Vec::new();
        settings.value = state.settings;
        settings.revision += 1;
        changes.push(Change {
            path: SlicePath::Settings,
            revision: settings.revision,
            slice: Slice::Settings(settings.value.clone()),
        });
        projects.replace_all(state.project_tabs, state.project_active_tab_id, &mut changes);
        chats.replace_all(state.chat_tabs, state.chat_active_tab_id, &mut changes);
        self.publish(name, None, None, changes)
    }
}

fn log_rejected(mutation: &str, err: &SyncError) {
    debug!(
        event = "mutation_rejected",
        mutation = mutation,
        code = err.code(),
        error = %err
    );
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
