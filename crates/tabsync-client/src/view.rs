use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tabsync_core::partial::merge_shallow;
use tabsync_core::store::{Commit, StateSnapshot};
use tabsync_core::{Change, EntityKey, ObserverRegistry, Partial, Slice, SlicePath, SyncError};
use tracing::warn;

/// Fields per entity whose local value must survive incoming broadcasts.
pub type Protected = HashMap<EntityKey, BTreeSet<String>>;

/// The client's optimistic copy of the document plus its observers.
pub struct LocalView {
    snapshot: StateSnapshot,
    observers: ObserverRegistry,
}

impl LocalView {
    pub fn new(snapshot: StateSnapshot) -> Self {
        Self {
            snapshot,
            observers: ObserverRegistry::new(),
        }
    }

    pub fn seq(&self) -> u64 {
        self.snapshot.seq
    }

    pub fn snapshot(&self) -> &StateSnapshot {
        &self.snapshot
    }

    pub fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    pub fn slice(&self, path: &SlicePath) -> Slice {
        self.snapshot.slice(path)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        match key {
            EntityKey::Settings => true,
            EntityKey::ProjectTab(id) => self.snapshot.state.project_tabs.contains_key(id),
            EntityKey::ChatTab(id) => self.snapshot.state.chat_tabs.contains_key(id),
        }
    }

    pub fn project_tab_count(&self) -> usize {
        self.snapshot.state.project_tabs.len()
    }

    /// Optimistic edit: merged and validated exactly as the store would,
    /// then observers of that entity are told.
    pub fn apply_local(&mut self, key: &EntityKey, partial: &Partial) -> Result<(), SyncError> {
        let state = &mut self.snapshot.state;
        match key {
            EntityKey::Settings => {
                let merged = merge_shallow(&state.settings, partial)?;
                merged.validate().map_err(SyncError::Validation)?;
                state.settings = merged;
            }
            EntityKey::ProjectTab(id) => {
                let tab = state
                    .project_tabs
                    .get_mut(id)
                    .ok_or_else(|| SyncError::stale(key.path()))?;
                let merged = merge_shallow(&*tab, partial)?;
                merged.validate().map_err(SyncError::Validation)?;
                *tab = merged;
            }
            EntityKey::ChatTab(id) => {
                let tab = state
                    .chat_tabs
                    .get_mut(id)
                    .ok_or_else(|| SyncError::stale(key.path()))?;
                let merged = merge_shallow(&*tab, partial)?;
                merged.validate().map_err(SyncError::Validation)?;
                *tab = merged;
            }
        }
        let path = key.path();
        let slice = self.snapshot.slice(&path);
        self.observers.notify([(&path, &slice)]);
        Ok(())
    }

    /// Apply a committed change set, keeping protected local fields, then
    /// notify each changed path once. Returns the paths that changed.
    pub fn apply_commit(&mut self, commit: &Commit, protected: &Protected) -> Vec<SlicePath> {
        let mut changed = Vec::new();
        for change in &commit.changes {
            let change = self.protect(change, protected);
            if self.snapshot.apply_change(&change) {
                changed.push(change.path);
            }
        }
        self.snapshot.seq = self.snapshot.seq.max(commit.seq);
        self.notify(&changed);
        changed
    }

    /// Swap in a fresh authoritative snapshot, keeping protected local
    /// fields, and notify every path whose value differs.
    pub fn replace(&mut self, mut fresh: StateSnapshot, protected: &Protected) -> Vec<SlicePath> {
        for (key, fields) in protected {
            let path = key.path();
            let local = self.snapshot.slice(&path);
            let incoming = fresh.slice(&path);
            if let Some(kept) = overlay_slice(&incoming, &local, fields) {
                let revision = fresh.revision(&path);
                fresh.apply_change(&Change {
                    path: path.clone(),
                    revision: revision + 1,
                    slice: kept,
                });
                fresh.revisions.insert(path, revision);
            }
        }

        let mut paths: BTreeSet<SlicePath> = [
            SlicePath::Settings,
            SlicePath::ProjectActiveTabId,
            SlicePath::ChatActiveTabId,
            SlicePath::ProjectTabIds,
            SlicePath::ChatTabIds,
        ]
        .into_iter()
        .collect();
        for state in [&self.snapshot.state, &fresh.state] {
            paths.extend(state.project_tabs.keys().cloned().map(SlicePath::ProjectTab));
            paths.extend(state.chat_tabs.keys().cloned().map(SlicePath::ChatTab));
        }
        let changed: Vec<SlicePath> = paths
            .into_iter()
            .filter(|path| self.snapshot.slice(path) != fresh.slice(path))
            .collect();
        self.snapshot = fresh;
        self.notify(&changed);
        changed
    }

    fn protect(&self, change: &Change, protected: &Protected) -> Change {
        let fields = EntityKey::from_path(&change.path).and_then(|key| protected.get(&key));
        let Some(fields) = fields.filter(|fields| !fields.is_empty()) else {
            return change.clone();
        };
        let local = self.snapshot.slice(&change.path);
        match overlay_slice(&change.slice, &local, fields) {
            Some(slice) => Change {
                slice,
                ..change.clone()
            },
            None => change.clone(),
        }
    }

    fn notify(&self, changed: &[SlicePath]) {
        let slices: Vec<(SlicePath, Slice)> = changed
            .iter()
            .map(|path| (path.clone(), self.snapshot.slice(path)))
            .collect();
        self.observers
            .notify(slices.iter().map(|(path, slice)| (path, slice)));
    }
}

/// `incoming` with the listed fields taken from `local`. `None` when there
/// is nothing to keep (entity removed on either side).
fn overlay_slice(incoming: &Slice, local: &Slice, fields: &BTreeSet<String>) -> Option<Slice> {
    match (incoming, local) {
        (Slice::Settings(incoming), Slice::Settings(local)) => {
            overlay(incoming, local, fields).map(Slice::Settings)
        }
        (Slice::ProjectTab(Some(incoming)), Slice::ProjectTab(Some(local))) => {
            overlay(incoming, local, fields).map(|tab| Slice::ProjectTab(Some(tab)))
        }
        (Slice::ChatTab(Some(incoming)), Slice::ChatTab(Some(local))) => {
            overlay(incoming, local, fields).map(|tab| Slice::ChatTab(Some(tab)))
        }
        _ => None,
    }
}

fn overlay<T>(incoming: &T, local: &T, fields: &BTreeSet<String>) -> Option<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut kept = Partial::of(local).ok()?;
    kept.retain(|key| fields.contains(key));
    match merge_shallow(incoming, &kept) {
        Ok(merged) => Some(merged),
        Err(err) => {
            warn!(event = "overlay_failed", error = %err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tabsync_core::model::DEFAULT_PROJECT_TAB_ID;
    use tabsync_core::{Mutation, StateStore, TabId};

    fn default_key() -> EntityKey {
        EntityKey::ProjectTab(TabId::new(DEFAULT_PROJECT_TAB_ID))
    }

    #[test]
    fn protected_fields_survive_a_peer_broadcast() {
        let store = StateStore::new();
        let mut view = LocalView::new(store.snapshot());
        view.apply_local(&default_key(), &Partial::new().with("userPrompt", "mine"))
            .expect("local edit");

        let commit = store
            .apply_mutation(Mutation::UpdateProjectTab {
                tab_id: TabId::new(DEFAULT_PROJECT_TAB_ID),
                partial: Partial::new()
                    .with("userPrompt", "theirs")
                    .with("fileSearch", "peer"),
            })
            .expect("peer commit");

        let mut protected = Protected::new();
        protected.insert(default_key(), BTreeSet::from(["userPrompt".to_string()]));
        let changed = view.apply_commit(&commit, &protected);

        assert_eq!(changed, vec![default_key().path()]);
        let slice = view.slice(&default_key().path());
        let tab = slice.as_project_tab().expect("tab");
        assert_eq!(tab.user_prompt, "mine");
        assert_eq!(tab.file_search, "peer");
        assert_eq!(view.seq(), commit.seq);
    }

    #[test]
    fn observers_fire_once_for_a_multi_change_commit() {
        let store = StateStore::new();
        let mut view = LocalView::new(store.snapshot());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = view
            .observers()
            .subscribe(SlicePath::ProjectActiveTabId, move |slice| {
                sink.lock().expect("sink").push(slice.clone());
            });

        let other = store
            .apply_mutation(Mutation::CreateProjectTab {
                data: Partial::new(),
            })
            .expect("create");
        view.apply_commit(&other, &Protected::new());
        let delete = store
            .apply_mutation(Mutation::DeleteProjectTab {
                tab_id: TabId::new(DEFAULT_PROJECT_TAB_ID),
            })
            .expect("delete");
        view.apply_commit(&delete, &Protected::new());

        let seen = seen.lock().expect("seen");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], Slice::ActiveTab(other.created_id.clone()));
        assert!(view.snapshot().state.check_invariants().is_ok());
    }

    #[test]
    fn replace_reports_only_differing_paths() {
        let store = StateStore::new();
        let mut view = LocalView::new(store.snapshot());
        store
            .apply_mutation(Mutation::UpdateSettings {
                partial: Partial::new().with("theme", "dark"),
            })
            .expect("settings");
        let changed = view.replace(store.snapshot(), &Protected::new());
        assert_eq!(changed, vec![SlicePath::Settings]);
        assert_eq!(view.snapshot(), &store.snapshot());
    }

    #[test]
    fn local_edits_to_missing_tabs_are_stale() {
        let store = StateStore::new();
        let mut view = LocalView::new(store.snapshot());
        let err = view
            .apply_local(
                &EntityKey::ChatTab(TabId::new("gone")),
                &Partial::new().with("input", "x"),
            )
            .expect_err("stale");
        assert!(matches!(err, SyncError::StaleTarget { .. }));
    }
}
