use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tracing::trace;

use crate::path::{Slice, SlicePath};

type Callback = Box<dyn FnMut(&Slice) + Send>;
type SharedCallback = Arc<Mutex<Callback>>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_path: HashMap<SlicePath, Vec<(u64, SharedCallback)>>,
}

/// Per-slice change callbacks. Notification happens once per path per
/// commit, after every change of that commit has been applied.
#[derive(Clone, Default)]
pub struct ObserverRegistry {
    inner: Arc<Mutex<Registry>>,
}

/// Drop guard returned by [`ObserverRegistry::subscribe`].
pub struct Subscription {
    id: u64,
    path: SlicePath,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn path(&self) -> &SlicePath {
        &self.path
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = lock(&registry);
        if let Some(callbacks) = registry.by_path.get_mut(&self.path) {
            callbacks.retain(|(id, _)| *id != self.id);
            if callbacks.is_empty() {
                registry.by_path.remove(&self.path);
            }
        }
    }
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        path: SlicePath,
        callback: impl FnMut(&Slice) + Send + 'static,
    ) -> Subscription {
        let mut registry = lock(&self.inner);
        registry.next_id += 1;
        let id = registry.next_id;
        let shared: SharedCallback = Arc::new(Mutex::new(Box::new(callback)));
        registry
            .by_path
            .entry(path.clone())
            .or_default()
            .push((id, shared));
        Subscription {
            id,
            path,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self, path: &SlicePath) -> usize {
        lock(&self.inner).by_path.get(path).map_or(0, Vec::len)
    }

    /// Call every observer of each changed path with the path's new value.
    /// The registry lock is released before callbacks run, so callbacks may
    /// subscribe or drop subscriptions.
    pub fn notify<'a>(&self, changed: impl IntoIterator<Item = (&'a SlicePath, &'a Slice)>) {
        let mut seen = Vec::new();
        let mut batch: Vec<(Vec<SharedCallback>, &Slice)> = Vec::new();
        {
            let registry = lock(&self.inner);
            for (path, slice) in changed {
                if seen.contains(&path) {
                    continue;
                }
                seen.push(path);
                if let Some(callbacks) = registry.by_path.get(path) {
                    batch.push((callbacks.iter().map(|(_, cb)| cb.clone()).collect(), slice));
                }
            }
        }
        for (callbacks, slice) in batch {
            for callback in callbacks {
                let mut callback = lock(&callback);
                (*callback)(slice);
            }
        }
        trace!(event = "observers_notified", paths = seen.len());
    }

    /// Derived value that is recomputed only when `path` changes and only
    /// republished when the mapped value differs.
    pub fn select<T, F>(&self, path: SlicePath, current: &Slice, map: F) -> Selector<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&Slice) -> T + Send + 'static,
    {
        let (tx, rx) = watch::channel(map(current));
        let subscription = self.subscribe(path, move |slice| {
            let next = map(slice);
            tx.send_if_modified(|value| {
                if *value == next {
                    false
                } else {
                    *value = next;
                    true
                }
            });
        });
        Selector {
            rx,
            _subscription: subscription,
        }
    }
}

pub struct Selector<T> {
    rx: watch::Receiver<T>,
    _subscription: Subscription,
}

impl<T: Clone> Selector<T> {
    pub fn get(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Resolves once the selected value differs from the last one seen.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    pub fn receiver(&self) -> watch::Receiver<T> {
        self.rx.clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProjectTabState, TabId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tab_slice(prompt: &str, files: &[&str]) -> Slice {
        Slice::ProjectTab(Some(ProjectTabState {
            user_prompt: prompt.to_string(),
            selected_files: files.iter().map(|f| f.to_string()).collect(),
            ..ProjectTabState::default()
        }))
    }

    #[test]
    fn observers_fire_once_per_commit_and_stop_after_unsubscribe() {
        let registry = ObserverRegistry::new();
        let path = SlicePath::ProjectTab(TabId::new("p1"));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let subscription = registry.subscribe(path.clone(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let slice = tab_slice("a", &[]);
        registry.notify([(&path, &slice), (&path, &slice)]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        registry.notify([(&SlicePath::Settings, &slice)]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        subscription.unsubscribe();
        assert_eq!(registry.subscriber_count(&path), 0);
        registry.notify([(&path, &slice)]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn selectors_only_publish_distinct_values() {
        let registry = ObserverRegistry::new();
        let path = SlicePath::ProjectTab(TabId::new("p1"));
        let initial = tab_slice("", &["1"]);
        let selector = registry.select(path.clone(), &initial, |slice| {
            slice
                .as_project_tab()
                .map_or(0, |tab| tab.selected_files.len())
        });
        let mut rx = selector.receiver();
        assert_eq!(selector.get(), 1);

        registry.notify([(&path, &tab_slice("typing", &["1"]))]);
        assert!(!rx.has_changed().expect("open"));

        registry.notify([(&path, &tab_slice("typing", &["1", "2"]))]);
        assert!(rx.has_changed().expect("open"));
        assert_eq!(selector.get(), 2);
    }

    #[test]
    fn callbacks_may_subscribe_while_being_notified() {
        let registry = ObserverRegistry::new();
        let path = SlicePath::Settings;
        let nested = Arc::new(Mutex::new(Vec::new()));
        let inner_registry = registry.clone();
        let keep = nested.clone();
        let _subscription = registry.subscribe(path.clone(), move |_| {
            let sub = inner_registry.subscribe(SlicePath::ChatTabIds, |_| {});
            lock(&keep).push(sub);
        });
        registry.notify([(&path, &Slice::TabIds(Vec::new()))]);
        assert_eq!(registry.subscriber_count(&SlicePath::ChatTabIds), 1);
    }
}
