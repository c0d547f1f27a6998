use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tabsync_client::{ClientConfig, FieldState, LocalTransport, SyncHandle};
use tabsync_core::model::{DEFAULT_CONTEXT_LIMIT, DEFAULT_PROJECT_TAB_ID};
use tabsync_core::{
    EntityKey, LinkSettings, Mutation, Partial, Slice, SlicePath, StateStore, SyncError, TabId,
};

fn config(client_id: &str) -> ClientConfig {
    ClientConfig {
        session_id: "test".to_string(),
        client_id: client_id.to_string(),
        ..ClientConfig::default()
    }
}

fn default_tab() -> TabId {
    TabId::new(DEFAULT_PROJECT_TAB_ID)
}

fn default_key() -> EntityKey {
    EntityKey::ProjectTab(default_tab())
}

async fn start(store: &Arc<StateStore>, client_id: &str) -> (SyncHandle, Arc<LocalTransport>) {
    let transport = Arc::new(LocalTransport::new(store.clone(), client_id));
    let handle = SyncHandle::start(config(client_id), transport.clone())
        .await
        .expect("start coordinator");
    (handle, transport)
}

fn user_prompt(store: &StateStore) -> String {
    store
        .get_slice(&SlicePath::ProjectTab(default_tab()))
        .as_project_tab()
        .map(|tab| tab.user_prompt.clone())
        .unwrap_or_default()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn ten_quick_edits_become_one_commit() {
    let store = Arc::new(StateStore::new());
    let (handle, _transport) = start(&store, "tab-a").await;

    for i in 0..10 {
        handle
            .edit(default_key(), Partial::new().with("userPrompt", format!("draft {i}")))
            .await
            .expect("edit");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let status = handle.status(default_key()).await.expect("status");
    assert_eq!(status.field("userPrompt"), FieldState::Dirty);
    assert_eq!(store.seq(), 0);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(store.seq(), 1);
    assert_eq!(user_prompt(&store), "draft 9");
    assert!(handle.status(default_key()).await.expect("status").is_clean());
}

#[tokio::test(start_paused = true)]
async fn flush_commits_without_waiting_for_the_timer() {
    let store = Arc::new(StateStore::new());
    let (handle, _transport) = start(&store, "tab-a").await;
    let started = tokio::time::Instant::now();

    handle
        .edit(default_key(), Partial::new().with("userPrompt", "enter pressed"))
        .await
        .expect("edit");
    handle.flush(default_key()).await.expect("flush");

    assert!(started.elapsed() < Duration::from_millis(300));
    assert_eq!(user_prompt(&store), "enter pressed");
}

#[tokio::test(start_paused = true)]
async fn local_dirty_field_beats_a_peer_echo_but_other_fields_merge() {
    let store = Arc::new(StateStore::new());
    let (tab_a, _ta) = start(&store, "tab-a").await;
    let (tab_b, _tb) = start(&store, "tab-b").await;

    tab_a
        .edit(default_key(), Partial::new().with("userPrompt", "from a"))
        .await
        .expect("edit a");
    tab_b
        .dispatch(Mutation::UpdateProjectTab {
            tab_id: default_tab(),
            partial: Partial::new()
                .with("userPrompt", "from b")
                .with("fileSearch", "needle"),
        })
        .await
        .expect("dispatch b");
    settle().await;

    let slice = tab_a
        .slice(SlicePath::ProjectTab(default_tab()))
        .await
        .expect("slice");
    let tab = slice.as_project_tab().expect("tab");
    assert_eq!(tab.user_prompt, "from a");
    assert_eq!(tab.file_search, "needle");

    tab_a.flush(default_key()).await.expect("flush a");
    settle().await;
    assert_eq!(user_prompt(&store), "from a");
    let slice = tab_b
        .slice(SlicePath::ProjectTab(default_tab()))
        .await
        .expect("slice b");
    assert_eq!(slice.as_project_tab().expect("tab").user_prompt, "from a");
}

#[tokio::test(start_paused = true)]
async fn create_then_activate_uses_defaults() {
    let store = Arc::new(StateStore::new());
    let (handle, _transport) = start(&store, "tab-a").await;

    let ack = handle
        .dispatch(Mutation::CreateProjectTab {
            data: Partial::new().with("selectedProjectId", 7),
        })
        .await
        .expect("create");
    let created = ack.created_id.expect("created id");

    let slice = handle
        .slice(SlicePath::ProjectTab(created.clone()))
        .await
        .expect("slice");
    let tab = slice.as_project_tab().expect("tab in view");
    assert_eq!(tab.selected_project_id.as_deref(), Some("7"));
    assert_eq!(tab.context_limit, DEFAULT_CONTEXT_LIMIT);

    handle
        .dispatch(Mutation::SetActiveProjectTab {
            tab_id: created.clone(),
        })
        .await
        .expect("activate");
    assert_eq!(
        handle.slice(SlicePath::ProjectActiveTabId).await.expect("active"),
        Slice::ActiveTab(Some(created))
    );
}

#[tokio::test(start_paused = true)]
async fn deleting_the_only_project_tab_is_rejected_at_dispatch() {
    let store = Arc::new(StateStore::new());
    let (handle, _transport) = start(&store, "tab-a").await;
    let err = handle
        .dispatch(Mutation::DeleteProjectTab {
            tab_id: default_tab(),
        })
        .await
        .expect_err("last tab");
    assert_eq!(err, SyncError::LastTab { tab_id: default_tab() });
    assert_eq!(store.seq(), 0);
}

#[tokio::test(start_paused = true)]
async fn deleting_a_tab_turns_its_pending_edits_into_no_ops() {
    let store = Arc::new(StateStore::new());
    let (handle, _transport) = start(&store, "tab-a").await;
    let mut failures = handle.failures();
    let chat = handle
        .dispatch(Mutation::CreateChatTab {
            data: Partial::new(),
        })
        .await
        .expect("create chat")
        .created_id
        .expect("id");
    let key = EntityKey::ChatTab(chat.clone());

    handle
        .edit(key.clone(), Partial::new().with("input", "half typed"))
        .await
        .expect("edit");
    handle
        .dispatch(Mutation::DeleteChatTab { tab_id: chat })
        .await
        .expect("delete");
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(handle.status(key).await.expect("status").is_clean());
    assert!(failures.try_recv().is_err());
    assert_eq!(
        store.get_slice(&SlicePath::ChatActiveTabId),
        Slice::ActiveTab(None)
    );
}

#[tokio::test(start_paused = true)]
async fn a_failed_delete_keeps_the_tabs_pending_edits() {
    let store = Arc::new(StateStore::new());
    let (handle, transport) = start(&store, "tab-a").await;
    let second = handle
        .dispatch(Mutation::CreateProjectTab {
            data: Partial::new(),
        })
        .await
        .expect("create")
        .created_id
        .expect("id");
    let key = EntityKey::ProjectTab(second.clone());
    let path = SlicePath::ProjectTab(second.clone());
    transport.set_connected(false);

    handle
        .edit(key.clone(), Partial::new().with("userPrompt", "precious"))
        .await
        .expect("edit");
    let err = handle
        .dispatch(Mutation::DeleteProjectTab {
            tab_id: second.clone(),
        })
        .await
        .expect_err("offline delete");
    assert_eq!(err, SyncError::NotConnected);

    let status = handle.status(key.clone()).await.expect("status");
    assert_ne!(status.field("userPrompt"), FieldState::Clean);

    transport.set_connected(true);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let stored = store.get_slice(&path);
    assert_eq!(
        stored.as_project_tab().map(|tab| tab.user_prompt.as_str()),
        Some("precious")
    );
    let viewed = handle.slice(path).await.expect("slice");
    assert_eq!(
        viewed.as_project_tab().map(|tab| tab.user_prompt.as_str()),
        Some("precious")
    );
    assert!(handle.status(key).await.expect("status").is_clean());
}

#[tokio::test(start_paused = true)]
async fn offline_edits_stay_dirty_and_retry_after_reconnect() {
    let store = Arc::new(StateStore::new());
    let (handle, transport) = start(&store, "tab-a").await;
    let mut failures = handle.failures();
    transport.set_connected(false);

    handle
        .edit(default_key(), Partial::new().with("userPrompt", "offline"))
        .await
        .expect("edit");
    let err = handle.flush(default_key()).await.expect_err("offline flush");
    assert_eq!(err, SyncError::NotConnected);

    let status = handle.status(default_key()).await.expect("status");
    assert_eq!(status.field("userPrompt"), FieldState::Dirty);
    assert_eq!(status.last_error, Some(SyncError::NotConnected));
    let failure = failures.try_recv().expect("failure surfaced");
    assert_eq!(failure.key, default_key());
    assert_eq!(store.seq(), 0);

    transport.set_connected(true);
    settle().await;
    assert_eq!(user_prompt(&store), "offline");
    assert!(handle.status(default_key()).await.expect("status").is_clean());
}

#[tokio::test(start_paused = true)]
async fn selectors_follow_local_edits_and_commits() {
    let store = Arc::new(StateStore::new());
    let (handle, _transport) = start(&store, "tab-a").await;
    let selector = handle
        .select(SlicePath::ProjectTab(default_tab()), |slice| {
            slice
                .as_project_tab()
                .map(|tab| tab.selected_files.clone())
                .unwrap_or_default()
        })
        .await
        .expect("select");
    assert!(selector.get().is_empty());

    handle
        .edit(default_key(), Partial::new().with("selectedFiles", json!([1])))
        .await
        .expect("edit");
    assert_eq!(selector.get(), BTreeSet::from(["1".to_string()]));

    handle
        .edit(default_key(), Partial::new().with("selectedFiles", json!([2, 3])))
        .await
        .expect("edit");
    assert_eq!(
        selector.get(),
        BTreeSet::from(["2".to_string(), "3".to_string()])
    );
}

#[tokio::test(start_paused = true)]
async fn linking_fills_missing_settings_and_chat_edits_cannot_relink() {
    let store = Arc::new(StateStore::new());
    let (handle, _transport) = start(&store, "tab-a").await;
    let chat = handle
        .dispatch(Mutation::CreateChatTab {
            data: Partial::new(),
        })
        .await
        .expect("create chat")
        .created_id
        .expect("id");

    handle
        .dispatch(Mutation::LinkChatTab {
            tab_id: chat.clone(),
            project_tab_id: default_tab(),
            settings: Partial::new().with("includePrompts", false),
        })
        .await
        .expect("link");
    let slice = handle
        .slice(SlicePath::ChatTab(chat.clone()))
        .await
        .expect("slice");
    let linked = slice.as_chat_tab().expect("chat");
    assert_eq!(linked.linked_project_tab_id, Some(default_tab()));
    assert_eq!(
        linked.link_settings,
        Some(LinkSettings {
            include_selected_files: true,
            include_prompts: false,
            include_user_prompt: true,
        })
    );

    let err = handle
        .edit(
            EntityKey::ChatTab(chat),
            Partial::new().with("linkedProjectTabId", Option::<String>::None),
        )
        .await
        .expect_err("link fields are off limits");
    assert!(matches!(err, SyncError::Validation(_)));
}

#[tokio::test(start_paused = true)]
async fn stale_edits_are_swallowed() {
    let store = Arc::new(StateStore::new());
    let (handle, _transport) = start(&store, "tab-a").await;
    handle
        .edit(
            EntityKey::ChatTab(TabId::new("never-existed")),
            Partial::new().with("input", "x"),
        )
        .await
        .expect("swallowed");
    assert_eq!(store.seq(), 0);
}
