use serde::{Deserialize, Deserializer};
use std::collections::BTreeSet;

pub mod error;
pub mod model;
pub mod mutation;
pub mod observe;
pub mod partial;
pub mod path;
pub mod snapshot;
pub mod store;
pub mod sync_ipc;

pub use error::SyncError;
pub use model::{
    ChatMessage, ChatRole, ChatTabState, EditorType, GlobalState, LinkSettings, ProjectTabState,
    Provider, Settings, TabId, Theme, TicketSort, TicketStatusFilter,
};
pub use mutation::{EntityKey, Mutation};
pub use observe::{ObserverRegistry, Selector, Subscription};
pub use partial::Partial;
pub use path::{Change, Slice, SlicePath};
pub use store::{Commit, Origin, StateSnapshot, StateStore};

fn id_from_value(val: serde_json::Value) -> Option<String> {
    match val {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Ids may arrive as strings or numbers; both are stored as strings.
pub(crate) fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: serde_json::Value = serde_json::Value::deserialize(deserializer)?;
    match val {
        serde_json::Value::Null => Ok(None),
        other => id_from_value(other)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("expected string or number for id")),
    }
}

pub(crate) fn deserialize_id_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let values: Vec<serde_json::Value> = Vec::deserialize(deserializer)?;
    let mut ids = BTreeSet::new();
    for val in values {
        match id_from_value(val) {
            Some(id) => {
                ids.insert(id);
            }
            None => return Err(serde::de::Error::custom("expected string or number for id")),
        }
    }
    Ok(ids)
}
