use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::model::{LinkSettings, TabId};
use crate::partial::{merge_shallow, Partial};
use crate::path::SlicePath;

pub const LINK_FIELDS: [&str; 2] = ["linkedProjectTabId", "linkSettings"];

/// Every state change goes through one of these. Serialized with a `type`
/// discriminator, e.g. `{"type":"update_project_tab","tabId":"p1","partial":{..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Mutation {
    UpdateSettings {
        partial: Partial,
    },
    CreateProjectTab {
        #[serde(default)]
        data: Partial,
    },
    UpdateProjectTab {
        tab_id: TabId,
        partial: Partial,
    },
    DeleteProjectTab {
        tab_id: TabId,
    },
    SetActiveProjectTab {
        tab_id: TabId,
    },
    CreateChatTab {
        #[serde(default)]
        data: Partial,
    },
    UpdateChatTab {
        tab_id: TabId,
        partial: Partial,
    },
    DeleteChatTab {
        tab_id: TabId,
    },
    SetActiveChatTab {
        tab_id: TabId,
    },
    LinkChatTab {
        tab_id: TabId,
        project_tab_id: TabId,
        #[serde(default)]
        settings: Partial,
    },
    UnlinkChatTab {
        tab_id: TabId,
    },
}

/// Entity a field edit belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "tabId", rename_all = "snake_case")]
pub enum EntityKey {
    Settings,
    ProjectTab(TabId),
    ChatTab(TabId),
}

impl EntityKey {
    pub fn path(&self) -> SlicePath {
        match self {
            Self::Settings => SlicePath::Settings,
            Self::ProjectTab(id) => SlicePath::ProjectTab(id.clone()),
            Self::ChatTab(id) => SlicePath::ChatTab(id.clone()),
        }
    }

    pub fn from_path(path: &SlicePath) -> Option<Self> {
        match path {
            SlicePath::Settings => Some(Self::Settings),
            SlicePath::ProjectTab(id) => Some(Self::ProjectTab(id.clone())),
            SlicePath::ChatTab(id) => Some(Self::ChatTab(id.clone())),
            _ => None,
        }
    }

    /// The mutation that writes `partial` onto this entity.
    pub fn update(&self, partial: Partial) -> Mutation {
        match self {
            Self::Settings => Mutation::UpdateSettings { partial },
            Self::ProjectTab(tab_id) => Mutation::UpdateProjectTab {
                tab_id: tab_id.clone(),
                partial,
            },
            Self::ChatTab(tab_id) => Mutation::UpdateChatTab {
                tab_id: tab_id.clone(),
                partial,
            },
        }
    }
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UpdateSettings { .. } => "update_settings",
            Self::CreateProjectTab { .. } => "create_project_tab",
            Self::UpdateProjectTab { .. } => "update_project_tab",
            Self::DeleteProjectTab { .. } => "delete_project_tab",
            Self::SetActiveProjectTab { .. } => "set_active_project_tab",
            Self::CreateChatTab { .. } => "create_chat_tab",
            Self::UpdateChatTab { .. } => "update_chat_tab",
            Self::DeleteChatTab { .. } => "delete_chat_tab",
            Self::SetActiveChatTab { .. } => "set_active_chat_tab",
            Self::LinkChatTab { .. } => "link_chat_tab",
            Self::UnlinkChatTab { .. } => "unlink_chat_tab",
        }
    }

    /// Field updates can be debounced; everything else changes structure
    /// and is sent immediately.
    pub fn is_structural(&self) -> bool {
        !matches!(
            self,
            Self::UpdateSettings { .. } | Self::UpdateProjectTab { .. } | Self::UpdateChatTab { .. }
        )
    }

    /// Entity whose fields this mutation edits, for field updates only.
    pub fn update_target(&self) -> Option<(EntityKey, &Partial)> {
        match self {
            Self::UpdateSettings { partial } => Some((EntityKey::Settings, partial)),
            Self::UpdateProjectTab { tab_id, partial } => {
                Some((EntityKey::ProjectTab(tab_id.clone()), partial))
            }
            Self::UpdateChatTab { tab_id, partial } => {
                Some((EntityKey::ChatTab(tab_id.clone()), partial))
            }
            _ => None,
        }
    }

    /// Entity removed by this mutation, if any.
    pub fn deleted_entity(&self) -> Option<EntityKey> {
        match self {
            Self::DeleteProjectTab { tab_id } => Some(EntityKey::ProjectTab(tab_id.clone())),
            Self::DeleteChatTab { tab_id } => Some(EntityKey::ChatTab(tab_id.clone())),
            _ => None,
        }
    }

    /// Shape checks that need no state. The store repeats these.
    pub fn validate(&self) -> Result<(), SyncError> {
        match self {
            Self::UpdateProjectTab { tab_id, .. }
            | Self::DeleteProjectTab { tab_id }
            | Self::SetActiveProjectTab { tab_id }
            | Self::DeleteChatTab { tab_id }
            | Self::SetActiveChatTab { tab_id }
            | Self::UnlinkChatTab { tab_id } => require_id(tab_id),
            Self::UpdateChatTab { tab_id, partial } => {
                require_id(tab_id)?;
                reject_link_fields(partial)
            }
            Self::CreateChatTab { data } => reject_link_fields(data),
            Self::LinkChatTab {
                tab_id,
                project_tab_id,
                settings,
            } => {
                require_id(tab_id)?;
                require_id(project_tab_id)?;
                parse_link_settings(settings).map(|_| ())
            }
            Self::UpdateSettings { .. } | Self::CreateProjectTab { .. } => Ok(()),
        }
    }
}

/// Missing fields mean "include"; unknown keys are ignored; non-boolean
/// values are rejected.
pub fn parse_link_settings(settings: &Partial) -> Result<LinkSettings, SyncError> {
    let known: Partial = {
        let mut known = settings.clone();
        let defaults = Partial::of(&LinkSettings::default())?;
        known.retain(|key| defaults.contains_key(key));
        known
    };
    if let Some(key) = known
        .keys()
        .find(|key| !known.get(key.as_str()).is_some_and(|value| value.is_boolean()))
    {
        return Err(SyncError::validation(format!(
            "link setting {key} must be a boolean"
        )));
    }
    merge_shallow(&LinkSettings::default(), &known)
}

fn require_id(tab_id: &TabId) -> Result<(), SyncError> {
    if tab_id.as_str().trim().is_empty() {
        return Err(SyncError::validation("tab id cannot be empty"));
    }
    Ok(())
}

fn reject_link_fields(partial: &Partial) -> Result<(), SyncError> {
    match LINK_FIELDS.iter().find(|field| partial.contains_key(field)) {
        Some(field) => Err(SyncError::validation(format!(
            "{field} can only change through link_chat_tab or unlink_chat_tab"
        ))),
        None => Ok(()),
    }
}
