use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::model::{ChatTabState, ProjectTabState, Settings, TabId};

/// Addressable piece of the document. Written as a dotted path on the wire,
/// e.g. `settings` or `projectTabs.<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SlicePath {
    Settings,
    ProjectTab(TabId),
    ChatTab(TabId),
    ProjectActiveTabId,
    ChatActiveTabId,
    ProjectTabIds,
    ChatTabIds,
}

impl fmt::Display for SlicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Settings => f.write_str("settings"),
            Self::ProjectTab(id) => write!(f, "projectTabs.{id}"),
            Self::ChatTab(id) => write!(f, "chatTabs.{id}"),
            Self::ProjectActiveTabId => f.write_str("projectActiveTabId"),
            Self::ChatActiveTabId => f.write_str("chatActiveTabId"),
            Self::ProjectTabIds => f.write_str("projectTabIds"),
            Self::ChatTabIds => f.write_str("chatTabIds"),
        }
    }
}

impl FromStr for SlicePath {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let path = match input {
            "settings" => Self::Settings,
            "projectActiveTabId" => Self::ProjectActiveTabId,
            "chatActiveTabId" => Self::ChatActiveTabId,
            "projectTabIds" => Self::ProjectTabIds,
            "chatTabIds" => Self::ChatTabIds,
            other => match other.split_once('.') {
                Some(("projectTabs", id)) if !id.is_empty() => Self::ProjectTab(TabId::new(id)),
                Some(("chatTabs", id)) if !id.is_empty() => Self::ChatTab(TabId::new(id)),
                _ => return Err(format!("unknown slice path: {other}")),
            },
        };
        Ok(path)
    }
}

impl Serialize for SlicePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SlicePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Value held at a [`SlicePath`]. Removed tabs read as `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Slice {
    Settings(Settings),
    ProjectTab(Option<ProjectTabState>),
    ChatTab(Option<ChatTabState>),
    ActiveTab(Option<TabId>),
    TabIds(Vec<TabId>),
}

impl Slice {
    pub fn as_settings(&self) -> Option<&Settings> {
        match self {
            Self::Settings(settings) => Some(settings),
            _ => None,
        }
    }

    pub fn as_project_tab(&self) -> Option<&ProjectTabState> {
        match self {
            Self::ProjectTab(tab) => tab.as_ref(),
            _ => None,
        }
    }

    pub fn as_chat_tab(&self) -> Option<&ChatTabState> {
        match self {
            Self::ChatTab(tab) => tab.as_ref(),
            _ => None,
        }
    }

    pub fn as_active_tab(&self) -> Option<&TabId> {
        match self {
            Self::ActiveTab(id) => id.as_ref(),
            _ => None,
        }
    }

    pub fn as_tab_ids(&self) -> &[TabId] {
        match self {
            Self::TabIds(ids) => ids,
            _ => &[],
        }
    }
}

/// One slice affected by a commit, carrying its post-commit value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub path: SlicePath,
    pub revision: u64,
    pub slice: Slice,
}
