use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use url::Url;
use uuid::Uuid;

use crate::{deserialize_id_set, deserialize_opt_id};

pub type FileId = String;
pub type PromptId = String;
pub type MessageId = String;
pub type ProjectId = String;
pub type TicketId = String;

pub const DEFAULT_PROJECT_TAB_ID: &str = "defaultTab";
pub const DEFAULT_PROJECT_TAB_NAME: &str = "Default Project Tab";
pub const DEFAULT_CONTEXT_LIMIT: u32 = 128_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(String);

impl TabId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TabId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TabId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    #[default]
    Openrouter,
    Openai,
    AzureOpenai,
    Anthropic,
    Ollama,
    Lmstudio,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Openrouter => "openrouter",
            Self::Openai => "openai",
            Self::AzureOpenai => "azure_openai",
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
            Self::Lmstudio => "lmstudio",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "openrouter" => Ok(Self::Openrouter),
            "openai" => Ok(Self::Openai),
            "azure_openai" | "azure-openai" | "azure" => Ok(Self::AzureOpenai),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            "lmstudio" | "lm_studio" => Ok(Self::Lmstudio),
            other => Err(format!("Unknown provider: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EditorType {
    #[default]
    Vscode,
    Cursor,
    Webstorm,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TicketSort {
    #[default]
    CreatedDesc,
    CreatedAsc,
    Status,
    Priority,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatusFilter {
    #[default]
    All,
    Open,
    InProgress,
    Closed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// User preferences. Only ever changed through a shallow partial merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub language: String,
    pub theme: Theme,
    pub code_theme_light: String,
    pub code_theme_dark: String,
    pub ollama_global_url: String,
    pub lm_studio_global_url: String,
    pub summarization_ignore_patterns: Vec<String>,
    pub summarization_allow_patterns: Vec<String>,
    pub summarization_enabled_project_ids: Vec<ProjectId>,
    pub use_spacebar_to_select_autocomplete: bool,
    pub hide_informational_tooltips: bool,
    pub auto_scroll_enabled: bool,
    pub provider: Provider,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            theme: Theme::Light,
            code_theme_light: "atomOneLight".to_string(),
            code_theme_dark: "atomOneDark".to_string(),
            ollama_global_url: "http://localhost:11434".to_string(),
            lm_studio_global_url: "http://localhost:1234".to_string(),
            summarization_ignore_patterns: Vec::new(),
            summarization_allow_patterns: Vec::new(),
            summarization_enabled_project_ids: Vec::new(),
            use_spacebar_to_select_autocomplete: true,
            hide_informational_tooltips: false,
            auto_scroll_enabled: true,
            provider: Provider::Openrouter,
            model: "gpt-4o".to_string(),
            temperature: 0.7,
            max_tokens: 4096,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), String> {
        if self.language.trim().is_empty() {
            return Err("language cannot be empty".to_string());
        }
        validate_http_url("ollamaGlobalUrl", &self.ollama_global_url)?;
        validate_http_url("lmStudioGlobalUrl", &self.lm_studio_global_url)?;
        check_range("temperature", self.temperature, 0.0, 2.0)?;
        check_range("topP", self.top_p, 0.0, 1.0)?;
        check_range("frequencyPenalty", self.frequency_penalty, -2.0, 2.0)?;
        check_range("presencePenalty", self.presence_penalty, -2.0, 2.0)?;
        if self.max_tokens < 100 {
            return Err(format!("maxTokens must be >= 100, got {}", self.max_tokens));
        }
        Ok(())
    }
}

fn validate_http_url(field: &str, value: &str) -> Result<(), String> {
    let parsed = Url::parse(value).map_err(|err| format!("{field} is not a valid url: {err}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("{field} must use http or https, got {other}")),
    }
}

fn check_range(field: &str, value: f64, min: f64, max: f64) -> Result<(), String> {
    if value.is_nan() || value < min || value > max {
        return Err(format!("{field} must be within {min}..={max}, got {value}"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectTabState {
    #[serde(alias = "projectId", deserialize_with = "deserialize_opt_id")]
    pub selected_project_id: Option<ProjectId>,
    #[serde(deserialize_with = "deserialize_opt_id")]
    pub edit_project_id: Option<ProjectId>,
    pub prompt_dialog_open: bool,
    #[serde(deserialize_with = "deserialize_opt_id")]
    pub edit_prompt_id: Option<PromptId>,
    pub file_search: String,
    #[serde(deserialize_with = "deserialize_id_set")]
    pub selected_files: BTreeSet<FileId>,
    #[serde(deserialize_with = "deserialize_id_set")]
    pub selected_prompts: BTreeSet<PromptId>,
    pub user_prompt: String,
    pub search_by_content: bool,
    pub display_name: String,
    pub context_limit: u32,
    pub resolve_imports: bool,
    pub preferred_editor: EditorType,
    #[serde(deserialize_with = "deserialize_id_set")]
    pub suggested_file_ids: BTreeSet<FileId>,
    pub bookmarked_file_groups: BTreeMap<String, Vec<FileId>>,
    pub ticket_search: String,
    pub ticket_sort: TicketSort,
    pub ticket_status_filter: TicketStatusFilter,
    #[serde(deserialize_with = "deserialize_opt_id")]
    pub ticket_id: Option<TicketId>,
    pub sort_order: i64,
}

impl Default for ProjectTabState {
    fn default() -> Self {
        Self {
            selected_project_id: None,
            edit_project_id: None,
            prompt_dialog_open: false,
            edit_prompt_id: None,
            file_search: String::new(),
            selected_files: BTreeSet::new(),
            selected_prompts: BTreeSet::new(),
            user_prompt: String::new(),
            search_by_content: false,
            display_name: String::new(),
            context_limit: DEFAULT_CONTEXT_LIMIT,
            resolve_imports: false,
            preferred_editor: EditorType::Vscode,
            suggested_file_ids: BTreeSet::new(),
            bookmarked_file_groups: BTreeMap::new(),
            ticket_search: String::new(),
            ticket_sort: TicketSort::CreatedDesc,
            ticket_status_filter: TicketStatusFilter::All,
            ticket_id: None,
            sort_order: 0,
        }
    }
}

impl ProjectTabState {
    pub fn validate(&self) -> Result<(), String> {
        if self.context_limit == 0 {
            return Err("contextLimit must be > 0".to_string());
        }
        if self.bookmarked_file_groups.keys().any(|name| name.trim().is_empty()) {
            return Err("bookmarkedFileGroups names cannot be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: ChatRole,
    pub content: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// What a linked chat pulls from its project tab. A missing field means
/// "include", so the default is maximal context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSettings {
    #[serde(default = "default_true")]
    pub include_selected_files: bool,
    #[serde(default = "default_true")]
    pub include_prompts: bool,
    #[serde(default = "default_true")]
    pub include_user_prompt: bool,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            include_selected_files: true,
            include_prompts: true,
            include_user_prompt: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatTabState {
    pub display_name: String,
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub provider: Provider,
    pub input: String,
    #[serde(deserialize_with = "deserialize_id_set")]
    pub excluded_message_ids: BTreeSet<MessageId>,
    pub linked_project_tab_id: Option<TabId>,
    pub link_settings: Option<LinkSettings>,
    pub sort_order: i64,
}

impl Default for ChatTabState {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            display_name: String::new(),
            messages: Vec::new(),
            model: settings.model,
            provider: settings.provider,
            input: String::new(),
            excluded_message_ids: BTreeSet::new(),
            linked_project_tab_id: None,
            link_settings: None,
            sort_order: 0,
        }
    }
}

impl ChatTabState {
    pub fn is_linked(&self) -> bool {
        self.linked_project_tab_id.is_some()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.linked_project_tab_id.is_some() != self.link_settings.is_some() {
            return Err(
                "linkSettings must be present exactly when linkedProjectTabId is set".to_string(),
            );
        }
        let mut seen = BTreeSet::new();
        for message in &self.messages {
            if message.id.trim().is_empty() {
                return Err("chat message ids cannot be empty".to_string());
            }
            if !seen.insert(message.id.as_str()) {
                return Err(format!("duplicate chat message id {}", message.id));
            }
        }
        Ok(())
    }

    pub fn unlink(&mut self) {
        self.linked_project_tab_id = None;
        self.link_settings = None;
    }
}

/// The whole synchronized document. This is also the persisted snapshot
/// layout: one JSON object keyed by these field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalState {
    pub settings: Settings,
    pub project_tabs: BTreeMap<TabId, ProjectTabState>,
    pub chat_tabs: BTreeMap<TabId, ChatTabState>,
    pub project_active_tab_id: Option<TabId>,
    pub chat_active_tab_id: Option<TabId>,
}

impl Default for GlobalState {
    fn default() -> Self {
        Self::initial()
    }
}

impl GlobalState {
    pub fn initial() -> Self {
        let default_id = TabId::new(DEFAULT_PROJECT_TAB_ID);
        let mut project_tabs = BTreeMap::new();
        project_tabs.insert(
            default_id.clone(),
            ProjectTabState {
                display_name: DEFAULT_PROJECT_TAB_NAME.to_string(),
                ..ProjectTabState::default()
            },
        );
        Self {
            settings: Settings::default(),
            project_tabs,
            chat_tabs: BTreeMap::new(),
            project_active_tab_id: Some(default_id),
            chat_active_tab_id: None,
        }
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        check_active("projectActiveTabId", &self.project_active_tab_id, &self.project_tabs)?;
        check_active("chatActiveTabId", &self.chat_active_tab_id, &self.chat_tabs)?;
        if self.project_tabs.is_empty() {
            return Err("at least one project tab must exist".to_string());
        }
        for (tab_id, chat) in &self.chat_tabs {
            chat.validate().map_err(|err| format!("chat tab {tab_id}: {err}"))?;
        }
        Ok(())
    }

    /// Bring a loaded document back within the invariants. Returns a short
    /// description of every fix applied.
    pub fn repair(&mut self) -> Vec<String> {
        let mut fixes = Vec::new();
        if self.project_tabs.is_empty() {
            let initial = Self::initial();
            self.project_tabs = initial.project_tabs;
            fixes.push("restored default project tab".to_string());
        }
        if !active_is_valid(&self.project_active_tab_id, &self.project_tabs) {
            self.project_active_tab_id = first_by_sort_order(
                self.project_tabs.iter().map(|(id, tab)| (id, tab.sort_order)),
            );
            fixes.push("reset projectActiveTabId".to_string());
        }
        if !active_is_valid(&self.chat_active_tab_id, &self.chat_tabs) {
            self.chat_active_tab_id =
                first_by_sort_order(self.chat_tabs.iter().map(|(id, tab)| (id, tab.sort_order)));
            fixes.push("reset chatActiveTabId".to_string());
        }
        for (tab_id, chat) in self.chat_tabs.iter_mut() {
            let dangling = chat
                .linked_project_tab_id
                .as_ref()
                .is_some_and(|linked| !self.project_tabs.contains_key(linked));
            if dangling || chat.linked_project_tab_id.is_some() != chat.link_settings.is_some() {
                chat.unlink();
                fixes.push(format!("unlinked chat tab {tab_id}"));
            }
        }
        fixes
    }
}

fn active_is_valid<T>(active: &Option<TabId>, tabs: &BTreeMap<TabId, T>) -> bool {
    match active {
        Some(id) => tabs.contains_key(id),
        None => tabs.is_empty(),
    }
}

fn check_active<T>(
    field: &str,
    active: &Option<TabId>,
    tabs: &BTreeMap<TabId, T>,
) -> Result<(), String> {
    if active_is_valid(active, tabs) {
        Ok(())
    } else {
        Err(format!("{field} does not reference an existing tab"))
    }
}

fn first_by_sort_order<'a>(tabs: impl Iterator<Item = (&'a TabId, i64)>) -> Option<TabId> {
    tabs.min_by(|(a_id, a_order), (b_id, b_order)| a_order.cmp(b_order).then(a_id.cmp(b_id)))
        .map(|(id, _)| id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn initial_state_has_one_active_default_tab() {
        let state = GlobalState::initial();
        assert_eq!(state.project_tabs.len(), 1);
        assert_eq!(
            state.project_active_tab_id,
            Some(TabId::new(DEFAULT_PROJECT_TAB_ID))
        );
        assert!(state.chat_tabs.is_empty());
        assert!(state.chat_active_tab_id.is_none());
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn project_tab_accepts_numeric_ids() {
        let tab: ProjectTabState = serde_json::from_value(json!({
            "selectedProjectId": 7,
            "selectedFiles": [1, "2", 3]
        }))
        .expect("parse tab");
        assert_eq!(tab.selected_project_id.as_deref(), Some("7"));
        assert_eq!(
            tab.selected_files,
            BTreeSet::from(["1".to_string(), "2".to_string(), "3".to_string()])
        );
        assert_eq!(tab.context_limit, DEFAULT_CONTEXT_LIMIT);
    }

    #[test]
    fn settings_validation_rejects_out_of_range_values() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_ok());
        settings.temperature = 2.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.ollama_global_url = "not a url".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.max_tokens = 10;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn link_settings_missing_fields_default_to_true() {
        let parsed: LinkSettings =
            serde_json::from_value(json!({"includePrompts": false})).expect("parse link");
        assert_eq!(
            parsed,
            LinkSettings {
                include_selected_files: true,
                include_prompts: false,
                include_user_prompt: true,
            }
        );
    }

    #[test]
    fn repair_fixes_dangling_pointers_and_half_links() {
        let mut state = GlobalState::initial();
        state.project_active_tab_id = Some(TabId::new("gone"));
        state.chat_tabs.insert(
            TabId::new("c1"),
            ChatTabState {
                linked_project_tab_id: Some(TabId::new("missing")),
                link_settings: Some(LinkSettings::default()),
                ..ChatTabState::default()
            },
        );
        state.chat_tabs.insert(
            TabId::new("c2"),
            ChatTabState {
                link_settings: Some(LinkSettings::default()),
                ..ChatTabState::default()
            },
        );

        let fixes = state.repair();
        assert!(!fixes.is_empty());
        assert!(state.check_invariants().is_ok());
        assert_eq!(
            state.project_active_tab_id,
            Some(TabId::new(DEFAULT_PROJECT_TAB_ID))
        );
        assert_eq!(state.chat_active_tab_id, Some(TabId::new("c1")));
        assert!(state.chat_tabs.values().all(|chat| !chat.is_linked()));
        assert!(state.chat_tabs.values().all(|chat| chat.link_settings.is_none()));
    }

    #[test]
    fn snapshot_document_uses_top_level_field_names() {
        let value = serde_json::to_value(GlobalState::initial()).expect("encode");
        let object = value.as_object().expect("object");
        for key in [
            "settings",
            "projectTabs",
            "chatTabs",
            "projectActiveTabId",
            "chatActiveTabId",
        ] {
            assert!(object.contains_key(key), "missing {key}");
        }
    }
}
