use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SyncError;

/// A set of top-level field replacements. Field names use the camelCase
/// wire spelling; values replace wholesale (no deep merge).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Partial(Map<String, Value>);

impl Partial {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Result<Self, SyncError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::default()),
            other => Err(SyncError::validation(format!(
                "partial must be an object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Every field of `value`, as a partial that would reproduce it.
    pub fn of<T: Serialize>(value: &T) -> Result<Self, SyncError> {
        let encoded = serde_json::to_value(value)
            .map_err(|err| SyncError::validation(format!("encode failed: {err}")))?;
        Self::from_value(encoded)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Fold a later partial into this one; the later value wins per field.
    pub fn extend(&mut self, later: Partial) {
        for (key, value) in later.0 {
            self.0.insert(key, value);
        }
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.0.retain(|key, _| keep(key));
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Partial {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Input-only short names, as in `{projectId: 7}`. The full name wins when
/// a partial carries both.
const FIELD_ALIASES: &[(&str, &str)] = &[("projectId", "selectedProjectId")];

/// Shallow merge: each key in `partial` replaces the field of the same name.
/// Unknown keys and values of the wrong shape are rejected and leave
/// `current` untouched.
pub fn merge_shallow<T>(current: &T, partial: &Partial) -> Result<T, SyncError>
where
    T: Serialize + DeserializeOwned,
{
    let mut base = match serde_json::to_value(current) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            return Err(SyncError::validation(format!(
                "cannot merge into {}",
                json_kind(&other)
            )))
        }
        Err(err) => return Err(SyncError::validation(format!("encode failed: {err}"))),
    };
    for (key, value) in &partial.0 {
        let field = match FIELD_ALIASES.iter().find(|(alias, _)| *alias == key.as_str()) {
            Some((_, full)) if base.contains_key(*full) => {
                if partial.0.contains_key(*full) {
                    continue;
                }
                *full
            }
            _ => key.as_str(),
        };
        if !base.contains_key(field) {
            return Err(SyncError::validation(format!("unknown field {key}")));
        }
        base.insert(field.to_string(), value.clone());
    }
    serde_json::from_value(Value::Object(base))
        .map_err(|err| SyncError::validation(format!("invalid field value: {err}")))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProjectTabState, Settings, Theme};
    use serde_json::json;
    use std::collections::BTreeSet;

    #[test]
    fn merge_replaces_fields_wholesale() {
        let mut tab = ProjectTabState::default();
        tab.selected_files = BTreeSet::from(["1".to_string()]);
        tab.user_prompt = "keep me".to_string();

        let partial = Partial::new().with("selectedFiles", json!([2, 3]));
        let merged = merge_shallow(&tab, &partial).expect("merge");

        assert_eq!(
            merged.selected_files,
            BTreeSet::from(["2".to_string(), "3".to_string()])
        );
        assert_eq!(merged.user_prompt, "keep me");
    }

    #[test]
    fn merge_rejects_unknown_and_mistyped_fields() {
        let settings = Settings::default();
        let unknown = Partial::new().with("colour", "blue");
        assert!(matches!(
            merge_shallow(&settings, &unknown),
            Err(SyncError::Validation(_))
        ));

        let mistyped = Partial::new().with("theme", 42);
        assert!(matches!(
            merge_shallow(&settings, &mistyped),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn project_id_is_accepted_as_a_short_name() {
        let tab = ProjectTabState::default();
        let short = Partial::new().with("projectId", 7);
        let merged = merge_shallow(&tab, &short).expect("merge");
        assert_eq!(merged.selected_project_id.as_deref(), Some("7"));

        let both = Partial::new()
            .with("projectId", 7)
            .with("selectedProjectId", "9");
        let merged = merge_shallow(&tab, &both).expect("merge");
        assert_eq!(merged.selected_project_id.as_deref(), Some("9"));

        assert!(matches!(
            merge_shallow(&Settings::default(), &short),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn merge_with_empty_partial_is_identity() {
        let settings = Settings {
            theme: Theme::Dark,
            ..Settings::default()
        };
        assert_eq!(merge_shallow(&settings, &Partial::new()), Ok(settings));
    }

    #[test]
    fn later_partials_win_when_extended() {
        let mut first = Partial::new().with("userPrompt", "a").with("fileSearch", "x");
        first.extend(Partial::new().with("userPrompt", "b"));
        assert_eq!(first.get("userPrompt"), Some(&json!("b")));
        assert_eq!(first.get("fileSearch"), Some(&json!("x")));
    }

    #[test]
    fn non_object_partials_are_rejected() {
        assert!(Partial::from_value(json!([1, 2])).is_err());
        assert!(Partial::from_value(Value::Null).expect("null").is_empty());
    }
}
