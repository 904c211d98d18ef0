//! Decoded webhook notifications.
//!
//! An [`Event`] is the JSON object a source host posted, plus the few keys
//! normalization fills in so hooks can filter GitHub and GitLab traffic the
//! same way.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{Result, RunnerError};

/// Key the dispatcher overlays with the current commit in per-commit mode.
pub const COMMIT_KEY: &str = "commit";
/// Key the router fills with the hook URL's path parameters.
pub const URL_PARAMS_KEY: &str = "urlparams";

pub type Mapping = Map<String, Value>;

/// Result of looking up a key that filters expect to hold a string.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldLookup<'a> {
    Missing,
    Str(&'a str),
    NotString(&'a Value),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event(Mapping);

impl Event {
    pub fn new(fields: Mapping) -> Self {
        Self(fields)
    }

    /// Decode a request body and normalize host-specific fields.
    ///
    /// `event_header` is the value of `X-Gitlab-Event` or `X-GitHub-Event`,
    /// whichever the request carried.
    pub fn from_payload(body: &[u8], event_header: Option<&str>) -> Result<Self> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| RunnerError::InvalidPayload(e.to_string()))?;
        let Value::Object(fields) = value else {
            return Err(RunnerError::InvalidPayload(format!(
                "expected a JSON object, got {}",
                kind_of(&value)
            )));
        };

        let mut event = Self(fields);
        event.normalize(event_header);
        Ok(event)
    }

    fn normalize(&mut self, event_header: Option<&str>) {
        if !self.0.contains_key("type") {
            let kind = event_header
                .filter(|h| !h.is_empty())
                .map(str::to_owned)
                .or_else(|| {
                    self.0
                        .get("object_kind")
                        .and_then(Value::as_str)
                        .map(str::to_owned)
                });
            if let Some(kind) = kind {
                self.0.insert("type".to_string(), Value::String(kind));
            }
        }

        // GitLab pipeline events nest these under object_attributes.
        let lifted: Vec<(&str, Value)> = match self.0.get("object_attributes") {
            Some(Value::Object(attrs)) => ["status", "ref"]
                .into_iter()
                .filter(|key| !self.0.contains_key(*key))
                .filter_map(|key| attrs.get(key).map(|v| (key, v.clone())))
                .collect(),
            _ => Vec::new(),
        };
        for (key, value) in lifted {
            self.0.insert(key.to_string(), value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn str_field(&self, key: &str) -> FieldLookup<'_> {
        match self.0.get(key) {
            None => FieldLookup::Missing,
            Some(Value::String(s)) => FieldLookup::Str(s),
            Some(other) => FieldLookup::NotString(other),
        }
    }

    /// Commit records carried by push payloads, in payload order.
    ///
    /// GitHub and GitLab both send them as a top-level `commits` array.
    pub fn commits(&self) -> Option<&[Value]> {
        match self.0.get("commits") {
            Some(Value::Array(commits)) => Some(commits.as_slice()),
            _ => None,
        }
    }

    /// View of the whole event with no overlay.
    pub fn view(&self) -> EventView<'_> {
        EventView {
            base: self,
            commit: None,
        }
    }

    /// View of the event with `commit` replaced by the given record.
    pub fn with_commit<'a>(&'a self, commit: &'a Mapping) -> EventView<'a> {
        EventView {
            base: self,
            commit: Some(commit),
        }
    }
}

/// Read-only view of an [`Event`], optionally overriding the `commit` key.
///
/// Templates are rendered against a view so per-commit iterations never
/// write into the shared event.
#[derive(Debug, Clone, Copy)]
pub struct EventView<'a> {
    base: &'a Event,
    commit: Option<&'a Mapping>,
}

impl EventView<'_> {
    /// Owned copy with the overlay applied, for log output.
    pub fn to_value(&self) -> Value {
        let mut fields = self.base.0.clone();
        if let Some(commit) = self.commit {
            fields.insert(COMMIT_KEY.to_string(), Value::Object(commit.clone()));
        }
        Value::Object(fields)
    }
}

impl Serialize for EventView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let base = &self.base.0;
        let len = match self.commit {
            Some(_) if base.contains_key(COMMIT_KEY) => base.len(),
            Some(_) => base.len() + 1,
            None => base.len(),
        };

        let mut map = serializer.serialize_map(Some(len))?;
        for (key, value) in base {
            if self.commit.is_some() && key == COMMIT_KEY {
                continue;
            }
            map.serialize_entry(key, value)?;
        }
        if let Some(commit) = self.commit {
            map.serialize_entry(COMMIT_KEY, commit)?;
        }
        map.end()
    }
}

/// JSON type name of `value`, for log messages.
pub fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
