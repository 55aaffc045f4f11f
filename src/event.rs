// src/event.rs
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

const FIELDS: [&str; 2] = ["action", "file"];

/// A file change that is fanned out to every connected viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A file appeared.
    Create(String),
    /// A file went away.
    Delete(String),
}

impl Event {
    /// The file the event refers to.
    pub fn file(&self) -> &str {
        match self {
            Event::Create(file) | Event::Delete(file) => file,
        }
    }

    /// The wire action for this event.
    pub fn action(&self) -> Action {
        match self {
            Event::Create(_) => Action::Create,
            Event::Delete(_) => Action::Delete,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action(), self.file())
    }
}

/// The `action` field of a frame.
///
/// Anything other than `"create"` or `"delete"` decodes into [`Action::Unknown`]
/// carrying the raw value, so unsupported frames stay recognizable instead of
/// failing to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    Create,
    Delete,
    Unknown(String),
}

impl Default for Action {
    fn default() -> Self {
        Action::Unknown(String::new())
    }
}

impl From<String> for Action {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "create" => Action::Create,
            "delete" => Action::Delete,
            _ => Action::Unknown(raw),
        }
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        match action {
            Action::Create => "create".to_string(),
            Action::Delete => "delete".to_string(),
            Action::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => f.write_str("create"),
            Action::Delete => f.write_str("delete"),
            Action::Unknown(raw) => write!(f, "{:?}", raw),
        }
    }
}

/// Wire encoding of one event: `{"action": "create"|"delete", "file": "<path>"}`.
///
/// Field names match case-insensitively, an exact match winning over other
/// spellings. Missing or `null` fields decode as empty strings, a bare `null`
/// decodes as an empty frame, and extra fields are ignored. Anything else that is
/// not a JSON object of this shape fails to decode.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct Frame {
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub file: String,
}

impl Frame {
    /// Decodes a frame from a text or binary message payload.
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        match serde_json::from_slice::<Option<Map<String, Value>>>(payload)? {
            Some(fields) => serde_json::from_value(Value::Object(fold_field_names(fields))),
            None => Ok(Frame::default()),
        }
    }

    /// Encodes the frame as a JSON text payload.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Turns the frame into an [`Event`], handing back the action when it is not supported.
    pub fn into_event(self) -> Result<Event, Action> {
        match self.action {
            Action::Create => Ok(Event::Create(self.file)),
            Action::Delete => Ok(Event::Delete(self.file)),
            unknown @ Action::Unknown(_) => Err(unknown),
        }
    }
}

/// Renames fields to their canonical spelling and drops the ones that are unknown
/// or `null`.
fn fold_field_names(fields: Map<String, Value>) -> Map<String, Value> {
    let mut folded = Map::new();
    let mut exact = Map::new();
    for (name, value) in fields {
        if value.is_null() {
            continue;
        }
        if FIELDS.contains(&name.as_str()) {
            exact.insert(name, value);
        } else if let Some(field) = FIELDS.iter().find(|f| name.eq_ignore_ascii_case(f)) {
            folded.insert(field.to_string(), value);
        }
    }
    folded.extend(exact);
    folded
}

impl From<Event> for Frame {
    fn from(event: Event) -> Self {
        let action = event.action();
        let file = match event {
            Event::Create(file) | Event::Delete(file) => file,
        };
        Frame { action, file }
    }
}
