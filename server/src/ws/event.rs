use serde_json::Value;

/// Kind of task mutation carried by a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    Toggled,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
            EventKind::Toggled => "toggled",
        }
    }
}

/// Immutable notification envelope handed to the registry for fan-out.
/// Wire form: `{"type":"<kind>","data":<payload>}`.
#[derive(Debug, Clone)]
pub struct Event {
    kind: EventKind,
    data: Value,
}

impl Event {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Event { kind, data }
    }

    /// Serialize to wire text. Called once per fan-out; recipients share the
    /// resulting buffer.
    pub fn to_wire(&self) -> String {
        serde_json::json!({
            "type": self.kind.as_str(),
            "data": self.data,
        })
        .to_string()
    }
}
