//! Input events delivered to views and the filters views wait with.

use serde_json::Value;
use tether_html::{InputEventKind, InputEventPayload, Node, NodeId};

/// Kind of pending input slot. `Any` accepts every event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AwaitKind {
    Any,
    Click,
    Change,
    Submit,
    Focus,
    Blur,
}

impl AwaitKind {
    /// The specific slot an event of `kind` resolves, if any.
    pub fn for_event(kind: InputEventKind) -> Option<Self> {
        match kind {
            InputEventKind::Click => Some(AwaitKind::Click),
            InputEventKind::Change => Some(AwaitKind::Change),
            InputEventKind::Submit => Some(AwaitKind::Submit),
            InputEventKind::Focus => Some(AwaitKind::Focus),
            InputEventKind::Blur => Some(AwaitKind::Blur),
            InputEventKind::Reset | InputEventKind::Custom(_) => None,
        }
    }

    pub fn accepts(self, kind: InputEventKind) -> bool {
        self == AwaitKind::Any || AwaitKind::for_event(kind) == Some(self)
    }
}

#[derive(Debug, Clone)]
pub struct InputEvent {
    pub event_id: u64,
    pub kind: InputEventKind,
    pub data: Value,
    pub node_id: NodeId,
    /// The node the event targets, when it is still in the document.
    pub node: Option<Node>,
    pub tag_name: String,
    pub id_list: Vec<String>,
    pub class_list: Vec<String>,
    pub connection_id: String,
    pub window_id: String,
}

impl InputEvent {
    pub fn from_payload(
        payload: InputEventPayload,
        node: Option<Node>,
        connection_id: &str,
        window_id: &str,
    ) -> Self {
        Self {
            event_id: payload.event_id,
            kind: payload.kind,
            data: payload.data,
            node_id: payload.node_id,
            node,
            tag_name: payload.tag_name,
            id_list: payload.id_list.split_whitespace().map(str::to_string).collect(),
            class_list: payload.class_list.split_whitespace().map(str::to_string).collect(),
            connection_id: connection_id.to_string(),
            window_id: window_id.to_string(),
        }
    }

    /// Value of a change event, as sent by the client.
    pub fn value(&self) -> Option<&Value> {
        match &self.data {
            Value::Object(map) => map.get("value"),
            Value::Null => None,
            other => Some(other),
        }
    }
}

/// What an `await_input` call is waiting for.
#[derive(Debug, Clone)]
pub struct InputFilter {
    pub kind: AwaitKind,
    /// Restrict to events on these nodes or their descendants. Empty means any node.
    pub nodes: Vec<Node>,
}

impl InputFilter {
    pub fn new(kind: AwaitKind) -> Self {
        Self {
            kind,
            nodes: Vec::new(),
        }
    }

    pub fn any() -> Self {
        Self::new(AwaitKind::Any)
    }

    pub fn click() -> Self {
        Self::new(AwaitKind::Click)
    }

    pub fn change() -> Self {
        Self::new(AwaitKind::Change)
    }

    pub fn on(mut self, nodes: &[Node]) -> Self {
        self.nodes.extend(nodes.iter().cloned());
        self
    }

    pub fn matches(&self, event: &InputEvent) -> bool {
        if !self.kind.accepts(event.kind) {
            return false;
        }
        if self.nodes.is_empty() {
            return true;
        }
        let Some(target) = &event.node else {
            return false;
        };
        self.nodes
            .iter()
            .any(|n| n == target || target.ancestors().contains(n))
    }
}
