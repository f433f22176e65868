//! Text frame codec for the live document protocol.
//!
//! Every frame is `PROTOCOL_PREFIX` followed by a JSON array
//! `[window_id, view_runtime_id, method, payload]`.

use serde_json::{Map, Value};

use crate::error::{HtmlError, HtmlResult, ProtocolError};
use crate::events::InputEventKind;
use crate::node::{Child, Node, TextNode};
use crate::patch::{wire_enum, NodeId, NodeType, PatchRecord};

pub const PROTOCOL_PREFIX: &str = "tether:";

/// Bumped whenever a wire tag is renumbered or a payload position moves.
pub const PROTOCOL_VERSION: u32 = 1;

wire_enum! {
    Method {
        View = 101,
        InputEvent = 102,
        Redirect = 103,
        HttpRedirect = 104,
        Data = 105,
        ViewStart = 106,
        ViewStop = 107,
        InputEventAck = 108,
    }
}

wire_enum! {
    /// Kind of content carried by a DATA frame.
    DataType {
        Html = 201,
        HtmlTree = 202,
        HtmlUpdate = 203,
    }
}

const VOID_TAGS: &[&str] = &["area", "br", "col", "hr", "img", "input", "link", "meta", "source"];

/// Document content pushed to a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentData {
    /// Pre-rendered HTML string.
    Html(String),
    /// Full serialization of the root node.
    HtmlTree(Value),
    /// Ordered patch list.
    HtmlUpdate(Vec<Value>),
}

impl DocumentData {
    pub fn from_patches(patches: &[PatchRecord]) -> Self {
        DocumentData::HtmlUpdate(patches.iter().map(PatchRecord::to_wire).collect())
    }

    pub fn data_type(&self) -> DataType {
        match self {
            DocumentData::Html(_) => DataType::Html,
            DocumentData::HtmlTree(_) => DataType::HtmlTree,
            DocumentData::HtmlUpdate(_) => DataType::HtmlUpdate,
        }
    }

    pub fn to_wire(&self) -> Value {
        let content = match self {
            DocumentData::Html(html) => Value::from(html.as_str()),
            DocumentData::HtmlTree(tree) => tree.clone(),
            DocumentData::HtmlUpdate(patches) => Value::Array(patches.clone()),
        };
        Value::Array(vec![Value::from(self.data_type().code()), content])
    }
}

/// Server to client methods and their payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMethod {
    ViewStart,
    ViewStop,
    Data {
        title: Option<String>,
        data: DocumentData,
    },
    Redirect(String),
    HttpRedirect(String),
    InputEventAck(u64),
}

impl ServerMethod {
    pub fn method(&self) -> Method {
        match self {
            ServerMethod::ViewStart => Method::ViewStart,
            ServerMethod::ViewStop => Method::ViewStop,
            ServerMethod::Data { .. } => Method::Data,
            ServerMethod::Redirect(_) => Method::Redirect,
            ServerMethod::HttpRedirect(_) => Method::HttpRedirect,
            ServerMethod::InputEventAck(_) => Method::InputEventAck,
        }
    }

    fn payload(&self) -> Value {
        match self {
            ServerMethod::ViewStart | ServerMethod::ViewStop => Value::Array(Vec::new()),
            ServerMethod::Data { title, data } => Value::Array(vec![
                title.as_deref().map_or(Value::Null, Value::from),
                data.to_wire(),
            ]),
            ServerMethod::Redirect(url) | ServerMethod::HttpRedirect(url) => {
                Value::Array(vec![Value::from(url.as_str())])
            }
            ServerMethod::InputEventAck(event_id) => Value::Array(vec![Value::from(*event_id)]),
        }
    }
}

pub fn encode_server_message(window_id: &str, runtime_id: &str, method: &ServerMethod) -> String {
    let frame = Value::Array(vec![
        Value::from(window_id),
        Value::from(runtime_id),
        Value::from(method.method().code()),
        method.payload(),
    ]);
    format!("{}{}", PROTOCOL_PREFIX, frame)
}

/// A decoded input event exactly as the client reported it.
#[derive(Debug, Clone, PartialEq)]
pub struct InputEventPayload {
    pub event_id: u64,
    pub kind: InputEventKind,
    pub data: Value,
    pub node_id: NodeId,
    pub tag_name: String,
    pub id_list: String,
    pub class_list: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    View {
        window_id: String,
        runtime_id: String,
        url: String,
        post_data: Option<Value>,
    },
    InputEvent {
        window_id: String,
        runtime_id: String,
        event: InputEventPayload,
    },
}

impl ClientMessage {
    pub fn window_id(&self) -> &str {
        match self {
            ClientMessage::View { window_id, .. } | ClientMessage::InputEvent { window_id, .. } => {
                window_id
            }
        }
    }

    pub fn runtime_id(&self) -> &str {
        match self {
            ClientMessage::View { runtime_id, .. }
            | ClientMessage::InputEvent { runtime_id, .. } => runtime_id,
        }
    }
}

fn invalid(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidMessage(reason.into())
}

fn string_at(items: &[Value], index: usize, what: &str) -> Result<String, ProtocolError> {
    match items.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(invalid(format!("{} must be a string", what))),
    }
}

fn int_at(items: &[Value], index: usize, what: &str) -> Result<i64, ProtocolError> {
    items
        .get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| invalid(format!("{} must be an integer", what)))
}

pub fn decode_client_message(frame: &str) -> Result<ClientMessage, ProtocolError> {
    let body = frame
        .strip_prefix(PROTOCOL_PREFIX)
        .ok_or(ProtocolError::NotAProtocolMessage)?;
    let value: Value = serde_json::from_str(body)?;
    let Value::Array(items) = value else {
        return Err(invalid("frame must be an array"));
    };
    if items.len() != 4 {
        return Err(invalid(format!("frame must have 4 items, got {}", items.len())));
    }
    let window_id = string_at(&items, 0, "window_id")?;
    let runtime_id = string_at(&items, 1, "view_runtime_id")?;
    let method = int_at(&items, 2, "method")?;
    let Value::Array(payload) = &items[3] else {
        return Err(invalid("payload must be an array"));
    };

    match Method::from_code(method) {
        Some(Method::View) => {
            if payload.is_empty() || payload.len() > 2 {
                return Err(invalid("VIEW payload must be [url, post_data?]"));
            }
            let url = match &payload[0] {
                Value::String(url) => url.clone(),
                _ => return Err(invalid("url must be a string")),
            };
            let post_data = payload.get(1).filter(|v| !v.is_null()).cloned();
            Ok(ClientMessage::View {
                window_id,
                runtime_id,
                url,
                post_data,
            })
        }
        Some(Method::InputEvent) => {
            if payload.len() != 7 {
                return Err(invalid("INPUT_EVENT payload must have 7 items"));
            }
            let event_id = payload[0]
                .as_u64()
                .ok_or_else(|| invalid("event_id must be a non-negative integer"))?;
            let kind = InputEventKind::from_code(int_at(payload, 1, "event_kind")?);
            let node_id =
                NodeId::from_wire(&payload[3]).ok_or_else(|| invalid("node_id is not a node id"))?;
            let event = InputEventPayload {
                event_id,
                kind,
                data: payload[2].clone(),
                node_id,
                tag_name: string_at(payload, 4, "tag_name")?,
                id_list: string_at(payload, 5, "id_list")?,
                class_list: string_at(payload, 6, "class_list")?,
            };
            Ok(ClientMessage::InputEvent {
                window_id,
                runtime_id,
                event,
            })
        }
        _ => Err(ProtocolError::UnknownMethod(method)),
    }
}

/// Encode a child exactly as a full sync would, without clearing patches.
pub fn encode_node(child: &Child) -> Value {
    child.snapshot()
}

fn bad_encoding(reason: &str) -> HtmlError {
    HtmlError::InvalidEncoding(reason.to_string())
}

fn string_list(value: &Value, what: &str) -> HtmlResult<Vec<String>> {
    let Value::Array(items) = value else {
        return Err(bad_encoding(&format!("{} must be a list", what)));
    };
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| bad_encoding(&format!("{} entries must be strings", what)))
        })
        .collect()
}

fn object<'a>(value: &'a Value, what: &str) -> HtmlResult<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| bad_encoding(&format!("{} must be an object", what)))
}

/// Rebuild a tree from its wire encoding. Every node gets a fresh identity
/// and the result carries no pending patches.
pub fn decode_node(value: &Value) -> HtmlResult<Child> {
    let child = decode_child(value)?;
    if let Child::Node(node) = &child {
        node.clear_subtree_patches();
    }
    Ok(child)
}

fn decode_child(value: &Value) -> HtmlResult<Child> {
    let Value::Array(items) = value else {
        return Err(bad_encoding("node must be an array"));
    };
    let node_type = items
        .first()
        .and_then(Value::as_i64)
        .and_then(NodeType::from_code)
        .ok_or_else(|| bad_encoding("unknown node type"))?;

    match node_type {
        NodeType::TextNode => {
            let text = items
                .get(2)
                .and_then(Value::as_str)
                .ok_or_else(|| bad_encoding("text node needs a string"))?;
            Ok(Child::Text(TextNode::new(text)))
        }
        NodeType::Node | NodeType::Widget => {
            let expected = if node_type == NodeType::Widget { 10 } else { 8 };
            if items.len() != expected {
                return Err(bad_encoding("wrong number of node fields"));
            }
            let tag = items[2]
                .as_str()
                .ok_or_else(|| bad_encoding("tag must be a string"))?;
            let node = if node_type == NodeType::Widget {
                let name = items[8]
                    .as_str()
                    .ok_or_else(|| bad_encoding("widget name must be a string"))?;
                Node::widget(tag, name, items[9].clone())?
            } else if VOID_TAGS.contains(&tag) {
                Node::self_closing(tag)
            } else {
                Node::new(tag)
            };

            node.id_list(|ids| ids.reset(string_list(&items[3], "id_list")?))?;
            node.class_list(|classes| classes.reset(string_list(&items[4], "class_list")?))?;
            let style = object(&items[5], "style")?;
            let mut entries = Vec::with_capacity(style.len());
            for (name, value) in style {
                let value = value
                    .as_str()
                    .ok_or_else(|| bad_encoding("style values must be strings"))?;
                entries.push((name.clone(), value.to_string()));
            }
            node.style(|s| s.reset(entries));
            let attributes = object(&items[6], "attributes")?;
            node.attributes(|a| a.reset(attributes.iter().map(|(k, v)| (k.clone(), v.clone()))))?;

            let Value::Array(children) = &items[7] else {
                return Err(bad_encoding("children must be a list"));
            };
            for child in children {
                node.append(decode_child(child)?)?;
            }
            Ok(Child::Node(node))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_decode_view() {
        let msg = decode_client_message(r#"tether:["w1","",101,["/counter/"]]"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::View {
                window_id: "w1".into(),
                runtime_id: "".into(),
                url: "/counter/".into(),
                post_data: None,
            }
        );
    }

    #[test]
    fn test_decode_input_event() {
        let frame = r#"tether:["w1","rt",102,[7,301,null,"42","BUTTON","","btn primary"]]"#;
        let ClientMessage::InputEvent { event, .. } = decode_client_message(frame).unwrap() else {
            panic!("expected input event");
        };
        assert_eq!(event.event_id, 7);
        assert_eq!(event.kind, InputEventKind::Click);
        assert_eq!(event.node_id, NodeId(42));
        assert_eq!(event.class_list, "btn primary");
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            decode_client_message("hello"),
            Err(ProtocolError::NotAProtocolMessage)
        );
        assert!(matches!(
            decode_client_message("tether:[1,2,3]"),
            Err(ProtocolError::InvalidMessage(_))
        ));
        assert!(matches!(
            decode_client_message("tether:{"),
            Err(ProtocolError::InvalidMessage(_))
        ));
        assert!(matches!(
            decode_client_message(r#"tether:["w","r",102,[1,301]]"#),
            Err(ProtocolError::InvalidMessage(_))
        ));
        assert_eq!(
            decode_client_message(r#"tether:["w","r",199,[]]"#),
            Err(ProtocolError::UnknownMethod(199))
        );
    }

    #[test]
    fn test_encode_server_message() {
        let frame = encode_server_message(
            "w1",
            "rt",
            &ServerMethod::Data {
                title: Some("Counter".into()),
                data: DocumentData::HtmlUpdate(vec![json!(["1", 505, 603])]),
            },
        );
        let body: Value = serde_json::from_str(frame.strip_prefix(PROTOCOL_PREFIX).unwrap()).unwrap();
        assert_eq!(body, json!(["w1", "rt", 105, ["Counter", [203, [["1", 505, 603]]]]]));

        let ack = encode_server_message("w1", "rt", &ServerMethod::InputEventAck(9));
        assert_eq!(ack, r#"tether:["w1","rt",108,[9]]"#);
    }

    #[test]
    fn test_decode_rejects_bad_nodes() {
        assert!(decode_node(&json!([999])).is_err());
        assert!(decode_node(&json!([401, "1", "div"])).is_err());
        assert!(decode_node(&json!([401, "1", "div", [], [], {}, {"x": [1]}, []])).is_err());
    }
}
