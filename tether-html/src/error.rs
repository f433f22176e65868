use thiserror::Error;

pub type HtmlResult<T> = Result<T, HtmlError>;

/// Usage errors raised synchronously at the call site of a tree mutation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HtmlError {
    #[error("Invalid attribute value for '{name}': only bool, int, float and string are allowed")]
    InvalidAttributeValue { name: String },

    #[error("Invalid widget data: {reason}")]
    InvalidWidgetData { reason: String },

    #[error("Invalid token '{token}': ids and classes must be non-empty and contain no whitespace")]
    InvalidToken { token: String },

    #[error("Invalid key path {path}: {reason}")]
    InvalidKeyPath { path: String, reason: String },

    #[error("Loop detected: node {node_id} cannot become a descendant of itself")]
    LoopDetected { node_id: u64 },

    #[error("Index {index} out of range for a child list of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Node {node_id} is not a child of node {parent_id}")]
    NotAChild { node_id: u64, parent_id: u64 },

    #[error("Invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("Invalid node encoding: {0}")]
    InvalidEncoding(String),
}

/// Errors produced while decoding wire frames.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// The frame does not carry the protocol prefix; another handler may own it.
    #[error("Not a protocol message")]
    NotAProtocolMessage,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Unknown method {0}")]
    UnknownMethod(i64),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LockError {
    #[error("Blocking lock acquisition is not allowed on the event loop thread")]
    OnEventLoop,
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::InvalidMessage(err.to_string())
    }
}
