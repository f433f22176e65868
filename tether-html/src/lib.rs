//! # tether-html
//!
//! Server-side live HTML documents.
//!
//! A [`Node`] tree records every mutation as a patch. The first time a tree is
//! sent it goes out as a full serialization; afterwards only the pending
//! patches are sent. The [`protocol`] module frames both directions of the
//! client connection, and [`DocumentLock`] serializes access to a document
//! between worker threads and the event loop.
//!
//! ## Example
//! ```ignore
//! use tether_html::{tags, Document};
//!
//! let doc = Document::new();
//! let root = tags::div().with_text("0");
//! doc.apply(Some(&root));          // full tree
//! root.set_text("1")?;
//! let update = doc.apply(None);    // one NODES/RESET patch
//! ```

pub mod attributes;
pub mod document;
pub mod error;
pub mod events;
pub mod lock;
pub mod node;
pub mod patch;
pub mod protocol;
pub mod render;
pub mod selector;
pub mod tags;
pub mod value;
pub mod widget_data;

pub use attributes::{AttributeDict, ClassList, IdList, StyleDict, TokenList};
pub use document::{Document, DocumentData};
pub use error::{HtmlError, HtmlResult, LockError, ProtocolError};
pub use events::InputEventKind;
pub use lock::{DocumentLock, LockGuard, LockOwner, LoopTask, WorkerContext};
pub use node::{Child, Node, TextNode};
pub use patch::{NodeId, NodeType, Operation, PatchRecord, PatchType};
pub use protocol::{
    decode_client_message, decode_node, encode_node, encode_server_message, ClientMessage,
    DataType, InputEventPayload, Method, ServerMethod, PROTOCOL_PREFIX, PROTOCOL_VERSION,
};
pub use selector::Selector;
pub use widget_data::{PathKey, WidgetData};
