//! Patch records and the integer tags they carry on the wire.
//!
//! The tag values are part of the protocol contract (see
//! [`crate::protocol::PROTOCOL_VERSION`]) and must never be renumbered
//! without bumping the version.

use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_STAMP: AtomicU64 = AtomicU64::new(1);

/// Stable numeric identity of a node or text node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Allocate a fresh, process-unique id.
    pub fn next() -> Self {
        NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wire form: decimal string.
    pub fn to_wire(self) -> Value {
        Value::String(self.0.to_string())
    }

    /// Accepts both the string form and a bare integer.
    pub fn from_wire(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => s.parse().ok().map(NodeId),
            Value::Number(n) => n.as_u64().map(NodeId),
            _ => None,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn code(self) -> i64 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            pub fn from_code(code: i64) -> Option<Self> {
                match code {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}
pub(crate) use wire_enum;

wire_enum! {
    /// Which store of a node a patch applies to.
    PatchType {
        IdList = 501,
        ClassList = 502,
        Style = 503,
        Attributes = 504,
        Nodes = 505,
        WidgetData = 506,
    }
}

wire_enum! {
    /// What the patch does to that store.
    Operation {
        Set = 601,
        Reset = 602,
        Clear = 603,
        Insert = 604,
        Remove = 605,
        Add = 606,
    }
}

wire_enum! {
    /// Leading tag of a serialized node.
    NodeType {
        Node = 401,
        TextNode = 402,
        Widget = 403,
    }
}

/// One recorded mutation.
///
/// `stamp` is a process-wide monotonic sequence number; collecting the patches
/// of a subtree sorts by it so deltas replay in creation order.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchRecord {
    pub stamp: u64,
    pub node_id: NodeId,
    pub patch_type: PatchType,
    pub operation: Operation,
    pub payload: Vec<Value>,
}

impl PatchRecord {
    pub fn new(
        node_id: NodeId,
        patch_type: PatchType,
        operation: Operation,
        payload: Vec<Value>,
    ) -> Self {
        Self {
            stamp: NEXT_STAMP.fetch_add(1, Ordering::Relaxed),
            node_id,
            patch_type,
            operation,
            payload,
        }
    }

    /// `[node_id, patch_type, operation, ...payload]`
    pub fn to_wire(&self) -> Value {
        let mut out = Vec::with_capacity(3 + self.payload.len());
        out.push(self.node_id.to_wire());
        out.push(Value::from(self.patch_type.code()));
        out.push(Value::from(self.operation.code()));
        out.extend(self.payload.iter().cloned());
        Value::Array(out)
    }
}

/// Pending-patch queue owned by every store.
#[derive(Debug, Clone, Default)]
pub struct PatchQueue {
    records: Vec<PatchRecord>,
}

impl PatchQueue {
    pub fn push(&mut self, record: PatchRecord) {
        self.records.push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn take(&mut self) -> Vec<PatchRecord> {
        std::mem::take(&mut self.records)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatchRecord> {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_codes_are_stable() {
        assert_eq!(PatchType::IdList.code(), 501);
        assert_eq!(PatchType::WidgetData.code(), 506);
        assert_eq!(Operation::Add.code(), 606);
        assert_eq!(NodeType::TextNode.code(), 402);
        assert_eq!(Operation::from_code(604), Some(Operation::Insert));
        assert_eq!(PatchType::from_code(999), None);
    }

    #[test]
    fn test_stamps_increase() {
        let a = PatchRecord::new(NodeId(1), PatchType::Style, Operation::Clear, vec![]);
        let b = PatchRecord::new(NodeId(1), PatchType::Style, Operation::Clear, vec![]);
        assert!(b.stamp > a.stamp);
    }

    #[test]
    fn test_record_wire_shape() {
        let rec = PatchRecord::new(
            NodeId(7),
            PatchType::ClassList,
            Operation::Add,
            vec![json!("active")],
        );
        assert_eq!(rec.to_wire(), json!(["7", 502, 606, "active"]));
    }

    #[test]
    fn test_node_id_from_wire() {
        assert_eq!(NodeId::from_wire(&json!("12")), Some(NodeId(12)));
        assert_eq!(NodeId::from_wire(&json!(12)), Some(NodeId(12)));
        assert_eq!(NodeId::from_wire(&json!("x")), None);
    }
}
