//! Change-tracked attribute stores attached to a node.
//!
//! Every mutating call validates its input, applies it and appends one
//! [`PatchRecord`] to the store's pending queue. Calls that would not change
//! anything (adding a present class, setting an equal value) record nothing.

use serde_json::{Map, Value};

use crate::error::HtmlResult;
use crate::patch::{NodeId, Operation, PatchQueue, PatchRecord, PatchType};
use crate::value::{check_attribute_value, check_token, scalar_to_string};

/// Ordered set of unique tokens (`IdList`, `ClassList`).
#[derive(Debug, Clone)]
pub struct TokenList {
    node_id: NodeId,
    patch_type: PatchType,
    tokens: Vec<String>,
    patches: PatchQueue,
}

pub type IdList = TokenList;
pub type ClassList = TokenList;

impl TokenList {
    pub fn new(node_id: NodeId, patch_type: PatchType) -> Self {
        Self {
            node_id,
            patch_type,
            tokens: Vec::new(),
            patches: PatchQueue::default(),
        }
    }

    fn record(&mut self, operation: Operation, payload: Vec<Value>) {
        self.patches.push(PatchRecord::new(
            self.node_id,
            self.patch_type,
            operation,
            payload,
        ));
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.tokens.clone()
    }

    /// Returns `false` when the token was already present.
    pub fn add(&mut self, token: &str) -> HtmlResult<bool> {
        check_token(token)?;
        if self.contains(token) {
            return Ok(false);
        }
        self.tokens.push(token.to_string());
        self.record(Operation::Add, vec![Value::from(token)]);
        Ok(true)
    }

    /// Returns `false` when the token was not present.
    pub fn remove(&mut self, token: &str) -> bool {
        let Some(pos) = self.tokens.iter().position(|t| t == token) else {
            return false;
        };
        self.tokens.remove(pos);
        self.record(Operation::Remove, vec![Value::from(token)]);
        true
    }

    /// Returns whether the token is present afterwards.
    pub fn toggle(&mut self, token: &str) -> HtmlResult<bool> {
        if self.remove(token) {
            Ok(false)
        } else {
            self.add(token)?;
            Ok(true)
        }
    }

    /// Replace all tokens. Every token is validated before anything changes.
    pub fn reset<I, S>(&mut self, tokens: I) -> HtmlResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut next: Vec<String> = Vec::new();
        for token in tokens {
            for part in token.as_ref().split_whitespace() {
                check_token(part)?;
                if !next.iter().any(|t| t == part) {
                    next.push(part.to_string());
                }
            }
        }
        if next == self.tokens {
            return Ok(());
        }
        self.tokens = next;
        let payload = Value::Array(self.tokens.iter().cloned().map(Value::from).collect());
        self.record(Operation::Reset, vec![payload]);
        Ok(())
    }

    pub fn clear(&mut self) {
        if self.tokens.is_empty() {
            return;
        }
        self.tokens.clear();
        self.record(Operation::Clear, Vec::new());
    }

    /// Space separated form used in the `id` / `class` HTML attributes.
    pub fn to_attribute_string(&self) -> String {
        self.tokens.join(" ")
    }

    pub fn to_wire(&self) -> Value {
        Value::Array(self.tokens.iter().cloned().map(Value::from).collect())
    }

    pub fn has_patches(&self) -> bool {
        !self.patches.is_empty()
    }

    pub fn take_patches(&mut self) -> Vec<PatchRecord> {
        self.patches.take()
    }

    pub fn clear_patches(&mut self) {
        self.patches.clear();
    }
}

/// Ordered string keyed map shared by `StyleDict` and `AttributeDict`.
#[derive(Debug, Clone)]
struct Dict {
    node_id: NodeId,
    patch_type: PatchType,
    entries: Map<String, Value>,
    patches: PatchQueue,
}

impl Dict {
    fn new(node_id: NodeId, patch_type: PatchType) -> Self {
        Self {
            node_id,
            patch_type,
            entries: Map::new(),
            patches: PatchQueue::default(),
        }
    }

    fn record(&mut self, operation: Operation, payload: Vec<Value>) {
        self.patches.push(PatchRecord::new(
            self.node_id,
            self.patch_type,
            operation,
            payload,
        ));
    }

    fn set(&mut self, name: &str, value: Value) {
        if self.entries.get(name) == Some(&value) {
            return;
        }
        self.entries.insert(name.to_string(), value.clone());
        self.record(Operation::Set, vec![Value::from(name), value]);
    }

    fn remove(&mut self, name: &str) -> Option<Value> {
        let old = self.entries.shift_remove(name)?;
        self.record(Operation::Remove, vec![Value::from(name)]);
        Some(old)
    }

    fn reset(&mut self, entries: Map<String, Value>) {
        if entries == self.entries {
            return;
        }
        self.entries = entries;
        self.record(Operation::Reset, vec![Value::Object(self.entries.clone())]);
    }

    fn clear(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        self.entries.clear();
        self.record(Operation::Clear, Vec::new());
    }
}

/// Inline style declarations, `property -> value`.
#[derive(Debug, Clone)]
pub struct StyleDict {
    inner: Dict,
}

impl StyleDict {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            inner: Dict::new(node_id, PatchType::Style),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner.entries.get(name).and_then(Value::as_str)
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.inner.set(name, Value::String(value.into()));
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.inner.remove(name).map(|v| scalar_to_string(&v))
    }

    pub fn reset<I, K, V>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = entries
            .into_iter()
            .map(|(k, v)| (k.into(), Value::String(v.into())))
            .collect();
        self.inner.reset(map);
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner
            .entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str().unwrap_or_default()))
    }

    /// `color: red; margin: 0` form used in the `style` attribute.
    pub fn to_attribute_string(&self) -> String {
        self.iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn to_wire(&self) -> Value {
        Value::Object(self.inner.entries.clone())
    }

    pub fn has_patches(&self) -> bool {
        !self.inner.patches.is_empty()
    }

    pub fn take_patches(&mut self) -> Vec<PatchRecord> {
        self.inner.patches.take()
    }

    pub fn clear_patches(&mut self) {
        self.inner.patches.clear();
    }
}

/// Generic scalar attributes.
#[derive(Debug, Clone)]
pub struct AttributeDict {
    inner: Dict,
}

impl AttributeDict {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            inner: Dict::new(node_id, PatchType::Attributes),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.inner.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.entries.contains_key(name)
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> HtmlResult<()> {
        let value = value.into();
        check_attribute_value(name, &value)?;
        self.inner.set(name, value);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.inner.remove(name)
    }

    /// Replace every attribute. Values are validated before anything changes.
    pub fn reset<I, K>(&mut self, entries: I) -> HtmlResult<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut map = Map::new();
        for (name, value) in entries {
            let name = name.into();
            check_attribute_value(&name, &value)?;
            map.insert(name, value);
        }
        self.inner.reset(map);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.inner.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn to_wire(&self) -> Value {
        Value::Object(self.inner.entries.clone())
    }

    pub fn has_patches(&self) -> bool {
        !self.inner.patches.is_empty()
    }

    pub fn take_patches(&mut self) -> Vec<PatchRecord> {
        self.inner.patches.take()
    }

    pub fn clear_patches(&mut self) {
        self.inner.patches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HtmlError;
    use serde_json::json;

    #[test]
    fn test_class_add_remove_patches() {
        let mut classes = ClassList::new(NodeId(1), PatchType::ClassList);
        assert!(classes.add("a").unwrap());
        assert!(!classes.add("a").unwrap());
        assert!(classes.remove("a"));
        assert!(!classes.remove("a"));

        let patches = classes.take_patches();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].operation, Operation::Add);
        assert_eq!(patches[1].operation, Operation::Remove);
        assert!(!classes.has_patches());
    }

    #[test]
    fn test_class_reset_splits_and_dedupes() {
        let mut classes = ClassList::new(NodeId(1), PatchType::ClassList);
        classes.reset(["a b", "b", "c"]).unwrap();
        assert_eq!(classes.to_vec(), vec!["a", "b", "c"]);
        assert_eq!(classes.to_attribute_string(), "a b c");
        let patches = classes.take_patches();
        assert_eq!(patches[0].payload, vec![json!(["a", "b", "c"])]);
    }

    #[test]
    fn test_toggle() {
        let mut classes = ClassList::new(NodeId(1), PatchType::ClassList);
        assert!(classes.toggle("x").unwrap());
        assert!(!classes.toggle("x").unwrap());
        assert!(classes.is_empty());
    }

    #[test]
    fn test_invalid_token_leaves_list_untouched() {
        let mut ids = IdList::new(NodeId(1), PatchType::IdList);
        ids.add("keep").unwrap();
        ids.clear_patches();
        assert!(matches!(ids.add("bad token"), Err(HtmlError::InvalidToken { .. })));
        assert!(ids.reset(["ok", ""]).is_ok());
        assert_eq!(ids.to_vec(), vec!["ok"]);
    }

    #[test]
    fn test_style_order_and_string() {
        let mut style = StyleDict::new(NodeId(2));
        style.set("color", "red");
        style.set("margin", "0");
        style.set("color", "red");
        assert_eq!(style.to_attribute_string(), "color: red; margin: 0");
        assert_eq!(style.take_patches().len(), 2);
        assert_eq!(style.remove("color"), Some("red".to_string()));
        assert_eq!(style.to_attribute_string(), "margin: 0");
    }

    #[test]
    fn test_attribute_type_check() {
        let mut attrs = AttributeDict::new(NodeId(3));
        attrs.set("value", 5).unwrap();
        attrs.set("disabled", true).unwrap();
        let err = attrs.set("bad", json!([1, 2])).unwrap_err();
        assert_eq!(
            err,
            HtmlError::InvalidAttributeValue {
                name: "bad".to_string()
            }
        );
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs.take_patches().len(), 2);
    }

    #[test]
    fn test_attribute_reset_and_clear() {
        let mut attrs = AttributeDict::new(NodeId(3));
        attrs
            .reset(vec![("a", json!(1)), ("b", json!("x"))])
            .unwrap();
        attrs.clear();
        attrs.clear();
        let patches = attrs.take_patches();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].operation, Operation::Reset);
        assert_eq!(patches[1].operation, Operation::Clear);
    }
}
