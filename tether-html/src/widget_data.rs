//! Patchable JSON-like data owned by a widget node.
//!
//! Mutations address a key path from the root of the blob. Patch payloads are
//! `[key_path, ...args]` with `patch_type = WIDGET_DATA`.

use serde_json::{Map, Value};

use crate::error::{HtmlError, HtmlResult};
use crate::patch::{NodeId, Operation, PatchQueue, PatchRecord, PatchType};
use crate::value::check_widget_data;

/// One step of a key path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathKey {
    Key(String),
    Index(usize),
}

impl PathKey {
    fn to_wire(&self) -> Value {
        match self {
            PathKey::Key(k) => Value::from(k.as_str()),
            PathKey::Index(i) => Value::from(*i),
        }
    }
}

impl From<&str> for PathKey {
    fn from(key: &str) -> Self {
        PathKey::Key(key.to_string())
    }
}

impl From<String> for PathKey {
    fn from(key: String) -> Self {
        PathKey::Key(key)
    }
}

impl From<usize> for PathKey {
    fn from(index: usize) -> Self {
        PathKey::Index(index)
    }
}

fn path_to_wire(path: &[PathKey]) -> Value {
    Value::Array(path.iter().map(PathKey::to_wire).collect())
}

fn path_error(path: &[PathKey], reason: &str) -> HtmlError {
    HtmlError::InvalidKeyPath {
        path: path_to_wire(path).to_string(),
        reason: reason.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct WidgetData {
    node_id: NodeId,
    data: Value,
    patches: PatchQueue,
}

impl WidgetData {
    pub fn new(node_id: NodeId, data: Value) -> HtmlResult<Self> {
        check_widget_data(&data)?;
        Ok(Self {
            node_id,
            data,
            patches: PatchQueue::default(),
        })
    }

    pub fn empty(node_id: NodeId) -> Self {
        Self {
            node_id,
            data: Value::Object(Map::new()),
            patches: PatchQueue::default(),
        }
    }

    pub fn get(&self) -> &Value {
        &self.data
    }

    pub fn get_path(&self, path: &[PathKey]) -> Option<&Value> {
        let mut current = &self.data;
        for key in path {
            current = match (key, current) {
                (PathKey::Key(k), Value::Object(map)) => map.get(k)?,
                (PathKey::Index(i), Value::Array(items)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    fn target_mut(&mut self, path: &[PathKey]) -> HtmlResult<&mut Value> {
        let mut current = &mut self.data;
        for key in path {
            current = match (key, current) {
                (PathKey::Key(k), Value::Object(map)) => map
                    .get_mut(k)
                    .ok_or_else(|| path_error(path, "missing key"))?,
                (PathKey::Index(i), Value::Array(items)) => items
                    .get_mut(*i)
                    .ok_or_else(|| path_error(path, "index out of range"))?,
                _ => return Err(path_error(path, "type mismatch")),
            };
        }
        Ok(current)
    }

    fn record(&mut self, operation: Operation, path: &[PathKey], mut args: Vec<Value>) {
        let mut payload = Vec::with_capacity(1 + args.len());
        payload.push(path_to_wire(path));
        payload.append(&mut args);
        self.patches.push(PatchRecord::new(
            self.node_id,
            PatchType::WidgetData,
            operation,
            payload,
        ));
    }

    /// Set `key` inside the object (or index inside the array) at `path`.
    pub fn set(&mut self, path: &[PathKey], key: PathKey, value: Value) -> HtmlResult<()> {
        check_widget_data(&value)?;
        let target = self.target_mut(path)?;
        match (&key, target) {
            (PathKey::Key(k), Value::Object(map)) => {
                map.insert(k.clone(), value.clone());
            }
            (PathKey::Index(i), Value::Array(items)) => {
                let slot = items
                    .get_mut(*i)
                    .ok_or_else(|| path_error(path, "index out of range"))?;
                *slot = value.clone();
            }
            _ => return Err(path_error(path, "type mismatch")),
        }
        self.record(Operation::Set, path, vec![key.to_wire(), value]);
        Ok(())
    }

    /// Insert into the array at `path`.
    pub fn insert(&mut self, path: &[PathKey], index: usize, value: Value) -> HtmlResult<()> {
        check_widget_data(&value)?;
        match self.target_mut(path)? {
            Value::Array(items) if index <= items.len() => items.insert(index, value.clone()),
            Value::Array(_) => return Err(path_error(path, "index out of range")),
            _ => return Err(path_error(path, "not a list")),
        }
        self.record(Operation::Insert, path, vec![Value::from(index), value]);
        Ok(())
    }

    pub fn append(&mut self, path: &[PathKey], value: Value) -> HtmlResult<()> {
        let len = match self.get_path(path) {
            Some(Value::Array(items)) => items.len(),
            _ => return Err(path_error(path, "not a list")),
        };
        self.insert(path, len, value)
    }

    pub fn remove(&mut self, path: &[PathKey], key: PathKey) -> HtmlResult<Value> {
        let removed = match (&key, self.target_mut(path)?) {
            (PathKey::Key(k), Value::Object(map)) => map
                .shift_remove(k)
                .ok_or_else(|| path_error(path, "missing key"))?,
            (PathKey::Index(i), Value::Array(items)) if *i < items.len() => items.remove(*i),
            _ => return Err(path_error(path, "cannot remove")),
        };
        self.record(Operation::Remove, path, vec![key.to_wire()]);
        Ok(removed)
    }

    /// Replace the value at `path`; an empty path replaces the whole blob.
    pub fn reset(&mut self, path: &[PathKey], value: Value) -> HtmlResult<()> {
        check_widget_data(&value)?;
        *self.target_mut(path)? = value.clone();
        self.record(Operation::Reset, path, vec![value]);
        Ok(())
    }

    pub fn clear(&mut self, path: &[PathKey]) -> HtmlResult<()> {
        match self.target_mut(path)? {
            Value::Array(items) => items.clear(),
            Value::Object(map) => map.clear(),
            _ => return Err(path_error(path, "not a container")),
        }
        self.record(Operation::Clear, path, Vec::new());
        Ok(())
    }

    pub fn to_wire(&self) -> Value {
        self.data.clone()
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data() -> WidgetData {
        WidgetData::new(NodeId(9), json!({"labels": ["a", "b"], "options": {"x": 1}})).unwrap()
    }

    #[test]
    fn test_set_nested() {
        let mut d = data();
        d.set(&["options".into()], "y".into(), json!(2)).unwrap();
        assert_eq!(d.get_path(&["options".into(), "y".into()]), Some(&json!(2)));
        let patch = &d.take_patches()[0];
        assert_eq!(patch.payload, vec![json!(["options"]), json!("y"), json!(2)]);
    }

    #[test]
    fn test_list_ops() {
        let mut d = data();
        d.append(&["labels".into()], json!("c")).unwrap();
        d.insert(&["labels".into()], 0, json!("z")).unwrap();
        assert_eq!(d.get_path(&["labels".into()]), Some(&json!(["z", "a", "b", "c"])));
        assert_eq!(d.remove(&["labels".into()], 1.into()).unwrap(), json!("a"));
        d.clear(&["labels".into()]).unwrap();
        assert_eq!(d.get_path(&["labels".into()]), Some(&json!([])));
        assert_eq!(d.take_patches().len(), 4);
    }

    #[test]
    fn test_bad_path() {
        let mut d = data();
        assert!(matches!(
            d.set(&["missing".into()], "k".into(), json!(1)),
            Err(HtmlError::InvalidKeyPath { .. })
        ));
        assert!(d.insert(&["options".into()], 0, json!(1)).is_err());
        assert!(!d.has_patches());
    }

    #[test]
    fn test_reset_root() {
        let mut d = data();
        d.reset(&[], json!([1, 2])).unwrap();
        assert_eq!(d.get(), &json!([1, 2]));
    }
}
