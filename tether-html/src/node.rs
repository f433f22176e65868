//! The node tree: `Node`, widgets and `TextNode`.
//!
//! A `Node` is a cheap handle; clones refer to the same element. Each node
//! keeps its state behind its own mutex, and no code path holds two node
//! mutexes at the same time: structural operations read what they need, drop
//! the guard, then touch the next node. Multi-step sequences that must not
//! interleave with the event loop go through the document lock
//! ([`crate::lock::DocumentLock`]).

use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::attributes::{AttributeDict, ClassList, IdList, StyleDict};
use crate::error::{HtmlError, HtmlResult};
use crate::events::{format_events, parse_events, InputEventKind, EVENTS_ATTRIBUTE};
use crate::lock::{DocumentLock, LockGuard};
use crate::patch::{NodeId, NodeType, Operation, PatchQueue, PatchRecord, PatchType};
use crate::widget_data::WidgetData;

struct NodeCell {
    id: NodeId,
    tag: String,
    self_closing: bool,
    widget: Option<String>,
    state: Mutex<NodeState>,
}

struct NodeState {
    parent: Weak<NodeCell>,
    ids: IdList,
    classes: ClassList,
    style: StyleDict,
    attributes: AttributeDict,
    children: Vec<Child>,
    nodes_patches: PatchQueue,
    widget_data: Option<WidgetData>,
    /// Lock of the document this node is attached to.
    document: Option<DocumentLock>,
}

impl NodeState {
    fn has_own_patches(&self) -> bool {
        self.ids.has_patches()
            || self.classes.has_patches()
            || self.style.has_patches()
            || self.attributes.has_patches()
            || !self.nodes_patches.is_empty()
            || self.widget_data.as_ref().is_some_and(WidgetData::has_patches)
    }

    fn take_own_patches(&mut self, out: &mut Vec<PatchRecord>) {
        out.extend(self.ids.take_patches());
        out.extend(self.classes.take_patches());
        out.extend(self.style.take_patches());
        out.extend(self.attributes.take_patches());
        out.extend(self.nodes_patches.take());
        if let Some(data) = self.widget_data.as_mut() {
            out.extend(data.take_patches());
        }
    }

    fn clear_own_patches(&mut self) {
        self.ids.clear_patches();
        self.classes.clear_patches();
        self.style.clear_patches();
        self.attributes.clear_patches();
        self.nodes_patches.clear();
        if let Some(data) = self.widget_data.as_mut() {
            data.clear_patches();
        }
    }
}

/// An element node (optionally a widget).
#[derive(Clone)]
pub struct Node {
    cell: Arc<NodeCell>,
}

struct TextCell {
    id: NodeId,
    text: String,
    parent: Mutex<Weak<NodeCell>>,
}

/// Immutable text leaf.
#[derive(Clone)]
pub struct TextNode {
    cell: Arc<TextCell>,
}

/// Anything that can sit in a child list.
#[derive(Clone, Debug)]
pub enum Child {
    Node(Node),
    Text(TextNode),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TextNode {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            cell: Arc::new(TextCell {
                id: NodeId::next(),
                text: text.into(),
                parent: Mutex::new(Weak::new()),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.cell.id
    }

    pub fn text(&self) -> &str {
        &self.cell.text
    }

    pub fn parent(&self) -> Option<Node> {
        lock(&self.cell.parent).upgrade().map(|cell| Node { cell })
    }

    pub fn to_wire(&self) -> Value {
        Value::Array(vec![
            Value::from(NodeType::TextNode.code()),
            self.id().to_wire(),
            Value::from(self.text()),
        ])
    }
}

impl fmt::Debug for TextNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TextNode({}, {:?})", self.cell.id, self.cell.text)
    }
}

impl PartialEq for TextNode {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Child {
    pub fn id(&self) -> NodeId {
        match self {
            Child::Node(n) => n.id(),
            Child::Text(t) => t.id(),
        }
    }

    pub fn parent(&self) -> Option<Node> {
        match self {
            Child::Node(n) => n.parent(),
            Child::Text(t) => t.parent(),
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Child::Node(n) => Some(n),
            Child::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&TextNode> {
        match self {
            Child::Text(t) => Some(t),
            Child::Node(_) => None,
        }
    }

    fn set_parent(&self, parent: Weak<NodeCell>) {
        match self {
            Child::Node(n) => n.state().parent = parent,
            Child::Text(t) => *lock(&t.cell.parent) = parent,
        }
    }

    /// Make `parent` the parent and inherit its document.
    fn attach_to(&self, parent: &Node) {
        self.set_parent(parent.weak());
        if let Child::Node(n) = self {
            n.set_document(parent.document_lock());
        }
    }

    /// Clear the parent and the document link.
    fn release(&self) {
        self.set_parent(Weak::new());
        if let Child::Node(n) = self {
            n.set_document(None);
        }
    }

    fn serialize_with(&self, clear: bool) -> Value {
        match self {
            Child::Node(n) => n.serialize_with(clear),
            Child::Text(t) => t.to_wire(),
        }
    }

    /// Full serialization; clears the pending patches of every visited node.
    pub fn serialize(&self) -> Value {
        match self {
            Child::Node(n) => n.serialize(),
            Child::Text(t) => t.to_wire(),
        }
    }

    pub fn snapshot(&self) -> Value {
        match self {
            Child::Node(n) => n.snapshot(),
            Child::Text(t) => t.to_wire(),
        }
    }

    fn text_content(&self, out: &mut String) {
        match self {
            Child::Node(n) => n.text_content(out),
            Child::Text(t) => out.push_str(t.text()),
        }
    }
}

impl PartialEq for Child {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Child::Node(a), Child::Node(b)) => a == b,
            (Child::Text(a), Child::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl From<Node> for Child {
    fn from(node: Node) -> Self {
        Child::Node(node)
    }
}

impl From<&Node> for Child {
    fn from(node: &Node) -> Self {
        Child::Node(node.clone())
    }
}

impl From<TextNode> for Child {
    fn from(text: TextNode) -> Self {
        Child::Text(text)
    }
}

impl From<&str> for Child {
    fn from(text: &str) -> Self {
        Child::Text(TextNode::new(text))
    }
}

impl From<String> for Child {
    fn from(text: String) -> Self {
        Child::Text(TextNode::new(text))
    }
}

impl Node {
    fn build(
        id: NodeId,
        tag: &str,
        self_closing: bool,
        widget: Option<String>,
        data: Option<WidgetData>,
    ) -> Self {
        let state = NodeState {
            parent: Weak::new(),
            ids: IdList::new(id, PatchType::IdList),
            classes: ClassList::new(id, PatchType::ClassList),
            style: StyleDict::new(id),
            attributes: AttributeDict::new(id),
            children: Vec::new(),
            nodes_patches: PatchQueue::default(),
            widget_data: data,
            document: None,
        };
        Self {
            cell: Arc::new(NodeCell {
                id,
                tag: tag.to_string(),
                self_closing,
                widget,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn new(tag: &str) -> Self {
        Self::build(NodeId::next(), tag, false, None, None)
    }

    pub fn self_closing(tag: &str) -> Self {
        Self::build(NodeId::next(), tag, true, None, None)
    }

    /// A node rendered by the named client-side widget behavior.
    pub fn widget(tag: &str, name: &str, data: Value) -> HtmlResult<Self> {
        let id = NodeId::next();
        let data = WidgetData::new(id, data)?;
        Ok(Self::build(id, tag, false, Some(name.to_string()), Some(data)))
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        lock(&self.cell.state)
    }

    fn weak(&self) -> Weak<NodeCell> {
        Arc::downgrade(&self.cell)
    }

    pub fn id(&self) -> NodeId {
        self.cell.id
    }

    pub fn tag(&self) -> &str {
        &self.cell.tag
    }

    pub fn is_self_closing(&self) -> bool {
        self.cell.self_closing
    }

    pub fn widget_name(&self) -> Option<&str> {
        self.cell.widget.as_deref()
    }

    pub fn is_widget(&self) -> bool {
        self.cell.widget.is_some()
    }

    pub fn parent(&self) -> Option<Node> {
        self.state().parent.upgrade().map(|cell| Node { cell })
    }

    /// Parent, grandparent, ... up to the root.
    pub fn ancestors(&self) -> Vec<Node> {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(node) = current {
            current = node.parent();
            out.push(node);
        }
        out
    }

    pub fn root(&self) -> Node {
        self.ancestors().pop().unwrap_or_else(|| self.clone())
    }

    /// Lock of the document this subtree is attached to, if any.
    pub(crate) fn document_lock(&self) -> Option<DocumentLock> {
        self.state().document.clone()
    }

    /// Link this subtree to a document, or unlink it with `None`.
    pub(crate) fn set_document(&self, document: Option<DocumentLock>) {
        let children = {
            let mut state = self.state();
            state.document = document.clone();
            state.children.clone()
        };
        for child in children.iter().filter_map(Child::as_node) {
            child.set_document(document.clone());
        }
    }

    /// Held for the duration of a helper call, before any node mutex.
    fn implicit_lock(&self) -> Option<LockGuard> {
        let document = self.document_lock()?;
        document.lock_implicit()
    }

    // --- store access ---

    pub fn id_list<R>(&self, f: impl FnOnce(&mut IdList) -> R) -> R {
        let _doc = self.implicit_lock();
        f(&mut self.state().ids)
    }

    pub fn class_list<R>(&self, f: impl FnOnce(&mut ClassList) -> R) -> R {
        let _doc = self.implicit_lock();
        f(&mut self.state().classes)
    }

    pub fn style<R>(&self, f: impl FnOnce(&mut StyleDict) -> R) -> R {
        let _doc = self.implicit_lock();
        f(&mut self.state().style)
    }

    pub fn attributes<R>(&self, f: impl FnOnce(&mut AttributeDict) -> R) -> R {
        let _doc = self.implicit_lock();
        f(&mut self.state().attributes)
    }

    /// `None` when this node is not a widget.
    pub fn widget_data<R>(&self, f: impl FnOnce(&mut WidgetData) -> R) -> Option<R> {
        let _doc = self.implicit_lock();
        self.state().widget_data.as_mut().map(f)
    }

    pub fn ids(&self) -> Vec<String> {
        self.state().ids.to_vec()
    }

    pub fn add_id(&self, id: &str) -> HtmlResult<bool> {
        self.id_list(|ids| ids.add(id))
    }

    pub fn has_id(&self, id: &str) -> bool {
        self.state().ids.contains(id)
    }

    pub fn classes(&self) -> Vec<String> {
        self.state().classes.to_vec()
    }

    pub fn add_class(&self, class: &str) -> HtmlResult<bool> {
        self.class_list(|classes| classes.add(class))
    }

    pub fn remove_class(&self, class: &str) -> bool {
        self.class_list(|classes| classes.remove(class))
    }

    pub fn toggle_class(&self, class: &str) -> HtmlResult<bool> {
        self.class_list(|classes| classes.toggle(class))
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.state().classes.contains(class)
    }

    pub fn set_style(&self, name: &str, value: impl Into<String>) {
        self.style(|style| style.set(name, value));
    }

    pub fn get_style(&self, name: &str) -> Option<String> {
        self.state().style.get(name).map(str::to_string)
    }

    /// Set an attribute. `id`, `class` and `style` are routed to their stores.
    pub fn set_attribute(&self, name: &str, value: impl Into<Value>) -> HtmlResult<()> {
        let _doc = self.implicit_lock();
        let value = value.into();
        match name {
            "id" | "class" => {
                crate::value::check_attribute_value(name, &value)?;
                let raw = crate::value::scalar_to_string(&value);
                let mut state = self.state();
                let list = if name == "id" {
                    &mut state.ids
                } else {
                    &mut state.classes
                };
                list.reset(raw.split_whitespace())
            }
            "style" => {
                crate::value::check_attribute_value(name, &value)?;
                let raw = crate::value::scalar_to_string(&value);
                let entries = parse_style(&raw);
                self.state().style.reset(entries);
                Ok(())
            }
            _ => self.state().attributes.set(name, value),
        }
    }

    pub fn get_attribute(&self, name: &str) -> Option<Value> {
        let state = self.state();
        match name {
            "id" if !state.ids.is_empty() => Some(Value::from(state.ids.to_attribute_string())),
            "class" if !state.classes.is_empty() => {
                Some(Value::from(state.classes.to_attribute_string()))
            }
            "style" if !state.style.is_empty() => {
                Some(Value::from(state.style.to_attribute_string()))
            }
            "id" | "class" | "style" => None,
            _ => state.attributes.get(name).cloned(),
        }
    }

    pub fn remove_attribute(&self, name: &str) -> Option<Value> {
        let _doc = self.implicit_lock();
        let old = self.get_attribute(name);
        let mut state = self.state();
        match name {
            "id" => state.ids.clear(),
            "class" => state.classes.clear(),
            "style" => state.style.clear(),
            _ => return state.attributes.remove(name),
        }
        old
    }

    // --- event subscriptions ---

    pub fn events(&self) -> Vec<InputEventKind> {
        self.state()
            .attributes
            .get(EVENTS_ATTRIBUTE)
            .and_then(Value::as_str)
            .map(parse_events)
            .unwrap_or_default()
    }

    pub fn add_event(&self, kind: InputEventKind) -> HtmlResult<()> {
        let _doc = self.implicit_lock();
        let mut events = self.events();
        if events.contains(&kind) {
            return Ok(());
        }
        events.push(kind);
        self.state()
            .attributes
            .set(EVENTS_ATTRIBUTE, format_events(&events))
    }

    pub fn remove_event(&self, kind: InputEventKind) -> HtmlResult<()> {
        let _doc = self.implicit_lock();
        let mut events = self.events();
        let before = events.len();
        events.retain(|e| *e != kind);
        if events.len() == before {
            return Ok(());
        }
        let mut state = self.state();
        if events.is_empty() {
            state.attributes.remove(EVENTS_ATTRIBUTE);
            Ok(())
        } else {
            state.attributes.set(EVENTS_ATTRIBUTE, format_events(&events))
        }
    }

    // --- children ---

    pub fn children(&self) -> Vec<Child> {
        self.state().children.clone()
    }

    pub fn child_count(&self) -> usize {
        self.state().children.len()
    }

    pub fn child_nodes(&self) -> Vec<Node> {
        self.state()
            .children
            .iter()
            .filter_map(|c| c.as_node().cloned())
            .collect()
    }

    pub fn index_of(&self, child: &Child) -> Option<usize> {
        let id = child.id();
        self.state().children.iter().position(|c| c.id() == id)
    }

    /// True when `candidate` is this node or one of its ancestors.
    fn is_self_or_ancestor(&self, candidate: &Node) -> bool {
        let mut current = Some(self.clone());
        while let Some(node) = current {
            if node == *candidate {
                return true;
            }
            current = node.parent();
        }
        false
    }

    fn check_loop(&self, child: &Child) -> HtmlResult<()> {
        if let Child::Node(node) = child {
            if self.is_self_or_ancestor(node) {
                return Err(HtmlError::LoopDetected {
                    node_id: node.id().0,
                });
            }
        }
        Ok(())
    }

    /// Length of the child list once `child` has been detached from us.
    fn len_without(&self, child: &Child) -> usize {
        let state = self.state();
        let id = child.id();
        let present = state.children.iter().any(|c| c.id() == id);
        state.children.len() - usize::from(present)
    }

    /// Detach `child` from its current parent (possibly `self`) and make it ours.
    /// Returns the full serialization used as the patch payload.
    fn adopt(&self, child: &Child) -> Value {
        if let Some(old) = child.parent() {
            old.forget_child(child.id());
        }
        child.attach_to(self);
        // The payload is a full serialization, which subsumes pending deltas.
        child.serialize()
    }

    fn forget_child(&self, id: NodeId) {
        let mut state = self.state();
        if let Some(pos) = state.children.iter().position(|c| c.id() == id) {
            state.children.remove(pos);
            state.nodes_patches.push(PatchRecord::new(
                self.id(),
                PatchType::Nodes,
                Operation::Remove,
                vec![id.to_wire()],
            ));
        }
    }

    fn record_nodes(state: &mut NodeState, node_id: NodeId, operation: Operation, payload: Vec<Value>) {
        state.nodes_patches.push(PatchRecord::new(
            node_id,
            PatchType::Nodes,
            operation,
            payload,
        ));
    }

    pub fn insert(&self, index: usize, child: impl Into<Child>) -> HtmlResult<()> {
        let _doc = self.implicit_lock();
        let child = child.into();
        self.check_loop(&child)?;
        let len = self.len_without(&child);
        if index > len {
            return Err(HtmlError::IndexOutOfRange { index, len });
        }
        let payload = self.adopt(&child);
        let mut state = self.state();
        let index = index.min(state.children.len());
        state.children.insert(index, child);
        Self::record_nodes(&mut state, self.id(), Operation::Insert, vec![Value::from(index), payload]);
        Ok(())
    }

    pub fn append(&self, child: impl Into<Child>) -> HtmlResult<()> {
        let _doc = self.implicit_lock();
        let child = child.into();
        self.check_loop(&child)?;
        self.append_checked(child);
        Ok(())
    }

    fn append_checked(&self, child: Child) {
        let _doc = self.implicit_lock();
        let payload = self.adopt(&child);
        let mut state = self.state();
        let index = state.children.len();
        state.children.push(child);
        Self::record_nodes(&mut state, self.id(), Operation::Insert, vec![Value::from(index), payload]);
    }

    pub fn extend<I, C>(&self, children: I) -> HtmlResult<()>
    where
        I: IntoIterator<Item = C>,
        C: Into<Child>,
    {
        children.into_iter().try_for_each(|c| self.append(c))
    }

    /// Replace the child at `index`.
    pub fn set_child(&self, index: usize, child: impl Into<Child>) -> HtmlResult<()> {
        let _doc = self.implicit_lock();
        let child = child.into();
        self.check_loop(&child)?;
        let len = self.len_without(&child);
        if index >= len {
            return Err(HtmlError::IndexOutOfRange { index, len });
        }
        if self.state().children.get(index) == Some(&child) {
            return Ok(());
        }
        let payload = self.adopt(&child);
        let replaced = {
            let mut state = self.state();
            let index = index.min(state.children.len().saturating_sub(1));
            let replaced = std::mem::replace(&mut state.children[index], child);
            Self::record_nodes(&mut state, self.id(), Operation::Set, vec![Value::from(index), payload]);
            replaced
        };
        replaced.release();
        Ok(())
    }

    pub fn remove(&self, child: &Child) -> HtmlResult<()> {
        let _doc = self.implicit_lock();
        let id = child.id();
        let removed = {
            let mut state = self.state();
            let pos = state
                .children
                .iter()
                .position(|c| c.id() == id)
                .ok_or(HtmlError::NotAChild {
                    node_id: id.0,
                    parent_id: self.id().0,
                })?;
            let removed = state.children.remove(pos);
            Self::record_nodes(&mut state, self.id(), Operation::Remove, vec![id.to_wire()]);
            removed
        };
        removed.release();
        Ok(())
    }

    /// Remove and return the child at `index`.
    pub fn remove_at(&self, index: usize) -> HtmlResult<Child> {
        let _doc = self.implicit_lock();
        let removed = {
            let mut state = self.state();
            let len = state.children.len();
            if index >= len {
                return Err(HtmlError::IndexOutOfRange { index, len });
            }
            let removed = state.children.remove(index);
            let id = removed.id();
            Self::record_nodes(&mut state, self.id(), Operation::Remove, vec![id.to_wire()]);
            removed
        };
        removed.release();
        Ok(removed)
    }

    pub fn clear_children(&self) {
        let _doc = self.implicit_lock();
        let removed = {
            let mut state = self.state();
            if state.children.is_empty() {
                return;
            }
            let removed = std::mem::take(&mut state.children);
            Self::record_nodes(&mut state, self.id(), Operation::Clear, Vec::new());
            removed
        };
        for child in removed {
            child.release();
        }
    }

    /// Replace the whole child list with one RESET patch.
    pub fn set_children<I, C>(&self, children: I) -> HtmlResult<()>
    where
        I: IntoIterator<Item = C>,
        C: Into<Child>,
    {
        let _doc = self.implicit_lock();
        let mut next: Vec<Child> = Vec::new();
        for child in children {
            let child = child.into();
            if next.iter().any(|c| c.id() == child.id()) {
                continue;
            }
            self.check_loop(&child)?;
            next.push(child);
        }
        let keep: Vec<NodeId> = next.iter().map(Child::id).collect();
        let mut payload = Vec::with_capacity(next.len());
        for child in &next {
            if child.parent().as_ref() != Some(self) {
                if let Some(old) = child.parent() {
                    old.forget_child(child.id());
                }
            }
            child.attach_to(self);
            payload.push(child.serialize());
        }
        let dropped = {
            let mut state = self.state();
            let old = std::mem::replace(&mut state.children, next);
            Self::record_nodes(&mut state, self.id(), Operation::Reset, vec![Value::Array(payload)]);
            old
        };
        for child in dropped {
            if !keep.contains(&child.id()) {
                child.release();
            }
        }
        Ok(())
    }

    /// Replace all children with a single text node.
    pub fn set_text(&self, text: impl Into<String>) -> HtmlResult<()> {
        self.set_children([TextNode::new(text)])
    }

    /// Concatenated text of every descendant text node.
    pub fn get_text(&self) -> String {
        let mut out = String::new();
        self.text_content(&mut out);
        out
    }

    fn text_content(&self, out: &mut String) {
        for child in self.children() {
            child.text_content(out);
        }
    }

    /// Remove this node from its parent, if any.
    pub fn detach(&self) {
        if let Some(parent) = self.parent() {
            let _ = parent.remove(&Child::Node(self.clone()));
        }
    }

    // --- builders ---

    pub fn with_text(self, text: impl Into<String>) -> Self {
        // text leaves cannot form loops
        self.append_checked(Child::Text(TextNode::new(text)));
        self
    }

    pub fn with_child(self, child: impl Into<Child>) -> HtmlResult<Self> {
        self.append(child)?;
        Ok(self)
    }

    pub fn with_class(self, class: &str) -> HtmlResult<Self> {
        self.add_class(class)?;
        Ok(self)
    }

    pub fn with_id(self, id: &str) -> HtmlResult<Self> {
        self.add_id(id)?;
        Ok(self)
    }

    pub fn with_style(self, name: &str, value: impl Into<String>) -> Self {
        self.set_style(name, value);
        self
    }

    pub fn with_attribute(self, name: &str, value: impl Into<Value>) -> HtmlResult<Self> {
        self.set_attribute(name, value)?;
        Ok(self)
    }

    // --- patches and serialization ---

    /// True if any store in this subtree has unsent patches.
    pub fn has_patches(&self) -> bool {
        let children = {
            let state = self.state();
            if state.has_own_patches() {
                return true;
            }
            state.children.clone()
        };
        children
            .iter()
            .filter_map(Child::as_node)
            .any(Node::has_patches)
    }

    /// Drain every pending patch of this subtree, ordered by creation.
    pub fn take_patches(&self) -> Vec<PatchRecord> {
        let _doc = self.implicit_lock();
        let mut out = Vec::new();
        self.collect_patches(&mut out);
        out.sort_by_key(|p| p.stamp);
        out
    }

    fn collect_patches(&self, out: &mut Vec<PatchRecord>) {
        let children = {
            let mut state = self.state();
            state.take_own_patches(out);
            state.children.clone()
        };
        for child in children.iter().filter_map(Child::as_node) {
            child.collect_patches(out);
        }
    }

    pub fn clear_subtree_patches(&self) {
        let _doc = self.implicit_lock();
        let children = {
            let mut state = self.state();
            state.clear_own_patches();
            state.children.clone()
        };
        for child in children.iter().filter_map(Child::as_node) {
            child.clear_subtree_patches();
        }
    }

    fn serialize_with(&self, clear: bool) -> Value {
        let (mut head, children) = {
            let mut state = self.state();
            if clear {
                state.clear_own_patches();
            }
            let node_type = if self.is_widget() {
                NodeType::Widget
            } else {
                NodeType::Node
            };
            let head = vec![
                Value::from(node_type.code()),
                self.id().to_wire(),
                Value::from(self.tag()),
                state.ids.to_wire(),
                state.classes.to_wire(),
                state.style.to_wire(),
                state.attributes.to_wire(),
            ];
            (head, state.children.clone())
        };
        let children: Vec<Value> = children.iter().map(|c| c.serialize_with(clear)).collect();
        head.push(Value::Array(children));
        if let Some(name) = self.widget_name() {
            head.push(Value::from(name));
            let data = self
                .state()
                .widget_data
                .as_ref()
                .map(WidgetData::to_wire)
                .unwrap_or(Value::Null);
            head.push(data);
        }
        Value::Array(head)
    }

    /// Full serialization of this subtree. Clears every visited patch queue,
    /// since the result subsumes any pending delta.
    pub fn serialize(&self) -> Value {
        let _doc = self.implicit_lock();
        self.serialize_with(true)
    }

    /// Same encoding as [`Node::serialize`] but leaves patch queues untouched.
    pub fn snapshot(&self) -> Value {
        let _doc = self.implicit_lock();
        self.serialize_with(false)
    }

    // --- traversal ---

    /// This node and every descendant element, in document order.
    pub fn iter_nodes(&self) -> Vec<Node> {
        let mut out = Vec::new();
        self.collect_nodes(&mut out);
        out
    }

    fn collect_nodes(&self, out: &mut Vec<Node>) {
        out.push(self.clone());
        for child in self.child_nodes() {
            child.collect_nodes(out);
        }
    }

    pub fn find(&self, id: NodeId) -> Option<Node> {
        if self.id() == id {
            return Some(self.clone());
        }
        self.child_nodes().iter().find_map(|c| c.find(id))
    }

    pub fn find_child(&self, id: NodeId) -> Option<Child> {
        for child in self.children() {
            if child.id() == id {
                return Some(child);
            }
            if let Child::Node(node) = &child {
                if let Some(found) = node.find_child(id) {
                    return Some(found);
                }
            }
        }
        None
    }
}

/// Parse `a: b; c: d` into ordered pairs.
pub(crate) fn parse_style(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|decl| {
            let (name, value) = decl.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Eq for Node {}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.widget_name() {
            Some(name) => write!(f, "Node(<{}> #{}, widget {})", self.tag(), self.id(), name),
            None => write!(f, "Node(<{}> #{})", self.tag(), self.id()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_append_sets_parent_and_patch() {
        let parent = Node::new("div");
        let child = Node::new("span");
        parent.append(&child).unwrap();
        assert_eq!(child.parent(), Some(parent.clone()));
        let patches = parent.take_patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].operation, Operation::Insert);
        assert_eq!(patches[0].payload[0], json!(0));
    }

    #[test]
    fn test_reparent_detaches_from_old_parent() {
        let a = Node::new("div");
        let b = Node::new("div");
        let child = Node::new("span");
        a.append(&child).unwrap();
        b.append(&child).unwrap();
        assert_eq!(a.child_count(), 0);
        assert_eq!(b.child_count(), 1);
        assert_eq!(child.parent(), Some(b.clone()));
        let a_patches = a.take_patches();
        assert_eq!(a_patches.last().unwrap().operation, Operation::Remove);
    }

    #[test]
    fn test_loop_detection_leaves_tree_unmodified() {
        let root = Node::new("div");
        let mid = Node::new("div");
        let leaf = Node::new("div");
        root.append(&mid).unwrap();
        mid.append(&leaf).unwrap();
        root.clear_subtree_patches();

        let err = leaf.append(&root).unwrap_err();
        assert_eq!(err, HtmlError::LoopDetected { node_id: root.id().0 });
        assert!(matches!(root.append(&root), Err(HtmlError::LoopDetected { .. })));
        assert_eq!(root.parent(), None);
        assert_eq!(leaf.child_count(), 0);
        assert!(!root.has_patches());
    }

    #[test]
    fn test_adopted_node_patches_cleared() {
        let parent = Node::new("div");
        let child = Node::new("span");
        child.add_class("x").unwrap();
        assert!(child.has_patches());
        parent.append(&child).unwrap();
        assert!(!child.has_patches());
    }

    #[test]
    fn test_serialize_clears_and_is_idempotent() {
        let node = Node::new("div");
        node.add_class("a").unwrap();
        node.set_style("color", "red");
        node.append("hello").unwrap();
        assert!(node.has_patches());
        let first = node.serialize();
        assert!(!node.has_patches());
        assert_eq!(node.take_patches(), vec![]);
        assert_eq!(node.serialize(), first);
    }

    #[test]
    fn test_set_text_replaces_children() {
        let node = Node::new("div").with_text("0");
        node.clear_subtree_patches();
        node.set_text("1").unwrap();
        assert_eq!(node.get_text(), "1");
        let patches = node.take_patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].operation, Operation::Reset);
    }

    #[test]
    fn test_insert_bounds() {
        let node = Node::new("ul");
        assert_eq!(
            node.insert(1, Node::new("li")).unwrap_err(),
            HtmlError::IndexOutOfRange { index: 1, len: 0 }
        );
        node.insert(0, Node::new("li")).unwrap();
        node.insert(0, Node::new("li")).unwrap();
        assert_eq!(node.child_count(), 2);
    }

    #[test]
    fn test_set_child_and_remove() {
        let list = Node::new("ul");
        let a = Node::new("li");
        let b = Node::new("li");
        list.append(&a).unwrap();
        list.set_child(0, &b).unwrap();
        assert_eq!(a.parent(), None);
        assert_eq!(list.child_nodes(), vec![b.clone()]);
        list.remove(&Child::from(&b)).unwrap();
        assert!(matches!(
            list.remove(&Child::from(&b)),
            Err(HtmlError::NotAChild { .. })
        ));
    }

    #[test]
    fn test_attribute_routing() {
        let node = Node::new("div");
        node.set_attribute("class", "a b").unwrap();
        node.set_attribute("style", "color: red; margin: 0").unwrap();
        node.set_attribute("title", "hi").unwrap();
        assert_eq!(node.classes(), vec!["a", "b"]);
        assert_eq!(node.get_style("margin").as_deref(), Some("0"));
        assert_eq!(node.get_attribute("title"), Some(json!("hi")));
        assert_eq!(node.get_attribute("class"), Some(json!("a b")));
        assert!(node.set_attribute("data", json!({"x": 1})).is_err());
    }

    #[test]
    fn test_events_attribute() {
        let button = Node::new("button");
        button.add_event(InputEventKind::Click).unwrap();
        button.add_event(InputEventKind::Click).unwrap();
        assert_eq!(button.events(), vec![InputEventKind::Click]);
        button.remove_event(InputEventKind::Click).unwrap();
        assert!(button.events().is_empty());
    }

    #[test]
    fn test_iter_nodes_document_order() {
        let root = Node::new("div");
        let a = Node::new("a");
        let a1 = Node::new("b");
        let c = Node::new("c");
        a.append(&a1).unwrap();
        root.append(&a).unwrap();
        root.append(&c).unwrap();
        let tags: Vec<String> = root.iter_nodes().iter().map(|n| n.tag().to_string()).collect();
        assert_eq!(tags, vec!["div", "a", "b", "c"]);
        assert_eq!(root.find(a1.id()), Some(a1));
    }

    #[test]
    fn test_widget_serialization() {
        let widget = Node::widget("div", "chart", json!({"points": [1, 2]})).unwrap();
        widget
            .widget_data(|d| d.append(&["points".into()], json!(3)))
            .unwrap()
            .unwrap();
        assert!(widget.has_patches());
        let wire = widget.serialize();
        assert_eq!(wire[0], json!(403));
        assert_eq!(wire[8], json!("chart"));
        assert_eq!(wire[9], json!({"points": [1, 2, 3]}));
        assert!(Node::new("div").widget_data(|_| ()).is_none());
    }

    #[test]
    fn test_document_link_follows_adoption() {
        let doc = crate::document::Document::new();
        let root = Node::new("div");
        let item = Node::new("ul");
        root.append(&item).unwrap();
        assert!(item.document_lock().is_none());

        doc.apply(Some(&root));
        assert!(item.document_lock().is_some());
        let late = Node::new("li");
        item.append(&late).unwrap();
        assert!(late.document_lock().is_some());

        root.remove(&Child::Node(item.clone())).unwrap();
        assert!(item.document_lock().is_none());
        assert!(late.document_lock().is_none());

        doc.clear();
        assert!(root.document_lock().is_none());
    }
}
