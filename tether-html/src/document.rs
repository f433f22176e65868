//! Document: the root holder that turns tree changes into outgoing data.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::lock::DocumentLock;
use crate::node::Node;
use crate::patch::PatchRecord;
pub use crate::protocol::DocumentData;

/// Root of a live document plus its lock.
///
/// The lock is scoped to this document only; unrelated documents never
/// contend. Callers that read or mutate the tree in several steps hold the
/// lock around the whole sequence.
#[derive(Debug)]
pub struct Document {
    root: Mutex<Option<Node>>,
    // false until the current root has been sent as a full tree
    sent: AtomicBool,
    lock: DocumentLock,
}

impl Document {
    pub fn new() -> Self {
        Self::with_lock(DocumentLock::new())
    }

    pub fn with_lock(lock: DocumentLock) -> Self {
        Self {
            root: Mutex::new(None),
            sent: AtomicBool::new(false),
            lock,
        }
    }

    fn root_slot(&self) -> MutexGuard<'_, Option<Node>> {
        self.root.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lock(&self) -> &DocumentLock {
        &self.lock
    }

    pub fn root(&self) -> Option<Node> {
        self.root_slot().clone()
    }

    /// Install `node` (or keep the current root when `None`) and return what
    /// has to be sent: a full tree for a new root, the pending patches for a
    /// known one, or nothing.
    pub fn apply(&self, node: Option<&Node>) -> Option<DocumentData> {
        let mut replaced = None;
        let root = {
            let mut slot = self.root_slot();
            match node {
                Some(node) if slot.as_ref() != Some(node) => {
                    node.set_document(Some(self.lock.clone()));
                    replaced = slot.replace(node.clone());
                    self.sent.store(false, Ordering::SeqCst);
                }
                _ => {}
            }
            slot.clone()
        };
        if let Some(old) = replaced {
            old.set_document(None);
        }
        let root = root?;
        if !self.sent.swap(true, Ordering::SeqCst) {
            return Some(DocumentData::HtmlTree(root.serialize()));
        }
        let patches = root.take_patches();
        if patches.is_empty() {
            None
        } else {
            Some(DocumentData::from_patches(&patches))
        }
    }

    /// Pending deltas only. `None` when the root was never sent or nothing changed.
    pub fn flush_update(&self) -> Option<DocumentData> {
        if !self.sent.load(Ordering::SeqCst) {
            return None;
        }
        let patches = self.take_patches();
        if patches.is_empty() {
            None
        } else {
            Some(DocumentData::from_patches(&patches))
        }
    }

    pub fn take_patches(&self) -> Vec<PatchRecord> {
        self.root().map(|r| r.take_patches()).unwrap_or_default()
    }

    /// Full tree for a late joiner. Does not consume pending patches.
    pub fn full_sync(&self) -> Option<DocumentData> {
        self.root().map(|r| DocumentData::HtmlTree(r.snapshot()))
    }

    pub fn serialize(&self) -> Option<Value> {
        let root = self.root()?;
        self.sent.store(true, Ordering::SeqCst);
        Some(root.serialize())
    }

    pub fn has_patches(&self) -> bool {
        self.root().is_some_and(|r| r.has_patches())
    }

    pub fn to_html(&self) -> String {
        self.root().map(|r| r.to_html()).unwrap_or_default()
    }

    pub fn clear(&self) {
        let old = self.root_slot().take();
        self.sent.store(false, Ordering::SeqCst);
        if let Some(old) = old {
            old.set_document(None);
        }
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}
