//! In-process remote store.
//!
//! Keeps the whole tree in a `serde_json::Value`. Listeners are notified
//! synchronously after each write, outside the tree lock, and only when the
//! value at their path actually changed.
//!
//! Deliveries are serialized in write order by a second lock, so the last
//! value a listener sees always matches the tree. A listener must not write
//! to the store it listens on.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::trace;

use super::{split_path, Listener, RemoteResult, RemoteStore, Subscription};
use crate::types::now_millis;

struct ListenerEntry {
    path: Vec<String>,
    callback: Arc<Listener>,
    last: Option<Value>,
}

#[derive(Default)]
struct Tree {
    root: Value,
    listeners: BTreeMap<u64, ListenerEntry>,
    next_listener: u64,
    push_seq: u64,
}

/// A remote store living in process memory.
///
/// Cloning shares the same tree, so several coordinators in one process
/// (a driver and a validator in a test) see each other's writes.
#[derive(Clone, Default)]
pub struct MemoryRemoteStore {
    tree: Arc<Mutex<Tree>>,
    delivery: Arc<Mutex<()>>,
}

impl MemoryRemoteStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Snapshot of the whole tree.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        self.lock().root.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Apply `write` to the tree, then fire every listener whose view changed.
    fn write_and_notify(&self, segments: &[String], write: impl FnOnce(&mut Value)) {
        let _delivery = self.lock_delivery();
        let pending = {
            let mut tree = self.lock();
            write(&mut tree.root);

            let Tree {
                root, listeners, ..
            } = &mut *tree;
            let mut pending = Vec::new();
            for entry in listeners.values_mut() {
                if !is_related(&entry.path, segments) {
                    continue;
                }
                let current = value_at(root, &entry.path).cloned();
                if current != entry.last {
                    entry.last.clone_from(&current);
                    if let Some(value) = current {
                        pending.push((Arc::clone(&entry.callback), value));
                    }
                }
            }
            pending
        };

        for (callback, value) in pending {
            callback(value);
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn set(&self, path: &str, value: Value) -> RemoteResult<()> {
        let segments = split_path(path)?;
        trace!(path, "memory set");
        self.write_and_notify(&segments, |root| write_at(root, &segments, value));
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> RemoteResult<()> {
        let segments = split_path(path)?;
        trace!(path, fields = fields.len(), "memory update");
        self.write_and_notify(&segments, |root| {
            for (key, value) in fields {
                let mut child = segments.clone();
                child.push(key);
                write_at(root, &child, value);
            }
        });
        Ok(())
    }

    async fn push(&self, path: &str, value: Value) -> RemoteResult<String> {
        let mut segments = split_path(path)?;
        let key = {
            let mut tree = self.lock();
            tree.push_seq += 1;
            format!("{:013}-{:06}", now_millis(), tree.push_seq)
        };
        segments.push(key.clone());
        trace!(path, key = %key, "memory push");
        self.write_and_notify(&segments, |root| write_at(root, &segments, value));
        Ok(key)
    }

    async fn get(&self, path: &str) -> RemoteResult<Option<Value>> {
        let segments = split_path(path)?;
        Ok(value_at(&self.lock().root, &segments).cloned())
    }

    fn subscribe(&self, path: &str, listener: Listener) -> RemoteResult<Subscription> {
        let segments = split_path(path)?;
        let callback = Arc::new(listener);

        let delivery = self.lock_delivery();
        let (id, initial) = {
            let mut tree = self.lock();
            let initial = value_at(&tree.root, &segments).cloned();
            let id = tree.next_listener;
            tree.next_listener += 1;
            tree.listeners.insert(
                id,
                ListenerEntry {
                    path: segments,
                    callback: Arc::clone(&callback),
                    last: initial.clone(),
                },
            );
            (id, initial)
        };

        if let Some(value) = initial {
            callback(value);
        }
        drop(delivery);

        let tree: Weak<Mutex<Tree>> = Arc::downgrade(&self.tree);
        Ok(Subscription::new(move || {
            if let Some(tree) = tree.upgrade() {
                let mut tree = tree.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                tree.listeners.remove(&id);
            }
        }))
    }
}

/// Whether a write at `written` can change the view at `watched`.
fn is_related(watched: &[String], written: &[String]) -> bool {
    let n = watched.len().min(written.len());
    watched[..n] == written[..n]
}

/// The non-null value at `segments`, if any.
fn value_at<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut node = root;
    for segment in segments {
        node = node.as_object()?.get(segment)?;
    }
    if node.is_null() {
        None
    } else {
        Some(node)
    }
}

/// Write `value` at `segments`, creating intermediate objects.
///
/// Null removes the key and prunes parents left empty.
fn write_at(root: &mut Value, segments: &[String], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return;
    };

    if value.is_null() {
        remove_at(root, parents, last);
        return;
    }

    let mut node = root;
    for segment in parents {
        node = ensure_object(node)
            .entry(segment.clone())
            .or_insert(Value::Null);
    }
    ensure_object(node).insert(last.clone(), value);
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(object) => object,
        _ => unreachable!("node was just replaced by an object"),
    }
}

fn remove_at(node: &mut Value, parents: &[String], last: &str) -> bool {
    let Some(object) = node.as_object_mut() else {
        return false;
    };
    match parents.split_first() {
        None => {
            object.remove(last);
        }
        Some((head, rest)) => {
            if let Some(child) = object.get_mut(head) {
                if remove_at(child, rest, last) {
                    object.remove(head);
                }
            }
        }
    }
    object.is_empty()
}
