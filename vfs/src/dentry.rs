//! Cached directory entries.
//!
//! A dentry binds one name component to an inode inside a parent directory.
//! Children are owned strongly, the parent weakly, so the tree is acyclic
//! upward. The children map has its own lock and is a leaf in the lock
//! order.

use crate::Inode;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

pub struct Dentry {
    name: String,
    inode: Arc<Inode>,
    parent: Weak<Dentry>,
    children: Mutex<HashMap<String, Arc<Dentry>>>,
}

impl Dentry {
    pub fn new(name: &str, inode: Arc<Inode>, parent: Option<&Arc<Dentry>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            inode,
            parent: parent.map(Arc::downgrade).unwrap_or_default(),
            children: Mutex::new(HashMap::new()),
        })
    }

    /// Root dentry of a mounted filesystem: no name, no parent.
    pub fn new_root(inode: Arc<Inode>) -> Arc<Self> {
        Self::new("", inode, None)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn parent(&self) -> Option<Arc<Dentry>> {
        self.parent.upgrade()
    }

    pub fn is_root(&self) -> bool {
        self.parent.upgrade().is_none()
    }

    pub fn lookup_child(&self, name: &str) -> Option<Arc<Dentry>> {
        self.children.lock().get(name).cloned()
    }

    pub fn add_child(&self, child: Arc<Dentry>) {
        self.children
            .lock()
            .insert(child.name.clone(), child);
    }

    pub fn remove_child(&self, name: &str) {
        self.children.lock().remove(name);
    }

    pub fn list_children(&self) -> Vec<Arc<Dentry>> {
        self.children.lock().values().cloned().collect()
    }

    /// Absolute path built by walking parent links up to the root.
    pub fn path(&self) -> String {
        let mut parts = Vec::new();
        if !self.name.is_empty() {
            parts.push(self.name.clone());
        }
        let mut cursor = self.parent.upgrade();
        while let Some(dentry) = cursor {
            if !dentry.name.is_empty() {
                parts.push(dentry.name.clone());
            }
            cursor = dentry.parent.upgrade();
        }
        if parts.is_empty() {
            return "/".to_string();
        }
        let mut path = String::new();
        for part in parts.iter().rev() {
            path.push('/');
            path.push_str(part);
        }
        path
    }
}

impl std::fmt::Debug for Dentry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dentry")
            .field("name", &self.name)
            .field("ino", &self.inode.ino())
            .finish()
    }
}
