use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use lru::LruCache;

use super::Node;

#[derive(Debug)]
struct Inner {
    nodes: Mutex<LruCache<(u64, u64), Node>>,
    next_id: AtomicU64,
}

/// A node cache that can be shared between several trees. Each tree
/// registers once and gets an id that namespaces its entries.
#[derive(Debug, Clone)]
pub struct NodeCache {
    inner: Arc<Inner>,
}

impl NodeCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            inner: Arc::new(Inner {
                nodes: Mutex::new(LruCache::new(capacity)),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn register(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, tree: u64, index: u64) -> Option<Node> {
        self.lock().get(&(tree, index)).copied()
    }

    pub fn put(&self, tree: u64, node: Node) {
        self.lock().put((tree, node.index), node);
    }

    /// Drops every entry of `tree`.
    pub fn evict(&self, tree: u64) {
        let mut nodes = self.lock();
        let keys: Vec<_> = nodes
            .iter()
            .filter(|((id, _), _)| *id == tree)
            .map(|(key, _)| *key)
            .collect();

        for key in keys {
            nodes.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<(u64, u64), Node>> {
        self.inner.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }
}
