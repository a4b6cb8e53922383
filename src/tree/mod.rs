//! The Merkle tree over the block sequence.
//!
//! Nodes are stored in a flat file of 40 byte records addressed by flat-tree
//! index. The tree keeps only its roots in memory; everything else is read on
//! demand, consulting nodes that were committed but not yet flushed first.

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{prelude::*, storage::Storage};

mod batch;
mod cache;
mod node;
mod proof;
mod reorg;
mod seek;
mod verify;

pub use batch::{signable, tree_hash, TreeBatch, TreeUpgrade};
pub use cache::NodeCache;
pub use node::{Node, NODE_SIZE};
pub use proof::{
    DataBlock, DataHash, DataSeek, DataUpgrade, Proof, Request, RequestBlock, RequestSeek,
    RequestUpgrade,
};
pub use reorg::{ReorgBatch, ReorgWant};
pub use seek::ByteSeek;

/// The persisted summary of a tree, as stored in the oplog header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeHead {
    pub fork: u64,
    pub length: u64,
    pub root_hash: Hash,
    pub signature: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct MerkleTree {
    storage: Arc<dyn Storage>,
    pub roots: Vec<Node>,
    pub length: u64,
    pub byte_length: u64,
    pub fork: u64,
    pub signature: Option<Vec<u8>>,
    unflushed: BTreeMap<u64, Node>,
    truncated: bool,
    truncate_to: u64,
    cache: Option<(NodeCache, u64)>,
}

impl MerkleTree {
    /// Opens the tree at the state recorded in `head`.
    pub async fn open(
        storage: Arc<dyn Storage>,
        head: &TreeHead,
        cache: Option<NodeCache>,
    ) -> Result<Self> {
        let mut tree = Self {
            storage,
            roots: Vec::new(),
            length: 0,
            byte_length: 0,
            fork: head.fork,
            signature: head.signature.clone(),
            unflushed: BTreeMap::new(),
            truncated: false,
            truncate_to: 0,
            cache: cache.map(|c| {
                let id = c.register();
                (c, id)
            }),
        };

        let mut roots = Vec::new();
        for index in flat_tree::full_roots(2 * head.length) {
            let root = tree.get_optional(index).await?.ok_or_else(|| {
                Error::CorruptTree(format!("root {} of length {} is missing", index, head.length))
            })?;
            roots.push(root);
        }

        tree.byte_length = roots.iter().map(|r| r.size).sum();
        tree.roots = roots;
        tree.length = head.length;

        if head.length > 0 && !head.root_hash.is_zero() && tree.hash() != head.root_hash {
            return Err(Error::CorruptTree(format!(
                "roots at length {} do not match the recorded hash",
                head.length
            )));
        }

        debug!(target: "mulog::tree", length = tree.length, fork = tree.fork, "opened tree");
        Ok(tree)
    }

    pub fn head(&self) -> TreeHead {
        TreeHead {
            fork: self.fork,
            length: self.length,
            root_hash: self.hash(),
            signature: self.signature.clone(),
        }
    }

    pub fn batch(&self) -> TreeBatch {
        TreeBatch::new(self)
    }

    pub fn hash(&self) -> Hash {
        tree_hash(&self.roots)
    }

    pub fn signable(&self, namespace: Option<&Hash>) -> Vec<u8> {
        signable(namespace, &self.hash(), self.length, self.fork)
    }

    /// Reads a node, failing with [`Error::NodeNotFound`] if it is absent.
    pub async fn get(&self, index: u64) -> Result<Node> {
        self.get_optional(index)
            .await?
            .ok_or(Error::NodeNotFound(index))
    }

    pub async fn get_optional(&self, index: u64) -> Result<Option<Node>> {
        if let Some(node) = self.unflushed.get(&index) {
            return Ok((!node.is_blank()).then_some(*node));
        }
        if self.truncated && index >= 2 * self.truncate_to {
            return Ok(None);
        }
        if let Some((cache, id)) = &self.cache {
            if let Some(node) = cache.get(*id, index) {
                return Ok(Some(node));
            }
        }

        let Some(bytes) = self.storage.read(index * NODE_SIZE, NODE_SIZE).await? else {
            return Ok(None);
        };
        let node = Node::decode(index, &bytes)?;
        if node.is_blank() {
            return Ok(None);
        }

        if let Some((cache, id)) = &self.cache {
            cache.put(*id, node);
        }
        Ok(Some(node))
    }

    pub async fn has(&self, index: u64) -> Result<bool> {
        Ok(self.get_optional(index).await?.is_some())
    }

    /// Stages a node that is already trusted, without any verification.
    pub fn add_node(&mut self, node: Node) {
        self.unflushed.insert(node.index, node);
    }

    pub fn add_nodes(&mut self, nodes: impl IntoIterator<Item = Node>) {
        for node in nodes {
            self.add_node(node);
        }
    }

    /// Marks a stored node as absent.
    pub fn blank_node(&mut self, index: u64) {
        self.unflushed.insert(index, Node::blank(index));
    }

    /// Applies `batch`. Fails without changes if the tree moved since the
    /// batch was created.
    pub fn commit(&mut self, batch: TreeBatch) -> Result<()> {
        if !batch.commitable(self) {
            return Err(Error::InvalidOperation(
                "tree was modified during batch, refusing to commit".into(),
            ));
        }

        if batch.upgraded {
            if batch.ancestors < batch.tree_length {
                self.drop_after(batch.ancestors);
            }

            self.roots = batch.roots;
            self.length = batch.length;
            self.byte_length = batch.byte_length;
            self.fork = batch.fork;
            self.signature = batch.signature;
        }

        for node in batch.nodes {
            self.unflushed.insert(node.index, node);
        }
        Ok(())
    }

    /// Forgets everything at or after block `ancestors`.
    fn drop_after(&mut self, ancestors: u64) {
        debug!(target: "mulog::tree", ancestors, length = self.length, "truncating tree");

        if ancestors > 0 {
            // Parents that straddle the new head are stale but sit below it.
            let head = 2 * ancestors;
            let mut ite = flat_tree::Iterator::new(head - 2);
            loop {
                if ite.contains(head) && ite.index < head {
                    self.blank_node(ite.index);
                }
                if ite.offset == 0 {
                    break;
                }
                ite.parent();
            }
        }

        self.truncate_to = if self.truncated {
            self.truncate_to.min(ancestors)
        } else {
            ancestors
        };
        self.truncated = true;

        if let Some((cache, id)) = &self.cache {
            cache.evict(*id);
        }
        self.unflushed.retain(|index, _| *index < 2 * ancestors);
    }

    /// Writes pending nodes and truncations to storage.
    pub async fn flush(&mut self) -> Result<()> {
        if self.truncated {
            self.storage
                .truncate(self.truncate_to * 2 * NODE_SIZE)
                .await?;
            self.truncated = false;
        }

        for node in self.unflushed.values() {
            self.storage
                .write(node.index * NODE_SIZE, &node.to_bytes())
                .await?;
        }

        trace!(target: "mulog::tree", nodes = self.unflushed.len(), "flushed tree");
        self.unflushed.clear();
        Ok(())
    }

    pub fn is_flushed(&self) -> bool {
        self.unflushed.is_empty() && !self.truncated
    }

    /// A batch that moves the tree to `length` under `fork`. Also used to
    /// grow the tree when the nodes of the new roots are already staged.
    pub async fn truncate(&self, length: u64, fork: u64) -> Result<TreeBatch> {
        let mut batch = self.batch();
        let full_roots = flat_tree::full_roots(2 * length);

        for (i, root) in full_roots.iter().enumerate() {
            if i < batch.roots.len() && batch.roots[i].index == *root {
                continue;
            }
            batch.roots.truncate(i);
            batch.roots.push(self.get(*root).await?);
        }
        batch.roots.truncate(full_roots.len());

        batch.fork = fork;
        batch.length = length;
        batch.ancestors = length;
        batch.byte_length = batch.roots.iter().map(|r| r.size).sum();
        batch.upgraded = true;
        Ok(batch)
    }

    /// Rebuilds the batch behind a logged upgrade. The new roots come from
    /// `nodes` first, so this also replays reorgs.
    pub async fn restore(&self, upgrade: &TreeUpgrade, nodes: Vec<Node>) -> Result<TreeBatch> {
        let mut roots = Vec::new();
        for index in flat_tree::full_roots(2 * upgrade.length) {
            roots.push(self.overlaid(&nodes, index).await?);
        }

        let mut batch = self.batch();
        batch.byte_length = roots.iter().map(|r| r.size).sum();
        batch.roots = roots;
        batch.length = upgrade.length;
        batch.fork = upgrade.fork;
        batch.ancestors = upgrade.ancestors;
        batch.signature = upgrade.signature.clone();
        batch.nodes = nodes;
        batch.upgraded = true;
        Ok(batch)
    }

    /// The root set of the tree at an earlier `length`.
    pub async fn get_roots(&self, length: u64) -> Result<Vec<Node>> {
        let mut roots = Vec::new();
        for index in flat_tree::full_roots(2 * length) {
            roots.push(self.get(index).await?);
        }
        Ok(roots)
    }

    /// Byte offset of the first block covered by `index`.
    pub async fn byte_offset(&self, index: u64) -> Result<u64> {
        self.byte_offset_in(&self.roots, &[], index).await
    }

    /// Offset and size of block `index`.
    pub async fn byte_range(&self, index: u64) -> Result<(u64, u64)> {
        let offset = self.byte_offset(2 * index).await?;
        let size = self.get(2 * index).await?.size;
        Ok((offset, size))
    }

    /// Like [`Self::byte_offset`] but against an arbitrary root set, looking
    /// up `overlay` before the stored nodes.
    pub(crate) async fn byte_offset_in(
        &self,
        roots: &[Node],
        overlay: &[Node],
        index: u64,
    ) -> Result<u64> {
        let index = flat_tree::left_span(index);
        let mut offset = 0;

        for root in roots {
            let (left, right) = flat_tree::spans(root.index);
            if index > right {
                offset += root.size;
                continue;
            }
            if index < left {
                break;
            }

            let mut ite = flat_tree::Iterator::new(root.index);
            while ite.index != index {
                let left = ite.left_child();
                if index <= ite.right_span() {
                    continue;
                }
                offset += self.overlaid(overlay, left).await?.size;
                ite.sibling();
            }
            return Ok(offset);
        }

        let head = roots.last().map_or(0, |r| flat_tree::right_span(r.index) + 2);
        if index == head {
            return Ok(offset);
        }
        Err(Error::InvalidRequest(format!("index {} is out of bounds", index)))
    }

    pub(crate) async fn overlaid(&self, overlay: &[Node], index: u64) -> Result<Node> {
        match overlay.iter().find(|n| n.index == index) {
            Some(node) => Ok(*node),
            None => self.get(index).await,
        }
    }

    /// How many ancestors of `index` are missing locally, counting up to the
    /// first one that is present.
    pub async fn missing_nodes(&self, index: u64) -> Result<u64> {
        let head = 2 * self.length;
        let mut ite = flat_tree::Iterator::new(index);

        if ite.right_span() >= head {
            return Ok(0);
        }

        let mut count = 0;
        while !ite.contains(head) && !self.has(ite.index).await? {
            count += 1;
            ite.parent();
        }
        Ok(count)
    }
}
