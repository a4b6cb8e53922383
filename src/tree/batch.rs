use serde::{Deserialize, Serialize};

use crate::prelude::*;

/// A draft of tree changes. It owns a copy of the roots it started from so
/// building it never touches the live tree; [`MerkleTree::commit`] applies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeBatch {
    pub fork: u64,
    pub roots: Vec<Node>,
    pub length: u64,
    pub byte_length: u64,
    /// Length up to which the previous tree is kept. Anything between this
    /// and `tree_length` is dropped on commit.
    pub ancestors: u64,
    pub signature: Option<Vec<u8>>,
    /// New nodes, flushed to the tree on commit.
    pub nodes: Vec<Node>,
    pub upgraded: bool,
    pub(crate) tree_length: u64,
    pub(crate) tree_fork: u64,
}

/// What the oplog records about an upgrade, enough to replay it from the
/// nodes written alongside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeUpgrade {
    pub fork: u64,
    pub length: u64,
    pub ancestors: u64,
    pub signature: Option<Vec<u8>>,
}

impl TreeBatch {
    pub(crate) fn new(tree: &MerkleTree) -> Self {
        Self {
            fork: tree.fork,
            roots: tree.roots.clone(),
            length: tree.length,
            byte_length: tree.byte_length,
            ancestors: tree.length,
            signature: tree.signature.clone(),
            nodes: Vec::new(),
            upgraded: false,
            tree_length: tree.length,
            tree_fork: tree.fork,
        }
    }

    /// A batch that ignores the local roots, used to rebuild a remote tree
    /// from scratch.
    pub(crate) fn detached(tree: &MerkleTree, fork: u64) -> Self {
        Self {
            fork,
            roots: Vec::new(),
            length: 0,
            byte_length: 0,
            ancestors: 0,
            signature: None,
            ..Self::new(tree)
        }
    }

    /// Length of the tree this batch was built against.
    pub fn tree_length(&self) -> u64 {
        self.tree_length
    }

    pub fn append(&mut self, data: &[u8]) {
        let head = self.length * 2;
        let mut ite = flat_tree::Iterator::new(head);
        let node = Node::leaf(head, data);
        self.append_root(node, &mut ite);
    }

    /// Pushes `node` as the new last root and merges sibling roots upwards.
    /// `ite` must sit on `node` and is left on the last root.
    pub(crate) fn append_root(&mut self, node: Node, ite: &mut flat_tree::Iterator) {
        self.upgraded = true;
        self.length += ite.factor / 2;
        self.byte_length += node.size;
        self.roots.push(node);
        self.nodes.push(node);

        while self.roots.len() > 1 {
            let a = self.roots[self.roots.len() - 1];
            let b = self.roots[self.roots.len() - 2];

            if ite.sibling() != b.index {
                ite.sibling();
                break;
            }

            let parent = Node::parent(ite.parent(), &a, &b);
            self.nodes.push(parent);
            self.roots.truncate(self.roots.len() - 2);
            self.roots.push(parent);
        }
    }

    /// The hash of the root set.
    pub fn hash(&self) -> Hash {
        tree_hash(&self.roots)
    }

    /// The bytes a signer commits to. With a namespace (the manifest hash)
    /// this is the 80 byte layout, otherwise the 48 byte one.
    pub fn signable(&self, namespace: Option<&Hash>) -> Vec<u8> {
        signable(namespace, &self.hash(), self.length, self.fork)
    }

    pub fn upgrade_record(&self) -> TreeUpgrade {
        TreeUpgrade {
            fork: self.fork,
            length: self.length,
            ancestors: self.ancestors,
            signature: self.signature.clone(),
        }
    }

    /// Whether the tree is still the one this batch was built against.
    pub fn commitable(&self, tree: &MerkleTree) -> bool {
        let corresponds = if self.upgraded {
            self.tree_length == tree.length
        } else {
            self.tree_length <= tree.length
        };
        self.tree_fork == tree.fork && corresponds
    }
}

pub fn tree_hash(roots: &[Node]) -> Hash {
    Hash::roots::<Blake2b256, _>(roots.iter().map(|r| (&r.hash, r.index, r.size)))
}

pub fn signable(namespace: Option<&Hash>, hash: &Hash, length: u64, fork: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(80);
    if let Some(namespace) = namespace {
        out.extend_from_slice(namespace.as_ref());
    }
    out.extend_from_slice(hash.as_ref());
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&fork.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::testing::tree_with;

    #[tokio::test]
    async fn test_append_rolls_up_roots() {
        let tree = tree_with(0).await;
        let mut batch = tree.batch();

        for block in [b"a", b"b", b"c"] {
            batch.append(block);
        }

        let roots: Vec<u64> = batch.roots.iter().map(|r| r.index).collect();
        assert_eq!(roots, vec![1, 4]);
        assert_eq!(batch.length, 3);
        assert_eq!(batch.byte_length, 3);
        assert_eq!(batch.nodes.len(), 4);
        assert!(batch.upgraded);
    }

    #[tokio::test]
    async fn test_batching_does_not_change_the_hash() {
        let tree = tree_with(0).await;
        let blocks: Vec<Vec<u8>> = (0..11u8).map(|i| vec![i; i as usize + 1]).collect();

        let mut all = tree.batch();
        for block in &blocks {
            all.append(block);
        }

        let mut tree = tree_with(0).await;
        for block in &blocks {
            let mut one = tree.batch();
            one.append(block);
            tree.commit(one).unwrap();
        }

        assert_eq!(tree.hash(), all.hash());
        assert_eq!(tree.roots, all.roots);
    }

    #[tokio::test]
    async fn test_signable_layouts() {
        let tree = tree_with(3).await;
        let batch = tree.batch();

        assert_eq!(batch.signable(None).len(), 48);
        assert_eq!(batch.signable(Some(&Hash::zero())).len(), 80);
        assert_eq!(&batch.signable(None)[32..40], &3u64.to_be_bytes());
    }

    #[tokio::test]
    async fn test_stale_batch_is_not_commitable() {
        let mut tree = tree_with(2).await;
        let mut stale = tree.batch();
        stale.append(b"late");

        let mut first = tree.batch();
        first.append(b"first");
        tree.commit(first).unwrap();

        assert!(!stale.commitable(&tree));
        assert!(matches!(tree.commit(stale), Err(Error::InvalidOperation(_))));
    }
}
