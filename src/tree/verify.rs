//! Proof verification.
//!
//! Verification never reads more than one stored node: the proof is replayed
//! into a [`TreeBatch`] by hashing upwards, and only when the proof does not
//! reach a new root is the node it ends at compared against local state.

use crate::{flat_tree::Iterator, prelude::*};

/// Hands out proof nodes in the order the replay asks for them. `extra`
/// stands in for the one node the replay computed from an earlier section.
struct NodeQueue<'a> {
    nodes: &'a [Node],
    i: usize,
    extra: Option<Node>,
}

impl<'a> NodeQueue<'a> {
    fn new(nodes: &'a [Node], extra: Option<Node>) -> Self {
        Self { nodes, i: 0, extra }
    }

    fn len(&self) -> usize {
        self.nodes.len() - self.i + usize::from(self.extra.is_some())
    }

    fn shift(&mut self, index: u64) -> Result<Node> {
        if let Some(extra) = self.extra.filter(|n| n.index == index) {
            self.extra = None;
            return Ok(extra);
        }

        let Some(node) = self.nodes.get(self.i) else {
            return Err(Error::UnderflowedProof(format!(
                "expected node {}, got nothing",
                index
            )));
        };
        if node.index != index {
            return Err(Error::ProofMismatch(format!(
                "expected node {}, got node {}",
                index, node.index
            )));
        }

        self.i += 1;
        Ok(*node)
    }
}

/// Hashes a path upwards from its first node, collecting every node seen.
fn replay(q: &mut NodeQueue<'_>, mut ite: Iterator, first: Node, nodes: &mut Vec<Node>) -> Result<Node> {
    let mut root = first;
    nodes.push(root);

    while q.len() > 0 {
        let node = q.shift(ite.sibling())?;
        root = Node::parent(ite.parent(), &root, &node);
        nodes.push(node);
        nodes.push(root);
    }
    Ok(root)
}

/// Replays the seek and block sections. Returns the node both paths lead
/// to, or `None` if the proof has neither.
pub(crate) fn verify_tree(proof: &Proof, nodes: &mut Vec<Node>) -> Result<Option<Node>> {
    let untrusted = match (&proof.block, &proof.hash) {
        (Some(block), _) => Some((2 * block.index, block.value.as_deref(), &block.nodes)),
        (None, Some(hash)) => Some((hash.index, None, &hash.nodes)),
        (None, None) => None,
    };

    let mut root = None;

    if let Some(seek) = proof.seek.as_ref().filter(|s| !s.nodes.is_empty()) {
        let ite = Iterator::new(seek.nodes[0].index);
        let mut q = NodeQueue::new(&seek.nodes, None);
        let first = q.shift(ite.index)?;
        root = Some(replay(&mut q, ite, first, nodes)?);
    }

    let Some((index, value, path)) = untrusted else {
        return Ok(root);
    };

    let ite = Iterator::new(index);
    let mut q = NodeQueue::new(path, root);
    let first = match value {
        Some(value) => Node::leaf(index, value),
        None => q.shift(index)?,
    };

    Ok(Some(replay(&mut q, ite, first, nodes)?))
}

/// Grows `batch` to the upgrade length. Returns whether `block_root` was
/// consumed as one of the nodes.
pub(crate) fn verify_upgrade(
    proof: &Proof,
    block_root: Option<Node>,
    batch: &mut TreeBatch,
) -> Result<bool> {
    let Some(upgrade) = &proof.upgrade else {
        return Ok(block_root.is_none());
    };

    let mut q = NodeQueue::new(&upgrade.nodes, block_root);
    let mut grow = !batch.roots.is_empty();
    let mut i = 0;

    let to = 2 * (upgrade.start + upgrade.length);
    let mut ite = Iterator::new(0);

    while ite.full_root(to) {
        if i < batch.roots.len() && batch.roots[i].index == ite.index {
            i += 1;
            ite.next_tree();
            continue;
        }

        if grow {
            grow = false;
            let root = ite.index;

            if i < batch.roots.len() {
                let last = batch.roots[batch.roots.len() - 1].index;
                ite.seek(last);
                while ite.index != root {
                    let node = q.shift(ite.sibling())?;
                    batch.append_root(node, &mut ite);
                }
                ite.next_tree();
                continue;
            }
        }

        let node = q.shift(ite.index)?;
        batch.append_root(node, &mut ite);
        ite.next_tree();
    }

    if q.i < q.nodes.len() {
        return Err(Error::UnderflowedProof(format!(
            "{} unused upgrade nodes",
            q.nodes.len() - q.i
        )));
    }

    let last = batch
        .roots
        .last()
        .ok_or_else(|| Error::UnderflowedProof("upgrade produced no roots".into()))?;
    ite.seek(last.index);

    let extra = &upgrade.additional_nodes;
    let mut i = 0;

    while i < extra.len() && extra[i].index == ite.sibling() {
        batch.append_root(extra[i], &mut ite);
        i += 1;
    }

    while i < extra.len() {
        let node = extra[i];
        i += 1;

        while node.index != ite.index {
            if ite.factor == 2 {
                return Err(Error::ProofMismatch(format!("unexpected node {}", node.index)));
            }
            ite.left_child();
        }

        batch.append_root(node, &mut ite);
        ite.sibling();
    }

    batch.signature = Some(upgrade.signature.clone());
    batch.fork = proof.fork;

    Ok(q.extra.is_none())
}

impl MerkleTree {
    /// Replays `proof` on top of the current tree.
    pub async fn verify(&self, proof: &Proof) -> Result<TreeBatch> {
        let mut batch = self.batch();

        let mut unverified = verify_tree(proof, &mut batch.nodes)?;
        if proof.upgrade.is_some() && verify_upgrade(proof, unverified, &mut batch)? {
            unverified = None;
        }

        if let Some(node) = unverified {
            let verified = self.get_optional(node.index).await?.ok_or_else(|| {
                Error::ProofMismatch(format!("node {} is not known locally", node.index))
            })?;

            if verified.hash != node.hash {
                return Err(Error::ProofMismatch(format!(
                    "invalid checksum at node {}",
                    node.index
                )));
            }
        }

        Ok(batch)
    }

    /// Replays `proof` into an empty tree, ignoring local roots. The result
    /// describes the remote tree only and is never committed.
    pub fn verify_fully_remote(&self, proof: &Proof) -> Result<TreeBatch> {
        let mut batch = TreeBatch::detached(self, proof.fork);
        let unverified = verify_tree(proof, &mut batch.nodes)?;

        if proof.upgrade.is_some() {
            verify_upgrade(proof, unverified, &mut batch)?;
        }
        Ok(batch)
    }
}
