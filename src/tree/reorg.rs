//! Locating the point where a remote fork diverges from the local tree.
//!
//! A [`ReorgBatch`] starts from a remote upgrade proof and narrows down the
//! first differing subtree one level at a time, asking the remote for the
//! path below it through hash requests. Each round trip halves the range,
//! so a fork is found in at most `log2(length)` requests.

use std::collections::HashMap;

use crate::{
    prelude::*,
    tree::verify::{verify_tree, verify_upgrade},
};

/// The next hash request that moves the search forward: the remote path
/// from block `start` up `nodes` levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorgWant {
    pub nodes: u64,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone)]
pub struct ReorgBatch {
    /// The remote tree. `batch.ancestors` is the shared prefix found so far.
    pub batch: TreeBatch,
    diff: Option<Node>,
    pub want: Option<ReorgWant>,
}

impl ReorgBatch {
    fn new(tree: &MerkleTree, fork: u64) -> Self {
        let mut batch = TreeBatch::detached(tree, fork);
        batch.upgraded = true;

        Self {
            batch,
            diff: None,
            want: Some(ReorgWant {
                nodes: 0,
                start: 0,
                end: 0,
            }),
        }
    }

    /// Whether the divergence point is known.
    pub fn finished(&self) -> bool {
        self.want.is_none()
    }

    pub fn ancestors(&self) -> u64 {
        self.batch.ancestors
    }

    pub fn into_batch(self) -> TreeBatch {
        self.batch
    }

    /// Feeds the answer to the last [`ReorgWant`]. Returns whether the
    /// search finished. A proof that does not lead to the node under
    /// investigation is ignored.
    pub async fn update(&mut self, tree: &MerkleTree, proof: &Proof) -> Result<bool> {
        if self.want.is_none() {
            return Ok(true);
        }
        let Some(diff) = self.diff else {
            return Ok(false);
        };

        let mut nodes = Vec::new();
        match verify_tree(proof, &mut nodes)? {
            Some(root) if root.hash == diff.hash => {}
            _ => return Ok(false),
        }

        self.batch.nodes.extend_from_slice(&nodes);
        self.descend(tree, &nodes).await
    }

    /// Walks down from the current diff through `nodes`, following the
    /// left child while it differs locally and stepping right otherwise.
    async fn descend(&mut self, tree: &MerkleTree, nodes: &[Node]) -> Result<bool> {
        let Some(start) = self.diff else {
            return Ok(false);
        };

        let known: HashMap<u64, Node> = nodes.iter().map(|n| (n.index, *n)).collect();
        let mut ite = flat_tree::Iterator::new(start.index);
        let mut diff = None;

        while ite.index & 1 == 1 {
            let Some(left) = known.get(&ite.left_child()).copied() else {
                break;
            };

            let local = tree.get_optional(left.index).await?;
            if local.map(|n| n.hash) == Some(left.hash) {
                diff = known.get(&ite.sibling()).copied();
            } else {
                diff = Some(left);
            }
        }

        if start.is_leaf() {
            return Ok(true);
        }
        match diff {
            Some(diff) => Ok(self.update_diff_root(diff)),
            None => Ok(false),
        }
    }

    fn update_diff_root(&mut self, diff: Node) -> bool {
        if self.want.is_none() {
            return true;
        }

        let (left, right) = flat_tree::spans(diff.index);
        let start = left / 2;
        let end = self.batch.tree_length.min(right / 2 + 1);

        self.batch.ancestors = start;
        self.diff = Some(diff);

        if diff.is_leaf() || start >= end {
            self.want = None;
            return true;
        }

        self.want = Some(ReorgWant {
            nodes: flat_tree::depth(diff.index),
            start,
            end,
        });
        false
    }
}

impl MerkleTree {
    /// Starts a search for the shared prefix with the remote tree described
    /// by `proof`, which must carry an upgrade from zero.
    pub async fn reorg(&self, proof: &Proof) -> Result<ReorgBatch> {
        let mut reorg = ReorgBatch::new(self, proof.fork);

        let unverified = if proof.block.is_some() || proof.hash.is_some() || proof.seek.is_some() {
            verify_tree(proof, &mut reorg.batch.nodes)?
        } else {
            None
        };

        if !verify_upgrade(proof, unverified, &mut reorg.batch)? {
            return Err(Error::ProofMismatch("fork proof not verifiable".into()));
        }

        for root in reorg.batch.roots.clone() {
            let local = self.get_optional(root.index).await?;
            if local.map(|n| n.hash) == Some(root.hash) {
                continue;
            }
            reorg.update_diff_root(root);
            break;
        }

        if reorg.diff.is_some() {
            let nodes = reorg.batch.nodes.clone();
            reorg.descend(self, &nodes).await?;
        } else {
            reorg.want = None;
            reorg.batch.ancestors = reorg.batch.length;
        }

        Ok(reorg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{testing::*, Request, RequestBlock, RequestUpgrade};

    async fn fork_of(shared: u64, length: u64) -> MerkleTree {
        let mut tree = tree_with(shared).await;
        let mut batch = tree.truncate(shared, 1).await.unwrap();
        for i in shared..length {
            batch.append(format!("fork #{}", i).as_bytes());
        }
        tree.commit(batch).unwrap();
        tree
    }

    async fn full_upgrade(remote: &MerkleTree) -> Proof {
        let request = Request {
            fork: remote.fork,
            upgrade: Some(RequestUpgrade {
                start: 0,
                length: remote.length,
            }),
            ..Default::default()
        };
        remote.proof(&request).await.unwrap()
    }

    /// Answers wants from `remote` until the search finishes.
    async fn converge(local: &MerkleTree, remote: &MerkleTree) -> (ReorgBatch, usize) {
        let mut reorg = local.reorg(&full_upgrade(remote).await).await.unwrap();
        let mut round_trips = 0;

        while let Some(want) = reorg.want {
            let request = Request {
                fork: remote.fork,
                hash: Some(RequestBlock {
                    index: 2 * want.start,
                    nodes: want.nodes,
                }),
                ..Default::default()
            };
            let proof = remote.proof(&request).await.unwrap();
            reorg.update(local, &proof).await.unwrap();

            round_trips += 1;
            assert!(round_trips <= 8, "reorg did not converge");
        }
        (reorg, round_trips)
    }

    #[tokio::test]
    async fn test_shorter_remote_with_shared_prefix() {
        let local = tree_with(10).await;
        let remote = fork_of(1, 1).await;

        let (reorg, round_trips) = converge(&local, &remote).await;
        assert_eq!(reorg.ancestors(), 1);
        assert_eq!(round_trips, 0);
        assert_eq!(reorg.batch.length, 1);
    }

    #[tokio::test]
    async fn test_divergence_inside_a_root() {
        let local = tree_with(10).await;
        let remote = fork_of(5, 12).await;

        let (reorg, round_trips) = converge(&local, &remote).await;
        assert_eq!(reorg.ancestors(), 5);
        assert!(round_trips <= 4);
        assert_eq!(reorg.batch.hash(), remote.hash());
    }

    #[tokio::test]
    async fn test_committed_reorg_matches_remote() {
        let mut local = tree_with(10).await;
        let remote = fork_of(3, 7).await;

        let (reorg, _) = converge(&local, &remote).await;
        assert_eq!(reorg.ancestors(), 3);

        local.commit(reorg.into_batch()).unwrap();
        assert_eq!(local.length, 7);
        assert_eq!(local.fork, 1);
        assert_eq!(local.hash(), remote.hash());
        assert_eq!(local.get(6).await.unwrap(), Node::leaf(6, b"fork #3"));
        assert!(!local.has(8).await.unwrap());
        assert!(local.has(4).await.unwrap());
    }

    #[tokio::test]
    async fn test_unrelated_proof_is_ignored() {
        let local = tree_with(10).await;
        let remote = fork_of(5, 12).await;
        let mut reorg = local.reorg(&full_upgrade(&remote).await).await.unwrap();

        let request = Request {
            hash: Some(RequestBlock { index: 18, nodes: 1 }),
            ..Default::default()
        };
        let proof = remote.proof(&request).await.unwrap();

        assert!(!reorg.update(&local, &proof).await.unwrap());
        assert!(!reorg.finished());
    }

    #[tokio::test]
    async fn test_proof_without_upgrade_is_rejected() {
        let local = tree_with(4).await;
        let remote = fork_of(2, 4).await;

        let request = Request {
            block: Some(RequestBlock { index: 1, nodes: 0 }),
            ..Default::default()
        };
        let mut proof = remote.proof(&request).await.unwrap();
        proof.block.as_mut().unwrap().value = Some(b"x".to_vec());

        assert!(local.reorg(&proof).await.is_err());
    }
}
