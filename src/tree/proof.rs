//! Proof generation.
//!
//! A proof carries up to three node lists: the path of a block (or of an
//! arbitrary node for hash requests), the path of the node holding a byte
//! offset, and the nodes needed to grow the requester's roots to a new
//! length. Lists overlap as little as possible: when one path ends inside a
//! subtree that another list would otherwise include whole, the path is
//! spliced in instead.

use serde::{Deserialize, Serialize};

use crate::{flat_tree::Iterator, prelude::*, verifier::Manifest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBlock {
    pub index: u64,
    /// How many levels of the path the requester is missing.
    pub nodes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSeek {
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestUpgrade {
    pub start: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub fork: u64,
    pub block: Option<RequestBlock>,
    /// Like `block`, but `index` is a tree index and no value is sent.
    pub hash: Option<RequestBlock>,
    pub seek: Option<RequestSeek>,
    pub upgrade: Option<RequestUpgrade>,
    /// Whether the requester still needs the manifest.
    pub manifest: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBlock {
    pub index: u64,
    pub value: Option<Vec<u8>>,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataHash {
    pub index: u64,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSeek {
    pub bytes: u64,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataUpgrade {
    pub start: u64,
    pub length: u64,
    pub nodes: Vec<Node>,
    pub additional_nodes: Vec<Node>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub fork: u64,
    pub block: Option<DataBlock>,
    pub hash: Option<DataHash>,
    pub seek: Option<DataSeek>,
    pub upgrade: Option<DataUpgrade>,
    pub manifest: Option<Manifest>,
}

/// The block or hash part of a request, in tree indices.
#[derive(Debug, Clone, Copy)]
struct Indexed {
    index: u64,
    nodes: u64,
    /// Whether the value travels with the proof, making the leaf itself
    /// redundant.
    value: bool,
    last_index: u64,
}

impl Indexed {
    fn from_request(request: &Request) -> Option<Self> {
        if let Some(block) = request.block {
            return Some(Self {
                index: 2 * block.index,
                nodes: block.nodes,
                value: true,
                last_index: block.index,
            });
        }
        request.hash.map(|hash| Self {
            index: hash.index,
            nodes: hash.nodes,
            value: false,
            last_index: flat_tree::right_span(hash.index) / 2,
        })
    }
}

/// Node indices per proof section, resolved to nodes once complete.
#[derive(Debug, Default)]
struct Layout {
    node: Option<Vec<u64>>,
    seek: Option<Vec<u64>>,
    upgrade: Option<Vec<u64>>,
    additional: Option<Vec<u64>>,
}

impl Layout {
    fn block_and_seek(&mut self, node: Option<&Indexed>, seek: bool, seek_root: u64, root: u64) {
        let Some(node) = node else {
            return self.seek(seek_root, root);
        };

        let mut ite = Iterator::new(node.index);
        let mut nodes = Vec::new();
        if !node.value {
            nodes.push(ite.index);
        }

        while ite.index != root {
            ite.sibling();
            if seek && ite.contains(seek_root) && ite.index != seek_root {
                self.seek(seek_root, ite.index);
            } else {
                nodes.push(ite.index);
            }
            ite.parent();
        }

        self.node = Some(nodes);
    }

    fn seek(&mut self, seek_root: u64, root: u64) {
        let mut ite = Iterator::new(seek_root);
        let mut nodes = vec![seek_root];

        while ite.index != root {
            ite.sibling();
            nodes.push(ite.index);
            ite.parent();
        }

        self.seek = Some(nodes);
    }

    fn spliceable(&self, ite: &Iterator, sub_tree: u64) -> bool {
        self.node.is_none() && self.seek.is_none() && ite.contains(sub_tree)
    }

    fn upgrade(&mut self, node: Option<&Indexed>, seek: bool, from: u64, to: u64, sub_tree: u64) {
        let mut upgrade = (from == 0).then(Vec::new);
        let mut ite = Iterator::new(0);

        while ite.full_root(to) {
            if ite.index + ite.factor / 2 < from {
                ite.next_tree();
                continue;
            }

            if upgrade.is_none() && ite.contains(from - 2) {
                let mut nodes = Vec::new();
                let root = ite.index;
                let target = from - 2;

                ite.seek(target);
                while ite.index != root {
                    ite.sibling();
                    if ite.index > target {
                        if self.spliceable(&ite, sub_tree) {
                            self.block_and_seek(node, seek, sub_tree, ite.index);
                        } else {
                            nodes.push(ite.index);
                        }
                    }
                    ite.parent();
                }

                upgrade = Some(nodes);
                ite.next_tree();
                continue;
            }

            let nodes = upgrade.get_or_insert_with(Vec::new);
            if self.spliceable(&ite, sub_tree) {
                self.block_and_seek(node, seek, sub_tree, ite.index);
            } else {
                nodes.push(ite.index);
            }
            ite.next_tree();
        }

        self.upgrade = upgrade;
    }

    fn additional_upgrade(&mut self, from: u64, to: u64) {
        let mut additional = None;
        let mut ite = Iterator::new(0);

        while ite.full_root(to) {
            if ite.index + ite.factor / 2 < from {
                ite.next_tree();
                continue;
            }

            if additional.is_none() && ite.contains(from - 2) {
                let mut nodes = Vec::new();
                let root = ite.index;
                let target = from - 2;

                ite.seek(target);
                while ite.index != root {
                    ite.sibling();
                    if ite.index > target {
                        nodes.push(ite.index);
                    }
                    ite.parent();
                }

                additional = Some(nodes);
                ite.next_tree();
                continue;
            }

            additional.get_or_insert_with(Vec::new).push(ite.index);
            ite.next_tree();
        }

        self.additional = additional;
    }
}

/// The ancestor `nodes` levels above `index`, which must stay below `head`.
fn nodes_to_root(index: u64, nodes: u64, head: u64) -> Result<u64> {
    let mut ite = Iterator::new(index);
    for _ in 0..nodes {
        ite.parent();
        if ite.contains(head) {
            return Err(Error::InvalidRequest("nodes is out of bounds".into()));
        }
    }
    Ok(ite.index)
}

impl MerkleTree {
    async fn resolve(&self, indices: Option<Vec<u64>>) -> Result<Option<Vec<Node>>> {
        let Some(indices) = indices else {
            return Ok(None);
        };

        let mut nodes = Vec::with_capacity(indices.len());
        for index in indices {
            nodes.push(self.get(index).await?);
        }
        Ok(Some(nodes))
    }

    /// Builds the proof answering `request`. Block values are not filled in.
    pub async fn proof(&self, request: &Request) -> Result<Proof> {
        let head = 2 * self.length;
        let (from, to) = match request.upgrade {
            Some(upgrade) => (2 * upgrade.start, 2 * (upgrade.start + upgrade.length)),
            None => (0, head),
        };
        let node = Indexed::from_request(request);
        let seek = request.seek.map(|s| s.bytes);

        if from >= to || to > head {
            return Err(Error::InvalidRequest("invalid upgrade".into()));
        }
        if seek.is_some() && request.upgrade.is_some() && node.is_some_and(|n| n.index >= from) {
            return Err(Error::InvalidRequest(
                "cannot seek and request a block past the upgrade start".into(),
            ));
        }

        let mut layout = Layout::default();
        let mut sub_tree = head;

        let below_upgrade = node.filter(|n| {
            request
                .upgrade
                .map_or(true, |upgrade| n.last_index < upgrade.start)
        });

        if let Some(indexed) = below_upgrade {
            sub_tree = nodes_to_root(indexed.index, indexed.nodes, to)?;
            let seek_root = match seek {
                Some(bytes) => self.seek_untrusted_tree(sub_tree, bytes).await?,
                None => head,
            };
            layout.block_and_seek(Some(&indexed), seek.is_some(), seek_root, sub_tree);
        } else if request.upgrade.is_some() {
            match (seek, node) {
                (Some(bytes), _) => sub_tree = self.seek_from_head(to, bytes).await?,
                (None, Some(indexed)) => sub_tree = indexed.index,
                (None, None) => {}
            }
        }

        if request.upgrade.is_some() {
            layout.upgrade(node.as_ref(), seek.is_some(), from, to, sub_tree);
            if head > to {
                layout.additional_upgrade(to, head);
            }
        }

        let node_nodes = self.resolve(layout.node).await?.unwrap_or_default();
        let seek_nodes = self.resolve(layout.seek).await?;
        let upgrade_nodes = self.resolve(layout.upgrade).await?;
        let additional_nodes = self.resolve(layout.additional).await?;

        Ok(Proof {
            fork: self.fork,
            block: request.block.map(|block| DataBlock {
                index: block.index,
                value: None,
                nodes: node_nodes.clone(),
            }),
            hash: request.hash.map(|hash| DataHash {
                index: hash.index,
                nodes: node_nodes.clone(),
            }),
            seek: seek.zip(seek_nodes).map(|(bytes, nodes)| DataSeek { bytes, nodes }),
            upgrade: request.upgrade.map(|upgrade| DataUpgrade {
                start: upgrade.start,
                length: upgrade.length,
                nodes: upgrade_nodes.unwrap_or_default(),
                additional_nodes: additional_nodes.unwrap_or_default(),
                signature: self.signature.clone().unwrap_or_default(),
            }),
            manifest: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::testing::*;
    use proptest::prelude::*;
    use test_strategy::proptest;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
    }

    fn with_value(mut proof: Proof) -> Proof {
        if let Some(data) = proof.block.as_mut() {
            data.value = Some(block(data.index));
        }
        proof
    }

    #[tokio::test]
    async fn test_block_proof_without_upgrade() {
        let source = tree_with(4).await;
        let request = Request {
            block: Some(RequestBlock { index: 1, nodes: 2 }),
            ..Default::default()
        };

        let proof = source.proof(&request).await.unwrap();
        let nodes: Vec<u64> = proof.block.as_ref().unwrap().nodes.iter().map(|n| n.index).collect();
        assert_eq!(nodes, vec![0, 5]);
        assert!(proof.upgrade.is_none());
    }

    #[tokio::test]
    async fn test_full_upgrade_lists_roots() {
        let source = tree_with(5).await;
        let request = Request {
            upgrade: Some(RequestUpgrade { start: 0, length: 5 }),
            ..Default::default()
        };

        let proof = source.proof(&request).await.unwrap();
        let upgrade = proof.upgrade.unwrap();
        let roots: Vec<u64> = upgrade.nodes.iter().map(|n| n.index).collect();
        assert_eq!(roots, vec![3, 8]);
        assert!(upgrade.additional_nodes.is_empty());
    }

    #[tokio::test]
    async fn test_partial_upgrade_with_additional_nodes() {
        let source = tree_with(10).await;
        let request = Request {
            upgrade: Some(RequestUpgrade { start: 3, length: 3 }),
            ..Default::default()
        };

        let proof = source.proof(&request).await.unwrap();
        let upgrade = proof.upgrade.unwrap();
        let nodes: Vec<u64> = upgrade.nodes.iter().map(|n| n.index).collect();
        let additional: Vec<u64> = upgrade.additional_nodes.iter().map(|n| n.index).collect();

        assert_eq!(nodes, vec![6, 9]);
        assert_eq!(additional, vec![13, 17]);
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let source = tree_with(4).await;

        let past_head = Request {
            upgrade: Some(RequestUpgrade { start: 2, length: 3 }),
            ..Default::default()
        };
        assert!(matches!(source.proof(&past_head).await, Err(Error::InvalidRequest(_))));

        let empty = Request {
            upgrade: Some(RequestUpgrade { start: 2, length: 0 }),
            ..Default::default()
        };
        assert!(matches!(source.proof(&empty).await, Err(Error::InvalidRequest(_))));

        let ambiguous = Request {
            block: Some(RequestBlock { index: 3, nodes: 0 }),
            seek: Some(RequestSeek { bytes: 1 }),
            upgrade: Some(RequestUpgrade { start: 1, length: 3 }),
            ..Default::default()
        };
        assert!(matches!(source.proof(&ambiguous).await, Err(Error::InvalidRequest(_))));
    }

    #[proptest(fork = false, cases = 48)]
    fn test_block_and_upgrade_roundtrip(
        #[strategy(1u64..40)] length: u64,
        #[strategy(0u64..#length)] known: u64,
        #[strategy(0u64..#length)] index: u64,
    ) {
        runtime().block_on(async {
            let source = tree_with(length).await;
            let mut target = tree_with(known).await;

            let request = Request {
                block: Some(RequestBlock { index, nodes: 0 }),
                upgrade: Some(RequestUpgrade { start: known, length: length - known }),
                ..Default::default()
            };
            let proof = with_value(source.proof(&request).await.unwrap());

            let batch = target.verify(&proof).await.unwrap();
            prop_assert_eq!(batch.hash(), source.hash());
            prop_assert_eq!(batch.length, length);

            target.commit(batch).unwrap();
            prop_assert_eq!(target.get(2 * index).await.unwrap(), source.get(2 * index).await.unwrap());
            Ok(())
        })?;
    }

    #[proptest(fork = false, cases = 48)]
    fn test_seek_and_upgrade_roundtrip(
        #[strategy(1u64..30)] length: u64,
        #[strategy(0u64..1000)] bytes: u64,
    ) {
        runtime().block_on(async {
            let source = tree_with(length).await;
            let mut target = empty_tree().await;
            let bytes = bytes % (source.byte_length + 1);

            let request = Request {
                seek: Some(RequestSeek { bytes }),
                upgrade: Some(RequestUpgrade { start: 0, length }),
                ..Default::default()
            };
            let proof = source.proof(&request).await.unwrap();
            let batch = target.verify(&proof).await.unwrap();
            target.commit(batch).unwrap();

            prop_assert_eq!(target.seek(bytes).await.unwrap(), source.seek(bytes).await.unwrap());
            Ok(())
        })?;
    }
}
