use proptest::prelude::*;
use serde::{Deserialize, Serialize};

use crate::prelude::*;

/// Size of a node record in the tree file.
pub const NODE_SIZE: u64 = 40;

/// A node of the tree. `size` is the number of bytes below it, which for a
/// leaf is the block length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub index: u64,
    pub size: u64,
    pub hash: Hash,
}

impl Node {
    pub fn new(index: u64, hash: Hash, size: u64) -> Self {
        Self { index, size, hash }
    }

    pub fn leaf(index: u64, data: &[u8]) -> Self {
        Self {
            index,
            size: data.len() as u64,
            hash: Hash::leaf::<Blake2b256>(data),
        }
    }

    /// The parent at `index` of two siblings, given in any order.
    pub fn parent(index: u64, a: &Node, b: &Node) -> Self {
        let (left, right) = if a.index < b.index { (a, b) } else { (b, a) };
        let size = left.size + right.size;

        Self {
            index,
            size,
            hash: Hash::parent::<Blake2b256>(size, &left.hash, &right.hash),
        }
    }

    /// The tombstone written over positions that no longer exist.
    pub fn blank(index: u64) -> Self {
        Self {
            index,
            size: 0,
            hash: Hash::zero(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.index & 1 == 0
    }

    /// Decodes the on-disk record stored for `index`.
    pub fn decode(index: u64, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != NODE_SIZE as usize {
            return Err(Error::CorruptTree(format!(
                "node {} has {} bytes",
                index,
                bytes.len()
            )));
        }

        let size = u64::from_le_bytes(bytes[32..].try_into()?);
        Ok(Self {
            index,
            size,
            hash: Hash::from_slice(&bytes[..32]),
        })
    }
}

impl ToBytes for Node {
    type Output = [u8; NODE_SIZE as usize];

    /// `hash ‖ size` with the size little-endian. The index is implied by
    /// the position in the file.
    fn to_bytes(&self) -> Self::Output {
        let mut out = [0u8; NODE_SIZE as usize];
        out[..32].copy_from_slice(self.hash.as_ref());
        out[32..].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

impl Arbitrary for Node {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        (any::<u32>(), any::<u32>(), any::<Hash>())
            .prop_map(|(index, size, hash)| Node::new(index as u64, hash, size as u64))
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_strategy::proptest;

    #[test]
    fn test_blank_is_blank() {
        assert!(Node::blank(7).is_blank());
        assert!(!Node::leaf(0, b"").is_blank());
    }

    #[test]
    fn test_parent_operand_order_does_not_matter() {
        let a = Node::leaf(0, b"a");
        let b = Node::leaf(2, b"b");

        assert_eq!(Node::parent(1, &a, &b), Node::parent(1, &b, &a));
        assert_eq!(Node::parent(1, &a, &b).size, 2);
    }

    #[proptest(fork = false)]
    fn test_record_roundtrip(node: Node) {
        prop_assert_eq!(Node::decode(node.index, &node.to_bytes())?, node);
    }

    #[test]
    fn test_short_record_is_corrupt() {
        assert!(matches!(
            Node::decode(0, &[0u8; 12]),
            Err(Error::CorruptTree(_))
        ));
    }
}
