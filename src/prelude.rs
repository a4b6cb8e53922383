pub use crate::{
    bitfield::{BitInterlude, Bitfield},
    error::*,
    flat_tree,
    hash::*,
    tree::{MerkleTree, Node, Proof, Request, TreeBatch},
};

pub trait FromBytes
where
    Self: Sized,
{
    fn from_bytes(bytes: &[u8]) -> Result<Self>;
}

pub trait ToBytes {
    type Output: AsRef<[u8]>;

    /// Converts the value to a representation in bytes.
    fn to_bytes(&self) -> Self::Output;

    /// Converts the value to a representation in bytes, as a vector.
    ///
    /// This is a convenience method, and automatically derived from `to_bytes`.
    fn to_bytes_vec(&self) -> Vec<u8> {
        self.to_bytes().as_ref().to_vec()
    }

    /// Checks if the value (as bytes) is zero.
    ///
    /// Absent tree nodes and empty pages are all-zero on disk, so this doubles
    /// as the blank check.
    fn is_blank(&self) -> bool {
        self.to_bytes().as_ref().iter().all(|b| *b == 0)
    }
}

pub trait FromHex
where
    Self: Sized,
{
    fn from_hex(hex: &str) -> Result<Self>;
}

pub trait ToHex {
    fn to_hex(&self) -> String;
}
