use std::fmt::{Display, Formatter};
use std::hash::{Hash as StdHash, Hasher};

use digest::Digest;
use proptest::prelude::*;
use proptest::strategy::BoxedStrategy;
use serde::{Deserialize, Serialize};

use crate::{error::Result, prelude::*};

/// The digest every tree in this crate is built with.
pub type Blake2b256 = blake2::Blake2b<digest::consts::U32>;

/// Domain separation prefixes, so a leaf can never be confused with a parent
/// or a root listing.
pub const LEAF_TYPE: u8 = 0;
pub const PARENT_TYPE: u8 = 1;
pub const ROOT_TYPE: u8 = 2;

/// Custom Hash type containing the inner field
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Hash([u8; 32]);

impl Display for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Arbitrary for Hash {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        any::<[u8; 32]>().prop_map(Hash::new).boxed()
    }
}

impl StdHash for Hash {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Hash {
    /// Creates a new Hash from any type that can be converted into [u8; 32].
    pub fn new<T: Into<[u8; 32]>>(data: T) -> Self {
        Hash(data.into())
    }

    pub fn from_slice(slice: &[u8]) -> Self {
        let mut inner = [0u8; 32];
        inner.copy_from_slice(slice);
        Hash(inner)
    }

    /// Returns a zero hash (all bytes set to 0).
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Creates a new Hash from a hexadecimal string.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let bytes = hex::decode(hex)?;

        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength)?;
        }

        Ok(Self::from_slice(&bytes))
    }

    pub fn digest<D: Digest>(data: &[u8]) -> Self {
        let mut hasher = D::new();
        hasher.update(data);
        Hash::from_slice(&hasher.finalize())
    }

    /// `H(LEAF_TYPE ‖ len(data) ‖ data)`.
    pub fn leaf<D: Digest>(data: &[u8]) -> Self {
        let mut hasher = D::new();
        hasher.update([LEAF_TYPE]);
        hasher.update((data.len() as u64).to_be_bytes());
        hasher.update(data);
        Hash::from_slice(&hasher.finalize())
    }

    /// `H(PARENT_TYPE ‖ size ‖ left ‖ right)`. Callers are responsible for
    /// passing the operands ordered by flat-tree index.
    pub fn parent<D: Digest>(size: u64, left: &Hash, right: &Hash) -> Self {
        let mut hasher = D::new();
        hasher.update([PARENT_TYPE]);
        hasher.update(size.to_be_bytes());
        hasher.update(left.as_ref());
        hasher.update(right.as_ref());
        Hash::from_slice(&hasher.finalize())
    }

    /// `H(ROOT_TYPE ‖ for each root: hash ‖ index ‖ size)`.
    pub fn roots<'a, D, I>(roots: I) -> Self
    where
        D: Digest,
        I: IntoIterator<Item = (&'a Hash, u64, u64)>,
    {
        let mut hasher = D::new();
        hasher.update([ROOT_TYPE]);
        for (hash, index, size) in roots {
            hasher.update(hash.as_ref());
            hasher.update(index.to_be_bytes());
            hasher.update(size.to_be_bytes());
        }
        Hash::from_slice(&hasher.finalize())
    }
}

impl Default for Hash {
    fn default() -> Self {
        Hash::zero()
    }
}

impl From<[u8; 32]> for Hash {
    fn from(array: [u8; 32]) -> Self {
        Hash(array)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsMut<[u8]> for Hash {
    fn as_mut(&mut self) -> &mut [u8] {
        self.0.as_mut()
    }
}

impl From<Hash> for [u8; 32] {
    fn from(val: Hash) -> Self {
        val.0
    }
}

impl ToBytes for Hash {
    type Output = [u8; 32];

    fn to_bytes(&self) -> Self::Output {
        self.0
    }
}

impl FromBytes for Hash {
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = bytes.try_into()?;
        Ok(Hash(bytes))
    }
}

impl ToHex for Hash {
    fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromHex for Hash {
    fn from_hex(input: &str) -> Result<Self> {
        Hash::from_hex(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_strategy::proptest;

    macro_rules! generate_domain_tests {
        ($digest:ty) => {
            paste::paste! {
                #[allow(non_snake_case)]
                mod [<$digest _tests>] {
                    use super::*;

                    #[proptest(fork = false)]
                    fn test_leaf_is_not_a_plain_digest(data: Vec<u8>) {
                        prop_assert_ne!(Hash::leaf::<$digest>(&data), Hash::digest::<$digest>(&data));
                    }

                    #[proptest(fork = false)]
                    fn test_leaf_commits_to_length(data: Vec<u8>) {
                        let mut longer = data.clone();
                        longer.push(0);

                        prop_assert_ne!(Hash::leaf::<$digest>(&data), Hash::leaf::<$digest>(&longer));
                    }

                    #[proptest(fork = false)]
                    fn test_parent_commits_to_size(left: Hash, right: Hash, size: u64) {
                        prop_assume!(size < u64::MAX);

                        prop_assert_ne!(
                            Hash::parent::<$digest>(size, &left, &right),
                            Hash::parent::<$digest>(size + 1, &left, &right)
                        );
                    }

                    #[proptest(fork = false)]
                    fn test_parent_is_ordered(left: Hash, right: Hash, size: u64) {
                        prop_assume!(left != right);

                        prop_assert_ne!(
                            Hash::parent::<$digest>(size, &left, &right),
                            Hash::parent::<$digest>(size, &right, &left)
                        );
                    }

                    #[proptest(fork = false)]
                    fn test_roots_commit_to_index(hash: Hash, index: u64, size: u64) {
                        prop_assume!(index < u64::MAX);

                        prop_assert_ne!(
                            Hash::roots::<$digest, _>([(&hash, index, size)]),
                            Hash::roots::<$digest, _>([(&hash, index + 1, size)])
                        );
                    }

                    #[test]
                    fn test_empty_roots_are_stable() {
                        assert_eq!(
                            Hash::roots::<$digest, _>(std::iter::empty()),
                            Hash::digest::<$digest>(&[ROOT_TYPE])
                        );
                    }
                }
            }
        };
    }

    type Blake2b = Blake2b256;
    type Blake3 = blake3::Hasher;
    type Sha256 = sha2::Sha256;

    generate_domain_tests!(Blake2b);
    generate_domain_tests!(Blake3);
    generate_domain_tests!(Sha256);

    #[proptest(fork = false)]
    fn test_hex_roundtrip(a: Hash) {
        prop_assert_eq!(a, Hash::from_hex(&a.to_hex())?);
    }

    #[test]
    fn test_zero() {
        assert!(Hash::zero().is_zero());
        assert!(Hash::default().is_zero());
        assert!(!Hash::leaf::<Blake2b256>(b"").is_zero());
    }
}
