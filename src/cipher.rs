//! Block encryption at the block store boundary.
//!
//! Hashes are always computed over plaintext, so a cipher never affects
//! proofs. Each stored block is prefixed with `padding()` bytes that carry
//! whatever the cipher needs to decrypt it later.

use std::fmt::Debug;

use digest::Digest;

use crate::prelude::*;

pub trait BlockCipher: Debug + Send + Sync {
    /// Bytes reserved in front of every stored block.
    fn padding(&self) -> usize;

    /// Encrypts `block` in place. The first `padding()` bytes are free for
    /// the cipher to fill.
    fn encrypt(&self, index: u64, block: &mut [u8], fork: u64);

    /// Reverses [`Self::encrypt`] in place, padding included.
    fn decrypt(&self, index: u64, block: &mut [u8]) -> Result<()>;
}

/// XORs the payload with a BLAKE2b-512 keystream derived from
/// `key ‖ fork ‖ index ‖ counter`. The padding holds the fork, so a block
/// written before a truncation still decrypts afterwards.
#[derive(Clone)]
pub struct Blake2Keystream {
    key: [u8; 32],
}

const FORK_PADDING: usize = 8;

impl Blake2Keystream {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    fn apply(&self, index: u64, fork: u64, payload: &mut [u8]) {
        for (counter, chunk) in payload.chunks_mut(64).enumerate() {
            let mut hasher = blake2::Blake2b512::new();
            hasher.update(self.key);
            hasher.update(fork.to_be_bytes());
            hasher.update(index.to_be_bytes());
            hasher.update((counter as u64).to_be_bytes());
            let stream = hasher.finalize();

            for (byte, key) in chunk.iter_mut().zip(stream.iter()) {
                *byte ^= key;
            }
        }
    }
}

impl Debug for Blake2Keystream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blake2Keystream").finish_non_exhaustive()
    }
}

impl BlockCipher for Blake2Keystream {
    fn padding(&self) -> usize {
        FORK_PADDING
    }

    fn encrypt(&self, index: u64, block: &mut [u8], fork: u64) {
        let (padding, payload) = block.split_at_mut(FORK_PADDING);
        padding.copy_from_slice(&fork.to_le_bytes());
        self.apply(index, fork, payload);
    }

    fn decrypt(&self, index: u64, block: &mut [u8]) -> Result<()> {
        if block.len() < FORK_PADDING {
            return Err(Error::FailedDeserialization(format!(
                "block {} is shorter than its padding",
                index
            )));
        }

        let (padding, payload) = block.split_at_mut(FORK_PADDING);
        let fork = u64::from_le_bytes(padding.try_into()?);
        self.apply(index, fork, payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_strategy::proptest;

    fn padded(data: &[u8]) -> Vec<u8> {
        let mut block = vec![0; FORK_PADDING];
        block.extend_from_slice(data);
        block
    }

    #[proptest(fork = false)]
    fn test_decrypt_reverses_encrypt(key: [u8; 32], index: u64, fork: u64, data: Vec<u8>) {
        let cipher = Blake2Keystream::new(key);
        let mut block = padded(&data);

        cipher.encrypt(index, &mut block, fork);
        cipher.decrypt(index, &mut block)?;

        prop_assert_eq!(&block[FORK_PADDING..], &data[..]);
    }

    #[proptest(fork = false)]
    fn test_ciphertext_depends_on_index(key: [u8; 32], index: u64, data: Vec<u8>) {
        prop_assume!(!data.is_empty() && index < u64::MAX);
        let cipher = Blake2Keystream::new(key);

        let mut a = padded(&data);
        let mut b = padded(&data);
        cipher.encrypt(index, &mut a, 0);
        cipher.encrypt(index + 1, &mut b, 0);

        prop_assert_ne!(a, b);
    }

    #[test]
    fn test_padding_carries_the_fork() {
        let cipher = Blake2Keystream::new([7; 32]);
        let mut block = padded(b"hello");

        cipher.encrypt(3, &mut block, 9);
        assert_eq!(&block[..FORK_PADDING], &9u64.to_le_bytes());
        assert_ne!(&block[FORK_PADDING..], b"hello");
    }

    #[test]
    fn test_truncated_block_is_rejected() {
        let cipher = Blake2Keystream::new([0; 32]);
        assert!(cipher.decrypt(0, &mut [0; 4]).is_err());
    }
}
