use std::fmt::{Debug, Display, Formatter};

use ed25519_dalek::{
    Signature as Ed25519Signature, Signer, SigningKey, Verifier as _, VerifyingKey,
    SECRET_KEY_LENGTH,
};
use proptest::prelude::*;
use serde::{Deserialize, Serialize};

use crate::prelude::*;

/// The writer's signing key. Serialized as its 32 byte seed, which is how
/// the oplog header persists it.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "[u8; 32]", into = "[u8; 32]")]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut rand::thread_rng()),
        }
    }

    pub fn from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.signing_key.verifying_key().into()
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data).into()
    }
}

impl From<[u8; SECRET_KEY_LENGTH]> for KeyPair {
    fn from(seed: [u8; SECRET_KEY_LENGTH]) -> Self {
        Self::from_seed(&seed)
    }
}

impl From<KeyPair> for [u8; SECRET_KEY_LENGTH] {
    fn from(key_pair: KeyPair) -> Self {
        key_pair.signing_key.to_bytes()
    }
}

impl Debug for KeyPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish()
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public_key() == other.public_key()
    }
}

impl Eq for KeyPair {}

impl Arbitrary for KeyPair {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        any::<[u8; SECRET_KEY_LENGTH]>()
            .prop_map(|seed| Self::from_seed(&seed))
            .boxed()
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl_associate_bytes_types!(PublicKey);

impl PublicKey {
    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<()> {
        let signature = Ed25519Signature::from_bytes(&signature.0);
        let key = VerifyingKey::from_bytes(&self.0)?;

        key.verify(data, &signature)
            .map_err(|_| Error::InvalidSignature)
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_hex()).finish()
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl ToBytes for PublicKey {
    type Output = [u8; 32];

    fn to_bytes(&self) -> Self::Output {
        self.0
    }
}

impl FromBytes for PublicKey {
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|e| {
            Error::FailedDeserialization(format!(
                "expected a 32 byte public key, got `{}`: {}",
                hex::encode(bytes),
                e
            ))
        })?;

        Ok(VerifyingKey::from_bytes(&bytes)?.into())
    }
}

impl From<VerifyingKey> for PublicKey {
    fn from(key: VerifyingKey) -> Self {
        Self(*key.as_bytes())
    }
}

impl Arbitrary for PublicKey {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        any::<KeyPair>().prop_map(|k| k.public_key()).boxed()
    }
}

/// A detached ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl_associate_bytes_types!(Signature);

impl Debug for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Signature").field(&self.to_hex()).finish()
    }
}

impl ToBytes for Signature {
    type Output = [u8; 64];

    fn to_bytes(&self) -> Self::Output {
        self.0
    }
}

impl FromBytes for Signature {
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 64] = bytes.try_into().map_err(|_| Error::InvalidSignature)?;
        Ok(Self(bytes))
    }
}

impl From<Ed25519Signature> for Signature {
    fn from(signature: Ed25519Signature) -> Self {
        Self(signature.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_strategy::proptest;

    #[proptest(fork = false)]
    fn test_sign_and_verify(key_pair: KeyPair, data: Vec<u8>) {
        let signature = key_pair.sign(&data);
        prop_assert!(key_pair.public_key().verify(&data, &signature).is_ok());
    }

    #[proptest(fork = false)]
    fn test_only_the_signer_verifies(a: KeyPair, b: KeyPair, data: Vec<u8>) {
        prop_assume!(a != b);

        let signature = a.sign(&data);
        prop_assert!(matches!(
            b.public_key().verify(&data, &signature),
            Err(Error::InvalidSignature)
        ));
    }

    #[proptest(fork = false)]
    fn test_tampered_data_fails(key_pair: KeyPair, data: Vec<u8>) {
        let signature = key_pair.sign(&data);
        let mut tampered = data.clone();
        tampered.push(1);

        prop_assert!(key_pair.public_key().verify(&tampered, &signature).is_err());
    }

    #[proptest(fork = false)]
    fn test_key_pair_serde_keeps_the_seed(key_pair: KeyPair) {
        let bytes = bincode::serialize(&key_pair)?;
        let decoded: KeyPair = bincode::deserialize(&bytes)?;

        prop_assert_eq!(decoded, key_pair);
    }

    #[proptest(fork = false)]
    fn test_public_key_hex_roundtrip(key: PublicKey) {
        prop_assert_eq!(key, PublicKey::from_hex(&key.to_hex())?);
    }

    #[test]
    fn test_short_signature_is_invalid() {
        assert!(matches!(
            Signature::from_bytes(&[0; 63]),
            Err(Error::InvalidSignature)
        ));
    }
}
