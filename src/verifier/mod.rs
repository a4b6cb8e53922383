//! Signing and verifying tree heads.
//!
//! A core is identified by the hash of its [`Manifest`], which names the
//! keys allowed to sign it. Version 0 manifests have a single signer that
//! signs the short 48 byte signable. Version 1 manifests require `quorum`
//! of their signers over the 80 byte signable, namespaced by the manifest
//! hash so a signature can never be replayed on another core.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::prelude::*;

mod keys;

pub use keys::{KeyPair, PublicKey, Signature};

const MANIFEST_NAMESPACE: &[u8] = b"mulog/manifest";

/// A prefix of the log that is fixed ahead of time. It is authenticated by
/// its tree hash instead of a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prologue {
    pub hash: Hash,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub quorum: u32,
    pub signers: Vec<PublicKey>,
    pub prologue: Option<Prologue>,
}

impl Manifest {
    pub fn single(signer: PublicKey) -> Self {
        Self {
            version: 0,
            quorum: 1,
            signers: vec![signer],
            prologue: None,
        }
    }

    pub fn multisig(quorum: u32, signers: Vec<PublicKey>) -> Self {
        Self {
            version: 1,
            quorum,
            signers,
            prologue: None,
        }
    }

    pub fn with_prologue(mut self, prologue: Prologue) -> Self {
        self.prologue = Some(prologue);
        self
    }

    /// The core key.
    pub fn hash(&self) -> Hash {
        let mut data = MANIFEST_NAMESPACE.to_vec();
        // Serializing plain integers, keys and hashes cannot fail.
        data.extend(bincode::serialize(self).unwrap_or_default());
        Hash::digest::<Blake2b256>(&data)
    }
}

/// One signer's contribution to a multisig signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerPart {
    /// Position of the signer in [`Manifest::signers`].
    pub signer: u32,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verifier {
    manifest: Manifest,
    key: Hash,
}

impl Verifier {
    pub fn new(manifest: Manifest) -> Result<Self> {
        match manifest.version {
            0 if manifest.signers.len() != 1 => {
                return Err(Error::InvalidOperation(
                    "version 0 manifests have exactly one signer".into(),
                ))
            }
            0 | 1 => {}
            version => {
                return Err(Error::InvalidOperation(format!(
                    "unknown manifest version {}",
                    version
                )))
            }
        }

        let quorum = manifest.quorum as usize;
        if quorum == 0 || quorum > manifest.signers.len() {
            return Err(Error::InvalidOperation(format!(
                "quorum {} is unreachable with {} signers",
                quorum,
                manifest.signers.len()
            )));
        }

        let key = manifest.hash();
        Ok(Self { manifest, key })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn key(&self) -> Hash {
        self.key
    }

    pub fn prologue(&self) -> Option<Prologue> {
        self.manifest.prologue
    }

    fn namespace(&self) -> Option<&Hash> {
        (self.manifest.version > 0).then_some(&self.key)
    }

    pub fn signable(&self, batch: &TreeBatch) -> Vec<u8> {
        batch.signable(self.namespace())
    }

    /// Signs `batch` alone. Only possible when one signature meets the
    /// quorum.
    pub fn sign(&self, batch: &TreeBatch, key_pair: &KeyPair) -> Result<Vec<u8>> {
        let part = self.sign_part(batch, key_pair)?;

        if self.manifest.version == 0 {
            return Ok(part.signature);
        }
        self.assemble(vec![part])
    }

    pub fn sign_part(&self, batch: &TreeBatch, key_pair: &KeyPair) -> Result<SignerPart> {
        let public_key = key_pair.public_key();
        let signer = self
            .manifest
            .signers
            .iter()
            .position(|s| *s == public_key)
            .ok_or_else(|| {
                Error::InvalidOperation(format!("{} is not a signer of this core", public_key))
            })?;

        Ok(SignerPart {
            signer: u32::try_from(signer)?,
            signature: key_pair.sign(&self.signable(batch)).to_bytes_vec(),
        })
    }

    /// Combines parts from distinct signers into one multisig signature.
    pub fn assemble(&self, mut parts: Vec<SignerPart>) -> Result<Vec<u8>> {
        parts.sort_by_key(|p| p.signer);
        parts.dedup_by_key(|p| p.signer);

        if parts.len() < self.manifest.quorum as usize {
            return Err(Error::InvalidOperation(format!(
                "{} of {} signatures",
                parts.len(),
                self.manifest.quorum
            )));
        }
        Ok(bincode::serialize(&parts)?)
    }

    /// Whether `signature` is a valid signature of `batch`, or `batch`
    /// is exactly the prologue.
    pub fn verify(&self, batch: &TreeBatch, signature: &[u8]) -> bool {
        if let Some(prologue) = self.manifest.prologue {
            if batch.length <= prologue.length {
                return batch.length == prologue.length && batch.hash() == prologue.hash;
            }
        }

        let signable = self.signable(batch);
        let valid = if self.manifest.version == 0 {
            self.verify_single(&signable, signature)
        } else {
            self.verify_multisig(&signable, signature)
        };

        trace!(target: "mulog::verifier", length = batch.length, valid, "verified signature");
        valid
    }

    fn verify_single(&self, signable: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_bytes(signature) else {
            return false;
        };
        self.manifest.signers[0].verify(signable, &signature).is_ok()
    }

    fn verify_multisig(&self, signable: &[u8], signature: &[u8]) -> bool {
        let Ok(parts) = bincode::deserialize::<Vec<SignerPart>>(signature) else {
            return false;
        };

        let mut seen = vec![false; self.manifest.signers.len()];
        let mut valid = 0;

        for part in parts {
            let Some(signer) = self.manifest.signers.get(part.signer as usize) else {
                return false;
            };
            if std::mem::replace(&mut seen[part.signer as usize], true) {
                continue;
            }

            let verified = Signature::from_bytes(&part.signature)
                .and_then(|s| signer.verify(signable, &s))
                .is_ok();
            if verified {
                valid += 1;
            }
        }

        valid >= self.manifest.quorum as usize
    }

    /// Checks an append that grows the tree across the prologue: it has to
    /// stop exactly at the prologue and match its hash.
    pub fn check_prologue(&self, batch: &TreeBatch) -> Result<()> {
        let Some(prologue) = self.manifest.prologue else {
            return Ok(());
        };
        if batch.tree_length() >= prologue.length || batch.length < prologue.length {
            return Ok(());
        }

        if batch.length > prologue.length || batch.hash() != prologue.hash {
            return Err(Error::InvalidOperation(
                "append is not consistent with the prologue".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::testing::*;
    use proptest::prelude::*;
    use test_strategy::proptest;

    fn seeded(seed: u8) -> KeyPair {
        KeyPair::from_seed(&[seed; 32])
    }

    #[tokio::test]
    async fn test_single_signer() {
        let key_pair = seeded(1);
        let verifier = Verifier::new(Manifest::single(key_pair.public_key())).unwrap();
        let batch = tree_with(4).await.batch();

        let signature = verifier.sign(&batch, &key_pair).unwrap();
        assert_eq!(signature.len(), 64);
        assert_eq!(verifier.signable(&batch).len(), 48);
        assert!(verifier.verify(&batch, &signature));

        let other = tree_with(5).await.batch();
        assert!(!verifier.verify(&other, &signature));
        assert!(!verifier.verify(&batch, b"short"));
    }

    #[tokio::test]
    async fn test_foreign_key_cannot_sign() {
        let verifier = Verifier::new(Manifest::single(seeded(1).public_key())).unwrap();
        let batch = tree_with(1).await.batch();

        assert!(matches!(
            verifier.sign(&batch, &seeded(2)),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_multisig_quorum() {
        let keys: Vec<KeyPair> = (1..=3).map(seeded).collect();
        let manifest = Manifest::multisig(2, keys.iter().map(|k| k.public_key()).collect());
        let verifier = Verifier::new(manifest).unwrap();
        let batch = tree_with(3).await.batch();

        assert_eq!(verifier.signable(&batch).len(), 80);

        let a = verifier.sign_part(&batch, &keys[0]).unwrap();
        let c = verifier.sign_part(&batch, &keys[2]).unwrap();

        assert!(verifier.assemble(vec![a.clone(), a.clone()]).is_err());

        let signature = verifier.assemble(vec![c, a.clone()]).unwrap();
        assert!(verifier.verify(&batch, &signature));

        let lonely = bincode::serialize(&vec![a.clone(), a]).unwrap();
        assert!(!verifier.verify(&batch, &lonely));
    }

    #[tokio::test]
    async fn test_multisig_rejects_unknown_signer_index() {
        let keys: Vec<KeyPair> = (1..=2).map(seeded).collect();
        let manifest = Manifest::multisig(1, keys.iter().map(|k| k.public_key()).collect());
        let verifier = Verifier::new(manifest).unwrap();
        let batch = tree_with(2).await.batch();

        let mut part = verifier.sign_part(&batch, &keys[1]).unwrap();
        part.signer = 7;
        let signature = bincode::serialize(&vec![part]).unwrap();

        assert!(!verifier.verify(&batch, &signature));
    }

    #[tokio::test]
    async fn test_prologue_replaces_signature() {
        let tree = tree_with(3).await;
        let prologue = Prologue {
            hash: tree.hash(),
            length: 3,
        };
        let manifest = Manifest::single(seeded(1).public_key()).with_prologue(prologue);
        let verifier = Verifier::new(manifest).unwrap();

        assert!(verifier.verify(&tree.batch(), &[]));
        assert!(!verifier.verify(&tree_with(2).await.batch(), &[]));
        assert!(!verifier.verify(&tree_with(4).await.batch(), &[]));
    }

    #[tokio::test]
    async fn test_appends_must_land_on_the_prologue() {
        let source = tree_with(3).await;
        let prologue = Prologue {
            hash: source.hash(),
            length: 3,
        };
        let manifest = Manifest::single(seeded(1).public_key()).with_prologue(prologue);
        let verifier = Verifier::new(manifest).unwrap();

        let empty = tree_with(0).await;
        let mut exact = empty.batch();
        for i in 0..3 {
            exact.append(&block(i));
        }
        assert!(verifier.check_prologue(&exact).is_ok());

        let mut past = exact.clone();
        past.append(&block(3));
        assert!(verifier.check_prologue(&past).is_err());

        let mut wrong = empty.batch();
        for i in 0..3 {
            wrong.append(&block(i + 1));
        }
        assert!(verifier.check_prologue(&wrong).is_err());

        let mut short = empty.batch();
        short.append(&block(0));
        assert!(verifier.check_prologue(&short).is_ok());
    }

    #[test]
    fn test_invalid_manifests() {
        let keys: Vec<PublicKey> = (1..=2).map(|i| seeded(i).public_key()).collect();

        assert!(Verifier::new(Manifest::multisig(0, keys.clone())).is_err());
        assert!(Verifier::new(Manifest::multisig(3, keys.clone())).is_err());

        let mut two_signers = Manifest::single(keys[0]);
        two_signers.signers = keys;
        assert!(Verifier::new(two_signers).is_err());
    }

    #[proptest(fork = false)]
    fn test_manifest_hash_depends_on_signers(a: PublicKey, b: PublicKey) {
        prop_assume!(a != b);
        prop_assert_ne!(Manifest::single(a).hash(), Manifest::single(b).hash());
    }
}
