//! Applying data from peers.
//!
//! Proofs that upgrade the tree are verified one at a time. Everything else
//! goes through a shared queue: whoever finds it idle drains it, verifying
//! all proofs queued meanwhile under a single lock and oplog write.

use std::collections::BTreeMap;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{status, Core, CoreEvent};
use crate::{
    oplog::{BitfieldEntry, OplogEntry},
    prelude::*,
    tree::{tree_hash, DataBlock, ReorgBatch},
    verifier::Verifier,
};

type Queued = (Proof, Option<u64>, oneshot::Sender<Result<bool>>);

#[derive(Debug, Default)]
pub(super) struct VerifyQueue {
    pending: Vec<Queued>,
    running: bool,
}

/// Marks the current task as the one draining the queue. If it is dropped
/// mid-way, the queue is released and whatever is left fails.
struct Drainer<'a> {
    core: &'a Core,
    done: bool,
}

impl Drop for Drainer<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut queue = self.core.verifies();
        queue.running = false;
        for (_, _, tx) in queue.pending.drain(..) {
            let _ = tx.send(Err(Error::RequestCancelled));
        }
    }
}

/// A proof that passed verification, waiting to be committed.
struct Staged {
    batch: TreeBatch,
    block: Option<(u64, Vec<u8>)>,
    from: Option<u64>,
}

impl Staged {
    fn bits(&self) -> Option<BitfieldEntry> {
        self.block.as_ref().map(|(index, _)| BitfieldEntry {
            start: *index,
            length: 1,
            drop: false,
        })
    }
}

impl Core {
    fn verifies(&self) -> std::sync::MutexGuard<'_, VerifyQueue> {
        self.inner.verifies.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Checks `proof` against the local tree and stores what it carries.
    /// `Ok(false)` means the proof was for another fork or is stale.
    pub async fn verify(&self, proof: Proof, from: Option<u64>) -> Result<bool> {
        if proof.upgrade.is_some() {
            self.verify_exclusive(proof, from).await
        } else {
            self.verify_shared(proof, from).await
        }
    }

    async fn verify_exclusive(&self, proof: Proof, from: Option<u64>) -> Result<bool> {
        let _guard = self.inner.mutex.lock().await?;
        let mut oplog = self.inner.oplog.lock().await;

        let (staged, adopted) = {
            let state = self.inner.state.read().await;
            let Some(upgrade) = &proof.upgrade else {
                return Ok(false);
            };
            if proof.fork != state.tree.fork || upgrade.start + upgrade.length <= state.tree.length {
                return Ok(false);
            }

            let adopted = match (&state.verifier, &proof.manifest) {
                (None, Some(manifest)) if manifest.hash() == self.inner.key => {
                    Some(Verifier::new(manifest.clone())?)
                }
                _ => None,
            };
            let verifier = match &adopted {
                Some(verifier) => verifier,
                None => state.verifier()?,
            };

            let batch = state.tree.verify(&proof).await?;
            if !verifier.verify(&batch, batch.signature.as_deref().unwrap_or_default()) {
                return Err(Error::InvalidSignature);
            }

            let block = match &proof.block {
                Some(DataBlock {
                    index,
                    value: Some(value),
                    ..
                }) if !state.bitfield.get(*index) => {
                    self.write_proof_block(&state, &batch, *index, value).await?;
                    Some((*index, value.clone()))
                }
                _ => None,
            };

            (Staged { batch, block, from }, adopted)
        };

        let bits = staged.bits();
        oplog
            .append(
                &[OplogEntry {
                    tree_nodes: staged.batch.nodes.clone(),
                    tree_upgrade: Some(staged.batch.upgrade_record()),
                    bitfield: bits,
                    ..Default::default()
                }],
                false,
            )
            .await?;

        let mut state = self.inner.state.write().await;
        let length = staged.batch.length;
        state.tree.commit(staged.batch)?;
        if let Some(verifier) = adopted {
            state.adopt(verifier);
        }

        let mut status = status::UPGRADED;
        if let Some(bits) = bits {
            let mut interlude = BitInterlude::new();
            interlude.set(bits.start, true);
            status |= state.apply_bits(&interlude);
        }
        state.header.tree = state.tree.head();

        debug!(target: "mulog::core", length, from, "verified upgrade");
        self.emit(CoreEvent::Update {
            status,
            bitfield: bits,
            value: staged.block.map(|(_, value)| value),
            from,
        });
        self.settle(&mut state, &mut oplog).await?;
        Ok(true)
    }

    async fn verify_shared(&self, proof: Proof, from: Option<u64>) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        let leads = {
            let mut queue = self.verifies();
            queue.pending.push((proof, from, tx));
            !std::mem::replace(&mut queue.running, true)
        };

        if leads {
            let mut drainer = Drainer {
                core: self,
                done: false,
            };
            loop {
                let queued = {
                    let mut queue = self.verifies();
                    if queue.pending.is_empty() {
                        queue.running = false;
                        break;
                    }
                    std::mem::take(&mut queue.pending)
                };

                let (proofs, senders): (Vec<_>, Vec<_>) = queued
                    .into_iter()
                    .map(|(proof, from, tx)| ((proof, from), tx))
                    .unzip();

                match self.verify_many(&proofs).await {
                    Ok(results) => {
                        for (tx, result) in senders.into_iter().zip(results) {
                            let _ = tx.send(result);
                        }
                    }
                    Err(error) => {
                        for tx in senders {
                            let _ = tx.send(Err(error.clone()));
                        }
                    }
                }
            }
            drainer.done = true;
        }

        rx.await.map_err(|_| Error::RequestCancelled)?
    }

    /// Verifies and commits a group of proofs that do not upgrade the tree.
    /// The outer error is a local failure that affects all of them.
    async fn verify_many(&self, proofs: &[(Proof, Option<u64>)]) -> Result<Vec<Result<bool>>> {
        let _guard = self.inner.mutex.lock().await?;
        let mut oplog = self.inner.oplog.lock().await;

        let mut results = Vec::with_capacity(proofs.len());
        let mut staged = Vec::new();
        {
            let state = self.inner.state.read().await;
            let mut written = BitInterlude::new();

            for (proof, from) in proofs {
                if proof.fork != state.tree.fork {
                    results.push(Ok(false));
                    continue;
                }
                let batch = match state.tree.verify(proof).await {
                    Ok(batch) => batch,
                    Err(error) => {
                        results.push(Err(error));
                        continue;
                    }
                };

                let block = match &proof.block {
                    Some(DataBlock {
                        index,
                        value: Some(value),
                        ..
                    }) if !written.get(&state.bitfield, *index) => {
                        self.write_proof_block(&state, &batch, *index, value).await?;
                        written.set(*index, true);
                        Some((*index, value.clone()))
                    }
                    _ => None,
                };

                staged.push(Staged {
                    batch,
                    block,
                    from: *from,
                });
                results.push(Ok(true));
            }
        }

        if staged.is_empty() {
            return Ok(results);
        }

        let entries: Vec<_> = staged
            .iter()
            .map(|s| OplogEntry {
                tree_nodes: s.batch.nodes.clone(),
                bitfield: s.bits(),
                ..Default::default()
            })
            .collect();
        oplog.append(&entries, false).await?;

        let mut state = self.inner.state.write().await;
        for s in staged {
            let bits = s.bits();
            state.tree.commit(s.batch)?;

            let mut status = 0;
            if let Some(bits) = bits {
                let mut interlude = BitInterlude::new();
                interlude.set(bits.start, true);
                status |= state.apply_bits(&interlude);
            }

            self.emit(CoreEvent::Update {
                status,
                bitfield: bits,
                value: s.block.map(|(_, value)| value),
                from: s.from,
            });
        }
        self.settle(&mut state, &mut oplog).await?;

        debug!(target: "mulog::core", proofs = proofs.len(), "verified batch");
        Ok(results)
    }

    /// Checks a peer's signed upgrade from zero against our tree. Returns
    /// `true` if the proof was bad or disagrees with us, in which case a
    /// [`CoreEvent::Conflict`] is emitted for the latter.
    pub async fn check_conflict(&self, proof: &Proof, from: Option<u64>) -> Result<bool> {
        if proof.upgrade.is_none() {
            return Ok(false);
        }

        let length = {
            let _guard = self.inner.mutex.lock().await?;
            let state = self.inner.state.read().await;
            if proof.fork != state.tree.fork {
                return Ok(false);
            }

            let Some(verifier) = &state.verifier else {
                return Ok(true);
            };
            let Ok(remote) = state.tree.verify_fully_remote(proof) else {
                return Ok(true);
            };
            if state.tree.length < remote.length {
                return Ok(false);
            }
            if !verifier.verify(&remote, remote.signature.as_deref().unwrap_or_default()) {
                return Ok(true);
            }

            let local = state.tree.get_roots(remote.length).await?;
            if tree_hash(&local) == remote.hash() {
                return Ok(false);
            }
            remote.length
        };

        warn!(target: "mulog::core", length, fork = proof.fork, from, "conflicting tree");
        self.emit(CoreEvent::Conflict {
            length,
            fork: proof.fork,
            from,
        });
        Ok(true)
    }

    /// Starts a reorg towards the signed remote tree in `proof`, which must
    /// carry an upgrade from zero.
    pub async fn reorg(&self, proof: &Proof) -> Result<ReorgBatch> {
        let state = self.inner.state.read().await;
        let reorg = state.tree.reorg(proof).await?;

        let signature = reorg.batch.signature.as_deref().unwrap_or_default();
        if !state.verifier()?.verify(&reorg.batch, signature) {
            return Err(Error::InvalidSignature);
        }
        Ok(reorg)
    }

    /// Feeds a hash proof into an ongoing reorg. `Ok(false)` if it did not
    /// belong to the current step.
    pub async fn update_reorg(&self, reorg: &mut ReorgBatch, proof: &Proof) -> Result<bool> {
        let state = self.inner.state.read().await;
        reorg.update(&state.tree, proof).await
    }

    /// Commits a reorg whose shared prefix was found.
    pub async fn verify_reorg(&self, reorg: ReorgBatch, from: Option<u64>) -> Result<()> {
        let _guard = self.inner.mutex.lock().await?;
        let mut oplog = self.inner.oplog.lock().await;

        if !reorg.finished() {
            return Err(Error::InvalidOperation(
                "reorg has not found its ancestors yet".into(),
            ));
        }
        if !reorg.batch.commitable(&self.inner.state.read().await.tree) {
            return Err(Error::InvalidOperation(
                "tree moved while the reorg was running".into(),
            ));
        }

        self.apply_truncation(reorg.into_batch(), &mut oplog, from)
            .await
    }

    /// Fills an empty core with the prologue of its manifest, taken from
    /// `source`. Nodes and whichever blocks `source` holds are copied, and
    /// the result must hash to the prologue.
    pub async fn copy_prologue(&self, source: &Core) -> Result<()> {
        if std::sync::Arc::ptr_eq(&self.inner, &source.inner) {
            return Err(Error::InvalidOperation("cannot copy a core into itself".into()));
        }

        let _guard = self.inner.mutex.lock().await?;
        let mut oplog = self.inner.oplog.lock().await;

        let (batch, runs) = {
            let state = self.inner.state.read().await;
            let verifier = state.verifier()?;
            let prologue = verifier
                .prologue()
                .ok_or_else(|| Error::InvalidOperation("core has no prologue".into()))?;

            if state.tree.length >= prologue.length {
                return Ok(());
            }
            if state.tree.length > 0 {
                return Err(Error::InvalidOperation(
                    "prologue can only be copied into an empty core".into(),
                ));
            }

            let src = source.inner.state.read().await;
            if src.tree.length < prologue.length {
                return Err(Error::InvalidOperation(
                    "source is shorter than the prologue".into(),
                ));
            }

            let roots = src.tree.get_roots(prologue.length).await?;
            let mut batch = state.tree.batch();
            batch.byte_length = roots.iter().map(|r| r.size).sum();
            batch.roots = roots.clone();
            batch.length = prologue.length;
            batch.signature = None;
            batch.upgraded = true;

            if !verifier.verify(&batch, &[]) {
                return Err(Error::InvalidOperation(
                    "source does not match the prologue".into(),
                ));
            }

            let mut nodes: BTreeMap<u64, Node> = roots.iter().map(|r| (r.index, *r)).collect();
            let mut runs = Vec::new();
            let mut i = 0;

            while let Some(first) = src.bitfield.find_first(true, i).filter(|f| *f < prologue.length) {
                let stop = src
                    .bitfield
                    .find_first(false, first)
                    .unwrap_or(prologue.length)
                    .min(prologue.length);

                for index in first..stop {
                    let mut ite = flat_tree::Iterator::new(2 * index);
                    while !nodes.contains_key(&ite.index) {
                        nodes.insert(ite.index, src.tree.get(ite.index).await?);
                        let sibling = flat_tree::sibling(ite.index);
                        if !nodes.contains_key(&sibling) {
                            nodes.insert(sibling, src.tree.get(sibling).await?);
                        }
                        ite.parent();
                    }
                }
                runs.push((first, stop));
                i = stop;
            }
            batch.nodes = nodes.into_values().collect();

            for (start, end) in &runs {
                for index in *start..*end {
                    let value = source
                        .read_block(&src, index)
                        .await?
                        .ok_or(Error::BlockNotAvailable(index))?;
                    self.write_proof_block(&state, &batch, index, &value).await?;
                }
            }

            (batch, runs)
        };

        let mut entries = vec![OplogEntry {
            tree_nodes: batch.nodes.clone(),
            tree_upgrade: Some(batch.upgrade_record()),
            ..Default::default()
        }];
        entries.extend(runs.iter().map(|(start, end)| OplogEntry {
            bitfield: Some(BitfieldEntry {
                start: *start,
                length: end - start,
                drop: false,
            }),
            ..Default::default()
        }));
        oplog.append(&entries, true).await?;

        let mut state = self.inner.state.write().await;
        let length = batch.length;
        state.tree.commit(batch)?;

        let mut interlude = BitInterlude::new();
        for (start, end) in &runs {
            interlude.set_range(*start, *end, true);
        }
        let status = status::UPGRADED | state.apply_bits(&interlude);
        state.header.tree = state.tree.head();
        state.force_flush = true;

        debug!(target: "mulog::core", length, runs = runs.len(), "copied prologue");
        self.emit(CoreEvent::Update {
            status,
            bitfield: None,
            value: None,
            from: None,
        });
        self.settle(&mut state, &mut oplog).await
    }
}
