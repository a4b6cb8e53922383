//! A single log: its tree, bitfield and blocks, kept consistent through the
//! oplog.
//!
//! Every mutation runs under the core lock and follows the same order:
//! block data is written first, then the change is journaled, and only then
//! applied in memory. Applied changes reach the tree and bitfield files, and
//! the oplog header, on the next flush.
//!
//! Readers take the state lock shared and never wait on the core lock.

use std::{
    collections::BTreeSet,
    ops::Range,
    sync::{Arc, MutexGuard as StdMutexGuard},
};

use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, instrument};

use crate::{
    block_store::BlockStore,
    cipher::BlockCipher,
    config::CoreOptions,
    mutex::Mutex,
    oplog::{BitfieldEntry, Oplog, OplogEntry, OplogHeader, OplogOpen, ReorgHint, UserDataEntry},
    prelude::*,
    storage::{CoreStorage, Storage},
    tree::{ByteSeek, NodeCache},
    verifier::{Manifest, Verifier},
};

mod audit;
mod session;
mod verify;

pub use audit::AuditReport;
pub use session::{Session, TypedSession};

use session::SessionSlot;
use verify::VerifyQueue;

/// Bits of [`CoreEvent::Update::status`].
pub mod status {
    pub const UPGRADED: u8 = 0b0001;
    pub const TRUNCATED: u8 = 0b0010;
    pub const CONTIG_GREW: u8 = 0b0100;
    pub const CONTIG_SHRANK: u8 = 0b1000;
}

/// Delivered to every open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    Update {
        status: u8,
        bitfield: Option<BitfieldEntry>,
        /// The block that was just verified, if any.
        value: Option<Vec<u8>>,
        /// The peer the change came from.
        from: Option<u64>,
    },
    /// A peer holds a validly signed tree that disagrees with ours.
    Conflict {
        length: u64,
        fork: u64,
        from: Option<u64>,
    },
}

/// Runtime objects that cannot live in [`CoreOptions`].
#[derive(Debug, Clone, Default)]
pub struct CoreHandles {
    pub cipher: Option<Arc<dyn BlockCipher>>,
    /// Shared between cores; a private one is made otherwise.
    pub cache: Option<NodeCache>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreInfo {
    pub key: Hash,
    pub length: u64,
    pub byte_length: u64,
    pub fork: u64,
    pub contiguous_length: u64,
    pub writable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub length: u64,
    pub byte_length: u64,
}

#[derive(Debug)]
struct State {
    header: OplogHeader,
    tree: MerkleTree,
    bitfield: Bitfield,
    verifier: Option<Verifier>,
    /// Bitfield pages changed since the last flush.
    dirty: BTreeSet<u64>,
    /// Mutations since the last flush.
    mutations: u64,
    force_flush: bool,
    closed: bool,
}

#[derive(Debug)]
struct Inner {
    key: Hash,
    options: CoreOptions,
    storage: CoreStorage,
    blocks: BlockStore,
    cipher: Option<Arc<dyn BlockCipher>>,
    mutex: Mutex,
    /// Only touched while holding `mutex`, always before `state`.
    oplog: AsyncMutex<Oplog>,
    state: RwLock<State>,
    sessions: std::sync::Mutex<Vec<SessionSlot>>,
    verifies: std::sync::Mutex<VerifyQueue>,
}

#[derive(Debug, Clone)]
pub struct Core {
    inner: Arc<Inner>,
}

impl State {
    async fn replay(&mut self, entry: OplogEntry) -> Result<()> {
        if let Some(data) = entry.user_data {
            self.header.set_user_data(&data.key, data.value.as_deref());
        }

        match entry.tree_upgrade {
            Some(upgrade) => {
                let batch = self.tree.restore(&upgrade, entry.tree_nodes).await?;
                self.tree.commit(batch)?;
            }
            None => self.tree.add_nodes(entry.tree_nodes),
        }

        if let Some(bits) = entry.bitfield {
            let mut interlude = BitInterlude::new();
            interlude.set_range(bits.start, bits.start + bits.length, !bits.drop);
            self.dirty.extend(interlude.flush(&mut self.bitfield));
        }

        self.header.tree = self.tree.head();
        self.mutations += 1;
        Ok(())
    }

    /// Frees the bytes of blocks in `ranges` the bitfield no longer has,
    /// and anything stored past the end of the tree. Deletes happen after
    /// the oplog entry that drops the blocks, so replaying that entry
    /// finishes what a crash interrupted.
    async fn free_dropped(&self, blocks: &BlockStore, padding: u64, ranges: &[Range<u64>]) -> Result<()> {
        blocks
            .truncate(self.tree.byte_length + self.tree.length * padding)
            .await?;

        let mut spans: Vec<(u64, u64)> = Vec::new();
        for range in ranges {
            for index in range.start..range.end.min(self.tree.length) {
                if self.bitfield.get(index) || !self.tree.has(2 * index).await? {
                    continue;
                }
                let Ok((offset, size)) = self.tree.byte_range(index).await else {
                    continue;
                };
                let (from, length) = (offset + index * padding, size + padding);
                match spans.last_mut() {
                    Some((start, len)) if *start + *len == from => *len += length,
                    _ => spans.push((from, length)),
                }
            }
        }
        for (offset, length) in spans {
            blocks.clear(offset, length).await?;
        }
        Ok(())
    }

    fn verifier(&self) -> Result<&Verifier> {
        self.verifier
            .as_ref()
            .ok_or_else(|| Error::InvalidOperation("the manifest of this core is not known".into()))
    }

    fn adopt(&mut self, verifier: Verifier) {
        info!(target: "mulog::core", key = %verifier.key(), "adopted manifest");
        self.header.manifest = Some(verifier.manifest().clone());
        self.verifier = Some(verifier);
        self.force_flush = true;
    }

    /// Applies pending bit edits and returns the contiguity status bits.
    fn apply_bits(&mut self, interlude: &BitInterlude) -> u8 {
        self.dirty.extend(interlude.flush(&mut self.bitfield));

        interlude
            .ranges()
            .fold(0, |status, (start, length, value)| {
                status | self.update_contig(start, start + length, value)
            })
    }

    /// Moves the contiguous length after `start..end` was set to `value`.
    fn update_contig(&mut self, start: u64, end: u64, value: bool) -> u8 {
        let current = self.header.hints.contiguous_length;

        let next = if value && start <= current && current <= end {
            self.bitfield.find_first(false, end).unwrap_or(end)
        } else if !value && start < current {
            start
        } else {
            current
        };

        self.header.hints.contiguous_length = next;
        match next.cmp(&current) {
            std::cmp::Ordering::Greater => status::CONTIG_GREW,
            std::cmp::Ordering::Less => status::CONTIG_SHRANK,
            std::cmp::Ordering::Equal => 0,
        }
    }

    fn push_reorg_hint(&mut self, hint: ReorgHint, limit: usize) {
        let reorgs = &mut self.header.hints.reorgs;
        reorgs.push(hint);
        if reorgs.len() > limit {
            reorgs.drain(..reorgs.len() - limit);
        }
    }

    fn should_flush(&self, options: &CoreOptions, oplog: &Oplog) -> bool {
        self.force_flush
            || self.mutations >= options.flush_interval
            || oplog.byte_length() >= options.max_oplog_size
    }

    /// Persists everything applied so far and folds it into the header.
    async fn flush(&mut self, bitfield: &dyn Storage, oplog: &mut Oplog) -> Result<()> {
        self.bitfield.write_pages(bitfield, &self.dirty).await?;
        self.dirty.clear();
        self.tree.flush().await?;

        self.header.tree = self.tree.head();
        oplog.flush(&self.header).await?;

        debug!(
            target: "mulog::core",
            length = self.tree.length,
            mutations = self.mutations,
            "flushed"
        );
        self.mutations = 0;
        self.force_flush = false;
        Ok(())
    }
}

fn initial_header(options: &CoreOptions) -> Result<OplogHeader> {
    let manifest = options
        .manifest
        .clone()
        .or_else(|| options.key_pair.as_ref().map(|kp| Manifest::single(kp.public_key())));

    let key = match (&manifest, options.key) {
        (Some(manifest), Some(key)) if manifest.hash() != key => {
            return Err(Error::InvalidOperation(
                "manifest does not match the given key".into(),
            ));
        }
        (Some(manifest), _) => manifest.hash(),
        (None, Some(key)) => key,
        (None, None) => {
            return Err(Error::InvalidOperation(
                "a key pair, a manifest or a key is required to create a core".into(),
            ));
        }
    };

    Ok(OplogHeader {
        key,
        manifest,
        key_pair: options.key_pair.clone(),
        ..Default::default()
    })
}

impl Core {
    /// Opens the core held by `storage`, creating it if allowed, and replays
    /// whatever the oplog journaled since its last flush.
    #[instrument(skip_all)]
    pub async fn open(storage: CoreStorage, options: CoreOptions, handles: CoreHandles) -> Result<Self> {
        if options.overwrite {
            storage.truncate_all().await?;
        }

        let OplogOpen {
            mut oplog,
            header,
            entries,
        } = Oplog::open(storage.oplog.clone(), storage.header.clone()).await?;

        let header = match header {
            Some(header) => {
                if options.key.is_some_and(|key| key != header.key) {
                    return Err(Error::InvalidOperation(
                        "storage holds a different core".into(),
                    ));
                }
                header
            }
            None if options.create_if_missing => {
                let header = initial_header(&options)?;
                oplog.flush(&header).await?;
                info!(target: "mulog::core", key = %header.key, "created core");
                header
            }
            None => {
                return Err(Error::InvalidOperation("storage holds no core".into()));
            }
        };

        let cache = handles
            .cache
            .or_else(|| (options.tree_cache_size > 0).then(|| NodeCache::new(options.tree_cache_size)));
        let tree = MerkleTree::open(storage.tree.clone(), &header.tree, cache).await?;
        let bitfield = Bitfield::open(&*storage.bitfield).await?;
        let verifier = header.manifest.clone().map(Verifier::new).transpose()?;

        let mut state = State {
            header,
            tree,
            bitfield,
            verifier,
            dirty: BTreeSet::new(),
            mutations: 0,
            force_flush: false,
            closed: false,
        };

        let replayed = entries.len();
        let mut dropped = Vec::new();
        for entry in entries {
            if let Some(bits) = entry.bitfield.filter(|bits| bits.drop) {
                dropped.push(bits.start..bits.start + bits.length);
            }
            state.replay(entry).await?;
        }
        state.header.hints.contiguous_length = state.bitfield.contiguous_length();

        let blocks = BlockStore::new(storage.data.clone());
        if !dropped.is_empty() {
            let padding = handles.cipher.as_ref().map_or(0, |c| c.padding() as u64);
            state.free_dropped(&blocks, padding, &dropped).await?;
        }

        if replayed > 0 {
            state.flush(&*storage.bitfield, &mut oplog).await?;
        }

        info!(
            target: "mulog::core",
            key = %state.header.key,
            length = state.tree.length,
            fork = state.tree.fork,
            replayed,
            "opened core"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                key: state.header.key,
                blocks,
                options,
                storage,
                cipher: handles.cipher,
                mutex: Mutex::new(),
                oplog: AsyncMutex::new(oplog),
                state: RwLock::new(state),
                sessions: Default::default(),
                verifies: Default::default(),
            }),
        })
    }

    pub fn key(&self) -> Hash {
        self.inner.key
    }

    pub fn options(&self) -> &CoreOptions {
        &self.inner.options
    }

    pub async fn info(&self) -> CoreInfo {
        let state = self.inner.state.read().await;
        CoreInfo {
            key: self.inner.key,
            length: state.tree.length,
            byte_length: state.tree.byte_length,
            fork: state.tree.fork,
            contiguous_length: state.header.hints.contiguous_length,
            writable: state.header.key_pair.is_some(),
        }
    }

    pub async fn length(&self) -> u64 {
        self.inner.state.read().await.tree.length
    }

    pub async fn byte_length(&self) -> u64 {
        self.inner.state.read().await.tree.byte_length
    }

    pub async fn fork(&self) -> u64 {
        self.inner.state.read().await.tree.fork
    }

    pub async fn contiguous_length(&self) -> u64 {
        self.inner.state.read().await.header.hints.contiguous_length
    }

    pub async fn manifest(&self) -> Option<Manifest> {
        self.inner.state.read().await.header.manifest.clone()
    }

    /// Recent fork transitions, oldest first.
    pub async fn reorg_hints(&self) -> Vec<ReorgHint> {
        self.inner.state.read().await.header.hints.reorgs.clone()
    }

    pub async fn user_data(&self, key: &str) -> Option<Vec<u8>> {
        let state = self.inner.state.read().await;
        state.header.user_data(key).map(<[u8]>::to_vec)
    }

    pub async fn has(&self, index: u64) -> bool {
        let state = self.inner.state.read().await;
        index < state.tree.length && state.bitfield.get(index)
    }

    /// Reads block `index`, failing if it is not stored locally.
    pub async fn get(&self, index: u64) -> Result<Vec<u8>> {
        let state = self.inner.state.read().await;
        self.read_block(&state, index)
            .await?
            .ok_or(Error::BlockNotAvailable(index))
    }

    pub async fn seek(&self, bytes: u64) -> Result<Option<ByteSeek>> {
        self.inner.state.read().await.tree.seek(bytes).await
    }

    /// The first block in `start..end` not stored locally.
    pub async fn first_missing(&self, start: u64, end: u64) -> Option<u64> {
        let state = self.inner.state.read().await;
        state.bitfield.find_first(false, start).filter(|i| *i < end)
    }

    /// Runs of locally stored blocks in `start..end`, as `(start, length)`.
    pub async fn present_ranges(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        let state = self.inner.state.read().await;
        let mut ranges = Vec::new();
        let mut i = start;

        while let Some(first) = state.bitfield.find_first(true, i).filter(|f| *f < end) {
            let stop = state.bitfield.find_first(false, first).unwrap_or(end).min(end);
            ranges.push((first, stop - first));
            i = stop;
        }
        ranges
    }

    /// Which of blocks `0..length` are stored, one bit each, MSB first.
    pub async fn bitfield_buffer(&self, length: u64) -> Vec<u8> {
        self.inner.state.read().await.bitfield.to_buffer(length)
    }

    pub async fn missing_nodes(&self, index: u64) -> Result<u64> {
        self.inner.state.read().await.tree.missing_nodes(index).await
    }

    /// Answers a peer's request, attaching the block value if one is asked
    /// for.
    pub async fn proof(&self, request: &Request) -> Result<Proof> {
        let state = self.inner.state.read().await;
        let mut proof = state.tree.proof(request).await?;

        if let Some(block) = &mut proof.block {
            block.value = Some(
                self.read_block(&state, block.index)
                    .await?
                    .ok_or(Error::BlockNotAvailable(block.index))?,
            );
        }
        if request.manifest {
            proof.manifest = state.header.manifest.clone();
        }
        Ok(proof)
    }

    /// Appends `blocks` and signs the new head.
    #[instrument(skip_all, fields(blocks = blocks.len()))]
    pub async fn append<B: AsRef<[u8]> + Sync>(&self, blocks: &[B]) -> Result<AppendOutcome> {
        let _guard = self.inner.mutex.lock().await?;
        let mut oplog = self.inner.oplog.lock().await;

        let batch = {
            let state = self.inner.state.read().await;
            let mut batch = state.tree.batch();
            for block in blocks {
                batch.append(block.as_ref());
            }
            batch
        };
        self.insert_locked(&mut oplog, batch, blocks, None).await
    }

    /// An empty draft on top of the current head, to be filled and handed
    /// back to [`Core::insert_batch`].
    pub async fn batch(&self) -> TreeBatch {
        self.inner.state.read().await.tree.batch()
    }

    /// Commits a draft from [`Core::batch`] holding `blocks`. A `signature`
    /// made elsewhere (a multisig quorum, say) is checked; without one the
    /// local key pair signs the new head.
    #[instrument(skip_all, fields(blocks = blocks.len()))]
    pub async fn insert_batch<B: AsRef<[u8]> + Sync>(
        &self,
        batch: TreeBatch,
        blocks: &[B],
        signature: Option<Vec<u8>>,
    ) -> Result<AppendOutcome> {
        let start = batch.tree_length();
        if batch.length != start + blocks.len() as u64 {
            return Err(Error::InvalidOperation(format!(
                "batch holds {} blocks, {} given",
                batch.length.saturating_sub(start),
                blocks.len()
            )));
        }
        let leaves = batch.nodes.iter().filter(|node| node.index % 2 == 0);
        for ((block, index), leaf) in blocks.iter().zip(start..).zip(leaves) {
            if *leaf != Node::leaf(2 * index, block.as_ref()) {
                return Err(Error::ProofMismatch(format!(
                    "block {index} does not match the batch"
                )));
            }
        }

        let _guard = self.inner.mutex.lock().await?;
        let mut oplog = self.inner.oplog.lock().await;
        self.insert_locked(&mut oplog, batch, blocks, signature).await
    }

    /// Writes the blocks of an append draft, journals it and moves the head.
    /// The caller holds the core mutex.
    async fn insert_locked<B: AsRef<[u8]> + Sync>(
        &self,
        oplog: &mut Oplog,
        mut batch: TreeBatch,
        blocks: &[B],
        signature: Option<Vec<u8>>,
    ) -> Result<AppendOutcome> {
        let start = {
            let state = self.inner.state.read().await;
            let verifier = state.verifier()?;
            if signature.is_none() && state.header.key_pair.is_none() {
                return Err(Error::InvalidOperation("core is not writable".into()));
            }

            let start = state.tree.length;
            if blocks.is_empty() {
                return Ok(AppendOutcome {
                    length: start,
                    byte_length: state.tree.byte_length,
                });
            }
            if !batch.commitable(&state.tree) || batch.ancestors != start {
                return Err(Error::InvalidOperation(
                    "batch does not extend the current head".into(),
                ));
            }

            verifier.check_prologue(&batch)?;
            batch.signature = Some(match (signature, &state.header.key_pair) {
                (Some(signature), _) => {
                    if !verifier.verify(&batch, &signature) {
                        return Err(Error::InvalidSignature);
                    }
                    signature
                }
                (None, Some(key_pair)) => verifier.sign(&batch, key_pair)?,
                (None, None) => {
                    return Err(Error::InvalidOperation("core is not writable".into()))
                }
            });

            let offset = state.tree.byte_length + start * self.padding();
            let encoded: Vec<_> = blocks
                .iter()
                .zip(start..)
                .map(|(block, index)| self.encode_block(index, block.as_ref(), state.tree.fork))
                .collect();
            self.inner.blocks.put_batch(offset, &encoded).await?;

            start
        };

        let bits = BitfieldEntry {
            start,
            length: batch.length - start,
            drop: false,
        };
        oplog
            .append(
                &[OplogEntry {
                    tree_nodes: batch.nodes.clone(),
                    tree_upgrade: Some(batch.upgrade_record()),
                    bitfield: Some(bits),
                    ..Default::default()
                }],
                false,
            )
            .await?;

        let mut state = self.inner.state.write().await;
        let outcome = AppendOutcome {
            length: batch.length,
            byte_length: batch.byte_length,
        };
        state.tree.commit(batch)?;

        let mut interlude = BitInterlude::new();
        interlude.set_range(start, outcome.length, true);
        let status = status::UPGRADED | state.apply_bits(&interlude);
        state.header.tree = state.tree.head();

        self.emit(CoreEvent::Update {
            status,
            bitfield: Some(bits),
            value: None,
            from: None,
        });
        self.settle(&mut state, oplog).await?;

        debug!(target: "mulog::core", length = outcome.length, "appended");
        Ok(outcome)
    }

    /// Cuts the log to `length` and moves it to `fork`.
    #[instrument(skip(self))]
    pub async fn truncate(&self, length: u64, fork: u64) -> Result<()> {
        let _guard = self.inner.mutex.lock().await?;
        let mut oplog = self.inner.oplog.lock().await;

        let batch = {
            let state = self.inner.state.read().await;
            let key_pair = state
                .header
                .key_pair
                .as_ref()
                .ok_or_else(|| Error::InvalidOperation("core is not writable".into()))?;
            let verifier = state.verifier()?;

            if length > state.tree.length {
                return Err(Error::InvalidOperation(format!(
                    "cannot truncate to {} past the length {}",
                    length, state.tree.length
                )));
            }
            if verifier.prologue().is_some_and(|p| length < p.length) {
                return Err(Error::InvalidOperation(
                    "cannot truncate into the prologue".into(),
                ));
            }

            let mut batch = state.tree.truncate(length, fork).await?;
            batch.signature = Some(verifier.sign(&batch, key_pair)?);
            batch
        };

        self.apply_truncation(batch, &mut oplog, None).await
    }

    /// Commits a batch that drops everything after `batch.ancestors`, which
    /// is how both truncations and reorgs land.
    async fn apply_truncation(
        &self,
        batch: TreeBatch,
        oplog: &mut Oplog,
        from: Option<u64>,
    ) -> Result<()> {
        let ancestors = batch.ancestors;
        let old_length = batch.tree_length();
        let bits = (old_length > ancestors).then_some(BitfieldEntry {
            start: ancestors,
            length: old_length - ancestors,
            drop: true,
        });

        oplog
            .append(
                &[OplogEntry {
                    tree_nodes: batch.nodes.clone(),
                    tree_upgrade: Some(batch.upgrade_record()),
                    bitfield: bits,
                    ..Default::default()
                }],
                false,
            )
            .await?;

        let mut state = self.inner.state.write().await;
        let data_end = state.tree.byte_offset(2 * ancestors).await? + ancestors * self.padding();
        let from_fork = state.tree.fork;
        let (length, fork) = (batch.length, batch.fork);
        state.tree.commit(batch)?;

        let mut status = status::TRUNCATED;
        if length > ancestors {
            status |= status::UPGRADED;
        }
        if let Some(bits) = bits {
            let mut interlude = BitInterlude::new();
            interlude.set_range(bits.start, bits.start + bits.length, false);
            status |= state.apply_bits(&interlude);
        }
        if fork != from_fork {
            state.push_reorg_hint(
                ReorgHint {
                    from: from_fork,
                    to: fork,
                    ancestors,
                },
                self.inner.options.fork_hint_limit,
            );
        }
        state.header.tree = state.tree.head();

        self.inner.blocks.truncate(data_end).await?;

        info!(target: "mulog::core", ancestors, length, fork, "truncated");
        self.emit(CoreEvent::Update {
            status,
            bitfield: bits,
            value: None,
            from,
        });
        self.settle(&mut state, oplog).await
    }

    /// Drops the local copies of blocks `start..end`. The tree is kept, so
    /// they can be fetched again.
    #[instrument(skip(self))]
    pub async fn clear(&self, start: u64, end: u64) -> Result<()> {
        let _guard = self.inner.mutex.lock().await?;
        let mut oplog = self.inner.oplog.lock().await;

        let (bits, spans) = {
            let state = self.inner.state.read().await;
            let end = end.min(state.tree.length);
            if start >= end {
                return Ok(());
            }

            let padding = self.padding();
            let mut spans = Vec::new();
            let mut i = start;
            while let Some(first) = state.bitfield.find_first(true, i).filter(|f| *f < end) {
                let stop = state.bitfield.find_first(false, first).unwrap_or(end).min(end);
                let (offset, _) = state.tree.byte_range(first).await?;
                let (last, size) = state.tree.byte_range(stop - 1).await?;
                let from = offset + first * padding;
                spans.push((from, last + size + stop * padding - from));
                i = stop;
            }

            let bits = BitfieldEntry {
                start,
                length: end - start,
                drop: true,
            };
            (bits, spans)
        };

        oplog
            .append(
                &[OplogEntry {
                    bitfield: Some(bits),
                    ..Default::default()
                }],
                false,
            )
            .await?;

        let mut state = self.inner.state.write().await;
        let mut interlude = BitInterlude::new();
        interlude.set_range(bits.start, bits.start + bits.length, false);
        let status = state.apply_bits(&interlude);

        for (offset, length) in spans {
            self.inner.blocks.clear(offset, length).await?;
        }

        self.emit(CoreEvent::Update {
            status,
            bitfield: Some(bits),
            value: None,
            from: None,
        });
        self.settle(&mut state, &mut oplog).await
    }

    /// Sets, or with `None` removes, a user data key.
    pub async fn set_user_data(&self, key: &str, value: Option<&[u8]>) -> Result<()> {
        let _guard = self.inner.mutex.lock().await?;
        let mut oplog = self.inner.oplog.lock().await;

        oplog
            .append(
                &[OplogEntry {
                    user_data: Some(UserDataEntry {
                        key: key.to_string(),
                        value: value.map(<[u8]>::to_vec),
                    }),
                    ..Default::default()
                }],
                false,
            )
            .await?;

        let mut state = self.inner.state.write().await;
        state.header.set_user_data(key, value);
        self.settle(&mut state, &mut oplog).await
    }

    /// Installs the manifest of a core that was opened by key only.
    pub async fn set_manifest(&self, manifest: Manifest) -> Result<()> {
        let _guard = self.inner.mutex.lock().await?;
        let mut oplog = self.inner.oplog.lock().await;
        let mut state = self.inner.state.write().await;

        if let Some(existing) = &state.header.manifest {
            if *existing == manifest {
                return Ok(());
            }
            return Err(Error::InvalidOperation(
                "core already has a different manifest".into(),
            ));
        }
        if manifest.hash() != self.inner.key {
            return Err(Error::InvalidOperation(
                "manifest does not match the core key".into(),
            ));
        }

        state.adopt(Verifier::new(manifest)?);
        state.flush(&*self.inner.storage.bitfield, &mut oplog).await
    }

    /// Writes everything applied so far.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.inner.mutex.lock().await?;
        let mut oplog = self.inner.oplog.lock().await;
        let mut state = self.inner.state.write().await;
        state.flush(&*self.inner.storage.bitfield, &mut oplog).await
    }

    /// Flushes and closes the core. Queued mutations still run; later ones
    /// fail with [`Error::SessionClosed`].
    pub async fn close(&self) -> Result<()> {
        if let Ok(_guard) = self.inner.mutex.lock().await {
            let mut oplog = self.inner.oplog.lock().await;
            let mut state = self.inner.state.write().await;
            if !state.closed {
                state.flush(&*self.inner.storage.bitfield, &mut oplog).await?;
                state.closed = true;
            }
        }

        self.inner.mutex.destroy(None).await;
        self.inner.storage.close_all().await?;
        self.sessions().clear();
        debug!(target: "mulog::core", key = %self.inner.key, "closed");
        Ok(())
    }

    /// Closes the core and deletes its files.
    pub async fn purge(&self) -> Result<()> {
        self.inner.mutex.destroy(Some(Error::SessionClosed)).await;
        self.inner.state.write().await.closed = true;
        self.inner.storage.unlink_all().await?;
        self.sessions().clear();
        info!(target: "mulog::core", key = %self.inner.key, "purged");
        Ok(())
    }

    fn sessions(&self) -> StdMutexGuard<'_, Vec<SessionSlot>> {
        self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: CoreEvent) {
        for slot in self.sessions().iter() {
            let _ = slot.tx.send(event.clone());
        }
    }

    /// Counts a finished mutation and flushes when one is due.
    async fn settle(&self, state: &mut State, oplog: &mut Oplog) -> Result<()> {
        state.mutations += 1;
        if state.should_flush(&self.inner.options, oplog) {
            state.flush(&*self.inner.storage.bitfield, oplog).await?;
        }
        Ok(())
    }

    fn padding(&self) -> u64 {
        self.inner.cipher.as_ref().map_or(0, |c| c.padding() as u64)
    }

    fn encode_block(&self, index: u64, data: &[u8], fork: u64) -> Vec<u8> {
        let Some(cipher) = &self.inner.cipher else {
            return data.to_vec();
        };

        let mut block = vec![0; cipher.padding()];
        block.extend_from_slice(data);
        cipher.encrypt(index, &mut block, fork);
        block
    }

    async fn read_block(&self, state: &State, index: u64) -> Result<Option<Vec<u8>>> {
        if index >= state.tree.length || !state.bitfield.get(index) {
            return Ok(None);
        }

        let padding = self.padding();
        let (offset, size) = state.tree.byte_range(index).await?;
        let Some(mut block) = self
            .inner
            .blocks
            .get(offset + index * padding, size + padding)
            .await?
        else {
            return Ok(None);
        };

        if let Some(cipher) = &self.inner.cipher {
            cipher.decrypt(index, &mut block)?;
            block.drain(..cipher.padding());
        }
        Ok(Some(block))
    }

    /// Stores a verified block at its place in the tree described by
    /// `batch`.
    async fn write_proof_block(
        &self,
        state: &State,
        batch: &TreeBatch,
        index: u64,
        value: &[u8],
    ) -> Result<()> {
        let offset = state
            .tree
            .byte_offset_in(&batch.roots, &batch.nodes, 2 * index)
            .await?;
        let block = self.encode_block(index, value, batch.fork);
        self.inner
            .blocks
            .put(offset + index * self.padding(), &block)
            .await
    }
}
