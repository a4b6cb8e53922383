//! Sparse replication of a core between peers.
//!
//! A [`Replicator`] owns a session on its core and talks to any number of
//! peers over byte channels carrying framed [`Message`]s. Callers ask for
//! blocks, ranges, upgrades or byte offsets; the replicator turns those wants
//! into requests spread over the peers able to serve them, verifies answers
//! into the core and announces local changes back out.
//!
//! Only peers on the local fork are asked for data. A peer on a newer fork
//! starts a reorg: its signed head is fetched, the shared prefix is narrowed
//! down through hash requests and the core then moves onto the remote tree.
//!
//! A request left unanswered for `request_timeout_ticks` ticks is cancelled,
//! and its block is not asked of that peer again for as long.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use rand::{
    rngs::StdRng,
    seq::{IteratorRandom, SliceRandom},
    Rng, SeedableRng,
};
use tokio::{
    sync::{mpsc, oneshot, Mutex, MutexGuard},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    config::ReplicatorOptions,
    flat_tree,
    core::{status, Core, CoreEvent, Session},
    prelude::*,
    tree::{ByteSeek, ReorgBatch, RequestBlock, RequestSeek, RequestUpgrade},
};

mod message;
mod peer;
mod request;

pub use message::{FrameDecoder, Message, PeerId, MAX_MESSAGE_SIZE};

use peer::Peer;
use request::{Inflight, Kind, RangeWant, SeekWant, UpgradeWant, Waiters};

/// A reorg running against one peer.
#[derive(Debug)]
struct Reorg {
    peer: PeerId,
    /// `None` until the remote head arrived.
    batch: Option<ReorgBatch>,
}

/// The parts of the core's head that requests are built from.
#[derive(Debug, Clone, Copy)]
struct Local {
    length: u64,
    fork: u64,
    needs_manifest: bool,
}

#[derive(Debug)]
struct State {
    session: Session,
    peers: BTreeMap<PeerId, Peer>,
    next_peer: PeerId,
    next_request: u64,
    inflight: HashMap<u64, Inflight>,
    blocks: BTreeMap<u64, Waiters<()>>,
    ranges: Vec<RangeWant>,
    seeks: Vec<SeekWant>,
    upgrade: Option<UpgradeWant>,
    /// The one request allowed to grow the tree at a time.
    upgrading: Option<u64>,
    reorg: Option<Reorg>,
    extensions: BTreeMap<String, mpsc::UnboundedSender<(PeerId, Vec<u8>)>>,
    rng: StdRng,
    closed: bool,
}

impl State {
    fn requested(&self, index: u64) -> bool {
        self.inflight.values().any(|r| r.kind == Kind::Block(index))
    }

    fn seeking(&self, bytes: u64) -> bool {
        self.inflight.values().any(|r| r.kind == Kind::Seek(bytes))
    }

    /// Forgets request `id`, provided it went to `peer`.
    fn finish(&mut self, peer: PeerId, id: u64) -> Option<Inflight> {
        if self.inflight.get(&id)?.peer != peer {
            return None;
        }

        let request = self.inflight.remove(&id)?;
        if let Some(remote) = self.peers.get_mut(&peer) {
            remote.inflight = remote.inflight.saturating_sub(1);
        }
        if self.upgrading == Some(id) {
            self.upgrading = None;
        }
        Some(request)
    }

    /// Whether `id` is a request to `peer` whose answer is verified into
    /// the core.
    fn verifies(&self, peer: PeerId, id: u64) -> bool {
        self.inflight.get(&id).is_some_and(|request| {
            request.peer == peer
                && matches!(request.kind, Kind::Block(_) | Kind::Upgrade | Kind::Seek(_))
        })
    }

    fn remove_peer(&mut self, id: PeerId) {
        if self.peers.remove(&id).is_none() {
            return;
        }

        let orphaned: Vec<u64> = self
            .inflight
            .iter()
            .filter(|(_, r)| r.peer == id)
            .map(|(request, _)| *request)
            .collect();
        for request in &orphaned {
            self.inflight.remove(request);
            if self.upgrading == Some(*request) {
                self.upgrading = None;
            }
        }
        if self.reorg.as_ref().is_some_and(|r| r.peer == id) {
            self.reorg = None;
        }

        info!(
            target: "mulog::replicator",
            peer = id,
            orphaned = orphaned.len(),
            "peer removed"
        );
    }

    /// Gives up on the running reorg, blaming the fork `peer` is on.
    fn abandon_reorg(&mut self, peer: PeerId) {
        self.reorg = None;
        if let Some(remote) = self.peers.get_mut(&peer) {
            remote.bad_fork = Some(remote.fork);
        }
    }

    fn wants_upgrade(&self, length: u64) -> bool {
        self.upgrade.is_some()
            || self.blocks.keys().next_back().is_some_and(|i| *i >= length)
            || self.ranges.iter().any(|r| r.end > length)
    }

    fn extension_names(&self) -> Vec<String> {
        self.extensions.keys().cloned().collect()
    }

    fn broadcast(&self, message: &Message) {
        for peer in self.peers.values() {
            peer.send(message);
        }
    }
}

#[derive(Debug)]
struct Inner {
    core: Core,
    options: ReplicatorOptions,
    state: Mutex<State>,
}

/// Replicates one core with any number of peers.
#[derive(Debug, Clone)]
pub struct Replicator {
    inner: Arc<Inner>,
}

impl Replicator {
    pub fn new(core: Core, options: ReplicatorOptions) -> Self {
        let state = State {
            session: core.session(),
            peers: BTreeMap::new(),
            next_peer: 0,
            next_request: 0,
            inflight: HashMap::new(),
            blocks: BTreeMap::new(),
            ranges: Vec::new(),
            seeks: Vec::new(),
            upgrade: None,
            upgrading: None,
            reorg: None,
            extensions: BTreeMap::new(),
            rng: StdRng::from_entropy(),
            closed: false,
        };

        Self {
            inner: Arc::new(Inner {
                core,
                options,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn core(&self) -> &Core {
        &self.inner.core
    }

    async fn lock(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.inner.state.lock().await;
        if state.closed {
            return Err(Error::SessionClosed);
        }
        Ok(state)
    }

    async fn local(&self) -> Local {
        let core = &self.inner.core;
        let info = core.info().await;

        Local {
            length: info.length,
            fork: info.fork,
            needs_manifest: core.manifest().await.is_none(),
        }
    }

    /// Starts replicating with a new peer. Frames for the peer are queued on
    /// `tx`; frames it sends back go to [`Replicator::on_data`].
    #[instrument(skip_all)]
    pub async fn add_peer(&self, tx: mpsc::UnboundedSender<Vec<u8>>) -> Result<PeerId> {
        let mut state = self.lock().await?;
        let core = &self.inner.core;
        let info = core.info().await;

        let id = state.next_peer;
        state.next_peer += 1;

        let peer = Peer::new(id, tx);
        peer.send(&Message::Handshake { key: core.key() });
        peer.send(&Message::Options {
            extensions: state.extension_names(),
        });
        peer.send(&Message::Info {
            length: info.length,
            fork: info.fork,
        });
        if info.length > 0 {
            let bitfield = if info.contiguous_length < info.length {
                Some(core.bitfield_buffer(info.length).await)
            } else {
                None
            };
            peer.send(&Message::Have {
                start: 0,
                length: info.length,
                bitfield,
            });
        }

        state.peers.insert(id, peer);
        info!(target: "mulog::replicator", peer = id, "peer added");
        Ok(id)
    }

    /// Drops a peer. Its unanswered requests go back to the other peers.
    pub async fn remove_peer(&self, id: PeerId) -> Result<()> {
        let mut state = self.lock().await?;
        state.remove_peer(id);
        self.update(&mut state).await;
        Ok(())
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        self.inner.state.lock().await.peers.keys().copied().collect()
    }

    /// Requests waiting on an answer.
    pub async fn inflight(&self) -> usize {
        self.inner.state.lock().await.inflight.len()
    }

    /// Feeds bytes received from `peer`. Frames may be split or merged
    /// arbitrarily. A malformed frame drops the peer.
    pub async fn on_data(&self, peer: PeerId, bytes: &[u8]) -> Result<()> {
        let mut state = self.lock().await?;

        let decoded = match state.peers.get_mut(&peer) {
            Some(remote) => {
                remote.decoder.push(bytes);
                drain(remote)
            }
            None => return Ok(()),
        };
        let messages = match decoded {
            Ok(messages) => messages,
            Err(error) => {
                warn!(target: "mulog::replicator", peer, %error, "malformed frame");
                state.remove_peer(peer);
                self.update(&mut state).await;
                return Err(error);
            }
        };

        for message in messages {
            if !state.peers.contains_key(&peer) {
                break;
            }
            match message {
                // Verifying may wait on storage and on other verifies, so it
                // runs without the replicator lock.
                Message::Data { id, proof } if state.verifies(peer, id) => {
                    trace!(target: "mulog::replicator", peer, id, "recv data");
                    drop(state);
                    let result = self.inner.core.verify(proof, Some(peer)).await;
                    state = self.lock().await?;
                    self.on_verified(&mut state, peer, id, result);
                }
                message => self.handle(&mut state, peer, message).await,
            }
        }
        self.refresh_locked(&mut state).await;
        Ok(())
    }

    async fn handle(&self, state: &mut State, from: PeerId, message: Message) {
        trace!(target: "mulog::replicator", peer = from, ?message, "recv");
        let core = &self.inner.core;

        match message {
            Message::Handshake { key } => {
                if key != core.key() {
                    warn!(target: "mulog::replicator", peer = from, "peer replicates another core");
                    if let Some(remote) = state.peers.get(&from) {
                        remote.send(&Message::Close);
                    }
                    state.remove_peer(from);
                }
            }
            Message::Options { extensions } => {
                if let Some(remote) = state.peers.get_mut(&from) {
                    remote.extensions = extensions;
                }
            }
            Message::Info { length, fork } => {
                let Some(remote) = state.peers.get_mut(&from) else {
                    return;
                };

                let reforked = fork != remote.fork;
                if reforked {
                    remote.have = Bitfield::new();
                    remote.skip.clear();
                    remote.seek_skip.clear();
                    remote.checked = 0;
                } else if length < remote.length {
                    remote.have.set_range(length, remote.length - length, false);
                }
                remote.length = length;
                remote.fork = fork;
                remote.synced = true;

                if reforked && length > 0 {
                    remote.send(&Message::Want { start: 0, length });
                }
            }
            Message::Have {
                start,
                length,
                bitfield,
            } => {
                let Some(remote) = state.peers.get_mut(&from) else {
                    return;
                };
                let announced = match bitfield {
                    Some(bytes) => remote.announce_buffer(start, &bytes),
                    None => remote.announce(start, length, true),
                };
                if let Err(error) = announced {
                    warn!(target: "mulog::replicator", peer = from, %error, "dropping peer");
                    state.remove_peer(from);
                }
            }
            Message::Unhave { start, length } => {
                let Some(remote) = state.peers.get_mut(&from) else {
                    return;
                };
                if let Err(error) = remote.announce(start, length, false) {
                    warn!(target: "mulog::replicator", peer = from, %error, "dropping peer");
                    state.remove_peer(from);
                }
            }
            Message::Want { start, length } => {
                let ranges = core.present_ranges(start, start.saturating_add(length)).await;
                if let Some(remote) = state.peers.get(&from) {
                    for (start, length) in ranges {
                        remote.send(&Message::Have {
                            start,
                            length,
                            bitfield: None,
                        });
                    }
                }
            }
            // Requests are answered as they arrive, so there is nothing to
            // cancel, and every change is announced to everyone.
            Message::Unwant { .. } | Message::Cancel { .. } => {}
            Message::Request { id, request } => self.serve(state, from, id, request).await,
            Message::Data { id, proof } => self.on_proof(state, from, id, proof).await,
            Message::NoData { id } => self.on_no_data(state, from, id).await,
            Message::Extension { name, data } => match state.extensions.get(&name) {
                Some(tx) => {
                    let _ = tx.send((from, data));
                }
                None => debug!(target: "mulog::replicator", peer = from, %name, "unknown extension"),
            },
            Message::Close => state.remove_peer(from),
        }
    }

    async fn serve(&self, state: &State, from: PeerId, id: u64, request: Request) {
        let core = &self.inner.core;
        let fork = core.fork().await;
        let proof = if request.fork == fork {
            core.proof(&request).await
        } else {
            Err(Error::InvalidRequest(format!(
                "asked for fork {} while on {}",
                request.fork, fork
            )))
        };

        let Some(remote) = state.peers.get(&from) else {
            return;
        };
        match proof {
            Ok(proof) => {
                remote.send(&Message::Data { id, proof });
            }
            Err(error) => {
                debug!(target: "mulog::replicator", peer = from, id, %error, "cannot serve request");
                remote.send(&Message::NoData { id });
            }
        }
    }

    async fn on_proof(&self, state: &mut State, from: PeerId, id: u64, proof: Proof) {
        let Some(request) = state.finish(from, id) else {
            debug!(target: "mulog::replicator", peer = from, id, "unsolicited data");
            return;
        };
        let core = &self.inner.core;

        match request.kind {
            Kind::ForkProof => self.start_reorg(state, from, &proof).await,
            Kind::Reorg => self.continue_reorg(state, from, &proof).await,
            Kind::ConflictCheck => {
                if let Err(error) = core.check_conflict(&proof, Some(from)).await {
                    debug!(target: "mulog::replicator", peer = from, %error, "conflict check failed");
                }
            }
            // Answered through `on_verified`.
            Kind::Block(_) | Kind::Upgrade | Kind::Seek(_) => {}
        }
    }

    fn on_verified(&self, state: &mut State, from: PeerId, id: u64, result: Result<bool>) {
        let kind = state.finish(from, id).map(|request| request.kind);

        match result {
            Ok(true) => {}
            Ok(false) => {
                debug!(target: "mulog::replicator", peer = from, id, "proof no longer applies")
            }
            Err(error) => {
                if error.is_protocol() {
                    warn!(target: "mulog::replicator", peer = from, id, %error, "peer sent an invalid proof");
                } else {
                    debug!(target: "mulog::replicator", peer = from, id, %error, "proof rejected");
                }
                if let (Some(Kind::Block(index)), Some(remote)) = (kind, state.peers.get_mut(&from)) {
                    remote
                        .skip
                        .insert(index, self.inner.options.request_timeout_ticks.max(1));
                }
            }
        }
    }

    async fn on_no_data(&self, state: &mut State, from: PeerId, id: u64) {
        let Some(request) = state.finish(from, id) else {
            return;
        };
        debug!(target: "mulog::replicator", peer = from, id, kind = ?request.kind, "peer has no data");

        let length = self.inner.core.length().await;
        match request.kind {
            Kind::Block(index) => {
                if let Some(remote) = state.peers.get_mut(&from) {
                    remote
                        .skip
                        .insert(index, self.inner.options.request_timeout_ticks.max(1));
                }
            }
            // The peer cannot prove the length it announced.
            Kind::Upgrade => {
                if let Some(remote) = state.peers.get_mut(&from) {
                    remote.length = remote.length.min(length);
                }
            }
            Kind::Seek(bytes) => {
                if let Some(remote) = state.peers.get_mut(&from) {
                    remote.length = remote.length.min(length);
                    remote
                        .seek_skip
                        .insert(bytes, self.inner.options.request_timeout_ticks.max(1));
                }
            }
            Kind::ForkProof | Kind::Reorg => state.abandon_reorg(from),
            Kind::ConflictCheck => {}
        }
    }

    async fn start_reorg(&self, state: &mut State, from: PeerId, proof: &Proof) {
        match self.inner.core.reorg(proof).await {
            Ok(batch) => {
                info!(target: "mulog::replicator", peer = from, fork = proof.fork, "peer is on a newer fork");
                self.step_reorg(state, from, batch).await;
            }
            Err(error) => {
                warn!(target: "mulog::replicator", peer = from, %error, "peer failed to prove its fork");
                state.abandon_reorg(from);
            }
        }
    }

    async fn step_reorg(&self, state: &mut State, from: PeerId, batch: ReorgBatch) {
        let Some(want) = batch.want else {
            return self.commit_reorg(state, from, batch).await;
        };
        let Some(fork) = state.peers.get(&from).map(|p| p.fork) else {
            state.reorg = None;
            return;
        };

        let request = Request {
            fork,
            hash: Some(RequestBlock {
                index: 2 * want.start,
                nodes: want.nodes,
            }),
            ..Default::default()
        };
        state.reorg = Some(Reorg {
            peer: from,
            batch: Some(batch),
        });
        if !self.send_request(state, from, Kind::Reorg, request) {
            state.reorg = None;
        }
    }

    async fn continue_reorg(&self, state: &mut State, from: PeerId, proof: &Proof) {
        let Some(Reorg {
            peer,
            batch: Some(mut batch),
        }) = state.reorg.take()
        else {
            return;
        };
        if peer != from {
            return;
        }

        match self.inner.core.update_reorg(&mut batch, proof).await {
            Ok(true) => self.step_reorg(state, from, batch).await,
            Ok(false) => {
                warn!(target: "mulog::replicator", peer = from, "reorg step did not match the request");
                state.abandon_reorg(from);
            }
            Err(error) => {
                warn!(target: "mulog::replicator", peer = from, %error, "invalid reorg step");
                state.abandon_reorg(from);
            }
        }
    }

    async fn commit_reorg(&self, state: &mut State, from: PeerId, batch: ReorgBatch) {
        state.reorg = None;
        let ancestors = batch.ancestors();

        match self.inner.core.verify_reorg(batch, Some(from)).await {
            Ok(()) => {
                info!(target: "mulog::replicator", peer = from, ancestors, "moved onto the peer's fork");
                for range in &mut state.ranges {
                    range.cursor = range.start;
                }
                for remote in state.peers.values_mut() {
                    remote.skip.clear();
                }
            }
            Err(error) => {
                warn!(target: "mulog::replicator", peer = from, %error, "reorg failed");
                state.abandon_reorg(from);
            }
        }
    }

    fn send_request(&self, state: &mut State, to: PeerId, kind: Kind, request: Request) -> bool {
        let Some(remote) = state.peers.get_mut(&to) else {
            return false;
        };
        let id = state.next_request;
        let upgrade = request.upgrade.is_some()
            && matches!(kind, Kind::Block(_) | Kind::Upgrade | Kind::Seek(_));

        if !remote.send(&Message::Request { id, request }) {
            return false;
        }
        remote.inflight += 1;
        state.next_request += 1;
        if upgrade {
            state.upgrading = Some(id);
        }
        state.inflight.insert(
            id,
            Inflight {
                peer: to,
                kind,
                ticks: self.inner.options.request_timeout_ticks.max(1),
            },
        );
        true
    }

    /// Announces local changes, resolves satisfied wants and sends whatever
    /// requests are due.
    pub async fn refresh(&self) {
        if let Ok(mut state) = self.lock().await {
            self.refresh_locked(&mut state).await;
        }
    }

    async fn refresh_locked(&self, state: &mut State) {
        self.announce(state).await;
        self.update(state).await;
    }

    async fn announce(&self, state: &mut State) {
        let mut messages = Vec::new();
        let mut head_changed = false;

        while let Some(event) = state.session.try_recv() {
            match event {
                CoreEvent::Update {
                    status: bits,
                    bitfield,
                    ..
                } => {
                    head_changed |= bits & (status::UPGRADED | status::TRUNCATED) != 0;
                    if let Some(entry) = bitfield {
                        messages.push(if entry.drop {
                            Message::Unhave {
                                start: entry.start,
                                length: entry.length,
                            }
                        } else {
                            Message::Have {
                                start: entry.start,
                                length: entry.length,
                                bitfield: None,
                            }
                        });
                    }
                }
                CoreEvent::Conflict { length, fork, from } => {
                    debug!(target: "mulog::replicator", length, fork, from, "conflict reported")
                }
            }
        }

        if head_changed {
            let info = self.inner.core.info().await;
            messages.insert(
                0,
                Message::Info {
                    length: info.length,
                    fork: info.fork,
                },
            );
        }
        for message in &messages {
            state.broadcast(message);
        }
    }

    async fn update(&self, state: &mut State) {
        if state.closed {
            return;
        }
        self.resolve_wants(state).await;

        let local = self.local().await;
        self.check_forks(state, local);

        let mut peers: Vec<PeerId> = state
            .peers
            .values()
            .filter(|p| p.active(local.fork) && !p.closed())
            .map(|p| p.id)
            .collect();
        peers.shuffle(&mut state.rng);

        let max = self.inner.options.max_inflight;
        for id in peers {
            while state.peers.get(&id).is_some_and(|p| p.inflight < max) {
                if !self.schedule(state, id, local).await {
                    break;
                }
            }
        }
    }

    async fn resolve_wants(&self, state: &mut State) {
        let core = &self.inner.core;

        let indices: Vec<u64> = state.blocks.keys().copied().collect();
        for index in indices {
            if core.has(index).await {
                if let Some(waiters) = state.blocks.remove(&index) {
                    waiters.resolve(Ok(()));
                }
            }
        }

        let mut i = 0;
        while i < state.ranges.len() {
            let (cursor, end) = (state.ranges[i].cursor, state.ranges[i].end);
            match core.first_missing(cursor, end).await {
                Some(missing) => {
                    state.ranges[i].cursor = missing;
                    i += 1;
                }
                None => state.ranges.swap_remove(i).waiters.resolve(Ok(())),
            }
        }

        let mut i = 0;
        while i < state.seeks.len() {
            match core.seek(state.seeks[i].bytes).await {
                Ok(Some(ByteSeek::Found { index, offset })) => {
                    state.seeks.swap_remove(i).waiters.resolve(Ok((index, offset)))
                }
                _ => i += 1,
            }
        }

        if let Some(want) = &state.upgrade {
            let length = core.length().await;
            let hopeless = state.upgrading.is_none()
                && state.reorg.is_none()
                && state.peers.values().all(|p| p.synced && p.length <= length);

            if length > want.length {
                if let Some(want) = state.upgrade.take() {
                    want.waiters.resolve(Ok(true));
                }
            } else if hopeless {
                if let Some(want) = state.upgrade.take() {
                    want.waiters.resolve(Ok(false));
                }
            }
        }
    }

    /// Starts a reorg towards a peer on a newer fork, and asks peers no
    /// longer than us for their signed head to check it against ours.
    fn check_forks(&self, state: &mut State, local: Local) {
        if state.reorg.is_none() {
            let newer = state
                .peers
                .values()
                .filter(|p| {
                    p.synced
                        && !p.closed()
                        && p.fork > local.fork
                        && p.length > 0
                        && p.bad_fork != Some(p.fork)
                })
                .map(|p| (p.id, p.fork, p.length))
                .choose(&mut state.rng);

            if let Some((id, fork, length)) = newer {
                let request = Request {
                    fork,
                    ..upgrade_request(local, RequestUpgrade { start: 0, length })
                };
                if self.send_request(state, id, Kind::ForkProof, request) {
                    state.reorg = Some(Reorg {
                        peer: id,
                        batch: None,
                    });
                }
            }
        }

        let unchecked: Vec<(PeerId, u64)> = state
            .peers
            .values()
            .filter(|p| {
                p.active(local.fork) && p.length > 0 && p.length <= local.length && p.checked != p.length
            })
            .map(|p| (p.id, p.length))
            .collect();
        for (id, length) in unchecked {
            if let Some(remote) = state.peers.get_mut(&id) {
                remote.checked = length;
            }
            let request = Request {
                fork: local.fork,
                upgrade: Some(RequestUpgrade { start: 0, length }),
                ..Default::default()
            };
            self.send_request(state, id, Kind::ConflictCheck, request);
        }
    }

    /// Sends peer `id` the most urgent request it can serve: seeks, then
    /// upgrades someone waits on, then single blocks, then ranges, then an
    /// eager upgrade. `false` if there was nothing to ask.
    async fn schedule(&self, state: &mut State, id: PeerId, local: Local) -> bool {
        let Some(remote_length) = state.peers.get(&id).map(|p| p.length) else {
            return false;
        };
        let can_upgrade = state.upgrading.is_none() && remote_length > local.length;
        let upgrade = RequestUpgrade {
            start: local.length,
            length: remote_length.saturating_sub(local.length),
        };

        if let Some((kind, request)) = self.seek_request(state, id, local, can_upgrade).await {
            return self.send_request(state, id, kind, request);
        }

        if can_upgrade && state.wants_upgrade(local.length) {
            return self.send_request(state, id, Kind::Upgrade, upgrade_request(local, upgrade));
        }

        let index = match self.pick_block(state, id, local, can_upgrade) {
            Some(index) => Some(index),
            None => self.pick_range_block(state, id, local).await,
        };
        if let Some(index) = index {
            let mut request = Request {
                fork: local.fork,
                block: Some(RequestBlock { index, nodes: 0 }),
                manifest: local.needs_manifest,
                ..Default::default()
            };
            if index < local.length {
                let Ok(nodes) = self.inner.core.missing_nodes(2 * index).await else {
                    return false;
                };
                request.block = Some(RequestBlock { index, nodes });
            } else {
                request.upgrade = Some(upgrade);
            }
            return self.send_request(state, id, Kind::Block(index), request);
        }

        if can_upgrade && self.inner.options.eager_upgrade {
            return self.send_request(state, id, Kind::Upgrade, upgrade_request(local, upgrade));
        }
        false
    }

    async fn seek_request(
        &self,
        state: &State,
        id: PeerId,
        local: Local,
        can_upgrade: bool,
    ) -> Option<(Kind, Request)> {
        let remote = state.peers.get(&id)?;

        for want in &state.seeks {
            if state.seeking(want.bytes) || remote.seek_skip.contains_key(&want.bytes) {
                continue;
            }
            let seek = Some(RequestSeek { bytes: want.bytes });

            match self.inner.core.seek(want.bytes).await {
                Ok(None) if can_upgrade => {
                    let request = Request {
                        seek,
                        ..upgrade_request(
                            local,
                            RequestUpgrade {
                                start: local.length,
                                length: remote.length - local.length,
                            },
                        )
                    };
                    return Some((Kind::Seek(want.bytes), request));
                }
                Ok(Some(ByteSeek::Narrowed { start, end })) if remote.length >= local.length => {
                    // Climb from the first leaf to the known node spanning
                    // the range, so the seek lands inside the proven tree.
                    let nodes = flat_tree::depth(start + end - 1);
                    let request = Request {
                        fork: local.fork,
                        hash: Some(RequestBlock {
                            index: 2 * start,
                            nodes,
                        }),
                        seek,
                        ..Default::default()
                    };
                    return Some((Kind::Seek(want.bytes), request));
                }
                _ => {}
            }
        }
        None
    }

    fn pick_block(&self, state: &mut State, id: PeerId, local: Local, can_upgrade: bool) -> Option<u64> {
        let remote = state.peers.get(&id)?;
        let candidates: Vec<u64> = state
            .blocks
            .keys()
            .copied()
            .filter(|i| {
                remote.can_serve(*i) && !state.requested(*i) && (*i < local.length || can_upgrade)
            })
            .collect();

        candidates.choose(&mut state.rng).copied()
    }

    /// A missing block of some range want, starting the scan at a random
    /// point so peers spread over the range.
    async fn pick_range_block(&self, state: &mut State, id: PeerId, local: Local) -> Option<u64> {
        let core = &self.inner.core;
        let mut order: Vec<usize> = (0..state.ranges.len()).collect();
        order.shuffle(&mut state.rng);

        for i in order {
            let cursor = state.ranges[i].cursor;
            let end = state.ranges[i].end.min(local.length);
            if cursor >= end {
                continue;
            }

            let pivot = state.rng.gen_range(cursor..end);
            for (from, to) in [(pivot, end), (cursor, pivot)] {
                let mut at = from;
                while let Some(index) = core.first_missing(at, to).await {
                    let remote = state.peers.get(&id)?;
                    if remote.can_serve(index) && !state.requested(index) {
                        return Some(index);
                    }
                    at = index + 1;
                }
            }
        }
        None
    }

    /// Waits until block `index` is stored locally and returns it.
    #[instrument(skip(self))]
    pub async fn want_block(&self, index: u64) -> Result<Vec<u8>> {
        let core = &self.inner.core;
        if core.has(index).await {
            return core.get(index).await;
        }

        self.wait(|state| state.blocks.entry(index).or_default().add())
            .await?;
        core.get(index).await
    }

    /// Waits until every block in `start..end` is stored locally.
    #[instrument(skip(self))]
    pub async fn want_range(&self, start: u64, end: u64) -> Result<()> {
        if start >= end || self.inner.core.first_missing(start, end).await.is_none() {
            return Ok(());
        }

        self.wait(|state| {
            let mut want = RangeWant::new(start, end);
            let rx = want.waiters.add();
            state.ranges.push(want);
            rx
        })
        .await
    }

    /// Waits for the core to grow. `false` once no peer can grow it.
    #[instrument(skip(self))]
    pub async fn want_upgrade(&self) -> Result<bool> {
        let length = self.inner.core.length().await;

        self.wait(|state| {
            state
                .upgrade
                .get_or_insert_with(|| UpgradeWant {
                    length,
                    waiters: Waiters::default(),
                })
                .waiters
                .add()
        })
        .await
    }

    /// Finds the block holding byte `bytes`, returning its index and the
    /// offset into it.
    #[instrument(skip(self))]
    pub async fn want_seek(&self, bytes: u64) -> Result<(u64, u64)> {
        if let Some(ByteSeek::Found { index, offset }) = self.inner.core.seek(bytes).await? {
            return Ok((index, offset));
        }

        self.wait(|state| match state.seeks.iter_mut().find(|s| s.bytes == bytes) {
            Some(want) => want.waiters.add(),
            None => {
                let mut want = SeekWant {
                    bytes,
                    waiters: Waiters::default(),
                };
                let rx = want.waiters.add();
                state.seeks.push(want);
                rx
            }
        })
        .await
    }

    /// Registers a want through `add`, sends what is due and waits for
    /// the want to resolve.
    async fn wait<T>(&self, add: impl FnOnce(&mut State) -> oneshot::Receiver<Result<T>>) -> Result<T> {
        let rx = {
            let mut state = self.lock().await?;
            let rx = add(&mut *state);
            self.update(&mut state).await;
            rx
        };
        rx.await.map_err(|_| Error::RequestCancelled)?
    }

    /// Advances request timeouts by one tick and drops wants nobody waits
    /// on anymore.
    pub async fn tick(&self) {
        let Ok(mut guard) = self.lock().await else {
            return;
        };
        let state = &mut *guard;
        let timeout = self.inner.options.request_timeout_ticks.max(1);

        let dead: Vec<PeerId> = state
            .peers
            .values()
            .filter(|p| p.closed())
            .map(|p| p.id)
            .collect();
        for id in dead {
            state.remove_peer(id);
        }
        for remote in state.peers.values_mut() {
            remote.tick();
        }

        let expired: Vec<(u64, PeerId)> = state
            .inflight
            .iter_mut()
            .filter_map(|(id, request)| {
                request.ticks = request.ticks.saturating_sub(1);
                (request.ticks == 0).then_some((*id, request.peer))
            })
            .collect();
        for (id, peer) in expired {
            let Some(request) = state.finish(peer, id) else {
                continue;
            };
            warn!(target: "mulog::replicator", peer, id, kind = ?request.kind, "request timed out");

            if let Some(remote) = state.peers.get_mut(&peer) {
                remote.send(&Message::Cancel { id });
                if let Kind::Block(index) = request.kind {
                    remote.skip.insert(index, timeout);
                }
            }
            if matches!(request.kind, Kind::ForkProof | Kind::Reorg) {
                state.abandon_reorg(peer);
            }
        }

        let abandoned: Vec<u64> = state
            .blocks
            .iter()
            .filter(|(_, waiters)| waiters.abandoned())
            .map(|(index, _)| *index)
            .collect();
        for index in abandoned {
            state.blocks.remove(&index);
            if state.ranges.iter().any(|r| index >= r.start && index < r.end) {
                continue;
            }

            let cancelled: Vec<(u64, PeerId)> = state
                .inflight
                .iter()
                .filter(|(_, r)| r.kind == Kind::Block(index))
                .map(|(id, r)| (*id, r.peer))
                .collect();
            for (id, peer) in cancelled {
                state.finish(peer, id);
                if let Some(remote) = state.peers.get(&peer) {
                    remote.send(&Message::Cancel { id });
                }
            }
        }
        state.ranges.retain(|r| !r.waiters.abandoned());
        state.seeks.retain(|s| !s.waiters.abandoned());
        if state.upgrade.as_ref().is_some_and(|u| u.waiters.abandoned()) {
            state.upgrade = None;
        }

        self.refresh_locked(state).await;
    }

    /// Ticks every `tick_interval_ms` until the replicator closes.
    pub fn spawn_ticker(&self) -> JoinHandle<()> {
        let replicator = self.clone();
        let period = Duration::from_millis(self.inner.options.tick_interval_ms.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if replicator.inner.state.lock().await.closed {
                    break;
                }
                replicator.tick().await;
            }
        })
    }

    /// Receives messages peers send on extension `name`, and tells peers
    /// that it is understood.
    pub async fn register_extension(
        &self,
        name: &str,
    ) -> Result<mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>> {
        let mut state = self.lock().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.extensions.insert(name.to_string(), tx);

        state.broadcast(&Message::Options {
            extensions: state.extension_names(),
        });
        Ok(rx)
    }

    pub async fn send_extension(&self, peer: PeerId, name: &str, data: Vec<u8>) -> Result<()> {
        let state = self.lock().await?;
        let remote = state
            .peers
            .get(&peer)
            .ok_or_else(|| Error::InvalidOperation(format!("no peer {}", peer)))?;

        if !remote.extensions.iter().any(|e| e == name) {
            return Err(Error::InvalidOperation(format!(
                "peer {} does not understand extension {}",
                peer, name
            )));
        }
        if !remote.send(&Message::Extension {
            name: name.to_string(),
            data,
        }) {
            return Err(Error::SessionClosed);
        }
        Ok(())
    }

    /// Says goodbye to every peer and fails all pending wants.
    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        if std::mem::replace(&mut state.closed, true) {
            return;
        }

        state.broadcast(&Message::Close);
        state.peers.clear();
        state.inflight.clear();
        state.upgrading = None;
        state.reorg = None;

        for (_, waiters) in std::mem::take(&mut state.blocks) {
            waiters.resolve(Err(Error::SessionClosed));
        }
        for want in std::mem::take(&mut state.ranges) {
            want.waiters.resolve(Err(Error::SessionClosed));
        }
        for want in std::mem::take(&mut state.seeks) {
            want.waiters.resolve(Err(Error::SessionClosed));
        }
        if let Some(want) = state.upgrade.take() {
            want.waiters.resolve(Err(Error::SessionClosed));
        }
        state.session.close();

        info!(target: "mulog::replicator", "replicator closed");
    }
}

fn drain(peer: &mut Peer) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    while let Some(message) = peer.decoder.next_message()? {
        messages.push(message);
    }
    Ok(messages)
}

fn upgrade_request(local: Local, upgrade: RequestUpgrade) -> Request {
    Request {
        fork: local.fork,
        upgrade: Some(upgrade),
        manifest: local.needs_manifest,
        ..Default::default()
    }
}

/// Wires two replicators together in process. Returns the id each one
/// gave the other.
pub async fn connect(a: &Replicator, b: &Replicator) -> Result<(PeerId, PeerId)> {
    let (a_tx, mut a_rx) = mpsc::unbounded_channel();
    let (b_tx, mut b_rx) = mpsc::unbounded_channel();
    let b_on_a = a.add_peer(a_tx).await?;
    let a_on_b = b.add_peer(b_tx).await?;

    let to = b.clone();
    tokio::spawn(async move {
        while let Some(frame) = a_rx.recv().await {
            if to.on_data(a_on_b, &frame).await.is_err() {
                break;
            }
        }
    });
    let to = a.clone();
    tokio::spawn(async move {
        while let Some(frame) = b_rx.recv().await {
            if to.on_data(b_on_a, &frame).await.is_err() {
                break;
            }
        }
    });

    Ok((b_on_a, a_on_b))
}
