mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use common::{init_tracing, until, within};
use mulog::{
    oplog::ENTRIES_OFFSET,
    prelude::Result,
    replicator::{connect, FrameDecoder, Message, PeerId},
    storage::{CoreStorage, MemoryStorage, Storage},
    testing::{memory_reader, memory_writer},
    tree::{Request, RequestBlock, RequestUpgrade},
    Core, CoreHandles, CoreOptions, Replicator, ReplicatorOptions,
};
use tokio::sync::{mpsc, Semaphore};

const DIGITS: [&str; 10] = ["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"];

fn replicator(core: Core) -> Replicator {
    Replicator::new(core, ReplicatorOptions::default())
}

/// A writer with the same key as `memory_writer(seed, DIGITS)` that kept
/// the first `shared` blocks and then went its own way.
async fn forked_writer(seed: u8, shared: u64, length: u64) -> Core {
    let core = memory_writer(seed, &DIGITS[..shared as usize + 1]).await.unwrap();
    core.truncate(shared, 1).await.unwrap();
    let rest: Vec<String> = (shared..length).map(|i| format!("fork #{i}")).collect();
    if !rest.is_empty() {
        core.append(&rest).await.unwrap();
    }
    core
}

#[tokio::test]
async fn test_sparse_replication_of_one_block() {
    init_tracing();
    let writer = replicator(memory_writer(1, &["a", "b", "c", "d", "e"]).await.unwrap());
    let reader = replicator(memory_reader(writer.core()).await.unwrap());
    connect(&writer, &reader).await.unwrap();

    assert_eq!(within(reader.want_block(3)).await.unwrap(), b"d");
    assert_eq!(reader.core().length().await, 5);
    assert!(!reader.core().has(0).await);
    assert_eq!(reader.core().contiguous_length().await, 0);
}

#[tokio::test]
async fn test_blocks_travel_through_a_middle_peer() {
    init_tracing();
    let writer = replicator(memory_writer(1, &DIGITS).await.unwrap());
    let middle = replicator(memory_reader(writer.core()).await.unwrap());
    let last = replicator(memory_reader(writer.core()).await.unwrap());

    connect(&writer, &middle).await.unwrap();
    within(middle.want_range(0, 10)).await.unwrap();
    writer.close().await;

    connect(&middle, &last).await.unwrap();
    within(last.want_range(0, 10)).await.unwrap();

    for (i, digit) in DIGITS.iter().enumerate() {
        assert_eq!(last.core().get(i as u64).await.unwrap(), digit.as_bytes());
    }
}

#[tokio::test]
async fn test_core_reorg_finds_the_shared_prefix() {
    let local = memory_writer(1, &DIGITS).await.unwrap();
    let remote = forked_writer(1, 1, 1).await;

    let proof = remote
        .proof(&Request {
            fork: 1,
            upgrade: Some(RequestUpgrade { start: 0, length: 1 }),
            ..Default::default()
        })
        .await
        .unwrap();
    let mut reorg = local.reorg(&proof).await.unwrap();

    let mut rounds = 0;
    while let Some(want) = reorg.want {
        let proof = remote
            .proof(&Request {
                fork: 1,
                hash: Some(RequestBlock {
                    index: 2 * want.start,
                    nodes: want.nodes,
                }),
                ..Default::default()
            })
            .await
            .unwrap();
        local.update_reorg(&mut reorg, &proof).await.unwrap();
        rounds += 1;
        assert!(rounds <= 4, "reorg did not converge");
    }
    assert_eq!(reorg.ancestors(), 1);

    local.verify_reorg(reorg, None).await.unwrap();
    assert_eq!(local.length().await, 1);
    assert_eq!(local.fork().await, 1);
    assert_eq!(local.get(0).await.unwrap(), b"0");
    assert_eq!(local.reorg_hints().await.len(), 1);
}

#[tokio::test]
async fn test_core_reorg_keeps_blocks_before_the_fork() {
    let local = memory_writer(1, &DIGITS).await.unwrap();
    let remote = forked_writer(1, 3, 7).await;

    let proof = remote
        .proof(&Request {
            fork: 1,
            upgrade: Some(RequestUpgrade { start: 0, length: 7 }),
            ..Default::default()
        })
        .await
        .unwrap();
    let mut reorg = local.reorg(&proof).await.unwrap();
    while let Some(want) = reorg.want {
        let proof = remote
            .proof(&Request {
                fork: 1,
                hash: Some(RequestBlock {
                    index: 2 * want.start,
                    nodes: want.nodes,
                }),
                ..Default::default()
            })
            .await
            .unwrap();
        local.update_reorg(&mut reorg, &proof).await.unwrap();
    }
    assert_eq!(reorg.ancestors(), 3);

    local.verify_reorg(reorg, None).await.unwrap();
    assert_eq!(local.length().await, 7);
    assert!(local.has(2).await);
    assert!(!local.has(3).await);
    assert!(!local.has(9).await);
}

#[tokio::test]
async fn test_reader_follows_the_writer_onto_a_new_fork() {
    init_tracing();
    let writer = replicator(memory_writer(1, &DIGITS).await.unwrap());
    let reader = replicator(memory_reader(writer.core()).await.unwrap());
    connect(&writer, &reader).await.unwrap();
    within(reader.want_range(0, 10)).await.unwrap();

    writer.core().truncate(4, 1).await.unwrap();
    writer.core().append(&["x", "y"]).await.unwrap();
    writer.refresh().await;

    until(|| async { reader.core().fork().await == 1 }).await;
    assert_eq!(reader.core().length().await, 6);
    assert!(reader.core().has(3).await);
    assert!(!reader.core().has(4).await);

    assert_eq!(within(reader.want_block(5)).await.unwrap(), b"y");
    assert_eq!(reader.core().get(0).await.unwrap(), b"0");
}

/// Block storage whose writes wait for a permit.
#[derive(Debug)]
struct Gated {
    inner: MemoryStorage,
    gate: Semaphore,
}

#[async_trait]
impl Storage for Gated {
    async fn read(&self, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        self.inner.read(offset, length).await
    }
    async fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let _permit = self.gate.acquire().await.unwrap();
        self.inner.write(offset, data).await
    }
    async fn del(&self, offset: u64, length: u64) -> Result<()> {
        self.inner.del(offset, length).await
    }
    async fn stat(&self) -> Result<u64> {
        self.inner.stat().await
    }
    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
    async fn unlink(&self) -> Result<()> {
        self.inner.unlink().await
    }
}

/// Oplog storage counting writes to the entry region.
#[derive(Debug, Default)]
struct Counted {
    inner: MemoryStorage,
    appends: AtomicUsize,
}

#[async_trait]
impl Storage for Counted {
    async fn read(&self, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        self.inner.read(offset, length).await
    }
    async fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        if offset >= ENTRIES_OFFSET {
            self.appends.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.write(offset, data).await
    }
    async fn del(&self, offset: u64, length: u64) -> Result<()> {
        self.inner.del(offset, length).await
    }
    async fn stat(&self) -> Result<u64> {
        self.inner.stat().await
    }
    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
    async fn unlink(&self) -> Result<()> {
        self.inner.unlink().await
    }
}

fn received(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, decoder: &mut FrameDecoder) -> Vec<Message> {
    while let Ok(frame) = rx.try_recv() {
        decoder.push(&frame);
    }
    let mut messages = Vec::new();
    while let Some(message) = decoder.next_message().unwrap() {
        messages.push(message);
    }
    messages
}

#[tokio::test]
async fn test_proofs_from_several_peers_verify_together() {
    init_tracing();
    let writer = memory_writer(1, &DIGITS).await.unwrap();

    let data = Arc::new(Gated {
        inner: MemoryStorage::new(),
        gate: Semaphore::new(0),
    });
    let oplog = Arc::new(Counted::default());
    let storage = CoreStorage {
        oplog: oplog.clone(),
        header: Arc::new(MemoryStorage::new()),
        tree: Arc::new(MemoryStorage::new()),
        bitfield: Arc::new(MemoryStorage::new()),
        data: data.clone(),
    };
    let core = Core::open(
        storage,
        CoreOptions::default().with_key(writer.key()),
        CoreHandles::default(),
    )
    .await
    .unwrap();
    let head = writer
        .proof(&Request {
            upgrade: Some(RequestUpgrade { start: 0, length: 10 }),
            manifest: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(core.verify(head, None).await.unwrap());

    let reader = Replicator::new(
        core,
        ReplicatorOptions {
            eager_upgrade: false,
            ..Default::default()
        },
    );

    // Peer k only has block k + 1, so each is asked for exactly one block.
    let mut peers: Vec<(PeerId, mpsc::UnboundedReceiver<Vec<u8>>, FrameDecoder)> = Vec::new();
    for k in 0..3 {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = reader.add_peer(tx).await.unwrap();
        let mut frames = Message::Handshake { key: writer.key() }.encode().unwrap();
        frames.extend(Message::Info { length: 10, fork: 0 }.encode().unwrap());
        frames.extend(
            Message::Have {
                start: k + 1,
                length: 1,
                bitfield: None,
            }
            .encode()
            .unwrap(),
        );
        reader.on_data(peer, &frames).await.unwrap();
        peers.push((peer, rx, FrameDecoder::new()));
    }

    let wants: Vec<_> = (1..=3)
        .map(|index| {
            let reader = reader.clone();
            tokio::spawn(async move { reader.want_block(index).await })
        })
        .collect();

    let mut answers = Vec::new();
    for (peer, rx, decoder) in &mut peers {
        let request = within(async {
            loop {
                let request = received(rx, decoder).into_iter().find_map(|message| match message {
                    Message::Request { id, request } if request.block.is_some() => {
                        Some((id, request))
                    }
                    _ => None,
                });
                match request {
                    Some(request) => break request,
                    None => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            }
        })
        .await;
        let (id, request) = request;
        let proof = writer.proof(&request).await.unwrap();
        answers.push((*peer, Message::Data { id, proof }.encode().unwrap()));
    }

    let before = oplog.appends.load(Ordering::SeqCst);
    let mut deliveries = Vec::new();
    for (peer, frame) in answers {
        let reader = reader.clone();
        deliveries.push(tokio::spawn(async move { reader.on_data(peer, &frame).await }));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The first proof is stuck writing its block, yet the replicator still
    // answers and the other proofs queue up behind it.
    assert_eq!(within(reader.peers()).await.len(), 3);
    assert_eq!(oplog.appends.load(Ordering::SeqCst), before);

    data.gate.add_permits(1);
    for delivery in deliveries {
        within(delivery).await.unwrap().unwrap();
    }
    for (want, digit) in wants.into_iter().zip(["1", "2", "3"]) {
        assert_eq!(within(want).await.unwrap().unwrap(), digit.as_bytes());
    }
    assert_eq!(oplog.appends.load(Ordering::SeqCst) - before, 2);
}
