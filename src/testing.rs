//! Strategies and fixtures for testing code built on logs.

use proptest::{
    collection::vec,
    prelude::*,
    sample::SizeRange,
    strategy::ValueTree,
    test_runner::{Config as TestConfig, TestRunner},
};

use crate::{
    config::CoreOptions,
    core::{Core, CoreHandles},
    prelude::*,
    storage::CoreStorage,
    verifier::KeyPair,
};

/// Blocks of up to `max_len` bytes, never empty.
pub fn blocks(size: impl Into<SizeRange>, max_len: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    vec(vec(any::<u8>(), 1..=max_len.max(1)), size)
}

pub fn unwrap_strategy<T>(strategy: impl Strategy<Value = T>) -> T {
    let mut test_runner = TestRunner::new(TestConfig::default());

    strategy
        .new_tree(&mut test_runner)
        .expect("Failed to get new value from strategy")
        .current()
}

/// Options for a writable core whose key pair derives from `seed`.
pub fn writer_options(seed: u8) -> CoreOptions {
    CoreOptions::default().with_key_pair(KeyPair::from_seed(&[seed; 32]))
}

/// An in-memory writer holding `blocks`.
pub async fn memory_writer<B: AsRef<[u8]> + Sync>(seed: u8, blocks: &[B]) -> Result<Core> {
    let core = Core::open(CoreStorage::memory(), writer_options(seed), CoreHandles::default()).await?;
    if !blocks.is_empty() {
        core.append(blocks).await?;
    }
    Ok(core)
}

/// An empty in-memory replica of `core`.
pub async fn memory_reader(core: &Core) -> Result<Core> {
    let options = CoreOptions::default().with_key(core.key());
    Core::open(CoreStorage::memory(), options, CoreHandles::default()).await
}
