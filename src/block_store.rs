use std::sync::Arc;

use crate::{prelude::*, storage::Storage};

/// Block bytes laid out back to back in the data file. Offsets are
/// computed by the caller from the tree, including cipher padding.
#[derive(Debug, Clone)]
pub struct BlockStore {
    storage: Arc<dyn Storage>,
}

impl BlockStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn get(&self, offset: u64, size: u64) -> Result<Option<Vec<u8>>> {
        self.storage.read(offset, size).await
    }

    pub async fn put(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.storage.write(offset, data).await
    }

    /// Writes consecutive blocks starting at `offset` in a single write.
    pub async fn put_batch(&self, offset: u64, blocks: &[Vec<u8>]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        self.storage.write(offset, &blocks.concat()).await
    }

    /// Frees a range of blocks. Clearing up to the end shrinks the file.
    pub async fn clear(&self, offset: u64, length: u64) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        self.storage.del(offset, length).await
    }

    pub async fn truncate(&self, offset: u64) -> Result<()> {
        self.storage.truncate(offset).await
    }
}
