//! Raw byte-range storage, one instance per logical file.
//!
//! Nothing above this layer assumes more than positional reads, writes and
//! deletes; the oplog, tree, bitfield and block store each get their own
//! [`Storage`].

use std::{fmt::Debug, path::Path, sync::Arc};

use async_trait::async_trait;

use crate::prelude::*;

mod file;
mod memory;

pub use {file::FileStorage, memory::MemoryStorage};

#[async_trait]
pub trait Storage: Debug + Send + Sync {
    /// Reads `length` bytes at `offset`. Returns `None` when the range is not
    /// fully contained in the file.
    async fn read(&self, offset: u64, length: u64) -> Result<Option<Vec<u8>>>;

    async fn write(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Zeroes a byte range. A range that reaches the end of the file
    /// truncates it instead.
    async fn del(&self, offset: u64, length: u64) -> Result<()>;

    /// Current size in bytes.
    async fn stat(&self) -> Result<u64>;

    async fn close(&self) -> Result<()>;

    /// Removes the file. Irreversible.
    async fn unlink(&self) -> Result<()>;

    /// Reads the whole file.
    async fn read_all(&self) -> Result<Vec<u8>> {
        let size = self.stat().await?;
        Ok(self.read(0, size).await?.unwrap_or_default())
    }

    /// Cuts the file at `offset`.
    async fn truncate(&self, offset: u64) -> Result<()> {
        let size = self.stat().await?;
        if offset >= size {
            return Ok(());
        }
        self.del(offset, size - offset).await
    }
}

/// The files a core is made of.
#[derive(Debug, Clone)]
pub struct CoreStorage {
    pub oplog: Arc<dyn Storage>,
    /// Overflow area for headers that do not fit in an oplog slot.
    pub header: Arc<dyn Storage>,
    pub tree: Arc<dyn Storage>,
    pub bitfield: Arc<dyn Storage>,
    pub data: Arc<dyn Storage>,
}

impl CoreStorage {
    pub fn memory() -> Self {
        Self {
            oplog: Arc::new(MemoryStorage::new()),
            header: Arc::new(MemoryStorage::new()),
            tree: Arc::new(MemoryStorage::new()),
            bitfield: Arc::new(MemoryStorage::new()),
            data: Arc::new(MemoryStorage::new()),
        }
    }

    /// Opens (creating if needed) the files of a core under `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;

        Ok(Self {
            oplog: Arc::new(FileStorage::open(dir.join("oplog")).await?),
            header: Arc::new(FileStorage::open(dir.join("header")).await?),
            tree: Arc::new(FileStorage::open(dir.join("tree")).await?),
            bitfield: Arc::new(FileStorage::open(dir.join("bitfield")).await?),
            data: Arc::new(FileStorage::open(dir.join("data")).await?),
        })
    }

    fn all(&self) -> [&Arc<dyn Storage>; 5] {
        [&self.oplog, &self.header, &self.tree, &self.bitfield, &self.data]
    }

    pub async fn close_all(&self) -> Result<()> {
        for storage in self.all() {
            storage.close().await?;
        }
        Ok(())
    }

    pub async fn unlink_all(&self) -> Result<()> {
        for storage in self.all() {
            storage.unlink().await?;
        }
        Ok(())
    }

    /// Empties every file, used when a core is opened with `overwrite`.
    pub async fn truncate_all(&self) -> Result<()> {
        for storage in self.all() {
            storage.truncate(0).await?;
        }
        Ok(())
    }
}
