use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::Storage;
use crate::prelude::*;

/// In-memory storage. Clones share the same buffer, which lets tests keep a
/// handle to a file, drop the core that wrote it and reopen it afterwards.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(bytes)),
        }
    }

    /// A copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Drops everything past `length`, simulating a torn write.
    pub fn cut(&self, length: usize) {
        self.lock().truncate(length);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        // A poisoned buffer still holds bytes that were fully written.
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        let buffer = self.lock();
        let start = offset as usize;
        let end = start + length as usize;

        if end > buffer.len() {
            return Ok(None);
        }
        Ok(Some(buffer[start..end].to_vec()))
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut buffer = self.lock();
        let start = offset as usize;
        let end = start + data.len();

        if end > buffer.len() {
            buffer.resize(end, 0);
        }
        buffer[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn del(&self, offset: u64, length: u64) -> Result<()> {
        let mut buffer = self.lock();
        let start = (offset as usize).min(buffer.len());
        let end = offset.saturating_add(length).min(buffer.len() as u64) as usize;

        if end == buffer.len() {
            buffer.truncate(start);
        } else {
            buffer[start..end].fill(0);
        }
        Ok(())
    }

    async fn stat(&self) -> Result<u64> {
        Ok(self.lock().len() as u64)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn unlink(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }
}
