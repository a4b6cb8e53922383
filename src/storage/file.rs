use std::{io::SeekFrom, path::PathBuf};

use async_trait::async_trait;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};

use super::Storage;
use crate::prelude::*;

/// A single file on disk. Reads and writes are serialized on the handle since
/// they share the seek position.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileStorage {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

fn closed() -> Error {
    Error::Io(std::sync::Arc::new(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "file is closed",
    )))
}

#[async_trait]
impl Storage for FileStorage {
    async fn read(&self, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or_else(closed)?;

        let size = file.metadata().await?.len();
        if offset + length > size {
            return Ok(None);
        }

        let mut buffer = vec![0u8; length as usize];
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buffer).await?;
        Ok(Some(buffer))
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or_else(closed)?;

        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn del(&self, offset: u64, length: u64) -> Result<()> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or_else(closed)?;

        let size = file.metadata().await?.len();
        if offset >= size {
            return Ok(());
        }

        if offset.saturating_add(length) >= size {
            file.set_len(offset).await?;
        } else {
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(&vec![0u8; length as usize]).await?;
            file.flush().await?;
        }
        Ok(())
    }

    async fn stat(&self) -> Result<u64> {
        let guard = self.file.lock().await;
        let file = guard.as_ref().ok_or_else(closed)?;
        Ok(file.metadata().await?.len())
    }

    async fn close(&self) -> Result<()> {
        if let Some(file) = self.file.lock().await.take() {
            file.sync_all().await?;
        }
        Ok(())
    }

    async fn unlink(&self) -> Result<()> {
        self.file.lock().await.take();
        match tokio::fs::remove_file(&self.path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => Ok(other?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_roundtrip_and_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path().join("data")).await.unwrap();

        storage.write(0, b"abcdef").await.unwrap();
        assert_eq!(storage.read(2, 2).await.unwrap(), Some(b"cd".to_vec()));
        assert_eq!(storage.read(4, 4).await.unwrap(), None);

        storage.del(1, 1).await.unwrap();
        assert_eq!(storage.read(0, 3).await.unwrap(), Some(b"a\0c".to_vec()));

        storage.truncate(3).await.unwrap();
        assert_eq!(storage.stat().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unlink_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let storage = FileStorage::open(&path).await.unwrap();
        storage.write(0, b"x").await.unwrap();

        storage.unlink().await.unwrap();
        assert!(!path.exists());
        assert!(storage.stat().await.is_err());
    }
}
