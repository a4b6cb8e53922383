#![allow(dead_code)]

use std::{future::Future, sync::Arc, time::Duration};

use mulog::storage::{CoreStorage, MemoryStorage};

/// Installs a subscriber once per test binary, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The five files of a core, kept around so tests can inspect or damage
/// them and reopen.
#[derive(Clone, Default)]
pub struct Files {
    pub oplog: MemoryStorage,
    pub header: MemoryStorage,
    pub tree: MemoryStorage,
    pub bitfield: MemoryStorage,
    pub data: MemoryStorage,
}

impl Files {
    pub fn storage(&self) -> CoreStorage {
        CoreStorage {
            oplog: Arc::new(self.oplog.clone()),
            header: Arc::new(self.header.clone()),
            tree: Arc::new(self.tree.clone()),
            bitfield: Arc::new(self.bitfield.clone()),
            data: Arc::new(self.data.clone()),
        }
    }
}

pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("timed out")
}

pub async fn until<F: Future<Output = bool>>(mut check: impl FnMut() -> F) {
    within(async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}
