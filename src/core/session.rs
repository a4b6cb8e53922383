//! Handles onto a core.
//!
//! Open sessions live in an arena on the core. Each session knows its slot
//! and closing swaps the last slot into the hole, so closing never shifts
//! the others.

use std::{
    marker::PhantomData,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use tokio::sync::mpsc;

use super::{AppendOutcome, Core, CoreEvent};
use crate::{codec::Codec, prelude::*};

#[derive(Debug)]
pub(super) struct SessionSlot {
    pub tx: mpsc::UnboundedSender<CoreEvent>,
    pub index: Arc<AtomicUsize>,
}

#[derive(Debug)]
pub struct Session {
    core: Core,
    index: Arc<AtomicUsize>,
    events: mpsc::UnboundedReceiver<CoreEvent>,
    closed: bool,
}

impl Core {
    /// Opens a session that receives every event from now on.
    pub fn session(&self) -> Session {
        let (tx, events) = mpsc::unbounded_channel();
        let mut sessions = self.sessions();
        let index = Arc::new(AtomicUsize::new(sessions.len()));

        sessions.push(SessionSlot {
            tx,
            index: index.clone(),
        });

        Session {
            core: self.clone(),
            index,
            events,
            closed: false,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }
}

impl Session {
    pub fn core(&self) -> &Core {
        &self.core
    }

    pub async fn get(&self, index: u64) -> Result<Vec<u8>> {
        self.core.get(index).await
    }

    pub async fn has(&self, index: u64) -> bool {
        self.core.has(index).await
    }

    pub async fn append<B: AsRef<[u8]> + Sync>(&self, blocks: &[B]) -> Result<AppendOutcome> {
        self.core.append(blocks).await
    }

    pub async fn length(&self) -> u64 {
        self.core.length().await
    }

    /// The next event, or `None` once the core is closed.
    pub async fn recv(&mut self) -> Option<CoreEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<CoreEvent> {
        self.events.try_recv().ok()
    }

    pub fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }

        let mut sessions = self.core.sessions();
        let i = self.index.load(Ordering::SeqCst);
        if sessions
            .get(i)
            .is_some_and(|slot| Arc::ptr_eq(&slot.index, &self.index))
        {
            sessions.swap_remove(i);
            if let Some(moved) = sessions.get(i) {
                moved.index.store(i, Ordering::SeqCst);
            }
        }
    }

    /// Views this session's blocks as values of `T`.
    pub fn typed<T, C: Codec<T>>(self, codec: C) -> TypedSession<T, C> {
        TypedSession {
            session: self,
            codec,
            _marker: PhantomData,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug)]
pub struct TypedSession<T, C> {
    session: Session,
    codec: C,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C: Codec<T>> TypedSession<T, C> {
    pub async fn append(&self, values: &[T]) -> Result<AppendOutcome> {
        let blocks = values
            .iter()
            .map(|v| self.codec.encode(v))
            .collect::<Result<Vec<_>>>()?;
        self.session.append(&blocks).await
    }

    pub async fn get(&self, index: u64) -> Result<T> {
        self.codec.decode(&self.session.get(index).await?)
    }

    pub fn session(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }
}
