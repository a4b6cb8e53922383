//! Local wants and the requests sent on their behalf.

use tokio::sync::oneshot;

use super::PeerId;
use crate::prelude::*;

/// What an inflight request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Block(u64),
    Upgrade,
    Seek(u64),
    /// The remote head on a newer fork, starting a reorg.
    ForkProof,
    /// A step of a running reorg.
    Reorg,
    /// A remote head no longer than ours, checked for conflicts.
    ConflictCheck,
}

#[derive(Debug)]
pub(crate) struct Inflight {
    pub peer: PeerId,
    pub kind: Kind,
    /// Ticks left before the request times out.
    pub ticks: u32,
}

/// Callers waiting on the same outcome.
#[derive(Debug)]
pub(crate) struct Waiters<T> {
    senders: Vec<oneshot::Sender<Result<T>>>,
}

impl<T> Default for Waiters<T> {
    fn default() -> Self {
        Self {
            senders: Vec::new(),
        }
    }
}

impl<T: Clone> Waiters<T> {
    pub fn add(&mut self) -> oneshot::Receiver<Result<T>> {
        let (tx, rx) = oneshot::channel();
        self.senders.push(tx);
        rx
    }

    /// Whether every caller has gone away.
    pub fn abandoned(&self) -> bool {
        self.senders.iter().all(|tx| tx.is_closed())
    }

    pub fn resolve(self, result: Result<T>) {
        for tx in self.senders {
            let _ = tx.send(result.clone());
        }
    }
}

#[derive(Debug)]
pub(crate) struct RangeWant {
    pub start: u64,
    pub end: u64,
    /// Everything before it is known to be present.
    pub cursor: u64,
    pub waiters: Waiters<()>,
}

impl RangeWant {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            cursor: start,
            waiters: Waiters::default(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct SeekWant {
    pub bytes: u64,
    pub waiters: Waiters<(u64, u64)>,
}

#[derive(Debug)]
pub(crate) struct UpgradeWant {
    /// Local length when the want was made; any growth satisfies it.
    pub length: u64,
    pub waiters: Waiters<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_waiters_share_the_result() {
        let mut waiters = Waiters::<u64>::default();
        let a = waiters.add();
        let b = waiters.add();

        waiters.resolve(Ok(5));
        assert_eq!(a.await.unwrap().unwrap(), 5);
        assert_eq!(b.await.unwrap().unwrap(), 5);
    }

    #[test]
    fn test_abandoned_once_all_callers_leave() {
        let mut waiters = Waiters::<()>::default();
        let a = waiters.add();
        let b = waiters.add();

        drop(a);
        assert!(!waiters.abandoned());
        drop(b);
        assert!(waiters.abandoned());
    }
}
