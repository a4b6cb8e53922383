//! The single-writer lock.
//!
//! Waiters are served strictly in arrival order. Destroying the lock makes
//! every later `lock()` fail; a graceful destroy lets the queue drain, an
//! eager one fails the queued waiters with the given error. An eager
//! destroy after a graceful one upgrades it.

use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::prelude::*;

type Waiter = oneshot::Sender<Result<()>>;

#[derive(Debug, Default)]
struct State {
    locked: bool,
    queue: VecDeque<Waiter>,
    destroyed: Option<Error>,
}

#[derive(Debug, Default)]
pub struct Mutex {
    state: std::sync::Mutex<State>,
}

/// Releases the lock on drop.
#[derive(Debug)]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// A queued `lock()` call. If it is dropped after being handed the lock,
/// the lock is passed on.
struct Pending<'a> {
    mutex: &'a Mutex,
    rx: oneshot::Receiver<Result<()>>,
    done: bool,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.rx.close();
        if let Ok(Ok(())) = self.rx.try_recv() {
            self.mutex.unlock();
        }
    }
}

impl Mutex {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    pub fn is_destroyed(&self) -> bool {
        self.state().destroyed.is_some()
    }

    pub async fn lock(&self) -> Result<MutexGuard<'_>> {
        let rx = {
            let mut state = self.state();
            if let Some(error) = &state.destroyed {
                return Err(error.clone());
            }
            if !state.locked {
                state.locked = true;
                return Ok(MutexGuard { mutex: self });
            }

            let (tx, rx) = oneshot::channel();
            state.queue.push_back(tx);
            rx
        };

        let mut pending = Pending {
            mutex: self,
            rx,
            done: false,
        };
        let result = (&mut pending.rx).await;
        pending.done = true;

        match result {
            Ok(Ok(())) => Ok(MutexGuard { mutex: self }),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(Error::SessionClosed),
        }
    }

    /// Hands the lock to the next live waiter, or releases it.
    fn unlock(&self) {
        let mut state = self.state();
        while let Some(waiter) = state.queue.pop_front() {
            if waiter.send(Ok(())).is_ok() {
                return;
            }
        }
        state.locked = false;
    }

    /// Destroys the lock. Without an error the queue drains normally;
    /// with one, queued waiters fail with it. Resolves once the lock is
    /// free.
    pub async fn destroy(&self, error: Option<Error>) {
        let rx = {
            let mut state = self.state();

            match error {
                Some(error) => {
                    for waiter in state.queue.drain(..) {
                        let _ = waiter.send(Err(error.clone()));
                    }
                    state.destroyed = Some(error);
                }
                None => {
                    if state.destroyed.is_none() {
                        state.destroyed = Some(Error::SessionClosed);
                    }
                }
            }

            if !state.locked {
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(tx);
            rx
        };

        if let Ok(Ok(())) = rx.await {
            self.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use super::*;

    #[tokio::test]
    async fn test_waiters_are_served_in_order() {
        let mutex = Arc::new(Mutex::new());
        let order = Arc::new(StdMutex::new(Vec::new()));
        let guard = mutex.lock().await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..5 {
            let mutex = mutex.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = mutex.lock().await.unwrap();
                order.lock().unwrap().push(i);
                tokio::task::yield_now().await;
            }));
            tokio::task::yield_now().await;
        }

        drop(guard);
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(!mutex.is_locked());
    }

    #[tokio::test]
    async fn test_eager_destroy_rejects_queued_waiters() {
        let mutex = Arc::new(Mutex::new());
        let guard = mutex.lock().await.unwrap();

        let waiter = {
            let mutex = mutex.clone();
            tokio::spawn(async move { mutex.lock().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;

        let destroy = {
            let mutex = mutex.clone();
            tokio::spawn(async move { mutex.destroy(Some(Error::RequestCancelled)).await })
        };
        tokio::task::yield_now().await;

        assert!(matches!(waiter.await.unwrap(), Err(Error::RequestCancelled)));
        assert!(!destroy.is_finished());

        drop(guard);
        destroy.await.unwrap();
        assert!(matches!(mutex.lock().await, Err(Error::RequestCancelled)));
    }

    #[tokio::test]
    async fn test_graceful_destroy_drains_the_queue() {
        let mutex = Arc::new(Mutex::new());
        let guard = mutex.lock().await.unwrap();

        let waiter = {
            let mutex = mutex.clone();
            tokio::spawn(async move { mutex.lock().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;

        let destroy = {
            let mutex = mutex.clone();
            tokio::spawn(async move { mutex.destroy(None).await })
        };
        tokio::task::yield_now().await;
        assert!(matches!(mutex.lock().await, Err(Error::SessionClosed)));

        drop(guard);
        assert!(waiter.await.unwrap().is_ok());
        destroy.await.unwrap();
        assert!(!mutex.is_locked());
    }

    #[tokio::test]
    async fn test_eager_destroy_upgrades_graceful() {
        let mutex = Arc::new(Mutex::new());
        let guard = mutex.lock().await.unwrap();

        let waiter = {
            let mutex = mutex.clone();
            tokio::spawn(async move { mutex.lock().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;

        let graceful = {
            let mutex = mutex.clone();
            tokio::spawn(async move { mutex.destroy(None).await })
        };
        tokio::task::yield_now().await;

        let eager = {
            let mutex = mutex.clone();
            tokio::spawn(async move { mutex.destroy(Some(Error::RequestTimeout)).await })
        };
        tokio::task::yield_now().await;

        assert!(matches!(waiter.await.unwrap(), Err(Error::RequestTimeout)));
        assert!(matches!(mutex.lock().await, Err(Error::RequestTimeout)));

        drop(guard);
        graceful.await.unwrap();
        eager.await.unwrap();
        assert!(!mutex.is_locked());
    }

    #[tokio::test]
    async fn test_abandoned_waiter_passes_the_lock_on() {
        let mutex = Mutex::new();
        let guard = mutex.lock().await.unwrap();

        let abandoned = tokio::time::timeout(std::time::Duration::from_millis(1), mutex.lock()).await;
        assert!(abandoned.is_err());

        drop(guard);
        assert!(mutex.lock().await.is_ok());
    }
}
