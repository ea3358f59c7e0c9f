//! Registry of live sessions.
//!
//! A session is registered when its connection is accepted and removes
//! itself when it reaches the closed state. The directory holds a
//! [`SessionHandle`] per session, which the application layer uses to queue
//! actions on the session or to close it.

use slab::Slab;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};

use crate::protocol::Action;

/// Application-side handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    peer: SocketAddr,
    inbox: mpsc::UnboundedSender<Action>,
    cancel: Arc<watch::Sender<bool>>,
}

/// Session-side ends of a [`SessionHandle`].
#[derive(Debug)]
pub struct SessionSignals {
    pub(crate) inbox: mpsc::UnboundedReceiver<Action>,
    pub(crate) cancel: watch::Receiver<bool>,
}

impl SessionHandle {
    pub fn new(peer: SocketAddr) -> (Self, SessionSignals) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = Self {
            peer,
            inbox: inbox_tx,
            cancel: Arc::new(cancel_tx),
        };
        let signals = SessionSignals {
            inbox: inbox_rx,
            cancel: cancel_rx,
        };
        (handle, signals)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Append an action to the back of the session's queue.
    ///
    /// Hands the action back if the session has already terminated.
    pub fn enqueue(&self, action: Action) -> Result<(), Action> {
        self.inbox.send(action).map_err(|e| e.0)
    }

    /// Cancel the session's outstanding operation and close it. Idempotent.
    pub fn close(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.cancel.borrow() || self.inbox.is_closed()
    }
}

/// Registry of live sessions with O(1) insert and remove.
#[derive(Debug)]
pub struct SessionDirectory {
    sessions: Mutex<Slab<SessionHandle>>,
    live: watch::Sender<usize>,
}

impl Default for SessionDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(Slab::new()),
            live: watch::channel(0).0,
        }
    }

    /// Register a session and return its id.
    pub fn insert(&self, handle: SessionHandle) -> usize {
        let mut sessions = self.sessions();
        let id = sessions.insert(handle);
        self.live.send_replace(sessions.len());
        id
    }

    /// Release a session. Returns `None` if it was already removed.
    pub fn remove(&self, id: usize) -> Option<SessionHandle> {
        let mut sessions = self.sessions();
        let handle = sessions.try_remove(id);
        self.live.send_replace(sessions.len());
        handle
    }

    pub fn get(&self, id: usize) -> Option<SessionHandle> {
        self.sessions().get(id).cloned()
    }

    pub fn contains(&self, id: usize) -> bool {
        self.sessions().contains(id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Ids of all live sessions.
    pub fn ids(&self) -> Vec<usize> {
        self.sessions().iter().map(|(id, _)| id).collect()
    }

    /// Ask every live session to close.
    pub fn close_all(&self) {
        for (_, handle) in self.sessions().iter() {
            handle.close();
        }
    }

    /// Wait until no sessions remain.
    pub async fn drained(&self) {
        let mut live = self.live.subscribe();
        // The sender lives as long as `self`, so this only returns once empty.
        let _ = live.wait_for(|count| *count == 0).await;
    }

    fn sessions(&self) -> MutexGuard<'_, Slab<SessionHandle>> {
        // A panic while holding the lock cannot leave the slab half-updated.
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn test_insert_remove() {
        let directory = SessionDirectory::new();
        let (h1, _s1) = SessionHandle::new(peer());
        let (h2, _s2) = SessionHandle::new(peer());

        let id1 = directory.insert(h1);
        let id2 = directory.insert(h2);
        assert_eq!(directory.len(), 2);
        assert!(directory.contains(id1));
        assert_eq!(directory.get(id2).unwrap().peer(), peer());

        assert!(directory.remove(id1).is_some());
        assert!(!directory.contains(id1));
        assert_eq!(directory.len(), 1);
        assert_eq!(directory.ids(), vec![id2]);
    }

    #[test]
    fn test_remove_is_exactly_once() {
        let directory = SessionDirectory::new();
        let (handle, _signals) = SessionHandle::new(peer());
        let id = directory.insert(handle);

        assert!(directory.remove(id).is_some());
        assert!(directory.remove(id).is_none());
        assert!(directory.is_empty());
    }

    #[test]
    fn test_handle_enqueue_and_close() {
        let (handle, mut signals) = SessionHandle::new(peer());

        handle.enqueue(Action::write_string("hi")).unwrap();
        assert_eq!(
            signals.inbox.try_recv().unwrap(),
            Action::write_string("hi")
        );

        assert!(!handle.is_closed());
        handle.close();
        handle.close();
        assert!(handle.is_closed());
        assert!(*signals.cancel.borrow());

        drop(signals);
        assert_eq!(handle.enqueue(Action::read()), Err(Action::read()));
    }

    #[test]
    fn test_close_all() {
        let directory = SessionDirectory::new();
        let (h1, s1) = SessionHandle::new(peer());
        let (h2, s2) = SessionHandle::new(peer());
        directory.insert(h1);
        directory.insert(h2);

        directory.close_all();
        assert!(*s1.cancel.borrow());
        assert!(*s2.cancel.borrow());
    }

    #[tokio::test]
    async fn test_drained_waits_for_last_removal() {
        let directory = Arc::new(SessionDirectory::new());
        let (handle, _signals) = SessionHandle::new(peer());
        let id = directory.insert(handle);

        let waiter = {
            let directory = Arc::clone(&directory);
            tokio::spawn(async move { directory.drained().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        directory.remove(id);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drained should complete")
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_insert_remove() {
        let directory = Arc::new(SessionDirectory::new());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let directory = Arc::clone(&directory);
            tasks.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let (handle, _signals) = SessionHandle::new(peer());
                    let id = directory.insert(handle);
                    tokio::task::yield_now().await;
                    assert!(directory.remove(id).is_some());
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(directory.is_empty());
    }
}
