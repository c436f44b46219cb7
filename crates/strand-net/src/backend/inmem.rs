//! In-process backend pair, used by tests and embedders that want two
//! nodes in one process without a transport.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{Backend, BackendSession, SessionReceiver};
use crate::shutdown::Shutdown;

const QUEUE_DEPTH: usize = 256;

/// One end of an in-memory session.
pub struct InMemorySession {
    tx: mpsc::Sender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    closed: Arc<watch::Sender<bool>>,
}

impl InMemorySession {
    /// Two connected sessions. Closing either closes both.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(QUEUE_DEPTH);
        let (b_tx, b_rx) = mpsc::channel(QUEUE_DEPTH);
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        (
            Self {
                tx: a_tx,
                rx: tokio::sync::Mutex::new(b_rx),
                closed: closed.clone(),
            },
            Self {
                tx: b_tx,
                rx: tokio::sync::Mutex::new(a_rx),
                closed,
            },
        )
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "in-memory session closed")
}

#[async_trait]
impl BackendSession for InMemorySession {
    async fn send(&self, frame: Bytes) -> io::Result<()> {
        if self.is_closed() {
            return Err(broken_pipe());
        }
        self.tx.send(frame).await.map_err(|_| broken_pipe())
    }

    async fn recv(&self) -> io::Result<Bytes> {
        let mut closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            frame = rx.recv() => frame.ok_or_else(broken_pipe),
            _ = closed.wait_for(|c| *c) => Err(broken_pipe()),
        }
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.send_replace(true);
        Ok(())
    }
}

/// Backend yielding a single pre-made session.
pub struct InMemoryBackend {
    session: Mutex<Option<Arc<dyn BackendSession>>>,
}

impl InMemoryBackend {
    /// Two backends whose sessions are connected to each other.
    pub fn pair() -> (Self, Self) {
        let (a, b) = InMemorySession::pair();
        (Self::from_session(a), Self::from_session(b))
    }

    pub fn from_session(session: impl BackendSession + 'static) -> Self {
        Self {
            session: Mutex::new(Some(Arc::new(session))),
        }
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn start(&self, _shutdown: Shutdown) -> io::Result<SessionReceiver> {
        let session = self.session.lock().take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AlreadyExists, "in-memory backend already started")
        })?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(session);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sessions_are_crossed() {
        let (a, b) = InMemorySession::pair();
        a.send(Bytes::from_static(b"ping")).await.unwrap();
        b.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"ping"));
        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn closing_one_end_closes_both() {
        let (a, b) = InMemorySession::pair();
        let pending = tokio::spawn(async move { b.recv().await });
        a.close().await.unwrap();
        assert!(pending.await.unwrap().is_err());
        assert!(a.send(Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn backend_starts_only_once() {
        let (backend, _other) = InMemoryBackend::pair();
        let (_tx, rx) = watch::channel(false);
        let mut sessions = backend.start(Shutdown::new(rx.clone())).await.unwrap();
        assert!(sessions.recv().await.is_some());
        assert!(backend.start(Shutdown::new(rx)).await.is_err());
    }
}
