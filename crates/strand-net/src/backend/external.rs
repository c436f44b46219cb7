//! Externally fed backend.
//!
//! Code outside the engine accepts or dials connections however it likes
//! and hands them over with `new_connection` (any byte stream, framed with
//! a 4-byte big-endian length prefix) or `new_session` (anything already
//! message-oriented).

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};

use super::{Backend, BackendSession, SessionReceiver};
use crate::shutdown::Shutdown;

/// Largest frame a `FramedSession` accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

// ── Framed session ────────────────────────────────────────────────────────────

/// Message framing over a byte stream: `u32` big-endian length, then bytes.
pub struct FramedSession<S> {
    reader: tokio::sync::Mutex<ReadHalf<S>>,
    writer: tokio::sync::Mutex<WriteHalf<S>>,
    closed: watch::Sender<bool>,
}

impl<S> FramedSession<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);
        Self {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the session has been closed or has failed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    fn fail(&self, e: io::Error) -> io::Error {
        self.closed.send_replace(true);
        e
    }
}

#[async_trait]
impl<S> BackendSession for FramedSession<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, frame: Bytes) -> io::Result<()> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds {MAX_FRAME_LEN}", frame.len()),
            ));
        }
        let mut w = self.writer.lock().await;
        let len = frame.len() as u32;
        let result = async {
            w.write_u32(len).await?;
            w.write_all(&frame).await?;
            w.flush().await
        }
        .await;
        result.map_err(|e| self.fail(e))
    }

    async fn recv(&self) -> io::Result<Bytes> {
        let mut r = self.reader.lock().await;
        let len = r.read_u32().await.map_err(|e| self.fail(e))? as usize;
        if len > MAX_FRAME_LEN {
            return Err(self.fail(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("peer announced a {len} byte frame"),
            )));
        }
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf).await.map_err(|e| self.fail(e))?;
        Ok(Bytes::from(buf))
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.send_replace(true);
        let mut w = self.writer.lock().await;
        w.shutdown().await
    }
}

// ── External backend ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ExternalBackend {
    tx: mpsc::Sender<Arc<dyn BackendSession>>,
    rx: Arc<Mutex<Option<SessionReceiver>>>,
}

impl Default for ExternalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalBackend {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(16);
        Self {
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
        }
    }

    /// Hand over a byte stream. Returns the framed session so the caller can
    /// wait on `closed()`.
    pub async fn new_connection<S>(&self, stream: S) -> io::Result<Arc<FramedSession<S>>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session = Arc::new(FramedSession::new(stream));
        self.new_session(session.clone()).await?;
        Ok(session)
    }

    /// Hand over an already message-oriented session.
    pub async fn new_session(&self, session: Arc<dyn BackendSession>) -> io::Result<()> {
        self.tx
            .send(session)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "external backend stopped"))
    }
}

#[async_trait]
impl Backend for ExternalBackend {
    async fn start(&self, mut shutdown: Shutdown) -> io::Result<SessionReceiver> {
        let mut incoming = self.rx.lock().take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AlreadyExists, "external backend already started")
        })?;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::info!("external backend shutting down");
                        return;
                    }
                    session = incoming.recv() => match session {
                        Some(s) => {
                            if tx.send(s).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    },
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn framing_preserves_message_boundaries() {
        let (a, b) = tokio::io::duplex(64);
        let a = FramedSession::new(a);
        let b = FramedSession::new(b);
        let sender = tokio::spawn(async move {
            a.send(Bytes::from_static(b"first")).await.unwrap();
            a.send(Bytes::new()).await.unwrap();
            a.send(Bytes::from(vec![7u8; 1000])).await.unwrap();
            a
        });
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"first"));
        assert_eq!(b.recv().await.unwrap(), Bytes::new());
        assert_eq!(b.recv().await.unwrap().len(), 1000);
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_length_prefix_fails_the_session() {
        let (mut raw, framed) = tokio::io::duplex(64);
        let framed = FramedSession::new(framed);
        raw.write_u32(u32::MAX).await.unwrap();
        let err = framed.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(framed.is_closed());
    }

    #[tokio::test]
    async fn peer_hangup_is_an_error() {
        let (raw, framed) = tokio::io::duplex(64);
        let framed = FramedSession::new(framed);
        drop(raw);
        assert!(framed.recv().await.is_err());
        framed.closed().await;
    }

    #[tokio::test]
    async fn sessions_flow_through_once_started() {
        let backend = ExternalBackend::new();
        let (_tx, rx) = watch::channel(false);
        let mut sessions = backend.start(Shutdown::new(rx)).await.unwrap();
        let (a, _b) = tokio::io::duplex(64);
        backend.new_connection(a).await.unwrap();
        assert!(sessions.recv().await.is_some());
    }
}
