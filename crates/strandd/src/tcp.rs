//! TCP backends. Every TCP connection carries one framed session.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use strand_net::backend::{FramedSession, SessionReceiver};
use strand_net::{Backend, BackendSession, Shutdown};

const REDIAL_DELAY: Duration = Duration::from_secs(5);
const SESSION_QUEUE_DEPTH: usize = 16;

// ── Listener ──────────────────────────────────────────────────────────────────

/// Accepts TCP connections. Bound at construction so the caller can learn
/// the port before the node starts it.
pub struct TcpListenerBackend {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
}

impl TcpListenerBackend {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Backend for TcpListenerBackend {
    async fn start(&self, mut shutdown: Shutdown) -> io::Result<SessionReceiver> {
        let listener = self.listener.lock().await.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AlreadyExists, "tcp listener already started")
        })?;
        let local_addr = self.local_addr;
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "tcp listener accepting");
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::info!(addr = %local_addr, "tcp listener shutting down");
                        return;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(peer = %peer, "tcp connection accepted");
                            let _ = stream.set_nodelay(true);
                            let session: Arc<dyn BackendSession> =
                                Arc::new(FramedSession::new(stream));
                            if tx.send(session).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(addr = %local_addr, error = %e, "tcp accept failed");
                        }
                    },
                }
            }
        });
        Ok(rx)
    }
}

// ── Dialer ────────────────────────────────────────────────────────────────────

/// Connects to one remote address, and optionally reconnects whenever the
/// connection is lost or could not be made.
pub struct TcpDialerBackend {
    address: String,
    redial: bool,
    redial_delay: Duration,
}

impl TcpDialerBackend {
    pub fn new(address: impl Into<String>, redial: bool) -> Self {
        Self {
            address: address.into(),
            redial,
            redial_delay: REDIAL_DELAY,
        }
    }

    pub fn with_redial_delay(mut self, delay: Duration) -> Self {
        self.redial_delay = delay;
        self
    }
}

#[async_trait]
impl Backend for TcpDialerBackend {
    async fn start(&self, mut shutdown: Shutdown) -> io::Result<SessionReceiver> {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let address = self.address.clone();
        let redial = self.redial;
        let delay = self.redial_delay;
        tokio::spawn(async move {
            loop {
                let connected = tokio::select! {
                    _ = shutdown.recv() => return,
                    connected = TcpStream::connect(&address) => connected,
                };
                match connected {
                    Ok(stream) => {
                        tracing::info!(address = %address, "tcp peer connected");
                        let _ = stream.set_nodelay(true);
                        let session = Arc::new(FramedSession::new(stream));
                        if tx.send(session.clone() as Arc<dyn BackendSession>).await.is_err() {
                            return;
                        }
                        tokio::select! {
                            _ = shutdown.recv() => return,
                            _ = session.closed() => {
                                tracing::info!(address = %address, "tcp peer connection lost");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(address = %address, error = %e, "tcp dial failed");
                    }
                }
                if !redial {
                    tracing::debug!(address = %address, "redial disabled, dialer stopping");
                    return;
                }
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        });
        Ok(rx)
    }
}
