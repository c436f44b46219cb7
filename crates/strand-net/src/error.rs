use strand_core::firewall::FirewallError;
use strand_core::wire::{Problem, WireError};

/// Errors surfaced to applications using the mesh.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("service name {0:?} is longer than 8 bytes")]
    ServiceNameTooLong(String),

    #[error("service {0:?} is reserved")]
    ReservedService(String),

    #[error("service {0:?} is already listening")]
    ServiceInUse(String),

    #[error("no route to node {0}")]
    NoRoute(String),

    /// The mesh reported the message undeliverable.
    #[error("{0}")]
    Unreachable(Problem),

    #[error("connection closed")]
    Closed,

    #[error("connection reset by peer")]
    Reset,

    #[error("timed out")]
    Timeout,

    #[error("node is shutting down")]
    ShuttingDown,

    #[error("link to {0} is gone")]
    LinkClosed(String),

    #[error("node id must not be empty")]
    EmptyNodeId,

    #[error("no TLS config named {0:?}")]
    UnknownTlsConfig(String),

    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),

    #[error("stream handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Connect(#[from] quinn::ConnectError),

    #[error(transparent)]
    Connection(#[from] quinn::ConnectionError),

    #[error(transparent)]
    Firewall(#[from] FirewallError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<NetError> for std::io::Error {
    fn from(e: NetError) -> Self {
        use std::io::ErrorKind;
        let kind = match &e {
            NetError::Io(inner) => inner.kind(),
            NetError::Closed | NetError::LinkClosed(_) | NetError::ShuttingDown => {
                ErrorKind::NotConnected
            }
            NetError::Reset => ErrorKind::ConnectionReset,
            NetError::Timeout => ErrorKind::TimedOut,
            NetError::NoRoute(_) | NetError::Unreachable(_) => ErrorKind::ConnectionRefused,
            NetError::ServiceInUse(_) => ErrorKind::AddrInUse,
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}
