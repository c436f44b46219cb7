//! TLS over mesh streams.
//!
//! TLS configs are registered on the node under a name and referenced by
//! that name when dialing or listening. The server name presented by a
//! dialer is the target node ID.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use strand_core::wire::ConnType;

use crate::error::NetError;
use crate::node::Node;
use crate::stream::{Conn, Listener};

/// Named TLS configs of one node.
#[derive(Default)]
pub struct TlsRegistry {
    client: DashMap<String, Arc<ClientConfig>>,
    server: DashMap<String, Arc<ServerConfig>>,
}

impl TlsRegistry {
    pub fn set_client(&self, name: &str, config: ClientConfig) {
        self.client.insert(name.to_string(), Arc::new(config));
    }

    pub fn set_server(&self, name: &str, config: ServerConfig) {
        self.server.insert(name.to_string(), Arc::new(config));
    }

    pub fn client(&self, name: &str) -> Result<Arc<ClientConfig>, NetError> {
        self.client
            .get(name)
            .map(|c| c.value().clone())
            .ok_or_else(|| NetError::UnknownTlsConfig(name.to_string()))
    }

    pub fn server(&self, name: &str) -> Result<Arc<ServerConfig>, NetError> {
        self.server
            .get(name)
            .map(|c| c.value().clone())
            .ok_or_else(|| NetError::UnknownTlsConfig(name.to_string()))
    }
}

/// A stream listener that completes a TLS handshake on every accepted conn.
pub struct TlsListener {
    listener: Listener,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    pub async fn accept(&self) -> Result<server::TlsStream<Conn>, NetError> {
        let conn = self.listener.accept().await?;
        let peer = conn.peer_addr().clone();
        self.acceptor.accept(conn).await.map_err(|e| {
            tracing::debug!(peer = %peer, error = %e, "TLS handshake failed");
            NetError::Io(e)
        })
    }

    pub fn addr(&self) -> strand_core::Addr {
        self.listener.addr()
    }

    pub fn close(&self) {
        self.listener.close();
    }
}

impl Node {
    pub fn set_client_tls_config(&self, name: &str, config: ClientConfig) {
        self.inner.tls.set_client(name, config);
    }

    pub fn set_server_tls_config(&self, name: &str, config: ServerConfig) {
        self.inner.tls.set_server(name, config);
    }

    pub fn client_tls_config(&self, name: &str) -> Result<Arc<ClientConfig>, NetError> {
        self.inner.tls.client(name)
    }

    pub fn server_tls_config(&self, name: &str) -> Result<Arc<ServerConfig>, NetError> {
        self.inner.tls.server(name)
    }

    /// Dial `service` on `node` and run a TLS client handshake over it.
    pub async fn dial_tls(
        &self,
        node: &str,
        service: &str,
        tls_config: &str,
    ) -> Result<client::TlsStream<Conn>, NetError> {
        let config = self.inner.tls.client(tls_config)?;
        let server_name = ServerName::try_from(node)
            .map(|n| n.to_owned())
            .map_err(|_| NetError::InvalidServerName(node.to_string()))?;
        let conn = self.dial(node, service).await?;
        let stream = TlsConnector::from(config).connect(server_name, conn).await?;
        Ok(stream)
    }

    /// Accept TLS streams on `service` using the named server config.
    pub fn listen_tls(&self, service: &str, tls_config: &str) -> Result<TlsListener, NetError> {
        let acceptor = TlsAcceptor::from(self.inner.tls.server(tls_config)?);
        let listener = self.inner.bind_listener(service, None)?;
        Ok(TlsListener { listener, acceptor })
    }

    /// Like `listen_tls`, and advertise the service as TLS.
    pub fn listen_and_advertise_tls(
        &self,
        service: &str,
        tls_config: &str,
        tags: BTreeMap<String, String>,
    ) -> Result<TlsListener, NetError> {
        let acceptor = TlsAcceptor::from(self.inner.tls.server(tls_config)?);
        let listener = self
            .inner
            .bind_listener(service, Some((ConnType::StreamTls, tags)))?;
        Ok(TlsListener { listener, acceptor })
    }
}
