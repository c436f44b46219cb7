//! Reliable byte streams over datagram endpoints, carried by QUIC.
//!
//! Each stream is one QUIC connection with one bidirectional stream,
//! running over a `PacketConn` through `MeshSocket`, which presents the
//! endpoint to quinn as a UDP socket. Mesh addresses are mapped to
//! synthetic IPv6 socket addresses. quinn supplies flow control,
//! congestion control, retransmission and keepalive.
//!
//! The dialer opens the stream and writes a single zero byte so the
//! listener sees it; the listener checks that byte before handing the
//! stream out. Certificates are throwaway: peers are identified by mesh
//! address, and authenticated streams run named TLS on top.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::io::{self, IoSliceMut};
use std::net::{Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, EndpointConfig, IdleTimeout, TransportConfig, UdpPoller, VarInt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{sleep_until, Instant, Sleep};

use strand_core::addr::Addr;
use strand_core::wire::ConnType;

use crate::error::NetError;
use crate::node::{Node, NodeInner};
use crate::packet::PacketConn;

const ALPN: &[u8] = b"strand";
const SERVER_NAME: &str = "strand";

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const IDLE_TIMEOUT_MS: u32 = 60_000;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const LINGER: Duration = Duration::from_secs(2);

/// Per-stream receive window. An idle reader stalls the writer here.
const STREAM_WINDOW: u32 = 256 * 1024;
const CONNECTION_WINDOW: u32 = 1024 * 1024;
const SEND_WINDOW: u64 = 1024 * 1024;

const SOCKET_QUEUE_DEPTH: usize = 256;

// ── Address mapping ───────────────────────────────────────────────────────────

/// Mesh addresses as quinn sees them: `fd00::/8` plus 120 bits of the
/// address hash, port 1.
#[derive(Debug)]
struct AddrMap {
    local: SocketAddr,
    peers: DashMap<SocketAddr, Addr>,
}

impl AddrMap {
    fn new(local: &Addr) -> Self {
        Self {
            local: synthetic(local),
            peers: DashMap::new(),
        }
    }

    fn socket_addr(&self, addr: &Addr) -> SocketAddr {
        let sa = synthetic(addr);
        self.peers.entry(sa).or_insert_with(|| addr.clone());
        sa
    }

    fn addr(&self, sa: &SocketAddr) -> Option<Addr> {
        self.peers.get(sa).map(|a| a.clone())
    }

    fn forget(&self, sa: &SocketAddr) {
        self.peers.remove(sa);
    }
}

fn synthetic(addr: &Addr) -> SocketAddr {
    let mut hasher = blake3::Hasher::new();
    hasher.update(addr.node.as_bytes());
    hasher.update(&[0]);
    hasher.update(addr.service.as_bytes());
    let digest = hasher.finalize();
    let mut octets = [0u8; 16];
    octets[0] = 0xfd;
    octets[1..].copy_from_slice(&digest.as_bytes()[..15]);
    SocketAddr::new(Ipv6Addr::from(octets).into(), 1)
}

// ── Socket ────────────────────────────────────────────────────────────────────

/// A `PacketConn` dressed as a UDP socket.
///
/// Inbound datagrams are pumped into a bounded queue that quinn drains;
/// outbound ones go through a bounded queue to a sender task. A full queue
/// drops the datagram, which QUIC treats as loss.
#[derive(Debug)]
struct MeshSocket {
    addrs: Arc<AddrMap>,
    inbound: Mutex<mpsc::Receiver<(Bytes, SocketAddr)>>,
    outbound: mpsc::Sender<(Addr, Bytes)>,
}

impl MeshSocket {
    /// Start the pumps for `pc`. The receiver yields errors the mesh
    /// reported synchronously while sending.
    fn spawn(
        inner: &Arc<NodeInner>,
        pc: Arc<PacketConn>,
        addrs: Arc<AddrMap>,
    ) -> (Arc<Self>, mpsc::Receiver<NetError>) {
        let (in_tx, in_rx) = mpsc::channel(SOCKET_QUEUE_DEPTH);
        let (out_tx, out_rx) = mpsc::channel(SOCKET_QUEUE_DEPTH);
        let (err_tx, err_rx) = mpsc::channel(1);

        inner.track(tokio::spawn(pump_inbound(pc.clone(), addrs.clone(), in_tx)));
        inner.track(tokio::spawn(pump_outbound(
            inner.clone(),
            pc.service().to_string(),
            pc.hops_to_live(),
            out_rx,
            err_tx,
        )));

        let socket = Arc::new(Self {
            addrs,
            inbound: Mutex::new(in_rx),
            outbound: out_tx,
        });
        (socket, err_rx)
    }
}

async fn pump_inbound(
    pc: Arc<PacketConn>,
    addrs: Arc<AddrMap>,
    tx: mpsc::Sender<(Bytes, SocketAddr)>,
) {
    while let Ok((data, from)) = pc.recv_from().await {
        let sa = addrs.socket_addr(&from);
        match tx.try_send((data, sa)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::trace!(
                    service = %pc.service(),
                    "stream socket queue full, dropping datagram"
                );
            }
            Err(TrySendError::Closed(_)) => return,
        }
    }
}

/// Sends as `service` rather than through the `PacketConn`, so close
/// packets still leave after the endpoint's name has been released.
async fn pump_outbound(
    inner: Arc<NodeInner>,
    service: String,
    hops_to_live: u8,
    mut rx: mpsc::Receiver<(Addr, Bytes)>,
    errors: mpsc::Sender<NetError>,
) {
    let mut shutdown = inner.shutdown_signal();
    loop {
        let next = tokio::select! {
            _ = shutdown.recv() => return,
            next = rx.recv() => next,
        };
        let Some((to, data)) = next else {
            return;
        };
        if let Err(e) = inner.send_message(&service, &to, hops_to_live, data).await {
            tracing::trace!(service = %service, to = %to, error = %e, "stream datagram not sent");
            let _ = errors.try_send(e);
        }
    }
}

#[derive(Debug)]
struct AlwaysWritable;

impl UdpPoller for AlwaysWritable {
    fn poll_writable(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncUdpSocket for MeshSocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Box::pin(AlwaysWritable)
    }

    fn try_send(&self, transmit: &Transmit<'_>) -> io::Result<()> {
        let Some(to) = self.addrs.addr(&transmit.destination) else {
            tracing::trace!(dest = %transmit.destination, "no mesh address for stream datagram");
            return Ok(());
        };
        let data = Bytes::copy_from_slice(transmit.contents);
        if self.outbound.try_send((to, data)).is_err() {
            tracing::trace!("stream send queue full, dropping datagram");
        }
        Ok(())
    }

    fn poll_recv(
        &self,
        cx: &mut Context<'_>,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        let mut inbound = self.inbound.lock();
        let slots = bufs.len().min(meta.len());
        let mut filled = 0;
        while filled < slots {
            let Poll::Ready(Some((data, from))) = inbound.poll_recv(cx) else {
                break;
            };
            let len = data.len().min(bufs[filled].len());
            bufs[filled][..len].copy_from_slice(&data[..len]);
            let m = &mut meta[filled];
            m.addr = from;
            m.len = len;
            m.stride = len;
            m.ecn = None;
            m.dst_ip = None;
            filled += 1;
        }
        if filled == 0 {
            // a closed queue stays pending; the endpoint winds down with its handles
            return Poll::Pending;
        }
        Poll::Ready(Ok(filled))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addrs.local)
    }

    fn may_fragment(&self) -> bool {
        false
    }
}

// ── QUIC configuration ────────────────────────────────────────────────────────

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn transport_config() -> TransportConfig {
    let mut transport = TransportConfig::default();
    transport
        .keep_alive_interval(Some(KEEPALIVE_INTERVAL))
        .max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(IDLE_TIMEOUT_MS))))
        .stream_receive_window(VarInt::from_u32(STREAM_WINDOW))
        .receive_window(VarInt::from_u32(CONNECTION_WINDOW))
        .send_window(SEND_WINDOW)
        .max_concurrent_bidi_streams(VarInt::from_u32(1))
        .max_concurrent_uni_streams(VarInt::from_u32(0));
    transport
}

fn server_config() -> Result<quinn::ServerConfig, NetError> {
    let certified = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
        .map_err(|e| NetError::Handshake(format!("certificate generation: {e}")))?;
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let mut crypto = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];
    let crypto =
        QuicServerConfig::try_from(crypto).map_err(|e| NetError::Handshake(e.to_string()))?;

    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(Arc::new(transport_config()));
    Ok(config)
}

fn client_config() -> Result<quinn::ClientConfig, NetError> {
    let provider = crypto_provider();
    let mut crypto = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AnyServerCert(provider)))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN.to_vec()];
    let crypto =
        QuicClientConfig::try_from(crypto).map_err(|e| NetError::Handshake(e.to_string()))?;

    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(Arc::new(transport_config()));
    Ok(config)
}

/// Takes any certificate but still checks handshake signatures.
#[derive(Debug)]
struct AnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn endpoint(
    socket: Arc<MeshSocket>,
    server: Option<quinn::ServerConfig>,
) -> Result<quinn::Endpoint, NetError> {
    let endpoint = quinn::Endpoint::new_with_abstract_socket(
        EndpointConfig::default(),
        server,
        socket,
        Arc::new(quinn::TokioRuntime),
    )?;
    Ok(endpoint)
}

// ── Conn ──────────────────────────────────────────────────────────────────────

/// A reliable, ordered byte stream between two mesh endpoints.
///
/// `poll_shutdown` closes the write half; the peer then reads EOF once it
/// has everything written before. Dropping the conn does the same, then
/// closes the connection once the peer has acknowledged the data or
/// `LINGER` passes.
pub struct Conn {
    local: Addr,
    peer: Addr,
    send: Option<quinn::SendStream>,
    recv: quinn::RecvStream,
    connection: quinn::Connection,
    endpoint: quinn::Endpoint,
    addrs: Arc<AddrMap>,
    /// The dialer's own endpoint, released with the conn.
    dialed: Option<Arc<PacketConn>>,
    inner: Arc<NodeInner>,
    read_timer: Option<Pin<Box<Sleep>>>,
    write_timer: Option<Pin<Box<Sleep>>>,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

fn deadline_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, NetError::Timeout)
}

impl Conn {
    pub fn local_addr(&self) -> &Addr {
        &self.local
    }

    pub fn peer_addr(&self) -> &Addr {
        &self.peer
    }

    /// Reads pending past `at` fail with `TimedOut`. `None` clears it.
    pub fn set_read_deadline(&mut self, at: Option<Instant>) {
        self.read_timer = at.map(|at| Box::pin(sleep_until(at)));
    }

    /// Writes blocked past `at` fail with `TimedOut`. `None` clears it.
    pub fn set_write_deadline(&mut self, at: Option<Instant>) {
        self.write_timer = at.map(|at| Box::pin(sleep_until(at)));
    }

    pub fn set_deadline(&mut self, at: Option<Instant>) {
        self.set_read_deadline(at);
        self.set_write_deadline(at);
    }
}

fn expired(timer: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    timer
        .as_mut()
        .is_some_and(|t| t.as_mut().poll(cx).is_ready())
}

fn write_half_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream write half is shut down")
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.recv).poll_read(cx, buf) {
            Poll::Pending if expired(&mut this.read_timer, cx) => {
                Poll::Ready(Err(deadline_error()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(send) = this.send.as_mut() else {
            return Poll::Ready(Err(write_half_closed()));
        };
        match AsyncWrite::poll_write(Pin::new(send), cx, buf) {
            Poll::Pending if expired(&mut this.write_timer, cx) => {
                Poll::Ready(Err(deadline_error()))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().send.as_mut() {
            Some(send) => Pin::new(send).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(send) = self.get_mut().send.as_mut() {
            // already finished or reset by the peer: nothing left to close
            let _ = send.finish();
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        let connection = self.connection.clone();
        let dialed = self.dialed.take();
        let send = self.send.take();
        let addrs = self.addrs.clone();
        let remote = connection.remote_address();
        let endpoint = self.endpoint.clone();

        let close = move || {
            connection.close(VarInt::from_u32(0), b"closed");
            addrs.forget(&remote);
            if let Some(pc) = dialed {
                pc.close();
            }
            drop(endpoint);
        };

        let Some(mut send) = send else {
            close();
            return;
        };
        let _ = send.finish();
        if tokio::runtime::Handle::try_current().is_err() {
            close();
            return;
        }
        let mut shutdown = self.inner.shutdown_signal();
        self.inner.track(tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.recv() => {}
                _ = tokio::time::timeout(LINGER, send.stopped()) => {}
            }
            close();
        }));
    }
}

// ── Listener ──────────────────────────────────────────────────────────────────

/// Accepts streams on one service. Closing it closes every stream it
/// accepted; their peers are told at once.
pub struct Listener {
    inner: Arc<NodeInner>,
    pc: Arc<PacketConn>,
    endpoint: quinn::Endpoint,
    addrs: Arc<AddrMap>,
}

impl Listener {
    pub async fn accept(&self) -> Result<Conn, NetError> {
        let mut shutdown = self.inner.shutdown_signal();
        loop {
            let incoming = tokio::select! {
                _ = shutdown.recv() => return Err(NetError::ShuttingDown),
                incoming = self.endpoint.accept() => incoming.ok_or(NetError::Closed)?,
            };
            let remote = incoming.remote_address();
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake(incoming)).await {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(e)) => tracing::debug!(
                    service = %self.pc.service(),
                    error = %e,
                    "stream handshake failed"
                ),
                Err(_) => tracing::debug!(
                    service = %self.pc.service(),
                    "stream handshake timed out"
                ),
            }
            self.addrs.forget(&remote);
        }
    }

    async fn handshake(&self, incoming: quinn::Incoming) -> Result<Conn, NetError> {
        let connection = incoming.await?;
        let peer = self
            .addrs
            .addr(&connection.remote_address())
            .ok_or_else(|| NetError::Handshake("unknown peer address".into()))?;
        let (send, mut recv) = connection.accept_bi().await?;
        let mut preamble = [0xffu8; 1];
        recv.read_exact(&mut preamble)
            .await
            .map_err(|e| NetError::Handshake(e.to_string()))?;
        if preamble != [0] {
            return Err(NetError::Handshake(format!("unexpected preamble {:#04x}", preamble[0])));
        }
        tracing::debug!(service = %self.pc.service(), peer = %peer, "stream accepted");
        Ok(Conn {
            local: self.pc.local_addr(),
            peer,
            send: Some(send),
            recv,
            connection,
            endpoint: self.endpoint.clone(),
            addrs: self.addrs.clone(),
            dialed: None,
            inner: self.inner.clone(),
            read_timer: None,
            write_timer: None,
        })
    }

    pub fn addr(&self) -> Addr {
        self.pc.local_addr()
    }

    pub fn close(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"listener closed");
        self.pc.close();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Node API ──────────────────────────────────────────────────────────────────

impl NodeInner {
    pub(crate) fn bind_listener(
        self: &Arc<Self>,
        service: &str,
        advertise: Option<(ConnType, BTreeMap<String, String>)>,
    ) -> Result<Listener, NetError> {
        let server = server_config()?;
        let pc = Arc::new(self.bind_packet_conn(service)?);
        let addrs = Arc::new(AddrMap::new(&pc.local_addr()));
        let (socket, _errors) = MeshSocket::spawn(self, pc.clone(), addrs.clone());
        let endpoint = endpoint(socket, Some(server))?;
        if let Some((conn_type, tags)) = advertise {
            pc.advertise(conn_type, tags);
        }
        tracing::info!(service = %pc.service(), "stream listener bound");
        Ok(Listener {
            inner: self.clone(),
            pc,
            endpoint,
            addrs,
        })
    }

    pub(crate) async fn dial(
        self: &Arc<Self>,
        node: &str,
        service: &str,
    ) -> Result<Conn, NetError> {
        let routable = node == self.id || self.routing.borrow().contains_key(node);
        if !routable {
            return Err(NetError::NoRoute(node.to_string()));
        }
        let client = client_config()?;
        let pc = Arc::new(self.bind_packet_conn("")?);
        let mut unreachable = pc.subscribe_unreachable();
        let addrs = Arc::new(AddrMap::new(&pc.local_addr()));
        let (socket, mut send_errors) = MeshSocket::spawn(self, pc.clone(), addrs.clone());
        let endpoint = endpoint(socket, None)?;

        let peer = Addr::new(node, service);
        let remote = addrs.socket_addr(&peer);
        let handshake = async {
            let connection = endpoint.connect_with(client, remote, SERVER_NAME)?.await?;
            let (mut send, recv) = connection.open_bi().await?;
            send.write_all(&[0]).await.map_err(io::Error::from)?;
            Ok::<_, NetError>((connection, send, recv))
        };

        let outcome = tokio::select! {
            result = handshake => result,
            note = unreachable.recv() => Err(match note {
                Some(note) => NetError::Unreachable(note.message.problem),
                None => NetError::ShuttingDown,
            }),
            Some(e) = send_errors.recv() => Err(e),
            _ = tokio::time::sleep(HANDSHAKE_TIMEOUT) => Err(NetError::Timeout),
        };
        match outcome {
            Ok((connection, send, recv)) => {
                tracing::debug!(node, service, "stream established");
                Ok(Conn {
                    local: pc.local_addr(),
                    peer,
                    send: Some(send),
                    recv,
                    connection,
                    endpoint,
                    addrs,
                    dialed: Some(pc),
                    inner: self.clone(),
                    read_timer: None,
                    write_timer: None,
                })
            }
            Err(e) => {
                endpoint.close(VarInt::from_u32(0), b"dial failed");
                pc.close();
                Err(e)
            }
        }
    }
}

impl Node {
    /// Accept reliable streams on `service`.
    pub fn listen(&self, service: &str) -> Result<Listener, NetError> {
        self.inner.bind_listener(service, None)
    }

    /// Like `listen`, and advertise the service to the mesh.
    pub fn listen_and_advertise(
        &self,
        service: &str,
        tags: BTreeMap<String, String>,
    ) -> Result<Listener, NetError> {
        self.inner
            .bind_listener(service, Some((ConnType::Stream, tags)))
    }

    /// Open a reliable stream to `service` on `node`.
    pub async fn dial(&self, node: &str, service: &str) -> Result<Conn, NetError> {
        self.inner.dial(node, service).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::config::NodeConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn synthetic_addresses_are_stable_and_distinct() {
        let a = synthetic(&Addr::new("n1", "svc"));
        assert_eq!(a, synthetic(&Addr::new("n1", "svc")));
        assert_ne!(a, synthetic(&Addr::new("n1", "svd")));
        assert_ne!(synthetic(&Addr::new("ab", "c")), synthetic(&Addr::new("a", "bc")));
        assert_eq!(a.port(), 1);
        match a.ip() {
            std::net::IpAddr::V6(ip) => assert_eq!(ip.octets()[0], 0xfd),
            other => panic!("expected an IPv6 address, got {other}"),
        }
    }

    #[test]
    fn addr_map_resolves_what_it_has_seen() {
        let map = AddrMap::new(&Addr::new("me", "svc"));
        let peer = Addr::new("far", "abc");
        let sa = map.socket_addr(&peer);
        assert_eq!(map.addr(&sa), Some(peer));
        map.forget(&sa);
        assert_eq!(map.addr(&sa), None);
    }

    #[tokio::test]
    async fn stream_echo_on_one_node() {
        let node = Node::new(NodeConfig::with_id("solo")).unwrap();
        let listener = node.listen("echo").unwrap();
        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            assert_eq!(conn.local_addr(), &Addr::new("solo", "echo"));
            let mut got = Vec::new();
            conn.read_to_end(&mut got).await.unwrap();
            conn.write_all(&got).await.unwrap();
            conn.shutdown().await.unwrap();
            // keep the listener alive until the client has read everything
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(listener);
        });

        let mut conn = node.dial("solo", "echo").await.unwrap();
        assert_eq!(conn.peer_addr(), &Addr::new("solo", "echo"));
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        conn.write_all(&payload).await.unwrap();
        conn.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), conn.read_to_end(&mut echoed))
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(echoed, payload);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dial_unknown_local_service_fails_fast() {
        let node = Node::new(NodeConfig::with_id("solo")).unwrap();
        let err = tokio::time::timeout(Duration::from_secs(2), node.dial("solo", "nobody"))
            .await
            .expect("dial hung")
            .err()
            .expect("dial succeeded");
        assert!(matches!(err, NetError::Unreachable(_)));
    }

    #[tokio::test]
    async fn dial_without_route_fails() {
        let node = Node::new(NodeConfig::with_id("solo")).unwrap();
        assert!(matches!(
            node.dial("far", "svc").await,
            Err(NetError::NoRoute(_))
        ));
    }

    #[tokio::test]
    async fn read_deadline_applies() {
        let node = Node::new(NodeConfig::with_id("solo")).unwrap();
        let listener = node.listen("idle").unwrap();
        let _server = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(conn);
        });
        let mut conn = node.dial("solo", "idle").await.unwrap();
        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));
        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn idle_reader_backpressures_writer() {
        let node = Node::new(NodeConfig::with_id("solo")).unwrap();
        let listener = node.listen("sink").unwrap();
        let server = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop((conn, listener));
        });

        let mut conn = node.dial("solo", "sink").await.unwrap();
        let chunk = vec![7u8; 64 * 1024];
        let mut written = 0usize;
        let filled = tokio::time::timeout(Duration::from_secs(2), async {
            while written < 64 * 1024 * 1024 {
                conn.write_all(&chunk).await.unwrap();
                written += chunk.len();
            }
        })
        .await;
        assert!(filled.is_err(), "wrote 64 MiB to a peer that never reads");
        assert!(written <= 4 * 1024 * 1024, "buffered {written} bytes for an idle reader");
        server.abort();
    }

    #[tokio::test]
    async fn write_deadline_applies_when_window_is_full() {
        let node = Node::new(NodeConfig::with_id("solo")).unwrap();
        let listener = node.listen("full").unwrap();
        let _server = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop((conn, listener));
        });

        let mut conn = node.dial("solo", "full").await.unwrap();
        conn.set_write_deadline(Some(Instant::now() + Duration::from_millis(500)));
        let chunk = vec![0u8; 64 * 1024];
        let err = loop {
            if let Err(e) = conn.write_all(&chunk).await {
                break e;
            }
        };
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn closing_listener_ends_its_streams_promptly() {
        let node = Node::new(NodeConfig::with_id("solo")).unwrap();
        let listener = node.listen("brief").unwrap();
        let accepting = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            (listener, conn)
        });
        let mut conn = node.dial("solo", "brief").await.unwrap();
        let (listener, _accepted) = accepting.await.unwrap();

        listener.close();
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(2), conn.read(&mut buf))
            .await
            .expect("peer did not learn the listener closed");
        assert!(read.is_err());
    }

    #[tokio::test]
    async fn listener_accept_fails_after_close() {
        let node = Node::new(NodeConfig::with_id("solo")).unwrap();
        let listener = node.listen("gone").unwrap();
        listener.close();
        assert!(matches!(listener.accept().await, Err(NetError::Closed)));
        assert!(node.listen("gone").is_ok(), "closing frees the service name");
    }

    #[tokio::test]
    async fn dropped_dialer_releases_its_endpoint() {
        let node = Node::new(NodeConfig::with_id("solo")).unwrap();
        let listener = node.listen("echo").unwrap();
        let accepting = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            (listener, conn)
        });
        let conn = node.dial("solo", "echo").await.unwrap();
        let ephemeral = conn.local_addr().service.clone();
        let (_listener, _accepted) = accepting.await.unwrap();
        drop(conn);
        tokio::time::timeout(Duration::from_secs(5), async {
            while node.inner.listeners.contains_key(&ephemeral) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("dialer endpoint never released");
    }
}
