//! strand-net: the mesh engine.
//!
//! A `Node` owns every piece of shared mesh state: links, the known
//! connection graph, the routing table, the service listener registry and
//! advertisements. Backends hand it sessions; each session runs the link
//! protocol in its own task. Applications talk to the mesh through
//! `PacketConn` (datagrams) and `Listener`/`Conn` (reliable streams).

pub mod ads;
pub mod backend;
pub mod error;
pub mod link;
pub mod names;
pub mod node;
pub mod packet;
pub mod ping;
pub mod shutdown;
pub mod stream;
pub mod tick;
pub mod tls;

pub use backend::{Backend, BackendOptions, BackendSession};
pub use error::NetError;
pub use node::{ConnectionStatus, Node, Status};
pub use packet::{PacketConn, UnreachableNotification, UnreachableSubscription};
pub use ping::{PingError, Pong, TracerouteResult};
pub use shutdown::Shutdown;
pub use stream::{Conn, Listener};
pub use tls::{TlsListener, TlsRegistry};

pub use strand_core::{Addr, MessageData, Problem};
