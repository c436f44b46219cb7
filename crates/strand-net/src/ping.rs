//! Ping and traceroute over the reserved `ping` service.
//!
//! Every node echoes whatever arrives on `ping` back to the sender. A
//! request is an empty datagram; the reply is recognised by its source.
//! Traceroute is a series of pings with a growing hop budget: each one
//! that runs out of hops is reported by the node where it expired.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use strand_core::addr::Addr;
use strand_core::wire::{Problem, PING_SERVICE};

use crate::error::NetError;
use crate::node::Node;

const PING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Pong {
    /// Node that answered.
    pub remote: String,
    pub elapsed: Duration,
}

#[derive(Debug, thiserror::Error)]
#[error("ping failed after {elapsed:?}: {source}")]
pub struct PingError {
    /// Node that reported the failure, if any did.
    pub remote: Option<String>,
    pub elapsed: Duration,
    #[source]
    pub source: NetError,
}

#[derive(Debug)]
pub struct TracerouteResult {
    pub hop: u8,
    /// Node that answered at this hop.
    pub from: Option<String>,
    pub time: Duration,
    pub err: Option<NetError>,
}

impl Node {
    /// Ping `target`, allowing the request `hops_to_live` forwards.
    pub async fn ping(&self, target: &str, hops_to_live: u8) -> Result<Pong, PingError> {
        let start = Instant::now();
        let fail = |remote: Option<String>, source: NetError| PingError {
            remote,
            elapsed: start.elapsed(),
            source,
        };

        let pc = self.listen_packet("").map_err(|e| fail(None, e))?;
        pc.set_hops_to_live(hops_to_live);
        let mut unreachable = pc.subscribe_unreachable();
        let responder = Addr::new(target, PING_SERVICE);
        pc.send_to(Bytes::new(), &responder)
            .await
            .map_err(|e| fail(None, e))?;

        let reply = async {
            loop {
                tokio::select! {
                    received = pc.recv_from() => match received {
                        Ok((_, from)) => {
                            if from == responder {
                                return Ok::<String, (Option<String>, NetError)>(from.node);
                            }
                        }
                        Err(e) => return Err((None, e)),
                    },
                    note = unreachable.recv() => {
                        return Err(match note {
                            Some(note) => (
                                Some(note.received_from_node),
                                NetError::Unreachable(note.message.problem),
                            ),
                            None => (None, NetError::ShuttingDown),
                        });
                    }
                }
            }
        };
        match tokio::time::timeout(PING_TIMEOUT, reply).await {
            Ok(Ok(remote)) => Ok(Pong {
                remote,
                elapsed: start.elapsed(),
            }),
            Ok(Err((remote, e))) => Err(fail(remote, e)),
            Err(_) => Err(fail(None, NetError::Timeout)),
        }
    }

    /// Trace the path to `target`, one result per hop, ending at the target
    /// or at the first failure that is not an expired hop budget.
    pub fn traceroute(&self, target: &str) -> mpsc::Receiver<TracerouteResult> {
        let (tx, rx) = mpsc::channel(8);
        let node = self.clone();
        let target = target.to_string();
        tokio::spawn(async move {
            for hop in 0..=node.config().max_forwarding_hops {
                let (result, done) = match node.ping(&target, hop).await {
                    Ok(pong) => (
                        TracerouteResult {
                            hop,
                            from: Some(pong.remote),
                            time: pong.elapsed,
                            err: None,
                        },
                        true,
                    ),
                    Err(e) => {
                        let expired =
                            matches!(e.source, NetError::Unreachable(Problem::ExpiredInTransit));
                        (
                            TracerouteResult {
                                hop,
                                from: e.remote,
                                time: e.elapsed,
                                err: Some(e.source),
                            },
                            !expired,
                        )
                    }
                };
                if tx.send(result).await.is_err() || done {
                    return;
                }
            }
        });
        rx
    }
}
