//! Node-wide shutdown signal.

use tokio::sync::watch;

/// Cloneable handle every background task selects on.
///
/// Unlike a broadcast receiver, a handle created after shutdown was
/// signalled still observes it. If the node itself is dropped the signal
/// fires as well.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been signalled.
    pub async fn recv(&mut self) {
        let _ = self.rx.wait_for(|down| *down).await;
    }
}
