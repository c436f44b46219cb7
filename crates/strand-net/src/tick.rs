//! Debounced periodic actions.
//!
//! A ticker runs its action every `period`, and additionally whenever
//! someone requests it. Requests carry a delay; the earliest pending
//! deadline wins, so a burst of requests collapses into one run.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::shutdown::Shutdown;

/// Request side of a ticker.
#[derive(Debug, Clone)]
pub struct Ticker {
    tx: mpsc::UnboundedSender<Duration>,
}

impl Ticker {
    /// Ask for the action to run within `delay`.
    pub fn request(&self, delay: Duration) {
        let _ = self.tx.send(delay);
    }
}

pub struct TickReceiver {
    rx: mpsc::UnboundedReceiver<Duration>,
}

pub fn channel() -> (Ticker, TickReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Ticker { tx }, TickReceiver { rx })
}

/// Drive `action` until shutdown, until every `Ticker` is dropped, or until
/// the action returns `false`.
pub async fn run<F>(
    mut requests: TickReceiver,
    period: Duration,
    mut shutdown: Shutdown,
    mut action: F,
)
where
    F: FnMut() -> bool,
{
    let mut next_periodic = Instant::now() + period;
    let mut requested: Option<Instant> = None;

    loop {
        let deadline = requested.map_or(next_periodic, |r| r.min(next_periodic));
        tokio::select! {
            _ = shutdown.recv() => return,

            _ = sleep_until(deadline) => {
                requested = None;
                next_periodic = Instant::now() + period;
                if !action() {
                    return;
                }
            }

            req = requests.rx.recv() => match req {
                Some(delay) => {
                    let at = Instant::now() + delay;
                    requested = Some(requested.map_or(at, |r| r.min(at)));
                }
                None => return,
            },
        }
    }
}
