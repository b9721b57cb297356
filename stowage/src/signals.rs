//! Module to control shutdown in stowage.
//!
//! The daemon runs a receiver, a flush scheduler and a pool of in-flight
//! work, all of which must wind down together. A [`Broadcaster`] signals
//! once; every component holds a [`Watcher`] and exits its run loop on
//! receipt.

use tokio::sync::broadcast::{self, error::RecvError};

/// Construct a connected [`Broadcaster`] and [`Watcher`] pair.
///
/// There is one `Broadcaster`; additional `Watcher` instances come from
/// cloning the first.
#[must_use]
pub fn pair() -> (Broadcaster, Watcher) {
    let (sender, receiver) = broadcast::channel(1);
    (Broadcaster { sender }, Watcher { receiver })
}

#[derive(Debug)]
/// Sending half of the shutdown signal.
pub struct Broadcaster {
    sender: broadcast::Sender<()>,
}

impl Broadcaster {
    /// Send the signal to every [`Watcher`].
    ///
    /// Dropping the `Broadcaster` without calling this has the same effect;
    /// a signal cannot be lost by arriving early.
    pub fn signal(self) {
        // Watchers treat a closed channel as the signal, so consuming self
        // is the whole implementation.
        drop(self.sender);
    }
}

#[derive(Debug)]
/// Receiving half of the shutdown signal.
pub struct Watcher {
    receiver: broadcast::Receiver<()>,
}

impl Watcher {
    /// Wait for the signal. Returns immediately if it was already sent.
    pub async fn recv(self) {
        let mut receiver = self.receiver;
        loop {
            match receiver.recv().await {
                Ok(()) | Err(RecvError::Closed) => return,
                // Only one value is ever sent, so lagging cannot drop it;
                // re-poll for the closed channel.
                Err(RecvError::Lagged(_)) => {}
            }
        }
    }
}

impl Clone for Watcher {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.resubscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_watcher_observes_the_signal() {
        let (broadcaster, watcher) = pair();
        let second = watcher.clone();

        let first_task = tokio::spawn(watcher.recv());
        let second_task = tokio::spawn(second.recv());

        broadcaster.signal();
        first_task.await.expect("watcher completes");
        second_task.await.expect("watcher completes");
    }

    #[tokio::test]
    async fn late_watchers_resolve_immediately() {
        let (broadcaster, watcher) = pair();
        broadcaster.signal();

        let late = watcher.clone();
        watcher.recv().await;
        late.recv().await;
    }

    #[tokio::test]
    async fn dropping_the_broadcaster_counts_as_signalling() {
        let (broadcaster, watcher) = pair();
        drop(broadcaster);
        watcher.recv().await;
    }
}
