//! Broadcast of the current aggregate to any number of subscribers.
//!
//! A [`Subscription`] starts with the value that was current when it was
//! created and then sees every later publish in order. Publishing never
//! waits on subscribers.

use parking_lot::RwLock;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};

/// Holds the latest aggregate and fans each new one out to subscribers.
///
/// `publish` and `subscribe` both take the `latest` lock, so a new
/// subscriber's starting value and its first broadcast value are always
/// adjacent: nothing is skipped and nothing is seen twice.
pub(crate) struct Publisher<P> {
    latest: RwLock<P>,
    sender: broadcast::Sender<P>,
}

impl<P: Clone + Send + Sync + 'static> Publisher<P> {
    /// Create a publisher holding `initial`.
    ///
    /// `capacity` is how many values a slow subscriber may fall behind before
    /// it starts skipping; it is clamped to at least 1.
    pub(crate) fn new(initial: P, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            latest: RwLock::new(initial),
            sender,
        }
    }

    /// Make `value` current and send it to every subscriber.
    pub(crate) fn publish(&self, value: P) {
        let mut latest = self.latest.write();
        *latest = value.clone();
        // Having no subscribers is normal.
        let _ = self.sender.send(value);
    }

    /// Clone of the current value.
    pub(crate) fn current(&self) -> P {
        self.latest.read().clone()
    }

    pub(crate) fn subscribe(&self) -> Subscription<P> {
        let latest = self.latest.read();
        Subscription {
            pending: Some(latest.clone()),
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live subscriptions.
    pub(crate) fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A stream of published aggregates.
///
/// Yields the aggregate that was current at subscription time, then every
/// later published aggregate in publish order. A subscriber that falls more
/// than the transactor's publish capacity behind skips ahead to the oldest
/// value still retained; it never sees an older value after a newer one.
///
/// Ends once the transactor and all its handles are dropped.
#[derive(Debug)]
pub struct Subscription<P> {
    pending: Option<P>,
    receiver: broadcast::Receiver<P>,
}

impl<P: Clone + Send + 'static> Subscription<P> {
    /// Wait for the next value.
    ///
    /// Returns `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<P> {
        if let Some(value) = self.pending.take() {
            return Some(value);
        }

        loop {
            match self.receiver.recv().await {
                Ok(value) => return Some(value),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscriber lagged, skipping ahead");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next value if one is ready, without waiting.
    pub fn try_recv(&mut self) -> Option<P> {
        if let Some(value) = self.pending.take() {
            return Some(value);
        }

        loop {
            match self.receiver.try_recv() {
                Ok(value) => return Some(value),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscriber lagged, skipping ahead");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a [`Stream`] with the same sequence of values.
    pub fn into_stream(self) -> impl Stream<Item = P> + Send + 'static {
        let live = BroadcastStream::new(self.receiver).filter_map(|item| match item {
            Ok(value) => Some(value),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "subscriber lagged, skipping ahead");
                None
            }
        });
        tokio_stream::iter(self.pending).chain(live)
    }
}
