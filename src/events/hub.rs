//! Broadcast hub shared by the lifecycle event and progress streams.
//!
//! The hub wraps a tokio broadcast channel with two loomflow-specific
//! behaviors: publishing with zero subscribers is a successful no-op (a
//! silent bus is a normal configuration, not an error), and shutdown is a
//! `watch` flag rather than dropping the sender, so subscribers drain
//! whatever is still buffered before their stream ends.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::{broadcast, watch};

use super::emitter::EmitterError;

/// Snapshot of hub health for monitoring and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubMetrics {
    /// Per-subscriber buffer depth before lag sets in.
    pub capacity: usize,
    /// Items accepted by `publish` over the hub's lifetime.
    pub published: usize,
    /// Items lost to subscribers that fell behind.
    pub dropped: usize,
}

/// Multi-producer broadcast channel with publish/drop accounting.
///
/// Generic over the payload so the same machinery serves both the
/// lifecycle event stream and the progress snapshot stream.
#[derive(Debug)]
pub struct BroadcastHub<T> {
    sender: broadcast::Sender<T>,
    shutdown: watch::Sender<bool>,
    published: AtomicUsize,
    dropped: AtomicUsize,
    capacity: usize,
}

impl<T: Clone + Send + 'static> BroadcastHub<T> {
    /// Create a new hub. `capacity` is clamped to at least 1 to satisfy
    /// the broadcast API.
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            sender,
            shutdown,
            published: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            capacity,
        })
    }

    /// Publish to all current subscribers.
    ///
    /// A hub with no subscribers accepts and drops the item; only a hub
    /// that has been shut down refuses with [`EmitterError::Closed`].
    pub fn publish(&self, item: T) -> Result<(), EmitterError> {
        if *self.shutdown.borrow() {
            return Err(EmitterError::Closed);
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        // send errs only when nobody is subscribed, which is fine here.
        let _ = self.sender.send(item);
        Ok(())
    }

    /// Subscribe to items published from this point on.
    ///
    /// Subscribing to a hub that already shut down yields a stream that
    /// ends on its first poll.
    pub fn subscribe(self: &Arc<Self>) -> EventStream<T> {
        EventStream {
            receiver: self.sender.subscribe(),
            closed: self.shutdown.subscribe(),
            hub: Arc::clone(self),
        }
    }

    pub fn metrics(&self) -> HubMetrics {
        HubMetrics {
            capacity: self.capacity,
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Flip the shutdown flag. Publishers start refusing immediately;
    /// subscribers finish draining their buffers, then end.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    fn note_dropped(&self, missed: u64) {
        let missed = usize::try_from(missed).unwrap_or(usize::MAX);
        self.dropped.fetch_add(missed, Ordering::Relaxed);
        tracing::warn!(
            target: "loomflow::events",
            missed,
            "slow subscriber fell behind; broadcast items dropped"
        );
    }
}

/// Subscriber handle over a hub's broadcast channel.
#[derive(Debug)]
pub struct EventStream<T> {
    receiver: broadcast::Receiver<T>,
    closed: watch::Receiver<bool>,
    hub: Arc<BroadcastHub<T>>,
}

impl<T: Clone + Send + 'static> EventStream<T> {
    /// Receive the next item.
    ///
    /// Buffered items are always drained before the shutdown flag is
    /// honored, so a close never loses events that were already published.
    pub async fn recv(&mut self) -> Result<T, broadcast::error::RecvError> {
        loop {
            match self.receiver.try_recv() {
                Ok(item) => return Ok(item),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    self.hub.note_dropped(missed);
                    continue;
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(broadcast::error::RecvError::Closed);
                }
                Err(broadcast::error::TryRecvError::Empty) => {}
            }
            if *self.closed.borrow() {
                return Err(broadcast::error::RecvError::Closed);
            }
            tokio::select! {
                _ = self.closed.changed() => {
                    // Loop back to drain anything that raced the close.
                }
                result = self.receiver.recv() => {
                    if let Err(broadcast::error::RecvError::Lagged(missed)) = &result {
                        self.hub.note_dropped(*missed);
                    }
                    return result;
                }
            }
        }
    }

    /// Non-blocking receive; lag is accounted and surfaced to the caller.
    pub fn try_recv(&mut self) -> Result<T, broadcast::error::TryRecvError> {
        let result = self.receiver.try_recv();
        if let Err(broadcast::error::TryRecvError::Lagged(missed)) = &result {
            self.hub.note_dropped(*missed);
        }
        result
    }

    /// Poll until an item arrives, the stream ends, or the deadline
    /// elapses. Lag notifications are absorbed and retried.
    pub async fn next_timeout(&mut self, duration: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            let result = tokio::time::timeout_at(deadline, self.recv()).await;
            match result {
                Ok(Ok(item)) => return Some(item),
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
            }
        }
    }

    /// Convert into a boxed stream so callers can plug the subscription
    /// into combinators (SSE bridges, `StreamExt` pipelines) without
    /// worrying about pinning at the call site.
    pub fn into_async_stream(self) -> BoxStream<'static, T> {
        stream::unfold(self, |mut subscription| async move {
            loop {
                match subscription.recv().await {
                    Ok(item) => return Some((item, subscription)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    /// Drain everything currently buffered without waiting. Lagged
    /// stretches are skipped over, not treated as end-of-stream.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        loop {
            match self.try_recv() {
                Ok(item) => out.push(item),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let hub = BroadcastHub::new(16);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        hub.publish(7u32).unwrap();
        assert_eq!(a.recv().await.unwrap(), 7);
        assert_eq!(b.recv().await.unwrap(), 7);
        assert_eq!(hub.metrics().published, 1);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let hub = BroadcastHub::new(4);
        assert!(hub.publish(1u32).is_ok());
        assert_eq!(hub.metrics().published, 1);
    }

    #[tokio::test]
    async fn close_refuses_publishers_but_drains_subscribers() {
        let hub = BroadcastHub::new(4);
        let mut stream = hub.subscribe();
        hub.publish(1u32).unwrap();
        hub.close();

        assert!(matches!(hub.publish(2u32), Err(EmitterError::Closed)));
        // The item published before the close is still delivered.
        assert_eq!(stream.next_timeout(Duration::from_millis(50)).await, Some(1));
        assert!(stream.next_timeout(Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn lag_is_accounted() {
        let hub = BroadcastHub::new(1);
        let mut stream = hub.subscribe();
        hub.publish(1u32).unwrap();
        hub.publish(2u32).unwrap();
        hub.publish(3u32).unwrap();
        // Only the newest item survives a capacity-1 buffer.
        assert_eq!(stream.recv().await.unwrap(), 3);
        assert_eq!(hub.metrics().dropped, 2);
    }
}
