//! Path lifecycle event fan-out.
//!
//! Subscribers (recording manager, health checker, websocket bridge) get a
//! bounded channel each. Delivery is non-blocking: a subscriber that cannot
//! keep up loses the event and a warning is logged, so a slow consumer can
//! never stall `set_not_ready`.

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::warn;

/// Capacity of each subscriber channel.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathEvent {
    Ready(String),
    NotReady(String),
}

impl PathEvent {
    #[must_use]
    pub fn path_name(&self) -> &str {
        match self {
            Self::Ready(name) | Self::NotReady(name) => name,
        }
    }
}

#[derive(Default)]
pub struct PathEventHub {
    subscribers: RwLock<Vec<mpsc::Sender<PathEvent>>>,
}

impl PathEventHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::Receiver<PathEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.subscribers.write().push(tx);
        rx
    }

    pub fn dispatch(&self, event: PathEvent) {
        let mut any_closed = false;
        {
            let subscribers = self.subscribers.read();
            for tx in subscribers.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            path = %event.path_name(),
                            "slow path-event subscriber, event dropped"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        any_closed = true;
                    }
                }
            }
        }
        if any_closed {
            self.subscribers.write().retain(|tx| !tx.is_closed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_reaches_all_subscribers() {
        let hub = PathEventHub::new();
        let mut rx1 = hub.subscribe();
        let mut rx2 = hub.subscribe();

        hub.dispatch(PathEvent::Ready("cam1".into()));

        assert_eq!(rx1.recv().await, Some(PathEvent::Ready("cam1".into())));
        assert_eq!(rx2.recv().await, Some(PathEvent::Ready("cam1".into())));
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_pruned() {
        let hub = PathEventHub::new();
        let rx = hub.subscribe();
        drop(rx);

        hub.dispatch(PathEvent::NotReady("cam1".into()));
        assert!(hub.subscribers.read().is_empty());
    }

    #[tokio::test]
    async fn test_full_subscriber_drops_event_without_blocking() {
        let hub = PathEventHub::new();
        let mut rx = hub.subscribe();

        for _ in 0..SUBSCRIBER_CHANNEL_CAPACITY + 10 {
            hub.dispatch(PathEvent::Ready("cam1".into()));
        }

        // The subscriber still drains the capacity's worth of events.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_CHANNEL_CAPACITY);
    }
}
