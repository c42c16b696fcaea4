use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;

/// Per-subscriber buffer depth. A subscriber that falls this far behind
/// starts losing events instead of stalling the publisher.
pub const SUBSCRIBER_BUFFER: usize = 256;

/// Publish/subscribe hub for world events. Events are opaque strings;
/// delivery is best-effort and non-blocking.
#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<SyncSender<String>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<String> {
        let (sender, receiver) = sync_channel(SUBSCRIBER_BUFFER);
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.push(sender);
        receiver
    }

    /// Delivers the event to every live subscriber. Full buffers drop the
    /// event for that subscriber; disconnected subscribers are pruned.
    pub fn publish(&self, event: impl Into<String>) {
        let event = event.into();
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|subscriber| match subscriber.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn subscribers_receive_published_events() {
        let hub = EventHub::new();
        let first = hub.subscribe();
        let second = hub.subscribe();
        hub.publish("hello");
        assert_eq!(first.recv_timeout(Duration::from_secs(1)).expect("recv"), "hello");
        assert_eq!(second.recv_timeout(Duration::from_secs(1)).expect("recv"), "hello");
    }

    #[test]
    fn slow_subscriber_drops_instead_of_blocking() {
        let hub = EventHub::new();
        let receiver = hub.subscribe();
        for index in 0..SUBSCRIBER_BUFFER + 50 {
            hub.publish(format!("event-{index}"));
        }
        // The publisher never blocked; the receiver sees the buffered prefix.
        let mut received = 0;
        while receiver.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let hub = EventHub::new();
        let receiver = hub.subscribe();
        drop(receiver);
        hub.publish("gone");
        assert_eq!(hub.subscriber_count(), 0);
    }
}
