//! Typed deck events and their in-process fan-out bus.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// A slider reported a new absolute position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliderMoveEvent {
    /// Zero-based slider index.
    pub slider: usize,
    /// Normalized position in `[0.0, 1.0]`.
    pub value: f32,
}

/// A button reported a raw value different from the last one seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEvent {
    /// Zero-based button index.
    pub button: usize,
    /// Raw value as reported by the deck.
    pub value: i32,
}

/// Registration-ordered fan-out of one event stream to N subscribers.
///
/// Subscriptions are permanent for the lifetime of the owning connection;
/// there is no unsubscribe. Delivery is sequential and awaits every
/// subscriber in turn, so a stalled consumer stalls the whole dispatch
/// path behind it - that backpressure is part of the contract.
pub struct EventBus<T> {
    senders: Mutex<Vec<mpsc::Sender<T>>>,
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber.
    ///
    /// Capacity 1 keeps delivery in lockstep with the dispatch loop.
    pub fn subscribe(&self) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(1);
        self.senders.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().len()
    }

    /// Deliver one event to every subscriber, in registration order.
    pub async fn publish(&self, event: T) {
        let senders = self.senders.lock().clone();
        for sender in senders {
            if sender.send(event.clone()).await.is_err() {
                debug!("Dropping event for a closed subscriber");
            }
        }
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(SliderMoveEvent {
            slider: 2,
            value: 0.5,
        })
        .await;

        assert_eq!(first.recv().await.unwrap().slider, 2);
        assert_eq!(second.recv().await.unwrap().value, 0.5);
    }

    #[tokio::test]
    async fn closed_subscriber_does_not_block_the_rest() {
        let bus = EventBus::new();
        let first = bus.subscribe();
        let mut second = bus.subscribe();
        drop(first);

        bus.publish(ButtonEvent {
            button: 0,
            value: 1,
        })
        .await;

        assert_eq!(second.recv().await.unwrap().button, 0);
        assert_eq!(bus.subscriber_count(), 2);
    }
}
