use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for per-trip change feeds.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a trip's events. Creates the channel if needed.
    pub fn subscribe(&self, trip_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(trip_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, trip_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&trip_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a trip's channel; subscribers see the stream close.
    pub fn remove(&self, trip_id: &Ulid) {
        self.channels.remove(trip_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let trip_id = Ulid::new();
        let mut rx = hub.subscribe(trip_id);

        let event = Event::HoldReleased {
            id: Ulid::new(),
            trip_id,
            at: 1_000,
        };
        hub.send(trip_id, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let trip_id = Ulid::new();
        hub.send(trip_id, &Event::TripDeleted { id: trip_id });
    }

    #[tokio::test]
    async fn other_trips_are_not_delivered() {
        let hub = NotifyHub::new();
        let watched = Ulid::new();
        let mut rx = hub.subscribe(watched);

        let other = Ulid::new();
        hub.send(other, &Event::TripDeleted { id: other });
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn remove_closes_stream() {
        let hub = NotifyHub::new();
        let trip_id = Ulid::new();
        let mut rx = hub.subscribe(trip_id);
        hub.remove(&trip_id);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
