use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub of committed events per location, for calendar views to refresh.
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

    /// Subscribe to a location's events. Creates the channel if needed.
    pub fn subscribe(&self, location_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(location_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, location_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&location_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels nobody listens to any more.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let location = Ulid::new();
        let mut rx = hub.subscribe(location);

        let event = Event::LoanCancelled { loan_id: Ulid::new() };
        hub.send(location, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(Ulid::new(), &Event::LoanMarkedOverdue { loan_id: Ulid::new() });
    }

    #[tokio::test]
    async fn other_locations_are_not_notified() {
        let hub = NotifyHub::new();
        let here = Ulid::new();
        let there = Ulid::new();
        let mut rx = hub.subscribe(here);
        hub.send(there, &Event::LoanReturned { loan_id: Ulid::new() });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn prune_drops_closed_channels() {
        let hub = NotifyHub::new();
        let location = Ulid::new();
        let rx = hub.subscribe(location);
        drop(rx);
        hub.prune();
        assert!(hub.channels.is_empty());
    }
}
