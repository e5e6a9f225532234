use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::WindowEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for window changes, one channel per tutor. Calendar views
/// subscribe to refresh when a window is published, held, released or
/// withdrawn.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<WindowEvent>>,
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

    /// Subscribe to an owner's window changes. Creates the channel if needed.
    pub fn subscribe(&self, owner_id: &str) -> broadcast::Receiver<WindowEvent> {
        self.channels
            .entry(owner_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, event: &WindowEvent) {
        let owner_id = event.owner_id();
        let orphaned = match self.channels.get(owner_id) {
            Some(sender) => sender.send(event.clone()).is_err(),
            None => return,
        };
        // Every receiver is gone; drop the channel.
        if orphaned {
            self.channels
                .remove_if(owner_id, |_, sender| sender.receiver_count() == 0);
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn held(owner: &str) -> WindowEvent {
        WindowEvent::Held {
            id: Ulid::new(),
            owner_id: owner.into(),
            at: 1,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("tutor-1");

        let event = held("tutor-1");
        hub.send(&event);

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn other_owners_are_not_delivered() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("tutor-1");

        hub.send(&held("tutor-2"));
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&held("tutor-1"));
        assert_eq!(hub.channel_count(), 0);
    }

    #[test]
    fn dropped_subscribers_release_channel() {
        let hub = NotifyHub::new();
        drop(hub.subscribe("tutor-1"));
        assert_eq!(hub.channel_count(), 1);
        hub.send(&held("tutor-1"));
        assert_eq!(hub.channel_count(), 0);
    }
}
