use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-scope broadcast of booking changes. Feeds live views such as a
/// "now performing" board; slow receivers see `Lagged` rather than blocking
/// writers.
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

    /// Subscribe to a scope's changes. Creates the channel if needed.
    pub fn subscribe(&self, scope_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(scope_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, scope_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&scope_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a scope's channel; open receivers observe `Closed`.
    pub fn remove(&self, scope_id: &Ulid) {
        self.channels.remove(scope_id);
    }
}
