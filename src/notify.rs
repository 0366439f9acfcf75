use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::ChangeRecord;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for live change feeds, one channel per advisor.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<ChangeRecord>>,
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

    /// Subscribe to an advisor's changes. Creates the channel if needed.
    pub fn subscribe(&self, advisor_id: &str) -> broadcast::Receiver<ChangeRecord> {
        let sender = self
            .channels
            .entry(advisor_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, advisor_id: &str, record: &ChangeRecord) {
        if let Some(sender) = self.channels.get(advisor_id) {
            let _ = sender.send(record.clone());
        }
    }

    /// Drop channels whose listeners have all gone away.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        before - self.channels.len()
    }
}
