use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::models::QueueUpdate;

pub type QueueUpdateSender = broadcast::Sender<QueueUpdate>;
pub type QueueUpdateReceiver = broadcast::Receiver<QueueUpdate>;

const CHANNEL_CAPACITY: usize = 100;

/// In-process change feed: one broadcast channel per doctor. Every committed
/// transition publishes a `QueueUpdate`; slow subscribers that lag simply
/// miss intermediate events and re-fetch, which the payload contract allows.
#[derive(Clone)]
pub struct QueueNotificationService {
    channels: Arc<RwLock<HashMap<Uuid, QueueUpdateSender>>>,
}

impl QueueNotificationService {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Subscribe to a doctor's queue events, creating the channel on first use.
    pub async fn subscribe(&self, doctor_id: Uuid) -> QueueUpdateReceiver {
        let mut channels = self.channels.write().await;
        let sender = channels.entry(doctor_id).or_insert_with(|| {
            debug!("Created queue event channel for doctor {}", doctor_id);
            broadcast::channel(CHANNEL_CAPACITY).0
        });
        sender.subscribe()
    }

    /// Publish a committed transition. Doctors nobody subscribed to have no
    /// channel and the update is dropped, matching at-most-once feed
    /// semantics.
    pub async fn publish(&self, update: QueueUpdate) {
        let channels = self.channels.read().await;
        if let Some(sender) = channels.get(&update.doctor_id) {
            let receivers = sender.send(update.clone()).unwrap_or(0);
            debug!(
                "Published queue update for doctor {} to {} subscribers",
                update.doctor_id, receivers
            );
        }
    }

    pub async fn active_channels(&self) -> Vec<Uuid> {
        let channels = self.channels.read().await;
        channels.keys().copied().collect()
    }

    /// Drop a doctor's channel once its last subscriber is gone.
    pub async fn remove_channel(&self, doctor_id: Uuid) {
        let mut channels = self.channels.write().await;
        if let Some(sender) = channels.get(&doctor_id) {
            if sender.receiver_count() == 0 {
                channels.remove(&doctor_id);
                debug!("Removed queue event channel for doctor {}", doctor_id);
            }
        }
    }
}

impl Default for QueueNotificationService {
    fn default() -> Self {
        Self::new()
    }
}
