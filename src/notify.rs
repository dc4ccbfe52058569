//! Fire-and-forget status broadcast to interested observers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStatus {
    Available,
    UpToDate,
    Installed,
}

/// Messages observers receive. Serialized as `{"type": ..., ...fields}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Notification {
    /// Outcome of an update check or install.
    UpdateInfo {
        status: UpdateStatus,
        date_checked: Option<String>,
        update_size: Option<u64>,
        new_version: Option<String>,
        current_version: Option<String>,
    },
    /// Human readable progress text; empty text clears a previous message.
    StatusInfo { text: String },
    /// Version of the engine answering control messages.
    VersionInfo { engine_version: String },
}

impl Notification {
    pub fn status(text: impl Into<String>) -> Self {
        Notification::StatusInfo { text: text.into() }
    }
}

/// Broadcast channel fanning notifications out to every subscriber.
///
/// Delivery is best effort: sending with no subscribers is not an error, and
/// a subscriber that falls more than the channel capacity behind loses the
/// oldest messages.
#[derive(Debug, Clone)]
pub struct NotificationChannel {
    sender: broadcast::Sender<Notification>,
}

impl Default for NotificationChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationChannel {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub fn notify(&self, message: Notification) {
        match self.sender.send(message) {
            Ok(receivers) => debug!("Notification delivered to {} observer(s)", receivers),
            Err(broadcast::error::SendError(message)) => {
                debug!("No observers for notification {:?}", message)
            }
        }
    }
}
