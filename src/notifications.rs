use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

/// Pushed to connected admin UIs so their lists refresh without polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdminNotification {
    RegistrationPendingApproval { subject_id: String, email: String },
    AccountApproved { subject_id: String },
    AccountRejected { subject_id: String },
    AccountLocked { subject_id: String, locked_until: i64 },
}

#[derive(Debug, Clone)]
pub struct AdminNotifier {
    tx: broadcast::Sender<AdminNotification>,
}

impl Default for AdminNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl AdminNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdminNotification> {
        self.tx.subscribe()
    }

    /// Fire and forget; having no listener is normal.
    pub fn notify(&self, notification: AdminNotification) {
        if self.tx.send(notification).is_err() {
            tracing::debug!("No admin listeners for notification");
        }
    }
}
