//! Owner notification seam.
//!
//! Delivery is best-effort everywhere: a failed notification is logged and
//! swallowed, never propagated into the orchestration decision that
//! triggered it. Callers therefore get no `Result` back.

use async_trait::async_trait;
use botplane_id::OwnerId;
use tracing::info;

/// Sends short human-readable messages to bot owners.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, owner: OwnerId, message: &str);
}

/// Production default until a chat transport is wired in: notifications
/// land in the structured log.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, owner: OwnerId, message: &str) {
        info!(owner = %owner, message, "Owner notification");
    }
}

/// Captures notifications for assertions in tests.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: std::sync::Mutex<Vec<(OwnerId, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(OwnerId, String)> {
        self.messages.lock().expect("notifier lock").clone()
    }

    pub fn count(&self) -> usize {
        self.messages.lock().expect("notifier lock").len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, owner: OwnerId, message: &str) {
        self.messages
            .lock()
            .expect("notifier lock")
            .push((owner, message.to_string()));
    }
}
