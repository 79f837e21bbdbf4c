use chrono::Utc;
use tokio::sync::watch;

use crate::store::ImageStatus;

use super::TaskProgress;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Reports the progress of a running task, refreshing its heartbeat on every update.
#[derive(Debug, Clone)]
pub struct StatusUpdater {
    sender: Option<watch::Sender<Option<TaskProgress>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl StatusUpdater {
    /// Creates an updater publishing into `sender`.
    pub fn new(sender: watch::Sender<Option<TaskProgress>>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// Creates an updater that drops every update.
    pub fn noop() -> Self {
        Self { sender: None }
    }

    /// Publishes `state` with a fresh heartbeat.
    pub fn update(&self, state: ImageStatus, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(%state, %message, "task progress");

        if let Some(sender) = &self.sender {
            sender.send_replace(Some(TaskProgress {
                state,
                heartbeat: Utc::now(),
                message,
            }));
        }
    }
}
