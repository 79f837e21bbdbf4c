use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{layers::ImageMetadata, store::ImageStatus};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Shortcuts that let a pull task finish without touching a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestMode {
    /// Run the real pipeline.
    #[default]
    Off,

    /// Walk through the pipeline states and return a random image id.
    Simulate,

    /// Fail immediately.
    Fail,
}

/// A request to pull an image and stage it on a system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullTask {
    /// The target system, which is also the dispatch partition.
    pub system: String,

    /// The image type.
    pub itype: String,

    /// The requested pull tag, optionally prefixed with a location.
    pub tag: String,

    /// User ids that may see the image if it turns out to be private.
    pub user_acl: BTreeSet<u32>,

    /// Group ids that may see the image if it turns out to be private.
    pub group_acl: BTreeSet<u32>,

    /// The kind of remote to pull from.
    pub remotetype: String,

    /// The image format to produce.
    pub format: String,

    /// Registry credentials by location, as `user:password`.
    pub tokens: BTreeMap<String, String>,

    /// Test shortcut.
    pub test_mode: TestMode,
}

/// A request to remove a staged image from a system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpireTask {
    /// The target system.
    pub system: String,

    /// The image id.
    pub id: String,

    /// The image format.
    pub format: String,
}

/// A unit of work for the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Task {
    /// Pull and stage an image.
    Pull(PullTask),

    /// Remove a staged image.
    Expire(ExpireTask),
}

/// Identifies a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskHandle(Uuid);

/// The last progress a running task reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    /// The pipeline state the task is in.
    pub state: ImageStatus,

    /// When the task reported.
    pub heartbeat: DateTime<Utc>,

    /// What the task is doing.
    pub message: String,
}

/// The outcome of a successful pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullResult {
    /// Metadata of the pulled image.
    pub metadata: ImageMetadata,

    /// Whether private credentials were needed to pull the image.
    pub private: bool,

    /// Whether the image was already staged and only its metadata was refreshed.
    pub meta_only: bool,
}

/// The result of a finished task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskOutput {
    /// A pull finished.
    Pulled(PullResult),

    /// An image was removed.
    Expired,
}

/// The observable state of a submitted task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPoll {
    /// The task has not finished, with its last reported progress if any.
    Pending(Option<TaskProgress>),

    /// The task finished successfully.
    Done(TaskOutput),

    /// The task failed with a human readable message.
    Failed(String),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Task {
    /// Returns the partition the task is dispatched to.
    pub fn system(&self) -> &str {
        match self {
            Task::Pull(task) => &task.system,
            Task::Expire(task) => &task.system,
        }
    }
}

impl TaskHandle {
    /// Creates a new unique handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for TaskHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
