use async_trait::async_trait;

use crate::GatewayResult;

use super::{ExpireTask, PullResult, PullTask, StatusUpdater, Task, TaskHandle, TaskPoll};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Submits tasks to a worker pool partitioned by target system.
///
/// Orchestration only relies on this interface, so the pool can live in process or behind a
/// broker.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Queues `task` on the partition of its system.
    ///
    /// ## Errors
    ///
    /// Returns a `Configuration` error if no partition serves the task's system.
    async fn submit(&self, task: Task) -> GatewayResult<TaskHandle>;

    /// Returns the current state of a task without consuming it.
    ///
    /// ## Errors
    ///
    /// Returns `UnknownTask` for handles that were never submitted or were released.
    async fn poll(&self, handle: &TaskHandle) -> GatewayResult<TaskPoll>;

    /// Forgets a task. Releasing an unknown handle is not an error.
    async fn release(&self, handle: &TaskHandle) -> GatewayResult<()>;
}

/// Executes the work behind a task inside a worker.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Pulls an image and stages it, reporting progress through `updater`.
    async fn run_pull(&self, task: &PullTask, updater: &StatusUpdater)
        -> GatewayResult<PullResult>;

    /// Removes a staged image.
    async fn run_expire(&self, task: &ExpireTask, updater: &StatusUpdater) -> GatewayResult<()>;
}
