use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};

use crate::{GatewayError, GatewayResult};

use super::{
    StatusUpdater, Task, TaskDispatcher, TaskHandle, TaskOutput, TaskPoll, TaskProgress,
    TaskRunner,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An in-process dispatcher with one queue and a fixed set of workers per system.
///
/// Must be created inside a tokio runtime. Workers stop once the dispatcher is dropped and their
/// queue drains.
pub struct LocalDispatcher {
    partitions: HashMap<String, mpsc::UnboundedSender<Job>>,
    slots: Arc<Mutex<HashMap<TaskHandle, Slot>>>,
}

struct Slot {
    progress: watch::Receiver<Option<TaskProgress>>,
    outcome: Option<Result<TaskOutput, String>>,
}

struct Job {
    handle: TaskHandle,
    task: Task,
    updater: StatusUpdater,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LocalDispatcher {
    /// Starts `workers` workers for each of `systems`, all running tasks through `runner`.
    pub fn new(
        runner: Arc<dyn TaskRunner>,
        systems: impl IntoIterator<Item = String>,
        workers: usize,
    ) -> Self {
        let slots = Arc::new(Mutex::new(HashMap::new()));
        let mut partitions = HashMap::new();

        for system in systems {
            let (sender, receiver) = mpsc::unbounded_channel::<Job>();
            let receiver = Arc::new(Mutex::new(receiver));

            for worker in 0..workers.max(1) {
                let receiver = receiver.clone();
                let runner = runner.clone();
                let slots = slots.clone();
                let system = system.clone();

                tokio::spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else {
                            break;
                        };

                        tracing::debug!(%system, worker, handle = %job.handle, "running task");
                        run_job(runner.clone(), slots.clone(), job).await;
                    }

                    tracing::debug!(%system, worker, "worker stopped");
                });
            }

            partitions.insert(system, sender);
        }

        Self { partitions, slots }
    }

    /// Returns the systems this dispatcher has partitions for.
    pub fn systems(&self) -> impl Iterator<Item = &String> {
        self.partitions.keys()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

async fn run_job(
    runner: Arc<dyn TaskRunner>,
    slots: Arc<Mutex<HashMap<TaskHandle, Slot>>>,
    job: Job,
) {
    let Job {
        handle,
        task,
        updater,
    } = job;

    // A panicking runner must still leave a terminal outcome behind
    let execution = tokio::spawn(async move {
        match &task {
            Task::Pull(pull) => runner
                .run_pull(pull, &updater)
                .await
                .map(TaskOutput::Pulled),
            Task::Expire(expire) => runner
                .run_expire(expire, &updater)
                .await
                .map(|()| TaskOutput::Expired),
        }
    });

    let outcome = match execution.await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => {
            tracing::warn!(%handle, error = %e, "task failed");
            Err(e.to_string())
        }
        Err(e) => {
            tracing::error!(%handle, error = %e, "task aborted");
            Err(format!("task aborted: {e}"))
        }
    };

    if let Some(slot) = slots.lock().await.get_mut(&handle) {
        slot.outcome = Some(outcome);
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl TaskDispatcher for LocalDispatcher {
    async fn submit(&self, task: Task) -> GatewayResult<TaskHandle> {
        let sender = self.partitions.get(task.system()).ok_or_else(|| {
            GatewayError::Configuration(format!("no dispatch partition for {}", task.system()))
        })?;

        let handle = TaskHandle::new();
        let (progress_tx, progress_rx) = watch::channel(None);

        self.slots.lock().await.insert(
            handle,
            Slot {
                progress: progress_rx,
                outcome: None,
            },
        );

        let job = Job {
            handle,
            task,
            updater: StatusUpdater::new(progress_tx),
        };

        if sender.send(job).is_err() {
            self.slots.lock().await.remove(&handle);
            return Err(GatewayError::custom(anyhow::anyhow!(
                "dispatch partition is closed"
            )));
        }

        Ok(handle)
    }

    async fn poll(&self, handle: &TaskHandle) -> GatewayResult<TaskPoll> {
        let slots = self.slots.lock().await;
        let slot = slots
            .get(handle)
            .ok_or_else(|| GatewayError::UnknownTask(handle.to_string()))?;

        Ok(match &slot.outcome {
            Some(Ok(output)) => TaskPoll::Done(output.clone()),
            Some(Err(message)) => TaskPoll::Failed(message.clone()),
            None => TaskPoll::Pending(slot.progress.borrow().clone()),
        })
    }

    async fn release(&self, handle: &TaskHandle) -> GatewayResult<()> {
        self.slots.lock().await.remove(handle);
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
