use std::{collections::BTreeSet, time::Duration};

use chrono::{DateTime, Utc};

use crate::{
    dispatch::{PullResult, PullTask, Task, TaskHandle, TaskOutput, TaskPoll, TaskProgress, TestMode},
    store::{ImageRecord, ImageStatus, RecordQuery, RecordUpdate},
    GatewayError, GatewayResult,
};

use super::{is_pullable, AclSpec, ImageManager, ImageSpec, Session, TaskKind, TrackedTask};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const STALE_WORKER_MESSAGE: &str = "pull worker stopped reporting";

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImageManager {
    /// Requests `spec` on its system and returns the record to poll.
    ///
    /// Repeated calls while a pull is in flight return that pull's record without starting new
    /// work. A READY private image is pulled again when `acls` differ from the stored ones.
    ///
    /// ## Errors
    ///
    /// Returns `InvalidSession` for a bad session. Failures of the pull itself are reported on the
    /// record, not here.
    pub async fn pull(
        &self,
        session: &Session,
        spec: &ImageSpec,
        acls: &AclSpec,
    ) -> GatewayResult<ImageRecord> {
        self.pull_with_test_mode(session, spec, acls, TestMode::Off)
            .await
    }

    /// Like [`pull`], but lets the worker simulate or fail the pull.
    ///
    /// [`pull`]: ImageManager::pull
    pub async fn pull_with_test_mode(
        &self,
        session: &Session,
        spec: &ImageSpec,
        acls: &AclSpec,
        test_mode: TestMode,
    ) -> GatewayResult<ImageRecord> {
        self.check_session(session, &spec.system)?;
        if let Err(e) = self.update_states().await {
            tracing::warn!(system = %spec.system, "collecting task states failed: {e}");
        }

        let now = Utc::now();
        let existing = self.find_pull_record(spec).await?;

        let acl_changed = existing.as_ref().is_some_and(|record| {
            record.status == ImageStatus::Ready
                && record.private
                && !acls.is_empty()
                && acls.differs_from(record)
        });

        match existing {
            Some(record) if !acl_changed && !is_pullable(Some(&record), now, &self.policy()) => {
                tracing::debug!(
                    system = %spec.system,
                    tag = %spec.tag,
                    status = %record.status,
                    "returning existing record"
                );
                Ok(record)
            }
            existing => {
                if let Some(record) = existing.as_ref().filter(|r| r.status.is_in_flight()) {
                    if !self.reclaim_stale(record).await? {
                        return self.current_pull_record(spec).await;
                    }
                }

                self.start_pull(session, spec, acls, test_mode, now).await
            }
        }
    }

    /// Collects finished tasks, records progress and sweeps old failures.
    ///
    /// Safe to call concurrently. A finished task is claimed under the task lock so only one
    /// caller applies its result.
    pub async fn update_states(&self) -> GatewayResult<()> {
        let tracked: Vec<(TaskHandle, TrackedTask)> = self
            .tasks
            .lock()
            .await
            .iter()
            .map(|(handle, task)| (*handle, *task))
            .collect();

        for (handle, task) in tracked {
            let poll = match self.dispatcher.poll(&handle).await {
                Ok(poll) => poll,
                Err(GatewayError::UnknownTask(_)) => {
                    tracing::warn!(%handle, key = task.key, "dispatcher lost task");
                    self.tasks.lock().await.remove(&handle);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(%handle, key = task.key, "polling task failed: {e}");
                    continue;
                }
            };

            match poll {
                TaskPoll::Pending(None) => {}
                TaskPoll::Pending(Some(progress)) => {
                    if task.kind == TaskKind::Pull {
                        if let Err(e) = self.record_progress(task.key, &progress).await {
                            tracing::warn!(%handle, key = task.key, "recording progress failed: {e}");
                        }
                    }
                }
                finished => {
                    if self.tasks.lock().await.remove(&handle).is_none() {
                        continue;
                    }

                    if let Err(e) = self.finish_task(task, finished).await {
                        tracing::error!(%handle, key = task.key, "failed to apply task result: {e}");
                    }

                    if let Err(e) = self.dispatcher.release(&handle).await {
                        tracing::warn!(%handle, "releasing task failed: {e}");
                    }
                }
            }
        }

        self.sweep_failures(Utc::now()).await
    }

    /// Applies a successful pull to the record with `key`.
    ///
    /// If a READY record already holds the resulting image id, that record takes over the tag and
    /// the pull record is removed. Otherwise the pull record itself becomes READY. Returns the
    /// READY record, or `None` if the pull record is gone or no longer in flight.
    pub async fn complete_pull(
        &self,
        key: i64,
        result: &PullResult,
    ) -> GatewayResult<Option<ImageRecord>> {
        let Some(pull) = self.store.find_one(&RecordQuery::by_key(key)).await? else {
            tracing::warn!(key, "pull record disappeared before completion");
            return Ok(None);
        };

        if !pull.status.is_in_flight() {
            tracing::warn!(key, status = %pull.status, "ignoring result for settled record");
            return Ok(None);
        }

        let now = Utc::now();
        let id = result.metadata.id.clone();
        let expiration = now + self.config.get_image_expiration_timeout().as_delta();
        let (user_acl, group_acl) = if result.private {
            (pull.user_acl.clone(), pull.group_acl.clone())
        } else {
            (BTreeSet::new(), BTreeSet::new())
        };

        let duplicate = self
            .store
            .find_one(
                &RecordQuery::on_system(&pull.system)
                    .itype(&pull.itype)
                    .id(&id)
                    .status_in([ImageStatus::Ready]),
            )
            .await?
            .filter(|record| record.key != Some(key));

        if let Some(existing) = duplicate {
            let existing_key = existing.require_key()?;
            let update = RecordUpdate {
                last_pull: Some(now),
                expiration: Some(expiration),
                private: Some(result.private),
                user_acl: Some(user_acl),
                group_acl: Some(group_acl),
                ..Default::default()
            };
            self.store.update(existing_key, &update).await?;
            self.store.remove(key).await?;
            self.add_tag(existing_key, &pull.system, &pull.pulltag).await?;

            tracing::info!(
                system = %pull.system,
                tag = %pull.pulltag,
                %id,
                "pull matched an existing image"
            );
            return self
                .store
                .find_one(&RecordQuery::by_key(existing_key))
                .await;
        }

        let metadata = &result.metadata;
        let update = RecordUpdate {
            id: Some(id.clone()),
            status: Some(ImageStatus::Ready),
            status_message: Some(None),
            last_pull: Some(now),
            last_heartbeat: Some(now),
            expiration: Some(expiration),
            env: Some(metadata.env.clone()),
            entry: Some(metadata.entrypoint.clone()),
            workdir: Some(metadata.workdir.clone()),
            labels: Some(metadata.labels.clone()),
            private: Some(result.private),
            user_acl: Some(user_acl),
            group_acl: Some(group_acl),
            ..Default::default()
        }
        .when(pull.status);

        if !self.store.update(key, &update).await? {
            tracing::warn!(key, "pull record changed while completing");
            return Ok(None);
        }

        self.add_tag(key, &pull.system, &pull.pulltag).await?;
        tracing::info!(system = %pull.system, tag = %pull.pulltag, %id, "image ready");

        self.store.find_one(&RecordQuery::by_key(key)).await
    }

    /// Polls until `record` settles and returns its final state.
    ///
    /// A pull that was merged into an existing image returns that image.
    pub async fn wait_for(
        &self,
        record: &ImageRecord,
        interval: Duration,
    ) -> GatewayResult<Option<ImageRecord>> {
        let key = record.require_key()?;

        loop {
            self.update_states().await?;

            match self.store.find_one(&RecordQuery::by_key(key)).await? {
                Some(current) if current.status.is_in_flight() => {}
                Some(current) => return Ok(Some(current)),
                None => {
                    let query = RecordQuery::on_system(&record.system)
                        .itype(&record.itype)
                        .tagged(&record.pulltag)
                        .status_in([ImageStatus::Ready]);
                    return self.store.find_one(&query).await;
                }
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// Finds the record a pull request for `spec` refers to.
    ///
    /// An in-flight pull wins, then the READY image holding the tag, then the latest failed or
    /// expired pull. A failed refresh that is newer than the READY image stands in for it, so
    /// its pull update timeout applies before the next attempt.
    async fn find_pull_record(&self, spec: &ImageSpec) -> GatewayResult<Option<ImageRecord>> {
        let base = RecordQuery::on_system(&spec.system).itype(&spec.itype);

        let in_flight = base
            .clone()
            .pulltag(&spec.tag)
            .status_in(ImageStatus::IN_FLIGHT);
        if let Some(record) = self.store.find_one(&in_flight).await? {
            return Ok(Some(record));
        }

        let ready = base
            .clone()
            .tagged(&spec.tag)
            .status_in([ImageStatus::Ready]);
        let ready = self.store.find_one(&ready).await?;

        let settled = base
            .pulltag(&spec.tag)
            .status_in([ImageStatus::Failure, ImageStatus::Expired]);
        let settled = self.store.find(&settled).await?.pop();

        Ok(match (ready, settled) {
            (Some(ready), Some(failed))
                if failed.status == ImageStatus::Failure
                    && failed.last_pull.is_some()
                    && failed.last_pull > ready.last_pull =>
            {
                Some(failed)
            }
            (Some(ready), _) => Some(ready),
            (None, settled) => settled,
        })
    }

    /// Returns the pull record another caller created first.
    async fn current_pull_record(&self, spec: &ImageSpec) -> GatewayResult<ImageRecord> {
        self.find_pull_record(spec).await?.ok_or_else(|| {
            GatewayError::custom(anyhow::anyhow!(
                "pull record for {} on {} vanished",
                spec.tag,
                spec.system
            ))
        })
    }

    /// Marks an abandoned in-flight record as failed. Returns false if another caller got there
    /// first or the worker reported in the meantime.
    async fn reclaim_stale(&self, record: &ImageRecord) -> GatewayResult<bool> {
        let key = record.require_key()?;
        let update = RecordUpdate {
            status_message: Some(Some(STALE_WORKER_MESSAGE.to_string())),
            ..RecordUpdate::status(ImageStatus::Failure)
        }
        .when(record.status);

        let reclaimed = self.store.update(key, &update).await?;
        if reclaimed {
            tracing::warn!(
                key,
                system = %record.system,
                tag = %record.pulltag,
                "reclaimed stale pull"
            );
        }

        Ok(reclaimed)
    }

    async fn start_pull(
        &self,
        session: &Session,
        spec: &ImageSpec,
        acls: &AclSpec,
        test_mode: TestMode,
        now: DateTime<Utc>,
    ) -> GatewayResult<ImageRecord> {
        let mut record = ImageRecord::new_pull(
            &spec.system,
            &spec.itype,
            &spec.tag,
            self.config.get_default_image_format(),
            now,
        );
        record.user_acl = acls.user_acl.clone();
        record.group_acl = acls.group_acl.clone();

        let Some(key) = self.store.insert(&record).await? else {
            tracing::debug!(system = %spec.system, tag = %spec.tag, "joined concurrent pull");
            return self.current_pull_record(spec).await;
        };
        record.key = Some(key);

        let update = RecordUpdate {
            last_pull: Some(now),
            ..RecordUpdate::status(ImageStatus::Enqueued)
        }
        .when(ImageStatus::Init);
        if self.store.update(key, &update).await? {
            record.status = ImageStatus::Enqueued;
        }

        let task = Task::Pull(PullTask {
            system: spec.system.clone(),
            itype: spec.itype.clone(),
            tag: spec.tag.clone(),
            user_acl: acls.user_acl.clone(),
            group_acl: acls.group_acl.clone(),
            remotetype: record.remotetype.clone(),
            format: record.format.clone(),
            tokens: session.tokens.clone(),
            test_mode,
        });

        match self.dispatcher.submit(task).await {
            Ok(handle) => {
                self.track(handle, key, TaskKind::Pull).await;
                tracing::info!(
                    system = %spec.system,
                    tag = %spec.tag,
                    key,
                    %handle,
                    "pull dispatched"
                );
                Ok(record)
            }
            Err(e) => {
                tracing::error!(system = %spec.system, tag = %spec.tag, key, "dispatch failed: {e}");
                self.mark_failed(key, &format!("dispatch failed: {e}")).await?;
                self.store
                    .find_one(&RecordQuery::by_key(key))
                    .await?
                    .ok_or_else(|| {
                        GatewayError::custom(anyhow::anyhow!("pull record {key} vanished"))
                    })
            }
        }
    }

    async fn record_progress(&self, key: i64, progress: &TaskProgress) -> GatewayResult<()> {
        if !progress.state.is_in_flight() {
            return Ok(());
        }

        let Some(record) = self.store.find_one(&RecordQuery::by_key(key)).await? else {
            return Ok(());
        };

        if !record.status.can_transition_to(progress.state) {
            tracing::debug!(
                key,
                from = %record.status,
                to = %progress.state,
                "ignoring out of order progress"
            );
            return Ok(());
        }

        let update = RecordUpdate {
            last_heartbeat: Some(progress.heartbeat),
            status_message: Some(Some(progress.message.clone())),
            ..RecordUpdate::status(progress.state)
        }
        .when(record.status);
        self.store.update(key, &update).await?;

        Ok(())
    }

    async fn finish_task(&self, task: TrackedTask, poll: TaskPoll) -> GatewayResult<()> {
        match (task.kind, poll) {
            (TaskKind::Pull, TaskPoll::Done(TaskOutput::Pulled(result))) => {
                self.complete_pull(task.key, &result).await?;
            }
            (TaskKind::Pull, TaskPoll::Failed(message)) => {
                tracing::warn!(key = task.key, "pull failed: {message}");
                self.mark_failed(task.key, &message).await?;
            }
            (TaskKind::Expire, TaskPoll::Done(TaskOutput::Expired)) => {
                let update = RecordUpdate::status(ImageStatus::Expired).when(ImageStatus::Ready);
                if self.store.update(task.key, &update).await? {
                    tracing::info!(key = task.key, "image expired");
                }
            }
            (TaskKind::Expire, TaskPoll::Failed(message)) => {
                tracing::warn!(key = task.key, "expire failed, image kept: {message}");
            }
            (kind, poll) => {
                tracing::warn!(key = task.key, ?kind, ?poll, "unexpected task result");
            }
        }

        Ok(())
    }

    async fn mark_failed(&self, key: i64, message: &str) -> GatewayResult<()> {
        let Some(record) = self.store.find_one(&RecordQuery::by_key(key)).await? else {
            return Ok(());
        };

        if !record.status.is_in_flight() {
            return Ok(());
        }

        let update = RecordUpdate {
            status_message: Some(Some(message.to_string())),
            ..RecordUpdate::status(ImageStatus::Failure)
        }
        .when(record.status);
        self.store.update(key, &update).await?;

        Ok(())
    }

    /// Removes FAILURE records older than the pull update timeout.
    async fn sweep_failures(&self, now: DateTime<Utc>) -> GatewayResult<()> {
        let timeout = self.policy().pull_update_timeout;
        let failures = self
            .store
            .find(&RecordQuery::default().status_in([ImageStatus::Failure]))
            .await?;

        for record in failures {
            let expired = record.last_pull.map_or(true, |last| now > last + timeout);
            if expired {
                let key = record.require_key()?;
                if self.store.remove(key).await? {
                    tracing::debug!(key, tag = %record.pulltag, "swept failed pull");
                }
            }
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeDelta;

    use super::*;
    use crate::{
        layers::ImageMetadata,
        manager::helper,
        store::{ImageRepository, MemoryImageStore},
    };

    #[test_log::test(tokio::test)]
    async fn test_pull_is_idempotent_while_in_flight() -> anyhow::Result<()> {
        let store = Arc::new(MemoryImageStore::new());
        let (manager, dispatcher) = helper::manager(store.clone());
        let session = helper::session(Some(1000), None);
        let spec = ImageSpec::docker("cluster", "ubuntu:latest");

        let first = manager.pull(&session, &spec, &AclSpec::default()).await?;
        let second = manager.pull(&session, &spec, &AclSpec::default()).await?;
        assert_eq!(first.key, second.key);
        assert_eq!(first.status, ImageStatus::Enqueued);

        let acls = AclSpec::default();
        let (third, fourth) = tokio::join!(
            manager.pull(&session, &spec, &acls),
            manager.pull(&session, &spec, &acls),
        );
        assert_eq!(third?.key, first.key);
        assert_eq!(fourth?.key, first.key);

        assert_eq!(dispatcher.submitted().await.len(), 1);
        let records = store.find(&RecordQuery::on_system("cluster")).await?;
        assert_eq!(records.len(), 1);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_pull_completes_through_update_states() -> anyhow::Result<()> {
        let store = Arc::new(MemoryImageStore::new());
        let (manager, dispatcher) = helper::manager(store.clone());
        let session = helper::session(Some(1000), Some(100));
        let spec = ImageSpec::docker("cluster", "ubuntu:latest");

        let record = manager
            .pull(&session, &spec, &AclSpec::new([1000], []))
            .await?;
        let (handle, task) = dispatcher.submitted().await.remove(0);
        let Task::Pull(task) = task else {
            panic!("expected a pull task");
        };
        assert_eq!(task.tag, "ubuntu:latest");
        assert_eq!(task.user_acl, BTreeSet::from([1000]));

        let progress = TaskProgress {
            state: ImageStatus::Pulling,
            heartbeat: Utc::now(),
            message: "Getting manifest".into(),
        };
        dispatcher
            .report(handle, TaskPoll::Pending(Some(progress)))
            .await;
        manager.update_states().await?;
        let pulling = store
            .find_one(&RecordQuery::by_key(record.require_key()?))
            .await?
            .expect("record exists");
        assert_eq!(pulling.status, ImageStatus::Pulling);
        assert_eq!(pulling.status_message.as_deref(), Some("Getting manifest"));

        let result = PullResult {
            metadata: ImageMetadata {
                id: "abc123".into(),
                env: vec!["PATH=/bin".into()],
                workdir: Some("/root".into()),
                ..Default::default()
            },
            private: true,
            meta_only: false,
        };
        dispatcher
            .report(handle, TaskPoll::Done(TaskOutput::Pulled(result)))
            .await;
        manager.update_states().await?;
        assert_eq!(manager.pending_tasks().await, 0);

        let ready = manager
            .lookup(&session, &spec)
            .await?
            .expect("image is ready");
        assert_eq!(ready.key, record.key);
        assert_eq!(ready.id.as_deref(), Some("abc123"));
        assert_eq!(ready.env, vec!["PATH=/bin".to_string()]);
        assert_eq!(ready.user_acl, BTreeSet::from([1000]));
        assert!(ready.private);
        assert!(ready.expiration.is_some());
        assert!(ready.has_tag("ubuntu:latest"));

        // A fresh READY image is not pulled again
        let again = manager.pull(&session, &spec, &AclSpec::new([1000], [])).await?;
        assert_eq!(again.key, record.key);
        assert_eq!(dispatcher.submitted().await.len(), 1);

        // Changing the ACLs of a private image starts a refresh
        manager
            .pull(&session, &spec, &AclSpec::new([1000, 1001], []))
            .await?;
        assert_eq!(dispatcher.submitted().await.len(), 2);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_complete_pull_merges_into_existing_image() -> anyhow::Result<()> {
        let store = Arc::new(MemoryImageStore::new());
        let (manager, _) = helper::manager(store.clone());

        let existing = store
            .insert(&helper::ready_record("abc123", ["ubuntu:latest"]))
            .await?
            .expect("inserted");

        let mut pull = ImageRecord::new_pull("cluster", "docker", "ubuntu:22.04", "squashfs", Utc::now());
        pull.status = ImageStatus::Transfer;
        let pull_key = store.insert(&pull).await?.expect("inserted");

        let result = PullResult {
            metadata: ImageMetadata {
                id: "abc123".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let merged = manager
            .complete_pull(pull_key, &result)
            .await?
            .expect("merged record");

        assert_eq!(merged.key, Some(existing));
        assert_eq!(
            merged.tag,
            BTreeSet::from(["ubuntu:22.04".to_string(), "ubuntu:latest".to_string()])
        );
        assert!(store.find_one(&RecordQuery::by_key(pull_key)).await?.is_none());

        // A record that already settled ignores late results
        assert!(manager.complete_pull(existing, &result).await?.is_none());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_pull_moves_tag_to_new_image() -> anyhow::Result<()> {
        let store = Arc::new(MemoryImageStore::new());
        let (manager, _) = helper::manager(store.clone());

        let old = store
            .insert(&helper::ready_record("old", ["ubuntu:latest"]))
            .await?
            .expect("inserted");

        let mut pull = ImageRecord::new_pull("cluster", "docker", "ubuntu:latest", "squashfs", Utc::now());
        pull.status = ImageStatus::Transfer;
        let pull_key = store.insert(&pull).await?.expect("inserted");

        let result = PullResult {
            metadata: ImageMetadata {
                id: "new".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        manager.complete_pull(pull_key, &result).await?;

        let old = store.find_one(&RecordQuery::by_key(old)).await?.expect("old");
        assert!(old.tag.is_empty());
        let holders = store
            .find(&RecordQuery::on_system("cluster").tagged("ubuntu:latest"))
            .await?;
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].id.as_deref(), Some("new"));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_pull_recovers_stuck_record() -> anyhow::Result<()> {
        let store = Arc::new(MemoryImageStore::new());
        let (manager, dispatcher) = helper::manager(store.clone());
        let session = helper::session(None, None);
        let threshold = manager.policy().stale_worker_threshold;

        let now = Utc::now();
        let mut fresh = ImageRecord::new_pull("cluster", "docker", "fresh:1", "squashfs", now);
        fresh.status = ImageStatus::Pulling;
        fresh.last_pull = Some(now - threshold * 2);
        fresh.last_heartbeat = Some(now);
        let fresh_key = store.insert(&fresh).await?.expect("inserted");

        let returned = manager
            .pull(&session, &ImageSpec::docker("cluster", "fresh:1"), &AclSpec::default())
            .await?;
        assert_eq!(returned.key, Some(fresh_key));
        assert!(dispatcher.submitted().await.is_empty());

        let mut stuck = ImageRecord::new_pull("cluster", "docker", "stuck:1", "squashfs", now);
        stuck.status = ImageStatus::Pulling;
        stuck.last_pull = Some(now - threshold * 2);
        stuck.last_heartbeat = Some(now - threshold * 2);
        let stuck_key = store.insert(&stuck).await?.expect("inserted");

        let replacement = manager
            .pull(&session, &ImageSpec::docker("cluster", "stuck:1"), &AclSpec::default())
            .await?;
        assert_ne!(replacement.key, Some(stuck_key));
        assert_eq!(replacement.status, ImageStatus::Enqueued);
        assert_eq!(dispatcher.submitted().await.len(), 1);

        let in_flight = store
            .find(
                &RecordQuery::on_system("cluster")
                    .pulltag("stuck:1")
                    .status_in(ImageStatus::IN_FLIGHT),
            )
            .await?;
        assert_eq!(in_flight.len(), 1);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_pull_is_reported_and_swept() -> anyhow::Result<()> {
        let store = Arc::new(MemoryImageStore::new());
        let (manager, dispatcher) = helper::manager(store.clone());
        let session = helper::session(None, None);
        let spec = ImageSpec::docker("cluster", "broken:1");

        let record = manager.pull(&session, &spec, &AclSpec::default()).await?;
        let key = record.require_key()?;
        let (handle, _) = dispatcher.submitted().await.remove(0);
        dispatcher
            .report(handle, TaskPoll::Failed("manifest digest mismatch".into()))
            .await;
        manager.update_states().await?;

        let failed = store
            .find_one(&RecordQuery::by_key(key))
            .await?
            .expect("record exists");
        assert_eq!(failed.status, ImageStatus::Failure);
        assert_eq!(
            failed.status_message.as_deref(),
            Some("manifest digest mismatch")
        );

        // Within the update timeout the failure is returned as is
        let again = manager.pull(&session, &spec, &AclSpec::default()).await?;
        assert_eq!(again.key, Some(key));
        assert_eq!(dispatcher.submitted().await.len(), 1);

        let old = RecordUpdate {
            last_pull: Some(Utc::now() - manager.policy().pull_update_timeout - TimeDelta::seconds(1)),
            ..Default::default()
        };
        store.update(key, &old).await?;
        manager.update_states().await?;
        assert!(store.find_one(&RecordQuery::by_key(key)).await?.is_none());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_refresh_holds_back_new_pulls() -> anyhow::Result<()> {
        let store = Arc::new(MemoryImageStore::new());
        let (manager, dispatcher) = helper::manager(store.clone());
        let session = helper::session(None, None);
        let spec = ImageSpec::docker("cluster", "ubuntu:latest");

        let mut ready = helper::ready_record("abc", ["ubuntu:latest"]);
        ready.last_pull = Some(Utc::now() - manager.policy().pull_update_timeout * 2);
        let ready_key = store.insert(&ready).await?.expect("inserted");

        // The stale image is refreshed and the refresh fails
        let refresh = manager.pull(&session, &spec, &AclSpec::default()).await?;
        let refresh_key = refresh.require_key()?;
        assert_ne!(refresh_key, ready_key);
        let (handle, _) = dispatcher.submitted().await.remove(0);
        dispatcher
            .report(handle, TaskPoll::Failed("registry unreachable".into()))
            .await;
        manager.update_states().await?;

        for _ in 0..3 {
            let returned = manager.pull(&session, &spec, &AclSpec::default()).await?;
            assert_eq!(returned.key, Some(refresh_key));
            assert_eq!(returned.status, ImageStatus::Failure);
        }
        assert_eq!(dispatcher.submitted().await.len(), 1);

        // The image itself stays visible
        let found = manager.lookup(&session, &spec).await?.expect("image found");
        assert_eq!(found.key, Some(ready_key));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_pull_reports_dispatch_trouble_on_the_record() -> anyhow::Result<()> {
        let store = Arc::new(MemoryImageStore::new());
        let (manager, dispatcher) = helper::manager(store.clone());
        let session = helper::session(None, None);

        manager
            .pull(&session, &ImageSpec::docker("cluster", "first:1"), &AclSpec::default())
            .await?;
        dispatcher.disconnect();

        // Polling trouble does not fail an unrelated request
        let second = manager
            .pull(&session, &ImageSpec::docker("cluster", "second:1"), &AclSpec::default())
            .await?;
        assert_eq!(second.status, ImageStatus::Enqueued);
        assert_eq!(dispatcher.submitted().await.len(), 2);

        // A system without a dispatch partition gets a failed record back
        let mut lab = session.clone();
        lab.system = "lab".into();
        let failed = manager
            .pull(&lab, &ImageSpec::docker("lab", "third:1"), &AclSpec::default())
            .await?;
        assert_eq!(failed.status, ImageStatus::Failure);
        assert!(failed
            .status_message
            .as_deref()
            .is_some_and(|message| message.starts_with("dispatch failed")));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_pull_rejects_bad_session() -> anyhow::Result<()> {
        let (manager, dispatcher) = helper::manager(Arc::new(MemoryImageStore::new()));
        let mut session = helper::session(None, None);
        session.magic = "forged".into();

        let result = manager
            .pull(&session, &ImageSpec::docker("cluster", "ubuntu:latest"), &AclSpec::default())
            .await;
        assert!(matches!(result, Err(GatewayError::InvalidSession(_))));
        assert!(dispatcher.submitted().await.is_empty());

        Ok(())
    }
}
