use chrono::Utc;

use crate::{
    dispatch::{ExpireTask, Task},
    store::{ImageRecord, ImageStatus, Metric, RecordQuery},
    GatewayError, GatewayResult,
};

use super::{AdminOutcome, ImageManager, ImageSpec, Session, TaskKind};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImageManager {
    /// Removes the READY image holding `spec.tag` from its system.
    ///
    /// The record becomes EXPIRED once the remove task reports success. Returns the record the
    /// task was dispatched for, or `None` if no image holds the tag.
    pub async fn expire(
        &self,
        session: &Session,
        spec: &ImageSpec,
    ) -> GatewayResult<AdminOutcome<Option<ImageRecord>>> {
        self.check_session(session, &spec.system)?;
        if !self.is_admin(session, &spec.system) {
            tracing::warn!(user = %session.user, system = %spec.system, "expire denied");
            return Ok(AdminOutcome::Denied);
        }

        self.update_states().await?;

        let query = RecordQuery::on_system(&spec.system)
            .itype(&spec.itype)
            .tagged(&spec.tag)
            .status_in([ImageStatus::Ready]);
        let Some(record) = self.store.find_one(&query).await? else {
            return Ok(AdminOutcome::Granted(None));
        };

        self.dispatch_expire(&record).await?;
        Ok(AdminOutcome::Granted(Some(record)))
    }

    /// Purges pulls stuck past the pull timeout and expires READY images whose expiration has
    /// passed. Returns the ids of the images being expired.
    pub async fn autoexpire(
        &self,
        session: &Session,
        system: &str,
    ) -> GatewayResult<AdminOutcome<Vec<String>>> {
        self.check_session(session, system)?;
        if !self.is_admin(session, system) {
            tracing::warn!(user = %session.user, %system, "autoexpire denied");
            return Ok(AdminOutcome::Denied);
        }

        self.update_states().await?;

        let now = Utc::now();
        let cutoff = now - self.config.pull_timeout();

        let unfinished = self
            .store
            .find(
                &RecordQuery::on_system(system)
                    .status_not_in([ImageStatus::Ready, ImageStatus::Expired]),
            )
            .await?;
        for record in unfinished {
            if record.last_pull.map_or(true, |last| last < cutoff) {
                let key = record.require_key()?;
                self.store.remove(key).await?;
                tracing::info!(
                    key,
                    %system,
                    tag = %record.pulltag,
                    status = %record.status,
                    "purged unfinished pull"
                );
            }
        }

        let ready = self
            .store
            .find(&RecordQuery::on_system(system).status_in([ImageStatus::Ready]))
            .await?;

        let mut expired = Vec::new();
        for record in ready {
            if record.expiration.is_some_and(|expiration| expiration < now)
                && self.dispatch_expire(&record).await?
            {
                expired.extend(record.id.clone());
            }
        }

        Ok(AdminOutcome::Granted(expired))
    }

    /// Returns up to `limit` of the latest lookups on `system`, newest first.
    pub async fn get_metrics(
        &self,
        session: &Session,
        system: &str,
        limit: usize,
    ) -> GatewayResult<AdminOutcome<Vec<Metric>>> {
        self.check_session(session, system)?;
        if !self.is_admin(session, system) {
            return Ok(AdminOutcome::Denied);
        }

        Ok(AdminOutcome::Granted(
            self.store.metrics(system, limit).await?,
        ))
    }

    /// Dispatches a remove task for a READY record unless one is already running. Returns true if
    /// a task was dispatched.
    async fn dispatch_expire(&self, record: &ImageRecord) -> GatewayResult<bool> {
        let key = record.require_key()?;
        let id = record.id.clone().ok_or_else(|| {
            GatewayError::InvalidArgument(format!("READY record {key} has no image id"))
        })?;

        let already_running = self
            .tasks
            .lock()
            .await
            .values()
            .any(|task| task.key == key && task.kind == TaskKind::Expire);
        if already_running {
            return Ok(false);
        }

        let task = Task::Expire(ExpireTask {
            system: record.system.clone(),
            id: id.clone(),
            format: record.format.clone(),
        });
        let handle = self.dispatcher.submit(task).await?;
        self.track(handle, key, TaskKind::Expire).await;

        tracing::info!(key, system = %record.system, %id, %handle, "expire dispatched");
        Ok(true)
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
        dispatch::{TaskOutput, TaskPoll},
        manager::helper,
        store::{ImageRepository, MemoryImageStore},
    };

    #[test_log::test(tokio::test)]
    async fn test_admin_operations_deny_non_admins() -> anyhow::Result<()> {
        let store = Arc::new(MemoryImageStore::new());
        let (manager, dispatcher) = helper::manager(store.clone());
        store
            .insert(&helper::ready_record("abc", ["ubuntu:latest"]))
            .await?;

        let user = helper::named_session("alice", Some(1000), None);
        let spec = ImageSpec::docker("cluster", "ubuntu:latest");

        assert!(manager.expire(&user, &spec).await?.is_denied());
        assert!(manager.autoexpire(&user, "cluster").await?.is_denied());
        assert!(manager.get_metrics(&user, "cluster", 10).await?.is_denied());
        assert!(dispatcher.submitted().await.is_empty());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_expire_marks_record_after_task_succeeds() -> anyhow::Result<()> {
        let store = Arc::new(MemoryImageStore::new());
        let (manager, dispatcher) = helper::manager(store.clone());
        let key = store
            .insert(&helper::ready_record("abc", ["ubuntu:latest"]))
            .await?
            .expect("inserted");

        let admin = helper::named_session("root", Some(0), Some(0));
        let spec = ImageSpec::docker("cluster", "ubuntu:latest");

        let record = manager
            .expire(&admin, &spec)
            .await?
            .granted()
            .flatten()
            .expect("image found");
        assert_eq!(record.key, Some(key));

        // Still READY until the remove task reports back
        let (handle, task) = dispatcher.submitted().await.remove(0);
        assert!(matches!(task, Task::Expire(ExpireTask { ref id, .. }) if id == "abc"));
        manager.update_states().await?;
        let current = store.find_one(&RecordQuery::by_key(key)).await?.expect("record");
        assert_eq!(current.status, ImageStatus::Ready);

        // A second request does not dispatch another task
        manager.expire(&admin, &spec).await?;
        assert_eq!(dispatcher.submitted().await.len(), 1);

        dispatcher
            .report(handle, TaskPoll::Done(TaskOutput::Expired))
            .await;
        manager.update_states().await?;
        let current = store.find_one(&RecordQuery::by_key(key)).await?.expect("record");
        assert_eq!(current.status, ImageStatus::Expired);

        let missing = manager
            .expire(&admin, &ImageSpec::docker("cluster", "missing:1"))
            .await?;
        assert_eq!(missing, AdminOutcome::Granted(None));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_autoexpire_purges_and_expires() -> anyhow::Result<()> {
        let store = Arc::new(MemoryImageStore::new());
        let (manager, dispatcher) = helper::manager(store.clone());
        let now = Utc::now();
        let long_ago = now - manager.config().pull_timeout() - TimeDelta::seconds(1);

        let mut stale = helper::ready_record("stale", ["old:1"]);
        stale.expiration = Some(now - TimeDelta::seconds(1));
        store.insert(&stale).await?;

        let mut live = helper::ready_record("live", ["new:1"]);
        live.expiration = Some(now + TimeDelta::days(1));
        store.insert(&live).await?;

        let mut stuck = ImageRecord::new_pull("cluster", "docker", "stuck:1", "squashfs", long_ago);
        stuck.status = ImageStatus::Conversion;
        let stuck_key = store.insert(&stuck).await?.expect("inserted");

        let recent = ImageRecord::new_pull("cluster", "docker", "recent:1", "squashfs", now);
        let recent_key = store.insert(&recent).await?.expect("inserted");

        let admin = helper::named_session("root", Some(0), Some(0));
        let expired = manager
            .autoexpire(&admin, "cluster")
            .await?
            .granted()
            .expect("admin is granted");
        assert_eq!(expired, vec!["stale".to_string()]);

        assert!(store.find_one(&RecordQuery::by_key(stuck_key)).await?.is_none());
        assert!(store.find_one(&RecordQuery::by_key(recent_key)).await?.is_some());

        let submitted = dispatcher.submitted().await;
        assert_eq!(submitted.len(), 1);
        assert!(matches!(&submitted[0].1, Task::Expire(task) if task.id == "stale"));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_get_metrics_for_admin() -> anyhow::Result<()> {
        let store = Arc::new(MemoryImageStore::new());
        let (manager, _) = helper::manager(store.clone());
        store
            .insert(&helper::ready_record("abc", ["ubuntu:latest"]))
            .await?;

        let user = helper::session(Some(1000), None);
        let spec = ImageSpec::docker("cluster", "ubuntu:latest");
        manager.lookup(&user, &spec).await?;
        manager.lookup(&user, &spec).await?;

        let admin = helper::named_session("root", Some(0), Some(0));
        let metrics = manager
            .get_metrics(&admin, "cluster", 1)
            .await?
            .granted()
            .expect("admin is granted");
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].user, "alice");

        Ok(())
    }
}
