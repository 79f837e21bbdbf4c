use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tokio::sync::Mutex;

use crate::{
    backends::{authenticator_for, Authenticator, CommandConverter, PlatformTransfer},
    config::GatewayConfig,
    dispatch::{LocalDispatcher, TaskDispatcher, TaskHandle},
    store::{ImageRecord, ImageRepository, ImageStatus, Metric, RecordQuery, RecordUpdate, SqliteImageStore},
    worker::ImageWorker,
    GatewayError, GatewayResult,
};

use super::{is_readable, ImageSpec, PullPolicy, Session};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Coordinates image records, dispatched tasks and tags for every configured system.
///
/// All coordination with other orchestrators goes through the store. The only in-memory state
/// is the set of tasks this instance dispatched and still has to collect.
pub struct ImageManager {
    pub(super) config: Arc<GatewayConfig>,
    pub(super) store: Arc<dyn ImageRepository>,
    pub(super) dispatcher: Arc<dyn TaskDispatcher>,
    authenticator: Arc<dyn Authenticator>,
    pub(super) tasks: Mutex<HashMap<TaskHandle, TrackedTask>>,
}

/// What a dispatched task does to its record when it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TaskKind {
    Pull,
    Expire,
}

/// A dispatched task and the record it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct TrackedTask {
    pub(super) key: i64,
    pub(super) kind: TaskKind,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImageManager {
    /// Creates a manager over explicit collaborators.
    pub fn new(
        config: Arc<GatewayConfig>,
        store: Arc<dyn ImageRepository>,
        dispatcher: Arc<dyn TaskDispatcher>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            config,
            store,
            dispatcher,
            authenticator,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a manager backed by the SQLite store and local workers for every platform.
    pub async fn open(config: GatewayConfig) -> GatewayResult<Self> {
        let config = Arc::new(config);
        let store = Arc::new(SqliteImageStore::open(config.get_database()).await?);
        let authenticator = authenticator_for(&config)?;

        let worker = Arc::new(ImageWorker::new(
            config.clone(),
            Arc::new(CommandConverter),
            Arc::new(PlatformTransfer),
        ));
        let dispatcher = Arc::new(LocalDispatcher::new(
            worker,
            config.get_platforms().keys().cloned(),
            *config.get_workers_per_platform(),
        ));

        tracing::info!(
            database = %config.get_database().display(),
            platforms = config.get_platforms().len(),
            "image manager ready"
        );

        Ok(Self::new(config, store, dispatcher, authenticator))
    }

    /// Returns the gateway configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Returns the record store.
    pub fn store(&self) -> &Arc<dyn ImageRepository> {
        &self.store
    }

    /// Returns the pull policy in effect.
    pub fn policy(&self) -> PullPolicy {
        PullPolicy::from_config(&self.config)
    }

    /// Authenticates `credential` and issues a session for `system`.
    ///
    /// ## Errors
    ///
    /// Returns `Configuration` for an unknown system, `AuthenticationFailed` when the credential is
    /// rejected and `InvalidSession` when the authenticator returns no user.
    pub async fn new_session(&self, credential: &str, system: &str) -> GatewayResult<Session> {
        self.config.platform(system)?;

        let identity = self
            .authenticator
            .authenticate(credential, system)
            .await
            .map_err(|e| match e {
                GatewayError::AuthenticationFailed(_) => e,
                other => GatewayError::AuthenticationFailed(other.to_string()),
            })?;

        if identity.user.is_empty() {
            return Err(GatewayError::InvalidSession(
                "authentication returned no user".to_string(),
            ));
        }

        tracing::debug!(user = %identity.user, %system, "session issued");
        Ok(Session::from_identity(identity, system))
    }

    /// Checks that `session` is valid for `system`.
    pub fn check_session(&self, session: &Session, system: &str) -> GatewayResult<()> {
        session.validate(system)
    }

    /// Returns true if `session` may see `record`.
    pub fn checkread(&self, session: &Session, record: &ImageRecord) -> bool {
        is_readable(session, record)
    }

    /// Returns the READY image holding `spec.tag`, extending its expiration.
    ///
    /// Returns `None` when no image holds the tag or the caller may not see it.
    pub async fn lookup(
        &self,
        session: &Session,
        spec: &ImageSpec,
    ) -> GatewayResult<Option<ImageRecord>> {
        self.check_session(session, &spec.system)?;

        let query = RecordQuery::on_system(&spec.system)
            .itype(&spec.itype)
            .tagged(&spec.tag)
            .status_in([ImageStatus::Ready]);
        let Some(mut record) = self.store.find_one(&query).await? else {
            return Ok(None);
        };

        if !is_readable(session, &record) {
            tracing::debug!(user = %session.user, tag = %spec.tag, "lookup hidden by acl");
            return Ok(None);
        }

        let key = record.require_key()?;
        let now = Utc::now();
        let expiration = now + self.config.get_image_expiration_timeout().as_delta();
        let update = RecordUpdate {
            expiration: Some(expiration),
            ..Default::default()
        }
        .when(ImageStatus::Ready);
        if self.store.update(key, &update).await? {
            record.expiration = Some(expiration);
        }

        if let Some(id) = &record.id {
            let metric = Metric {
                user: session.user.clone(),
                uid: session.uid.unwrap_or_default(),
                system: spec.system.clone(),
                itype: spec.itype.clone(),
                tag: spec.tag.clone(),
                id: id.clone(),
                time: now,
            };
            self.store.insert_metric(&metric).await?;
        }

        Ok(Some(record))
    }

    /// Returns the READY images on `system` that `session` may see.
    pub async fn imglist(&self, session: &Session, system: &str) -> GatewayResult<Vec<ImageRecord>> {
        self.check_session(session, system)?;

        let query = RecordQuery::on_system(system).status_in([ImageStatus::Ready]);
        let records = self.store.find(&query).await?;

        Ok(records
            .into_iter()
            .filter(|record| is_readable(session, record))
            .collect())
    }

    /// Returns the pulls on `system` that are in flight or failed.
    pub async fn show_queue(
        &self,
        session: &Session,
        system: &str,
    ) -> GatewayResult<Vec<ImageRecord>> {
        self.check_session(session, system)?;

        let query = RecordQuery::on_system(system)
            .status_not_in([ImageStatus::Ready, ImageStatus::Expired]);
        self.store.find(&query).await
    }

    /// Moves `tag` onto the record with `key`, taking it from any other record on `system`.
    ///
    /// Returns false if the record does not exist.
    pub async fn add_tag(&self, key: i64, system: &str, tag: &str) -> GatewayResult<bool> {
        self.remove_tag(system, tag).await?;

        let Some(record) = self.store.find_one(&RecordQuery::by_key(key)).await? else {
            return Ok(false);
        };

        if record.legacy_tag {
            tracing::info!(key, %system, "repairing legacy scalar tag");
        }

        let mut tags = record.tag;
        tags.insert(tag.to_string());
        let update = RecordUpdate {
            tag: Some(tags),
            ..Default::default()
        };

        self.store.update(key, &update).await
    }

    /// Removes `tag` from every record on `system` and returns how many records held it.
    pub async fn remove_tag(&self, system: &str, tag: &str) -> GatewayResult<usize> {
        let holders = self
            .store
            .find(&RecordQuery::on_system(system).tagged(tag))
            .await?;

        let mut removed = 0;
        for record in holders {
            let key = record.require_key()?;
            let mut tags = record.tag;
            tags.remove(tag);

            let update = RecordUpdate {
                tag: Some(tags),
                ..Default::default()
            };
            if self.store.update(key, &update).await? {
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Returns true if `session` belongs to an admin of `system`.
    pub(super) fn is_admin(&self, session: &Session, system: &str) -> bool {
        self.config
            .platform(system)
            .map(|platform| platform.is_admin(&session.user))
            .unwrap_or(false)
    }

    /// Starts tracking a dispatched task.
    pub(super) async fn track(&self, handle: TaskHandle, key: i64, kind: TaskKind) {
        self.tasks.lock().await.insert(handle, TrackedTask { key, kind });
    }

    /// Returns the number of dispatched tasks still waiting to be collected.
    pub async fn pending_tasks(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------


#[cfg(test)]
pub(crate) mod helper {
    use std::{
        collections::{BTreeMap, HashMap},
        sync::atomic::{AtomicBool, Ordering},
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        backends::MockAuthenticator,
        config::{LocalAccess, PlatformConfig},
        dispatch::{Task, TaskPoll},
        manager::SESSION_MAGIC,
    };

    /// A dispatcher that records submissions and reports whatever a test sets.
    #[derive(Default)]
    pub(crate) struct FakeDispatcher {
        submitted: Mutex<Vec<(TaskHandle, Task)>>,
        polls: Mutex<HashMap<TaskHandle, TaskPoll>>,
        unreachable: AtomicBool,
    }

    impl FakeDispatcher {
        pub(crate) async fn submitted(&self) -> Vec<(TaskHandle, Task)> {
            self.submitted.lock().await.clone()
        }

        pub(crate) async fn report(&self, handle: TaskHandle, poll: TaskPoll) {
            self.polls.lock().await.insert(handle, poll);
        }

        /// Makes every later poll fail as if the broker went away.
        pub(crate) fn disconnect(&self) {
            self.unreachable.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl TaskDispatcher for FakeDispatcher {
        async fn submit(&self, task: Task) -> GatewayResult<TaskHandle> {
            if task.system() != "cluster" {
                return Err(GatewayError::Configuration(format!(
                    "no partition for {}",
                    task.system()
                )));
            }

            let handle = TaskHandle::new();
            self.submitted.lock().await.push((handle, task));
            self.polls.lock().await.insert(handle, TaskPoll::Pending(None));
            Ok(handle)
        }

        async fn poll(&self, handle: &TaskHandle) -> GatewayResult<TaskPoll> {
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(GatewayError::custom(anyhow::anyhow!("broker unreachable")));
            }

            self.polls
                .lock()
                .await
                .get(handle)
                .cloned()
                .ok_or_else(|| GatewayError::UnknownTask(handle.to_string()))
        }

        async fn release(&self, handle: &TaskHandle) -> GatewayResult<()> {
            self.polls.lock().await.remove(handle);
            Ok(())
        }
    }

    pub(crate) fn config() -> GatewayConfig {
        let platform = PlatformConfig::builder()
            .admins(vec!["root".to_string()])
            .local(Some(
                LocalAccess::builder()
                    .image_dir(std::env::temp_dir())
                    .build(),
            ))
            .build();

        GatewayConfig::builder()
            .platforms(HashMap::from([("cluster".to_string(), platform)]))
            .build()
    }

    pub(crate) fn manager(store: Arc<dyn ImageRepository>) -> (ImageManager, Arc<FakeDispatcher>) {
        let dispatcher = Arc::new(FakeDispatcher::default());
        let manager = ImageManager::new(
            Arc::new(config()),
            store,
            dispatcher.clone(),
            Arc::new(MockAuthenticator),
        );
        (manager, dispatcher)
    }

    pub(crate) fn session(uid: Option<u32>, gid: Option<u32>) -> Session {
        named_session("alice", uid, gid)
    }

    pub(crate) fn named_session(user: &str, uid: Option<u32>, gid: Option<u32>) -> Session {
        Session {
            user: user.to_string(),
            group: "users".to_string(),
            uid,
            gid,
            tokens: BTreeMap::new(),
            system: "cluster".to_string(),
            magic: SESSION_MAGIC.to_string(),
        }
    }

    pub(crate) fn ready_record<const N: usize>(id: &str, tags: [&str; N]) -> ImageRecord {
        let pulltag = tags.first().copied().unwrap_or("untagged:latest");
        let mut record = ImageRecord::new_pull("cluster", "docker", pulltag, "squashfs", Utc::now());
        record.id = Some(id.to_string());
        record.status = ImageStatus::Ready;
        record.tag = tags.iter().map(|t| t.to_string()).collect();
        record
    }
}
