use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::GatewayResult;

use super::{ImageRecord, ImageRepository, Metric, RecordQuery, RecordUpdate};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An in-process [`ImageRepository`], used by tests and single-shot tools.
///
/// It applies the same in-flight uniqueness rule as the SQLite store.
#[derive(Debug, Default)]
pub struct MemoryImageStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_key: i64,
    records: BTreeMap<i64, ImageRecord>,
    metrics: Vec<Metric>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MemoryImageStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ImageRepository for MemoryImageStore {
    async fn find_one(&self, query: &RecordQuery) -> GatewayResult<Option<ImageRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.records.values().find(|r| query.matches(r)).cloned())
    }

    async fn find(&self, query: &RecordQuery) -> GatewayResult<Vec<ImageRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect())
    }

    async fn insert(&self, record: &ImageRecord) -> GatewayResult<Option<i64>> {
        let mut inner = self.inner.lock().await;

        let conflict = record.status.is_in_flight()
            && inner.records.values().any(|r| {
                r.status.is_in_flight()
                    && r.system == record.system
                    && r.itype == record.itype
                    && r.pulltag == record.pulltag
            });
        if conflict {
            return Ok(None);
        }

        inner.next_key += 1;
        let key = inner.next_key;
        let mut stored = record.clone();
        stored.key = Some(key);
        stored.legacy_tag = false;
        inner.records.insert(key, stored);

        Ok(Some(key))
    }

    async fn update(&self, key: i64, update: &RecordUpdate) -> GatewayResult<bool> {
        update.check_transition()?;

        let mut inner = self.inner.lock().await;
        let Some(record) = inner.records.get_mut(&key) else {
            return Ok(false);
        };

        if update.when_status.is_some_and(|status| record.status != status) {
            return Ok(false);
        }

        let unguarded = RecordUpdate {
            when_status: None,
            ..update.clone()
        };
        if unguarded == RecordUpdate::default() {
            return Ok(false);
        }

        if let Some(id) = &update.id {
            record.id = Some(id.clone());
        }
        if let Some(tag) = &update.tag {
            record.tag = tag.clone();
            record.legacy_tag = false;
        }
        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(message) = &update.status_message {
            record.status_message = message.clone();
        }
        if let Some(last_pull) = update.last_pull {
            record.last_pull = Some(last_pull);
        }
        if let Some(heartbeat) = update.last_heartbeat {
            record.last_heartbeat = Some(heartbeat);
        }
        if let Some(expiration) = update.expiration {
            record.expiration = Some(expiration);
        }
        if let Some(env) = &update.env {
            record.env = env.clone();
        }
        if let Some(entry) = &update.entry {
            record.entry = entry.clone();
        }
        if let Some(workdir) = &update.workdir {
            record.workdir = workdir.clone();
        }
        if let Some(labels) = &update.labels {
            record.labels = labels.clone();
        }
        if let Some(user_acl) = &update.user_acl {
            record.user_acl = user_acl.clone();
        }
        if let Some(group_acl) = &update.group_acl {
            record.group_acl = group_acl.clone();
        }
        if let Some(private) = update.private {
            record.private = private;
        }

        Ok(true)
    }

    async fn remove(&self, key: i64) -> GatewayResult<bool> {
        let mut inner = self.inner.lock().await;
        Ok(inner.records.remove(&key).is_some())
    }

    async fn insert_metric(&self, metric: &Metric) -> GatewayResult<()> {
        self.inner.lock().await.metrics.push(metric.clone());
        Ok(())
    }

    async fn metrics(&self, system: &str, limit: usize) -> GatewayResult<Vec<Metric>> {
        let inner = self.inner.lock().await;
        let mut metrics: Vec<Metric> = inner
            .metrics
            .iter()
            .filter(|m| m.system == system)
            .cloned()
            .collect();
        metrics.sort_by(|a, b| b.time.cmp(&a.time));
        metrics.truncate(limit);
        Ok(metrics)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{store::ImageStatus, GatewayError};

    #[tokio::test]
    async fn test_memory_store_in_flight_uniqueness() -> anyhow::Result<()> {
        let store = MemoryImageStore::new();
        let record = ImageRecord::new_pull("cluster", "docker", "ubuntu:latest", "squashfs", Utc::now());

        let key = store.insert(&record).await?.expect("first insert");
        assert_eq!(store.insert(&record).await?, None);

        assert!(!store
            .update(key, &RecordUpdate::status(ImageStatus::Ready).when(ImageStatus::Pulling))
            .await?);
        assert!(store
            .update(key, &RecordUpdate::status(ImageStatus::Ready).when(ImageStatus::Init))
            .await?);
        assert!(store.insert(&record).await?.is_some());

        let ready = store
            .find(&RecordQuery::on_system("cluster").status_in([ImageStatus::Ready]))
            .await?;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].key, Some(key));

        Ok(())
    }

    #[tokio::test]
    async fn test_memory_store_rejects_transitions_outside_the_table() -> anyhow::Result<()> {
        let store = MemoryImageStore::new();
        let mut record = ImageRecord::new_pull("cluster", "docker", "ubuntu:latest", "squashfs", Utc::now());
        record.status = ImageStatus::Failure;
        let key = store.insert(&record).await?.expect("inserted");

        let result = store
            .update(key, &RecordUpdate::status(ImageStatus::Pulling).when(ImageStatus::Failure))
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::InvalidTransition {
                from: ImageStatus::Failure,
                to: ImageStatus::Pulling
            })
        ));

        // A status change has to say which status it leaves
        let result = store
            .update(key, &RecordUpdate::status(ImageStatus::Pulling))
            .await;
        assert!(matches!(result, Err(GatewayError::InvalidArgument(_))));

        let current = store
            .find_one(&RecordQuery::by_key(key))
            .await?
            .expect("record exists");
        assert_eq!(current.status, ImageStatus::Failure);

        Ok(())
    }
}
