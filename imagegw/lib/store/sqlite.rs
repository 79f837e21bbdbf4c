use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Pool, QueryBuilder, Row, Sqlite};

use crate::{GatewayError, GatewayResult};

use super::{
    get_or_create_db_pool, ImageRecord, ImageRepository, ImageStatus, Metric, RecordQuery,
    RecordUpdate, IMAGES_DB_MIGRATOR,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An [`ImageRepository`] backed by SQLite.
///
/// Set-valued fields are stored as JSON text. A partial unique index over in-flight statuses
/// enforces a single pull record per system, image type and pull tag.
#[derive(Debug, Clone)]
pub struct SqliteImageStore {
    pool: Pool<Sqlite>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SqliteImageStore {
    /// Opens the store at `db_path`, creating and migrating the database if needed.
    pub async fn open(db_path: impl AsRef<Path>) -> GatewayResult<Self> {
        let pool = get_or_create_db_pool(db_path, &IMAGES_DB_MIGRATOR).await?;
        Ok(Self { pool })
    }

    /// Wraps an existing, already migrated pool.
    pub fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ImageRepository for SqliteImageStore {
    async fn find_one(&self, query: &RecordQuery) -> GatewayResult<Option<ImageRecord>> {
        Ok(self.find(query).await?.into_iter().next())
    }

    async fn find(&self, query: &RecordQuery) -> GatewayResult<Vec<ImageRecord>> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM images WHERE 1 = 1");

        if let Some(key) = query.key {
            builder.push(" AND _id = ").push_bind(key);
        }
        if let Some(id) = &query.id {
            builder.push(" AND id = ").push_bind(id.clone());
        }
        if let Some(system) = &query.system {
            builder.push(" AND system = ").push_bind(system.clone());
        }
        if let Some(itype) = &query.itype {
            builder.push(" AND itype = ").push_bind(itype.clone());
        }
        if let Some(pulltag) = &query.pulltag {
            builder.push(" AND pulltag = ").push_bind(pulltag.clone());
        }
        push_status_filter(&mut builder, " AND status IN (", &query.status_in);
        push_status_filter(&mut builder, " AND status NOT IN (", &query.status_not_in);
        builder.push(" ORDER BY _id");

        let rows = builder.build().fetch_all(&self.pool).await?;

        // Tags may be stored in the legacy scalar form, so tag membership is checked here.
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record = record_from_row(&row)?;
            if query.has_tag.as_ref().map_or(true, |tag| record.has_tag(tag)) {
                records.push(record);
            }
        }

        Ok(records)
    }

    async fn insert(&self, record: &ImageRecord) -> GatewayResult<Option<i64>> {
        let result = sqlx::query(
            r#"
            INSERT INTO images (
                id, system, itype, pulltag, tag, format, arch, os, location, remotetype,
                ostcount, replication, userACL, groupACL, status, status_message,
                last_pull, last_heartbeat, expiration, ENV, ENTRY, WORKDIR, LABELS, private
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING _id
            "#,
        )
        .bind(&record.id)
        .bind(&record.system)
        .bind(&record.itype)
        .bind(&record.pulltag)
        .bind(serde_json::to_string(&record.tag)?)
        .bind(&record.format)
        .bind(&record.arch)
        .bind(&record.os)
        .bind(&record.location)
        .bind(&record.remotetype)
        .bind(record.ostcount)
        .bind(record.replication)
        .bind(serde_json::to_string(&record.user_acl)?)
        .bind(serde_json::to_string(&record.group_acl)?)
        .bind(record.status.as_str())
        .bind(&record.status_message)
        .bind(record.last_pull.map(|t| t.timestamp_millis()))
        .bind(record.last_heartbeat.map(|t| t.timestamp_millis()))
        .bind(record.expiration.map(|t| t.timestamp_millis()))
        .bind(serde_json::to_string(&record.env)?)
        .bind(record.entry.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&record.workdir)
        .bind(serde_json::to_string(&record.labels)?)
        .bind(record.private)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(Some(row.get::<i64, _>("_id"))),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                tracing::debug!(
                    system = %record.system,
                    pulltag = %record.pulltag,
                    "in-flight record already exists"
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, key: i64, update: &RecordUpdate) -> GatewayResult<bool> {
        update.check_transition()?;

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE images SET ");
        let mut fields = builder.separated(", ");
        let mut any = false;

        macro_rules! set {
            ($column:literal, $value:expr) => {{
                fields.push(concat!($column, " = "));
                fields.push_bind_unseparated($value);
                any = true;
            }};
        }

        if let Some(id) = &update.id {
            set!("id", id.clone());
        }
        if let Some(tag) = &update.tag {
            set!("tag", serde_json::to_string(tag)?);
        }
        if let Some(status) = update.status {
            set!("status", status.as_str());
        }
        if let Some(message) = &update.status_message {
            set!("status_message", message.clone());
        }
        if let Some(last_pull) = update.last_pull {
            set!("last_pull", last_pull.timestamp_millis());
        }
        if let Some(heartbeat) = update.last_heartbeat {
            set!("last_heartbeat", heartbeat.timestamp_millis());
        }
        if let Some(expiration) = update.expiration {
            set!("expiration", expiration.timestamp_millis());
        }
        if let Some(env) = &update.env {
            set!("ENV", serde_json::to_string(env)?);
        }
        if let Some(entry) = &update.entry {
            set!("ENTRY", entry.as_ref().map(serde_json::to_string).transpose()?);
        }
        if let Some(workdir) = &update.workdir {
            set!("WORKDIR", workdir.clone());
        }
        if let Some(labels) = &update.labels {
            set!("LABELS", serde_json::to_string(labels)?);
        }
        if let Some(user_acl) = &update.user_acl {
            set!("userACL", serde_json::to_string(user_acl)?);
        }
        if let Some(group_acl) = &update.group_acl {
            set!("groupACL", serde_json::to_string(group_acl)?);
        }
        if let Some(private) = update.private {
            set!("private", private);
        }

        if !any {
            return Ok(false);
        }

        builder.push(" WHERE _id = ").push_bind(key);
        if let Some(status) = update.when_status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, key: i64) -> GatewayResult<bool> {
        let result = sqlx::query("DELETE FROM images WHERE _id = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_metric(&self, metric: &Metric) -> GatewayResult<()> {
        sqlx::query(
            r#"
            INSERT INTO metrics (user, uid, system, itype, tag, id, time)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&metric.user)
        .bind(metric.uid as i64)
        .bind(&metric.system)
        .bind(&metric.itype)
        .bind(&metric.tag)
        .bind(&metric.id)
        .bind(metric.time.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn metrics(&self, system: &str, limit: usize) -> GatewayResult<Vec<Metric>> {
        let rows = sqlx::query(
            r#"
            SELECT user, uid, system, itype, tag, id, time FROM metrics
            WHERE system = ?
            ORDER BY time DESC, _id DESC
            LIMIT ?
            "#,
        )
        .bind(system)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> GatewayResult<Metric> {
                Ok(Metric {
                    user: row.try_get("user")?,
                    uid: row.try_get::<i64, _>("uid")? as u32,
                    system: row.try_get("system")?,
                    itype: row.try_get("itype")?,
                    tag: row.try_get("tag")?,
                    id: row.try_get("id")?,
                    time: millis_to_datetime(row.try_get("time")?)?,
                })
            })
            .collect()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn push_status_filter(
    builder: &mut QueryBuilder<'_, Sqlite>,
    prefix: &str,
    statuses: &[ImageStatus],
) {
    if statuses.is_empty() {
        return;
    }

    builder.push(prefix);
    let mut separated = builder.separated(", ");
    for status in statuses {
        separated.push_bind(status.as_str());
    }
    separated.push_unseparated(")");
}

fn record_from_row(row: &SqliteRow) -> GatewayResult<ImageRecord> {
    let (tag, legacy_tag) = parse_tag_column(&row.try_get::<String, _>("tag")?);

    Ok(ImageRecord {
        key: Some(row.try_get("_id")?),
        id: row.try_get("id")?,
        system: row.try_get("system")?,
        itype: row.try_get("itype")?,
        pulltag: row.try_get("pulltag")?,
        tag,
        format: row.try_get("format")?,
        arch: row.try_get("arch")?,
        os: row.try_get("os")?,
        location: row.try_get("location")?,
        remotetype: row.try_get("remotetype")?,
        ostcount: row.try_get("ostcount")?,
        replication: row.try_get("replication")?,
        user_acl: serde_json::from_str(&row.try_get::<String, _>("userACL")?)?,
        group_acl: serde_json::from_str(&row.try_get::<String, _>("groupACL")?)?,
        status: row.try_get::<String, _>("status")?.parse()?,
        status_message: row.try_get("status_message")?,
        last_pull: optional_millis(row.try_get("last_pull")?)?,
        last_heartbeat: optional_millis(row.try_get("last_heartbeat")?)?,
        expiration: optional_millis(row.try_get("expiration")?)?,
        env: serde_json::from_str(&row.try_get::<String, _>("ENV")?)?,
        entry: row
            .try_get::<Option<String>, _>("ENTRY")?
            .map(|entry| serde_json::from_str(&entry))
            .transpose()?,
        workdir: row.try_get("WORKDIR")?,
        labels: serde_json::from_str::<BTreeMap<String, String>>(
            &row.try_get::<String, _>("LABELS")?,
        )?,
        private: row.try_get("private")?,
        legacy_tag,
    })
}

/// Parses a stored tag column. Older records hold a single tag string instead of a JSON array;
/// those are returned as a one element set and flagged.
fn parse_tag_column(raw: &str) -> (BTreeSet<String>, bool) {
    if let Ok(tags) = serde_json::from_str::<BTreeSet<String>>(raw) {
        return (tags, false);
    }

    let scalar = serde_json::from_str::<String>(raw).unwrap_or_else(|_| raw.to_string());
    let tags = if scalar.is_empty() {
        BTreeSet::new()
    } else {
        BTreeSet::from([scalar])
    };

    (tags, true)
}

fn millis_to_datetime(millis: i64) -> GatewayResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| GatewayError::InvalidArgument(format!("timestamp out of range: {millis}")))
}

fn optional_millis(millis: Option<i64>) -> GatewayResult<Option<DateTime<Utc>>> {
    millis.map(millis_to_datetime).transpose()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
