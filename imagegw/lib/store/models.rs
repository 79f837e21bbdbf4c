use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    config::{RemoteType, DEFAULT_ARCH, DEFAULT_OS},
    GatewayError, GatewayResult,
};

use super::ImageStatus;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The durable record of one image pull and, once READY, of the staged image itself.
///
/// Serialized field names are part of the contract with other tooling and must not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// The storage key of the record.
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub key: Option<i64>,

    /// The image id, known once the manifest has been examined.
    #[serde(default)]
    pub id: Option<String>,

    /// The target system.
    pub system: String,

    /// The image type, e.g. `docker`.
    pub itype: String,

    /// The tag that was requested when the pull record was created.
    pub pulltag: String,

    /// All tags that currently point at this image on this system.
    #[serde(default)]
    pub tag: BTreeSet<String>,

    /// The image format produced by the conversion step.
    pub format: String,

    /// The image architecture.
    pub arch: String,

    /// The image operating system.
    pub os: String,

    /// The registry location the image was pulled from.
    #[serde(default)]
    pub location: Option<String>,

    /// The kind of remote the image was pulled from.
    pub remotetype: String,

    /// Object storage target count, carried for compatibility.
    #[serde(default)]
    pub ostcount: i64,

    /// Replication factor, carried for compatibility.
    #[serde(default = "default_replication")]
    pub replication: i64,

    /// User ids allowed to see a private image.
    #[serde(rename = "userACL", default)]
    pub user_acl: BTreeSet<u32>,

    /// Group ids allowed to see a private image.
    #[serde(rename = "groupACL", default)]
    pub group_acl: BTreeSet<u32>,

    /// The lifecycle state.
    pub status: ImageStatus,

    /// A human readable message about the last state change.
    #[serde(default)]
    pub status_message: Option<String>,

    /// When a pull of this record was last requested.
    #[serde(default)]
    pub last_pull: Option<DateTime<Utc>>,

    /// When the worker last reported progress.
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// When the image expires unless it is accessed again.
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,

    /// Environment of the image configuration.
    #[serde(rename = "ENV", default)]
    pub env: Vec<String>,

    /// Entrypoint of the image configuration.
    #[serde(rename = "ENTRY", default)]
    pub entry: Option<Vec<String>>,

    /// Working directory of the image configuration.
    #[serde(rename = "WORKDIR", default)]
    pub workdir: Option<String>,

    /// Labels of the image configuration.
    #[serde(rename = "LABELS", default)]
    pub labels: BTreeMap<String, String>,

    /// Whether the image was pulled with private registry credentials.
    #[serde(default)]
    pub private: bool,

    /// Set when the stored tag was a scalar instead of a set.
    #[serde(skip)]
    pub legacy_tag: bool,
}

/// A field-by-field update of an image record.
///
/// `None` leaves a field untouched. `when_status` turns the update into a compare-and-set that
/// only applies while the record is still in that status. A status change must name the status
/// it leaves, and that move must be allowed by the transition table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    /// Only apply the update while the record has this status.
    pub when_status: Option<ImageStatus>,

    /// New image id.
    pub id: Option<String>,

    /// New tag set.
    pub tag: Option<BTreeSet<String>>,

    /// New status.
    pub status: Option<ImageStatus>,

    /// New status message.
    pub status_message: Option<Option<String>>,

    /// New last pull time.
    pub last_pull: Option<DateTime<Utc>>,

    /// New heartbeat time.
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// New expiration time.
    pub expiration: Option<DateTime<Utc>>,

    /// New environment.
    pub env: Option<Vec<String>>,

    /// New entrypoint.
    pub entry: Option<Option<Vec<String>>>,

    /// New working directory.
    pub workdir: Option<Option<String>>,

    /// New labels.
    pub labels: Option<BTreeMap<String, String>>,

    /// New user ACL.
    pub user_acl: Option<BTreeSet<u32>>,

    /// New group ACL.
    pub group_acl: Option<BTreeSet<u32>>,

    /// New private flag.
    pub private: Option<bool>,
}

/// A filter over image records. Every set field must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordQuery {
    /// Match the storage key.
    pub key: Option<i64>,

    /// Match the image id.
    pub id: Option<String>,

    /// Match the system.
    pub system: Option<String>,

    /// Match the image type.
    pub itype: Option<String>,

    /// Match the pull tag.
    pub pulltag: Option<String>,

    /// Match any of these statuses.
    pub status_in: Vec<ImageStatus>,

    /// Exclude these statuses.
    pub status_not_in: Vec<ImageStatus>,

    /// Match records whose tag set contains this tag.
    pub has_tag: Option<String>,
}

/// A record of one image lookup, kept for usage reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// The user that looked the image up.
    pub user: String,

    /// The uid of the user.
    pub uid: u32,

    /// The target system.
    pub system: String,

    /// The image type.
    #[serde(rename = "type")]
    pub itype: String,

    /// The tag that was looked up.
    pub tag: String,

    /// The image id that was returned.
    pub id: String,

    /// When the lookup happened.
    pub time: DateTime<Utc>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImageRecord {
    /// Creates a new INIT pull record for `pulltag` on `system`.
    ///
    /// Both `last_pull` and `last_heartbeat` start at `now` so a freshly created record is never
    /// mistaken for an abandoned one.
    pub fn new_pull(
        system: impl Into<String>,
        itype: impl Into<String>,
        pulltag: impl Into<String>,
        format: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key: None,
            id: None,
            system: system.into(),
            itype: itype.into(),
            pulltag: pulltag.into(),
            tag: BTreeSet::new(),
            format: format.into(),
            arch: DEFAULT_ARCH.to_string(),
            os: DEFAULT_OS.to_string(),
            location: None,
            remotetype: RemoteType::DockerV2.to_string(),
            ostcount: 0,
            replication: default_replication(),
            user_acl: BTreeSet::new(),
            group_acl: BTreeSet::new(),
            status: ImageStatus::Init,
            status_message: None,
            last_pull: Some(now),
            last_heartbeat: Some(now),
            expiration: None,
            env: Vec::new(),
            entry: None,
            workdir: None,
            labels: BTreeMap::new(),
            private: false,
            legacy_tag: false,
        }
    }

    /// Returns true if the record holds `tag`.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tag.contains(tag)
    }

    /// Returns the storage key or an error if the record was never stored.
    pub fn require_key(&self) -> crate::GatewayResult<i64> {
        self.key.ok_or_else(|| {
            crate::GatewayError::InvalidArgument(format!(
                "record for {} on {} has no storage key",
                self.pulltag, self.system
            ))
        })
    }
}

impl RecordUpdate {
    /// An update that only moves the record to `status`.
    pub fn status(status: ImageStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Makes the update conditional on the current status.
    pub fn when(mut self, status: ImageStatus) -> Self {
        self.when_status = Some(status);
        self
    }

    /// Checks the status change this update carries, if any.
    ///
    /// ## Errors
    ///
    /// Returns `InvalidArgument` for a status change without `when_status`, and
    /// `InvalidTransition` when the table forbids the move.
    pub fn check_transition(&self) -> GatewayResult<()> {
        let Some(to) = self.status else {
            return Ok(());
        };

        match self.when_status {
            Some(from) => from.transition_to(to).map(|_| ()),
            None => Err(GatewayError::InvalidArgument(format!(
                "status change to {to} needs a status guard"
            ))),
        }
    }
}

impl RecordQuery {
    /// Matches a single record by storage key.
    pub fn by_key(key: i64) -> Self {
        Self {
            key: Some(key),
            ..Default::default()
        }
    }

    /// Matches records on a system.
    pub fn on_system(system: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            ..Default::default()
        }
    }

    /// Restricts the query to an image type.
    pub fn itype(mut self, itype: impl Into<String>) -> Self {
        self.itype = Some(itype.into());
        self
    }

    /// Restricts the query to an image id.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Restricts the query to a pull tag.
    pub fn pulltag(mut self, pulltag: impl Into<String>) -> Self {
        self.pulltag = Some(pulltag.into());
        self
    }

    /// Restricts the query to records holding a tag.
    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.has_tag = Some(tag.into());
        self
    }

    /// Restricts the query to a set of statuses.
    pub fn status_in(mut self, statuses: impl IntoIterator<Item = ImageStatus>) -> Self {
        self.status_in = statuses.into_iter().collect();
        self
    }

    /// Excludes a set of statuses.
    pub fn status_not_in(mut self, statuses: impl IntoIterator<Item = ImageStatus>) -> Self {
        self.status_not_in = statuses.into_iter().collect();
        self
    }

    /// Returns true if `record` satisfies the query.
    pub fn matches(&self, record: &ImageRecord) -> bool {
        self.key.map_or(true, |key| record.key == Some(key))
            && self
                .id
                .as_ref()
                .map_or(true, |id| record.id.as_deref() == Some(id.as_str()))
            && self.system.as_ref().map_or(true, |s| &record.system == s)
            && self.itype.as_ref().map_or(true, |t| &record.itype == t)
            && self.pulltag.as_ref().map_or(true, |t| &record.pulltag == t)
            && (self.status_in.is_empty() || self.status_in.contains(&record.status))
            && !self.status_not_in.contains(&record.status)
            && self.has_tag.as_ref().map_or(true, |t| record.has_tag(t))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn default_replication() -> i64 {
    1
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_record_field_names() -> anyhow::Result<()> {
        let record = ImageRecord {
            key: Some(7),
            id: Some("abc".into()),
            system: "cluster".into(),
            itype: "docker".into(),
            pulltag: "ubuntu:latest".into(),
            tag: BTreeSet::from(["ubuntu:latest".to_string()]),
            format: "squashfs".into(),
            arch: "amd64".into(),
            os: "linux".into(),
            location: None,
            remotetype: "dockerv2".into(),
            ostcount: 0,
            replication: 1,
            user_acl: BTreeSet::from([1000]),
            group_acl: BTreeSet::new(),
            status: ImageStatus::Ready,
            status_message: None,
            last_pull: None,
            last_heartbeat: None,
            expiration: None,
            env: vec!["PATH=/bin".into()],
            entry: None,
            workdir: Some("/".into()),
            labels: BTreeMap::new(),
            private: true,
            legacy_tag: false,
        };

        let value = serde_json::to_value(&record)?;
        for key in [
            "_id", "id", "system", "itype", "pulltag", "tag", "userACL", "groupACL", "status",
            "status_message", "last_pull", "last_heartbeat", "expiration", "ENV", "ENTRY",
            "WORKDIR", "LABELS", "private",
        ] {
            assert!(value.get(key).is_some(), "missing field {key}");
        }
        assert_eq!(value["status"], "READY");

        Ok(())
    }
}
