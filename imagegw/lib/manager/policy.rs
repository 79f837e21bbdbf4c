use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    config::GatewayConfig,
    store::{ImageRecord, ImageStatus},
};

use super::Session;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// When an existing record may be pulled again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullPolicy {
    /// How long a READY or FAILURE record is considered fresh after its last pull.
    pub pull_update_timeout: TimeDelta,

    /// How long an in-flight record may go without a heartbeat before its worker is presumed dead.
    pub stale_worker_threshold: TimeDelta,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PullPolicy {
    /// Takes both timeouts from the gateway configuration.
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            pull_update_timeout: config.pull_update_delta(),
            stale_worker_threshold: config.stale_worker_delta(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns true if a pull request for `record` should start a new pull.
///
/// An in-flight record that has never sent a heartbeat is judged by its `last_pull`.
pub fn is_pullable(record: Option<&ImageRecord>, now: DateTime<Utc>, policy: &PullPolicy) -> bool {
    let Some(record) = record else {
        return true;
    };

    if record.status == ImageStatus::Expired {
        return true;
    }

    let Some(last_pull) = record.last_pull else {
        return true;
    };

    match record.status {
        ImageStatus::Ready | ImageStatus::Failure => now > last_pull + policy.pull_update_timeout,
        status if status.is_in_flight() => {
            let heartbeat = record.last_heartbeat.unwrap_or(last_pull);
            now - heartbeat > policy.stale_worker_threshold
        }
        _ => false,
    }
}

/// Returns true if `session` may see `record`.
///
/// Public images and private images without ACLs are visible to everyone. Otherwise the caller's
/// uid must be in the user ACL or their gid in the group ACL.
pub fn is_readable(session: &Session, record: &ImageRecord) -> bool {
    if !record.private {
        return true;
    }

    if record.user_acl.is_empty() && record.group_acl.is_empty() {
        return true;
    }

    session.uid.is_some_and(|uid| record.user_acl.contains(&uid))
        || session.gid.is_some_and(|gid| record.group_acl.contains(&gid))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
