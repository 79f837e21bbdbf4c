use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    backends::AuthIdentity, config::DEFAULT_IMAGE_TYPE, store::ImageRecord, GatewayError,
    GatewayResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The marker every session issued by [`ImageManager::new_session`] carries.
///
/// [`ImageManager::new_session`]: super::ImageManager::new_session
pub const SESSION_MAGIC: &str = "imagemngrmagic";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An authenticated caller, scoped to one system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// The user name.
    pub user: String,

    /// The primary group name.
    pub group: String,

    /// The numeric user id, when known.
    pub uid: Option<u32>,

    /// The numeric group id, when known.
    pub gid: Option<u32>,

    /// Registry credentials keyed by location, or `default`.
    pub tokens: BTreeMap<String, String>,

    /// The system the session was issued for.
    pub system: String,

    /// The session marker.
    pub magic: String,
}

/// Names an image on a system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSpec {
    /// The target system.
    pub system: String,

    /// The image type.
    pub itype: String,

    /// The tag, e.g. `ubuntu:latest`.
    pub tag: String,
}

/// The ACLs requested for a private image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclSpec {
    /// User ids allowed to see the image.
    pub user_acl: BTreeSet<u32>,

    /// Group ids allowed to see the image.
    pub group_acl: BTreeSet<u32>,
}

/// The result of an operation reserved for system admins.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminOutcome<T> {
    /// The caller is not an admin of the system.
    Denied,

    /// The caller is an admin and the operation ran.
    Granted(T),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Session {
    /// Builds a session for `system` from an authenticated identity.
    pub fn from_identity(identity: AuthIdentity, system: impl Into<String>) -> Self {
        Self {
            user: identity.user,
            group: identity.group,
            uid: identity.uid,
            gid: identity.gid,
            tokens: identity.tokens,
            system: system.into(),
            magic: SESSION_MAGIC.to_string(),
        }
    }

    /// Checks that the session is well formed and was issued for `system`.
    ///
    /// ## Errors
    ///
    /// Returns `InvalidSession` otherwise.
    pub fn validate(&self, system: &str) -> GatewayResult<()> {
        if self.magic != SESSION_MAGIC {
            return Err(GatewayError::InvalidSession(
                "session marker is missing".to_string(),
            ));
        }

        if self.user.is_empty() {
            return Err(GatewayError::InvalidSession(
                "session has no user".to_string(),
            ));
        }

        if self.system != system {
            return Err(GatewayError::InvalidSession(format!(
                "session was issued for {}, not {system}",
                self.system
            )));
        }

        Ok(())
    }
}

impl ImageSpec {
    /// Creates a spec.
    pub fn new(
        system: impl Into<String>,
        itype: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            system: system.into(),
            itype: itype.into(),
            tag: tag.into(),
        }
    }

    /// Creates a spec for a docker image.
    pub fn docker(system: impl Into<String>, tag: impl Into<String>) -> Self {
        Self::new(system, DEFAULT_IMAGE_TYPE, tag)
    }
}

impl AclSpec {
    /// Creates ACLs from user and group ids.
    pub fn new(
        user_acl: impl IntoIterator<Item = u32>,
        group_acl: impl IntoIterator<Item = u32>,
    ) -> Self {
        Self {
            user_acl: user_acl.into_iter().collect(),
            group_acl: group_acl.into_iter().collect(),
        }
    }

    /// Returns true if no ids were requested.
    pub fn is_empty(&self) -> bool {
        self.user_acl.is_empty() && self.group_acl.is_empty()
    }

    /// Returns true if these ACLs differ from the ones stored on `record`.
    pub fn differs_from(&self, record: &ImageRecord) -> bool {
        self.user_acl != record.user_acl || self.group_acl != record.group_acl
    }
}

impl<T> AdminOutcome<T> {
    /// Returns true if the caller was denied.
    pub fn is_denied(&self) -> bool {
        matches!(self, AdminOutcome::Denied)
    }

    /// Returns the value of a granted operation.
    pub fn granted(self) -> Option<T> {
        match self {
            AdminOutcome::Granted(value) => Some(value),
            AdminOutcome::Denied => None,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
