use std::{fmt, path::PathBuf, str::FromStr};

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::GatewayError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How the gateway reaches the image directory of a target system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    /// The image directory is mounted on the gateway host.
    #[default]
    Local,

    /// The image directory is reached through scp and ssh.
    Remote,
}

/// The local image directory of a target system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct LocalAccess {
    /// Directory where images and metadata files are placed.
    #[serde(rename = "imageDir")]
    image_dir: PathBuf,
}

/// The ssh coordinates of a target system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SshAccess {
    /// Remote user name.
    username: String,

    /// Private key passed with `-i`.
    #[serde(default)]
    #[builder(default)]
    key: Option<PathBuf>,

    /// Directory on the remote host where images and metadata files are placed.
    #[serde(rename = "imageDir")]
    image_dir: PathBuf,
}

/// A target system images are staged on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct PlatformConfig {
    /// User names allowed to expire images on this system.
    #[serde(default)]
    #[builder(default)]
    admins: Vec<String>,

    /// How the image directory is reached.
    #[serde(default)]
    #[builder(default)]
    accesstype: AccessType,

    /// Host names of the system, the first one is used for remote transfers.
    #[serde(default)]
    #[builder(default)]
    host: Vec<String>,

    /// Local access settings.
    #[serde(default)]
    #[builder(default)]
    local: Option<LocalAccess>,

    /// Remote access settings.
    #[serde(default)]
    #[builder(default)]
    ssh: Option<SshAccess>,

    /// Extra options for `cp`.
    #[serde(default, rename = "cpCmdOptions")]
    #[builder(default)]
    cp_cmd_options: Vec<String>,

    /// Extra options for `scp`.
    #[serde(default, rename = "scpCmdOptions")]
    #[builder(default)]
    scp_cmd_options: Vec<String>,

    /// Extra options for `ssh`.
    #[serde(default, rename = "sshCmdOptions")]
    #[builder(default)]
    ssh_cmd_options: Vec<String>,

    /// Whether squashfs images should be built without extended attributes.
    #[serde(default, rename = "noXattrs")]
    #[builder(default)]
    no_xattrs: bool,
}

/// The kind of remote a location points to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RemoteType {
    /// A Docker Registry V2 endpoint.
    #[default]
    #[serde(rename = "dockerv2")]
    DockerV2,
}

/// How registry credentials are presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Bearer tokens from the realm named by the registry challenge.
    #[default]
    Token,

    /// HTTP basic authentication on every request.
    Basic,
}

/// A registry location images can be pulled from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct LocationConfig {
    /// The kind of remote, only `dockerv2` is supported.
    #[serde(default = "default_remotetype_string")]
    #[builder(default = default_remotetype_string())]
    remotetype: String,

    /// Base url of the registry. Defaults to `https://<location>`.
    #[serde(default)]
    #[builder(default)]
    url: Option<String>,

    /// CA bundle used to verify the registry certificate.
    #[serde(default)]
    #[builder(default)]
    sslcacert: Option<PathBuf>,

    /// How credentials are presented.
    #[serde(default, rename = "authMethod")]
    #[builder(default)]
    auth_method: AuthMethod,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PlatformConfig {
    /// Returns true if `user` is listed as an admin of this system.
    pub fn is_admin(&self, user: &str) -> bool {
        self.admins.iter().any(|admin| admin == user)
    }
}

impl LocationConfig {
    /// Returns the parsed remote type.
    ///
    /// ## Errors
    ///
    /// Returns a `Configuration` error for remote types other than `dockerv2`.
    pub fn remote_type(&self) -> Result<RemoteType, GatewayError> {
        self.remotetype.parse()
    }

    /// Returns the base url of the location named `name`.
    pub fn base_url(&self, name: &str) -> String {
        self.url
            .clone()
            .unwrap_or_else(|| format!("https://{name}"))
            .trim_end_matches('/')
            .to_string()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn default_remotetype_string() -> String {
    RemoteType::DockerV2.to_string()
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for RemoteType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dockerv2" => Ok(RemoteType::DockerV2),
            other => Err(GatewayError::Configuration(format!(
                "unsupported remote type: {other}"
            ))),
        }
    }
}

impl fmt::Display for RemoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteType::DockerV2 => write!(f, "dockerv2"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
