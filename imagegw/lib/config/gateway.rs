use std::{collections::HashMap, path::{Path, PathBuf}};

use chrono::TimeDelta;
use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    config::{
        ExpirationTimeout, LocationConfig, PlatformConfig, DEFAULT_AUTHENTICATION,
        DEFAULT_IMAGE_FORMAT, DEFAULT_IMAGE_LOCATION, DEFAULT_IMAGE_LOCATION_URL,
        DEFAULT_PULL_UPDATE_TIMEOUT, DEFAULT_STALE_WORKER_THRESHOLD,
        DEFAULT_WORKERS_PER_PLATFORM, PULL_TIMEOUT_FACTOR,
    },
    utils::{self, EXPAND_SUBDIR, IMAGES_DB_FILENAME, LAYER_CACHE_SUBDIR},
    GatewayError, GatewayResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The gateway configuration.
///
/// Keys keep the PascalCase names used by existing deployments, so a configuration file looks
/// like:
///
/// ```toml
/// DefaultImageLocation = "index.docker.io"
/// PullUpdateTimeout = 300
///
/// [Platforms.cluster]
/// admins = ["root"]
/// accesstype = "local"
/// local = { imageDir = "/images" }
///
/// [Locations."index.docker.io"]
/// url = "https://registry-1.docker.io"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, Getters)]
#[serde(rename_all = "PascalCase")]
#[getset(get = "pub with_prefix")]
pub struct GatewayConfig {
    /// The target systems images are staged on.
    #[serde(default)]
    #[builder(default)]
    platforms: HashMap<String, PlatformConfig>,

    /// The registry locations images are pulled from.
    #[serde(default = "default_locations")]
    #[builder(default = default_locations())]
    locations: HashMap<String, LocationConfig>,

    /// The location used when a pull tag does not name one.
    #[serde(default = "default_location_name")]
    #[builder(default = default_location_name())]
    default_image_location: String,

    /// The image format produced for new pull records.
    #[serde(default = "default_format_name")]
    #[builder(default = default_format_name())]
    default_image_format: String,

    /// Seconds after which a READY or FAILURE record may be pulled again.
    #[serde(default = "default_pull_update_timeout")]
    #[builder(default = DEFAULT_PULL_UPDATE_TIMEOUT)]
    pull_update_timeout: u64,

    /// Seconds without a heartbeat after which an in-flight pull is reclaimed.
    #[serde(default = "default_stale_worker_threshold")]
    #[builder(default = DEFAULT_STALE_WORKER_THRESHOLD)]
    stale_worker_threshold: u64,

    /// Seconds after which autoexpire purges records that never became READY.
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    #[getset(skip)]
    pull_timeout: Option<u64>,

    /// How long a READY image stays alive after its last access.
    #[serde(default)]
    #[builder(default)]
    image_expiration_timeout: ExpirationTimeout,

    /// Where downloaded layer blobs are cached.
    #[serde(default = "default_cache_directory")]
    #[builder(default = default_cache_directory())]
    cache_directory: PathBuf,

    /// Where layers are expanded and images converted.
    #[serde(default = "default_expand_directory")]
    #[builder(default = default_expand_directory())]
    expand_directory: PathBuf,

    /// Path of the image record database.
    #[serde(default = "default_database")]
    #[builder(default = default_database())]
    database: PathBuf,

    /// The authentication backend, `mock` or `munge`.
    #[serde(default = "default_authentication")]
    #[builder(default = default_authentication())]
    authentication: String,

    /// Number of concurrent pull workers per platform.
    #[serde(default = "default_workers_per_platform")]
    #[builder(default = DEFAULT_WORKERS_PER_PLATFORM)]
    workers_per_platform: usize,

    /// Directory for rolling log files. Logs go to stderr only when unset.
    #[serde(default)]
    #[builder(default)]
    log_directory: Option<PathBuf>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl GatewayConfig {
    /// Loads a configuration file, TOML unless the extension is `.json`.
    ///
    /// ## Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or fails [`validate`].
    ///
    /// [`validate`]: GatewayConfig::validate
    pub async fn load(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            _ => toml::from_str(&contents)?,
        };

        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded gateway configuration");

        Ok(config)
    }

    /// Checks that the configuration can drive pulls.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.platforms.is_empty() {
            return Err(GatewayError::Configuration(
                "no platforms are configured".to_string(),
            ));
        }

        if !self.locations.contains_key(&self.default_image_location) {
            return Err(GatewayError::Configuration(format!(
                "default image location {} is not a configured location",
                self.default_image_location
            )));
        }

        if self.pull_update_timeout == 0 || self.stale_worker_threshold == 0 {
            return Err(GatewayError::Configuration(
                "pull timeouts must be greater than zero".to_string(),
            ));
        }

        for (name, location) in &self.locations {
            location.remote_type().map_err(|e| {
                GatewayError::Configuration(format!("location {name}: {e}"))
            })?;
        }

        Ok(())
    }

    /// Returns the configuration of a target system.
    ///
    /// ## Errors
    ///
    /// Returns a `Configuration` error for an unknown system.
    pub fn platform(&self, system: &str) -> GatewayResult<&PlatformConfig> {
        self.platforms
            .get(system)
            .ok_or_else(|| GatewayError::Configuration(format!("unknown platform: {system}")))
    }

    /// Returns the configuration of a registry location.
    ///
    /// ## Errors
    ///
    /// Returns a `Configuration` error for an unknown location.
    pub fn location(&self, name: &str) -> GatewayResult<&LocationConfig> {
        self.locations
            .get(name)
            .ok_or_else(|| GatewayError::Configuration(format!("unknown location: {name}")))
    }

    /// Returns true if `system` names a configured platform.
    pub fn is_system(&self, system: &str) -> bool {
        self.platforms.contains_key(system)
    }

    /// Returns the pull update timeout.
    pub fn pull_update_delta(&self) -> TimeDelta {
        TimeDelta::seconds(self.pull_update_timeout as i64)
    }

    /// Returns the stale worker threshold.
    pub fn stale_worker_delta(&self) -> TimeDelta {
        TimeDelta::seconds(self.stale_worker_threshold as i64)
    }

    /// Returns the timeout after which records that never became READY are purged.
    pub fn pull_timeout(&self) -> TimeDelta {
        let secs = self
            .pull_timeout
            .unwrap_or(self.pull_update_timeout * PULL_TIMEOUT_FACTOR);
        TimeDelta::seconds(secs as i64)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn default_locations() -> HashMap<String, LocationConfig> {
    let location = LocationConfig::builder()
        .url(Some(DEFAULT_IMAGE_LOCATION_URL.to_string()))
        .build();
    HashMap::from([(DEFAULT_IMAGE_LOCATION.to_string(), location)])
}

fn default_location_name() -> String {
    DEFAULT_IMAGE_LOCATION.to_string()
}

fn default_format_name() -> String {
    DEFAULT_IMAGE_FORMAT.to_string()
}

fn default_pull_update_timeout() -> u64 {
    DEFAULT_PULL_UPDATE_TIMEOUT
}

fn default_stale_worker_threshold() -> u64 {
    DEFAULT_STALE_WORKER_THRESHOLD
}

fn default_cache_directory() -> PathBuf {
    utils::get_imagegw_home_path().join(LAYER_CACHE_SUBDIR)
}

fn default_expand_directory() -> PathBuf {
    utils::get_imagegw_home_path().join(EXPAND_SUBDIR)
}

fn default_database() -> PathBuf {
    utils::get_imagegw_home_path().join(IMAGES_DB_FILENAME)
}

fn default_authentication() -> String {
    DEFAULT_AUTHENTICATION.to_string()
}

fn default_workers_per_platform() -> usize {
    DEFAULT_WORKERS_PER_PLATFORM
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
