use std::{path::PathBuf, sync::LazyLock};

use crate::utils::IMAGEGW_HOME_DIR;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default number of seconds after which a READY or FAILURE record may be pulled again.
pub const DEFAULT_PULL_UPDATE_TIMEOUT: u64 = 300;

/// The default number of seconds without a heartbeat after which a worker is declared dead.
pub const DEFAULT_STALE_WORKER_THRESHOLD: u64 = 3600;

/// The factor applied to the pull update timeout when no explicit pull timeout is configured.
pub const PULL_TIMEOUT_FACTOR: u64 = 10;

/// The default image expiration timeout in `days:hours:minutes:seconds` form.
pub const DEFAULT_IMAGE_EXPIRATION_TIMEOUT: &str = "90:00:00:00";

/// The default image format produced by the conversion step.
pub const DEFAULT_IMAGE_FORMAT: &str = "squashfs";

/// The default registry location used when a pull tag names none.
pub const DEFAULT_IMAGE_LOCATION: &str = "index.docker.io";

/// The url of the default registry location.
pub const DEFAULT_IMAGE_LOCATION_URL: &str = "https://registry-1.docker.io";

/// The default number of pull workers per platform partition.
pub const DEFAULT_WORKERS_PER_PLATFORM: usize = 2;

/// The default authentication backend.
pub const DEFAULT_AUTHENTICATION: &str = "mock";

/// The default image type.
pub const DEFAULT_IMAGE_TYPE: &str = "docker";

/// The default architecture recorded for new pull records.
pub const DEFAULT_ARCH: &str = "amd64";

/// The default operating system recorded for new pull records.
pub const DEFAULT_OS: &str = "linux";

/// The path where all imagegw global data is stored.
pub static DEFAULT_IMAGEGW_HOME: LazyLock<PathBuf> = LazyLock::new(|| {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(IMAGEGW_HOME_DIR)
});
