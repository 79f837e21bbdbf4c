//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The directory under the user's home directory where imagegw keeps its state.
pub const IMAGEGW_HOME_DIR: &str = ".imagegw";

/// The environment variable that overrides the imagegw home directory.
pub const IMAGEGW_HOME_ENV_VAR: &str = "IMAGEGW_HOME";

/// The sub directory where downloaded layer blobs are cached.
pub const LAYER_CACHE_SUBDIR: &str = "cache";

/// The sub directory where layers are expanded and images are converted.
pub const EXPAND_SUBDIR: &str = "expand";

/// The filename of the image record database.
pub const IMAGES_DB_FILENAME: &str = "images.db";

/// The filename of the gateway configuration.
pub const CONFIG_FILENAME: &str = "imagegw.toml";

/// The extension of image metadata files.
pub const META_EXTENSION: &str = "meta";

/// The extension of files that are still being written.
pub const PARTIAL_EXTENSION: &str = "partial";

/// The extension of cached layer blobs.
pub const LAYER_EXTENSION: &str = "tar";
