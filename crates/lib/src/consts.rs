//! Crate-wide constants.

/// Application name, used for the local working directory and lock metadata.
pub const APP_NAME: &str = "shelver";

/// Directory created under the base directory for tmp, cache and log files.
pub const LOCAL_DIR: &str = ".shelver";

/// Default registry file name, looked up relative to the current directory.
pub const DEFAULT_REGISTRY_FILE: &str = "shelver.yml";

/// File holding the artifacts produced by previous runs.
pub const ARTIFACTS_FILE: &str = "artifacts.json";

/// Reserved top-level registry key holding the defaults layer.
pub const DEFAULTS_KEY: &str = "defaults";

/// Reserved top-level registry key holding named metadata blocks.
pub const BLOCKS_KEY: &str = "blocks";

/// Length of the truncated content hash used in plain-directory archive names.
pub const ARCHIVE_HASH_PREFIX_LEN: usize = 20;
