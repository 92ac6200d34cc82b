use std::path::PathBuf;
use std::time::Duration;

use crate::builder::CoordinatorConfigBuilder;

const DEFAULT_CACHE_DIR_NAME: &str = "bgfetch-cache";

/// Configurable options for the download coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Directory holding cached files. If None, a directory under the system
    /// temp dir is used.
    pub cache_dir: Option<PathBuf>,

    /// Purge the cache directory when the coordinator starts
    pub purge_on_startup: bool,

    /// Ask the engine to reset its session once no transfer is active
    pub reset_session_when_idle: bool,

    /// How often the clock watcher samples the wall clock
    pub clock_check_interval: Duration,

    /// Wall-clock drift that counts as a significant time change
    pub clock_drift_threshold: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            purge_on_startup: true,
            reset_session_when_idle: true,
            clock_check_interval: Duration::from_secs(30),
            clock_drift_threshold: Duration::from_secs(120),
        }
    }
}

impl CoordinatorConfig {
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::new()
    }

    /// The cache directory in effect, falling back to the system temp dir
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_CACHE_DIR_NAME))
    }
}
