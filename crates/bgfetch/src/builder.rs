//! # Builder for CoordinatorConfig
//!
//! Fluent construction of [`CoordinatorConfig`] values.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use bgfetch_engine::CoordinatorConfig;
//!
//! let config = CoordinatorConfig::builder()
//!     .with_cache_dir("/var/cache/bgfetch")
//!     .with_purge_on_startup(false)
//!     .with_clock_drift_threshold(Duration::from_secs(300))
//!     .build();
//!
//! assert!(!config.purge_on_startup);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::CoordinatorConfig;

/// Builder for creating CoordinatorConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: CoordinatorConfig::default(),
        }
    }

    /// Set the cache directory
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = Some(dir.into());
        self
    }

    /// Enable or disable the startup purge
    pub fn with_purge_on_startup(mut self, purge: bool) -> Self {
        self.config.purge_on_startup = purge;
        self
    }

    /// Enable or disable the idle session reset
    pub fn with_reset_session_when_idle(mut self, reset: bool) -> Self {
        self.config.reset_session_when_idle = reset;
        self
    }

    /// Set how often the clock watcher samples the wall clock
    pub fn with_clock_check_interval(mut self, interval: Duration) -> Self {
        self.config.clock_check_interval = interval;
        self
    }

    /// Set the drift treated as a significant time change
    pub fn with_clock_drift_threshold(mut self, threshold: Duration) -> Self {
        self.config.clock_drift_threshold = threshold;
        self
    }

    /// Build the CoordinatorConfig instance
    pub fn build(self) -> CoordinatorConfig {
        self.config
    }
}

impl Default for CoordinatorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = CoordinatorConfigBuilder::new().build();
        assert!(config.cache_dir.is_none());
        assert!(config.purge_on_startup);
        assert!(config.reset_session_when_idle);
        assert_eq!(config.clock_check_interval, Duration::from_secs(30));
        assert_eq!(config.clock_drift_threshold, Duration::from_secs(120));
        assert_eq!(
            config.resolved_cache_dir(),
            std::env::temp_dir().join("bgfetch-cache")
        );
    }

    #[test]
    fn test_builder_customization() {
        let config = CoordinatorConfigBuilder::new()
            .with_cache_dir("/tmp/custom")
            .with_purge_on_startup(false)
            .with_reset_session_when_idle(false)
            .with_clock_check_interval(Duration::from_secs(5))
            .with_clock_drift_threshold(Duration::from_secs(10))
            .build();

        assert_eq!(config.resolved_cache_dir(), PathBuf::from("/tmp/custom"));
        assert!(!config.purge_on_startup);
        assert!(!config.reset_session_when_idle);
        assert_eq!(config.clock_check_interval, Duration::from_secs(5));
        assert_eq!(config.clock_drift_threshold, Duration::from_secs(10));
    }
}
