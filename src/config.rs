use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub watcher: WatcherConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// How long `start()` waits for the first value from a freshly started
    /// watcher before marking it timed-out (the watcher stays active).
    pub sync_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Root path under which audit sinks are expected to file entries.
    pub root_path: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            watcher: WatcherConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: 750,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            root_path: "/auditing".to_string(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from defaults, an optional `pathmodel` config file
    /// and `PATHMODEL_`-prefixed environment variables
    pub fn load() -> anyhow::Result<Self> {
        let mut config = config::Config::builder();

        // Add default configuration
        config = config.add_source(config::Config::try_from(&CoreConfig::default())?);

        // Add config file if it exists
        config = config.add_source(config::File::with_name("pathmodel").required(false));

        // Add environment variables with prefix "PATHMODEL_"
        config = config.add_source(
            config::Environment::with_prefix("PATHMODEL")
                .separator("_")
                .prefix_separator("_"),
        );

        let config = config.build()?;
        let core_config: CoreConfig = config.try_deserialize()?;

        Ok(core_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = CoreConfig::default();
        assert_eq!(config.watcher.sync_timeout_ms, 750);
        assert_eq!(config.audit.root_path, "/auditing");
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let config = CoreConfig::load().unwrap();
        assert_eq!(config.watcher.sync_timeout_ms, 750);
    }
}
