use std::path::PathBuf;

/// Engine configuration loaded from environment variables.
pub struct Config {
    pub data_dir: PathBuf,
    pub tick_interval_secs: u64,
    pub environment: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_raw_values(
            std::env::var("VERDANT_DATA_DIR").ok().as_deref(),
            std::env::var("VERDANT_TICK_SECS").ok().as_deref(),
            std::env::var("ENVIRONMENT").ok().as_deref(),
        )
    }

    /// Build a Config from raw string values (as they would come from env
    /// vars). Used directly in tests to avoid mutating process-global
    /// environment.
    pub fn from_raw_values(
        data_dir: Option<&str>,
        tick_interval_secs: Option<&str>,
        environment: Option<&str>,
    ) -> Self {
        let data_dir = data_dir
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".verdant")
            });

        let tick_interval_secs = tick_interval_secs
            .and_then(|v| v.parse().ok())
            .filter(|&v| v > 0)
            .unwrap_or(60);

        let environment = environment
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "local".to_string());

        Config {
            data_dir,
            tick_interval_secs,
            environment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_tick_interval_uses_default() {
        let config = Config::from_raw_values(None, Some("not-a-number"), None);
        assert_eq!(config.tick_interval_secs, 60);
    }

    #[test]
    fn zero_tick_interval_uses_default() {
        let config = Config::from_raw_values(None, Some("0"), None);
        assert_eq!(config.tick_interval_secs, 60);
    }

    #[test]
    fn valid_tick_interval() {
        let config = Config::from_raw_values(None, Some("5"), None);
        assert_eq!(config.tick_interval_secs, 5);
    }

    #[test]
    fn explicit_data_dir_wins() {
        let config = Config::from_raw_values(Some("/tmp/verdant-test"), None, None);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/verdant-test"));
    }

    #[test]
    fn default_environment_is_local() {
        let config = Config::from_raw_values(None, None, None);
        assert_eq!(config.environment, "local");
    }

    #[test]
    fn empty_environment_is_local() {
        let config = Config::from_raw_values(None, None, Some(""));
        assert_eq!(config.environment, "local");
    }
}
