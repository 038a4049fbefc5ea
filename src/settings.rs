//! Service settings: TOML file, then command-line and environment overrides

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use modelwatch_stream::{StreamConfig, WatchStrategy};

/// Upper bound the API server accepts for a watch call's timeout
const MAX_WATCH_TIMEOUT_SECS: u64 = 290;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub listen: SocketAddr,
    /// Path prefix every route is mounted under
    pub prefix: String,
    /// Kubeconfig context; in-cluster or current context when unset
    pub context: Option<String>,
    pub isvc_version: String,
    pub channel_capacity: usize,
    pub heartbeat_secs: u64,
    pub watch_timeout_secs: u64,
    pub retry_backoff_secs: u64,
    /// Deadline for one list, get or log poll cycle
    pub request_timeout_secs: u64,
    pub log_poll_interval_secs: u64,
    /// Poll period while no pods back the requested components
    pub log_idle_secs: u64,
    pub log_error_backoff_secs: u64,
    /// Lines read from the end of each container log; 0 reads all of it
    pub log_tail_lines: i64,
    pub max_log_components: usize,
    pub log_container: String,
    pub strategy: WatchStrategy,
    /// Header carrying the authenticated user, counted by the size guard
    pub userid_header: String,
    pub jwt_warning_threshold: usize,
    pub jwt_error_threshold: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 5000)),
            prefix: "/".to_string(),
            context: None,
            isvc_version: "v1beta1".to_string(),
            channel_capacity: 500,
            heartbeat_secs: 30,
            watch_timeout_secs: 60,
            retry_backoff_secs: 5,
            request_timeout_secs: 10,
            log_poll_interval_secs: 3,
            log_idle_secs: 5,
            log_error_backoff_secs: 5,
            log_tail_lines: 1000,
            max_log_components: 10,
            log_container: "kserve-container".to_string(),
            strategy: WatchStrategy::Dedicated,
            userid_header: "kubeflow-userid".to_string(),
            jwt_warning_threshold: 16_000,
            jwt_error_threshold: 28_000,
        }
    }
}

/// Flags and environment variables that win over the settings file
#[derive(clap::Args, Debug, Default, Clone)]
pub struct Overrides {
    /// Address to listen on
    #[arg(long, env = "MODELWATCH_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Path prefix for all routes
    #[arg(long, env = "APP_PREFIX")]
    pub prefix: Option<String>,

    /// Kubeconfig context to use
    #[arg(long, env = "MODELWATCH_CONTEXT")]
    pub context: Option<String>,

    /// InferenceService API version (v1beta1 or v1alpha2)
    #[arg(long, env = "ISVC_VERSION")]
    pub isvc_version: Option<String>,

    /// Watcher sharing strategy (dedicated or shared)
    #[arg(long, env = "MODELWATCH_STRATEGY")]
    pub strategy: Option<WatchStrategy>,

    /// Buffered messages per client before it is dropped
    #[arg(long, env = "MODELWATCH_CHANNEL_CAPACITY")]
    pub channel_capacity: Option<usize>,

    /// Seconds of idleness before a heartbeat is sent
    #[arg(long, env = "MODELWATCH_HEARTBEAT_SECS")]
    pub heartbeat_secs: Option<u64>,

    /// Maximum components per log stream request
    #[arg(long, env = "MODELWATCH_MAX_LOG_COMPONENTS")]
    pub max_log_components: Option<usize>,
}

impl Settings {
    /// Read settings from `path`, or start from the defaults
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&text)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply(mut self, overrides: Overrides) -> Self {
        if let Some(listen) = overrides.listen {
            self.listen = listen;
        }
        if let Some(prefix) = overrides.prefix {
            self.prefix = prefix;
        }
        if overrides.context.is_some() {
            self.context = overrides.context;
        }
        if let Some(version) = overrides.isvc_version {
            self.isvc_version = version;
        }
        if let Some(strategy) = overrides.strategy {
            self.strategy = strategy;
        }
        if let Some(capacity) = overrides.channel_capacity {
            self.channel_capacity = capacity;
        }
        if let Some(secs) = overrides.heartbeat_secs {
            self.heartbeat_secs = secs;
        }
        if let Some(max) = overrides.max_log_components {
            self.max_log_components = max;
        }
        self
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |msg: &str| Err(SettingsError::Invalid(msg.to_string()));

        if self.channel_capacity == 0 {
            return invalid("channel_capacity must be at least 1");
        }
        if self.heartbeat_secs == 0 {
            return invalid("heartbeat_secs must be at least 1");
        }
        if self.retry_backoff_secs == 0
            || self.request_timeout_secs == 0
            || self.log_poll_interval_secs == 0
            || self.log_idle_secs == 0
            || self.log_error_backoff_secs == 0
        {
            return invalid("timeouts and poll intervals must be at least 1 second");
        }
        if self.log_tail_lines < 0 {
            return invalid("log_tail_lines must not be negative");
        }
        if self.max_log_components == 0 {
            return invalid("max_log_components must be at least 1");
        }
        if self.log_container.is_empty() {
            return invalid("log_container must not be empty");
        }
        if self.jwt_warning_threshold >= self.jwt_error_threshold {
            return invalid("jwt_warning_threshold must be below jwt_error_threshold");
        }
        Ok(())
    }

    /// Non-empty path segments of the route prefix
    pub fn prefix_segments(&self) -> Vec<String> {
        self.prefix
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            channel_capacity: self.channel_capacity,
            heartbeat: Duration::from_secs(self.heartbeat_secs),
            watch_timeout: Duration::from_secs(
                self.watch_timeout_secs.clamp(1, MAX_WATCH_TIMEOUT_SECS),
            ),
            retry_backoff: Duration::from_secs(self.retry_backoff_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            log_poll_interval: Duration::from_secs(self.log_poll_interval_secs),
            log_idle_interval: Duration::from_secs(self.log_idle_secs),
            log_error_backoff: Duration::from_secs(self.log_error_backoff_secs),
            log_tail_lines: (self.log_tail_lines > 0).then_some(self.log_tail_lines),
            max_log_components: self.max_log_components,
            log_container: self.log_container.clone(),
            strategy: self.strategy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.stream_config(), StreamConfig::default());
        assert!(settings.prefix_segments().is_empty());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings = Settings::from_toml(
            r#"
            prefix = "/kserve-endpoints/"
            strategy = "shared"
            watch_timeout_secs = 1000
            "#,
        )
        .unwrap();

        assert_eq!(settings.strategy, WatchStrategy::Shared);
        assert_eq!(settings.channel_capacity, 500);
        assert_eq!(settings.prefix_segments(), vec!["kserve-endpoints".to_string()]);
        assert_eq!(settings.stream_config().watch_timeout, Duration::from_secs(290));
    }

    #[test]
    fn test_zero_tail_reads_whole_log() {
        let settings = Settings::from_toml("log_tail_lines = 0").unwrap();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.stream_config().log_tail_lines, None);

        let settings = Settings::from_toml("log_tail_lines = -5").unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(matches!(
            Settings::from_toml("chanel_capacity = 5"),
            Err(SettingsError::Parse(_))
        ));
    }

    #[test]
    fn test_overrides_win() {
        let settings = Settings::from_toml("max_log_components = 4")
            .unwrap()
            .apply(Overrides {
                max_log_components: Some(12),
                context: Some("staging".to_string()),
                ..Default::default()
            });
        assert_eq!(settings.max_log_components, 12);
        assert_eq!(settings.context.as_deref(), Some("staging"));
    }

    #[test]
    fn test_invalid_thresholds_fail() {
        let settings = Settings {
            jwt_warning_threshold: 30_000,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(SettingsError::Invalid(_))));

        let settings = Settings {
            channel_capacity: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
