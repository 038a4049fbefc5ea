use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::StreamError;

/// How watchers are shared between channels watching the same key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchStrategy {
    /// One watcher per channel; every channel gets its own INITIAL
    #[default]
    Dedicated,
    /// One watcher per key; late joiners are served from a snapshot
    Shared,
}

impl fmt::Display for WatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dedicated => f.write_str("dedicated"),
            Self::Shared => f.write_str("shared"),
        }
    }
}

impl FromStr for WatchStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dedicated" | "per-client" => Ok(Self::Dedicated),
            "shared" => Ok(Self::Shared),
            other => Err(format!("unknown watch strategy '{}'", other)),
        }
    }
}

/// Timing and sizing knobs for the streaming subsystem
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    /// Buffered frames per client before it is considered dead
    pub channel_capacity: usize,
    /// Idle time before a heartbeat frame is sent
    pub heartbeat: Duration,
    /// Server-side timeout of one watch call
    pub watch_timeout: Duration,
    /// Wait after a failed list or watch before resyncing
    pub retry_backoff: Duration,
    /// Deadline for one list, get or log poll cycle
    pub request_timeout: Duration,
    pub log_poll_interval: Duration,
    /// Poll period while no pods back the requested components
    pub log_idle_interval: Duration,
    pub log_error_backoff: Duration,
    /// Lines read from the end of each container log; `None` reads all of it
    pub log_tail_lines: Option<i64>,
    pub max_log_components: usize,
    pub log_container: String,
    pub strategy: WatchStrategy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 500,
            heartbeat: Duration::from_secs(30),
            watch_timeout: Duration::from_secs(60),
            retry_backoff: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            log_poll_interval: Duration::from_secs(3),
            log_idle_interval: Duration::from_secs(5),
            log_error_backoff: Duration::from_secs(5),
            log_tail_lines: Some(1000),
            max_log_components: 10,
            log_container: "kserve-container".to_string(),
            strategy: WatchStrategy::Dedicated,
        }
    }
}

impl StreamConfig {
    /// Reject component lists the log poller should never be asked to serve
    pub fn check_components(&self, components: &[String]) -> Result<(), StreamError> {
        if components.len() > self.max_log_components {
            return Err(StreamError::TooManyComponents {
                requested: components.len(),
                limit: self.max_log_components,
            });
        }
        if components.iter().any(|c| c.trim().is_empty()) {
            return Err(StreamError::EmptyComponent);
        }
        Ok(())
    }

    pub fn watch_timeout_secs(&self) -> u32 {
        self.watch_timeout.as_secs().clamp(1, u32::MAX as u64) as u32
    }

    /// Client-side bound on one watch call, for servers that never close it
    pub fn watch_deadline(&self) -> Duration {
        Duration::from_secs(self.watch_timeout_secs().into()) + self.request_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("component-{}", i)).collect()
    }

    #[test]
    fn test_component_limit_is_inclusive() {
        let config = StreamConfig::default();
        assert!(config.check_components(&names(10)).is_ok());

        let err = config.check_components(&names(11)).unwrap_err();
        assert_eq!(
            err,
            StreamError::TooManyComponents {
                requested: 11,
                limit: 10
            }
        );
        assert_eq!(err.to_string(), "Too many components requested (max 10)");
    }

    #[test]
    fn test_blank_component_rejected() {
        let config = StreamConfig::default();
        let components = vec!["predictor".to_string(), " ".to_string()];
        assert_eq!(
            config.check_components(&components),
            Err(StreamError::EmptyComponent)
        );
    }

    #[test]
    fn test_watch_deadline_outlasts_server_timeout() {
        let config = StreamConfig::default();
        assert_eq!(config.watch_deadline(), Duration::from_secs(70));

        let config = StreamConfig {
            watch_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(config.watch_deadline(), Duration::from_secs(11));
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("shared".parse::<WatchStrategy>(), Ok(WatchStrategy::Shared));
        assert_eq!("Dedicated".parse::<WatchStrategy>(), Ok(WatchStrategy::Dedicated));
        assert!("fanout".parse::<WatchStrategy>().is_err());
    }
}
