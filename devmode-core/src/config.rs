// Timing policy and process settings
//
// Every retry count and interval in the attach flow lives here so it can be
// tuned from a JSON file instead of being baked into the state machine.
// Durations are stored as milliseconds to keep the file format flat.

use crate::error::{DevModeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable naming an optional JSON config file
pub const CONFIG_ENV: &str = "DEVMODE_CONFIG";

pub const JAVA_HOME_ENV: &str = "JAVA_HOME";

/// Interval and attempt budget for one [`crate::probe::probe`] run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbePolicy {
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl ProbePolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            max_attempts,
        }
    }

    /// Budget for "is the freshly started server reachable yet"
    pub fn socket_activation() -> Self {
        Self::new(Duration::from_secs(1), 60)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self::socket_activation()
    }
}

/// Budgets for each phase of a debugger attach attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachPolicy {
    /// Poll interval while waiting for the debuggee to publish its port
    pub discovery_interval_ms: u64,
    pub discovery_max_attempts: u32,

    pub probe_interval_ms: u64,
    pub probe_max_attempts: u32,

    /// Re-read the published port after this many failed probes
    pub port_recheck_every: u32,

    /// Consult the session's closed flag on every Nth cancellation check
    pub closed_check_every: u32,

    pub connect_retry_interval_ms: u64,
    /// Total time spent retrying transport failures while connecting
    pub connect_retry_budget_ms: u64,

    /// Handshake timeout inside the debug protocol layer; not retried
    pub handshake_timeout_ms: u64,
}

impl AttachPolicy {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms)
    }

    pub fn connect_retry_budget(&self) -> Duration {
        Duration::from_millis(self.connect_retry_budget_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for AttachPolicy {
    fn default() -> Self {
        Self {
            discovery_interval_ms: 2_000,
            discovery_max_attempts: 30,
            probe_interval_ms: 1_000,
            probe_max_attempts: 180,
            port_recheck_every: 20,
            closed_check_every: 2,
            connect_retry_interval_ms: 100,
            connect_retry_budget_ms: 10_000,
            handshake_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevModeConfig {
    /// Host the debuggee JVM listens on
    pub debug_host: String,
    /// Injected into every dev-mode process as JAVA_HOME
    pub java_home: Option<PathBuf>,
    /// Lines of process output kept per session
    pub output_buffer_lines: usize,
    pub attach: AttachPolicy,
    pub activation: ProbePolicy,
}

impl Default for DevModeConfig {
    fn default() -> Self {
        Self {
            debug_host: "localhost".to_string(),
            java_home: None,
            output_buffer_lines: 1000,
            attach: AttachPolicy::default(),
            activation: ProbePolicy::socket_activation(),
        }
    }
}

impl DevModeConfig {
    /// Defaults, overlaid by the file named in `DEVMODE_CONFIG`, with
    /// `JAVA_HOME` from the environment filling in an unset `java_home`.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => {
                debug!("{} not set, using default configuration", CONFIG_ENV);
                Self::default()
            }
        };

        if config.java_home.is_none() {
            config.java_home = std::env::var_os(JAVA_HOME_ENV).map(PathBuf::from);
        }

        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| DevModeError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&text).map_err(|e| DevModeError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// `KEY=VALUE` entries to hand to a spawned dev-mode process
    pub fn process_env(&self) -> Vec<String> {
        self.java_home
            .iter()
            .map(|home| format!("{}={}", JAVA_HOME_ENV, home.display()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "debug_host": "127.0.0.1", "attach": {{ "probe_max_attempts": 5 }} }}"#
        )
        .unwrap();

        let config = DevModeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.debug_host, "127.0.0.1");
        assert_eq!(config.attach.probe_max_attempts, 5);
        assert_eq!(config.attach.probe_interval(), Duration::from_secs(1));
        assert_eq!(config.attach.discovery_max_attempts, 30);
        assert_eq!(config.activation, ProbePolicy::socket_activation());
    }

    #[test]
    fn malformed_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();

        let err = DevModeConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, DevModeError::Config { .. }));
    }

    #[test]
    fn huge_interval_saturates() {
        let policy = ProbePolicy::new(Duration::MAX, 1);
        assert_eq!(policy.interval_ms, u64::MAX);
        assert_eq!(ProbePolicy::new(Duration::from_millis(250), 3).interval_ms, 250);
    }

    #[test]
    fn java_home_becomes_process_env() {
        let config = DevModeConfig {
            java_home: Some(PathBuf::from("/opt/jdk-21")),
            ..DevModeConfig::default()
        };
        assert_eq!(config.process_env(), vec!["JAVA_HOME=/opt/jdk-21".to_string()]);
        assert!(DevModeConfig::default().process_env().is_empty());
    }
}
