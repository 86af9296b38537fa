use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::accel::AnalyzerConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Character device of the NMEA line discipline
    Device,
    /// Raw UART, framed in user space
    Serial,
    /// Built-in launch profile generator
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GnssConfig {
    pub source: SourceKind,
    pub device_path: PathBuf,
    pub serial_path: String,
    pub baud_rate: u32,
    pub module_start_script: Option<PathBuf>,
    pub simulated_interval_ms: u64,
}

impl Default for GnssConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Device,
            device_path: PathBuf::from("/dev/gnssposget"),
            serial_path: "/dev/ttyAMA1".to_string(),
            baud_rate: 9600,
            module_start_script: None,
            simulated_interval_ms: 1000,
        }
    }
}

/// Server configuration, loaded from YAML.
///
/// Every key is optional. Example:
///
/// listen_addr: "0.0.0.0:9000"
/// fix_timeout_secs: 15
/// accel_timeout_secs: 30
/// analyzer:
///   start_speed_threshold: 3.0
///   checkpoints: [30, 60, 100]
/// gnss:
///   source: serial
///   serial_path: /dev/ttyAMA1
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub client_read_timeout_ms: u64,
    pub fix_timeout_secs: u64,
    pub fix_poll_interval_ms: u64,
    pub accel_timeout_secs: u64,
    pub wait_accel_tick_us: u64,
    pub measure_tick_us: u64,
    pub status_refresh_ms: u64,
    pub analyzer: AnalyzerConfig,
    pub gnss: GnssConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9000".to_string(),
            client_read_timeout_ms: 2000,
            fix_timeout_secs: 15,
            fix_poll_interval_ms: 500,
            accel_timeout_secs: 30,
            wait_accel_tick_us: 200,
            measure_tick_us: 100,
            status_refresh_ms: 1000,
            analyzer: AnalyzerConfig::default(),
            gnss: GnssConfig::default(),
        }
    }
}

impl Config {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checkpoints = &self.analyzer.checkpoints;
        if checkpoints.is_empty() {
            return Err(ConfigError::Invalid("at least one checkpoint is required".into()));
        }
        if checkpoints.iter().any(|c| !c.is_finite() || *c <= 0.0) {
            return Err(ConfigError::Invalid("checkpoints must be positive speeds".into()));
        }
        if checkpoints.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::Invalid("checkpoints must be strictly ascending".into()));
        }
        if self.analyzer.jitter_count == 0 {
            return Err(ConfigError::Invalid("jitter_count must be at least 1".into()));
        }
        if self.analyzer.max_incorrect_samples == 0 {
            return Err(ConfigError::Invalid("max_incorrect_samples must be at least 1".into()));
        }
        // A zero read timeout means "block forever" to the socket layer
        if self.client_read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("client_read_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn client_read_timeout(&self) -> Duration {
        Duration::from_millis(self.client_read_timeout_ms)
    }

    pub fn fix_timeout(&self) -> Duration {
        Duration::from_secs(self.fix_timeout_secs)
    }

    pub fn fix_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fix_poll_interval_ms)
    }

    pub fn accel_timeout(&self) -> Duration {
        Duration::from_secs(self.accel_timeout_secs)
    }

    pub fn wait_accel_tick(&self) -> Duration {
        Duration::from_micros(self.wait_accel_tick_us)
    }

    pub fn measure_tick(&self) -> Duration {
        Duration::from_micros(self.measure_tick_us)
    }

    pub fn status_refresh(&self) -> Duration {
        Duration::from_millis(self.status_refresh_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_gives_defaults() {
        let config = Config::from_yaml_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.analyzer.checkpoints, vec![30.0, 60.0, 100.0]);
        assert_eq!(config.fix_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn partial_document_overrides_only_given_keys() {
        let yaml = "
accel_timeout_secs: 10
analyzer:
  checkpoints: [50, 100]
gnss:
  source: simulated
";
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.accel_timeout_secs, 10);
        assert_eq!(config.analyzer.checkpoints, vec![50.0, 100.0]);
        assert_eq!(config.analyzer.max_incorrect_samples, 5);
        assert_eq!(config.gnss.source, SourceKind::Simulated);
        assert_eq!(config.gnss.baud_rate, 9600);
    }

    #[test]
    fn invalid_checkpoints_are_rejected() {
        for yaml in [
            "analyzer: {checkpoints: []}",
            "analyzer: {checkpoints: [60, 30]}",
            "analyzer: {checkpoints: [0, 30]}",
        ] {
            let result = Config::from_yaml_str(yaml);
            assert!(matches!(result, Err(ConfigError::Invalid(_))), "{yaml}");
        }
    }

    #[test]
    fn unknown_source_is_a_parse_error() {
        let result = Config::from_yaml_str("gnss: {source: bluetooth}");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen_addr: \"127.0.0.1:9100\"").unwrap();
        let config = Config::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9100");

        let result = Config::from_yaml_file("/nonexistent/accelmeter.yml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
