use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde_derive::Deserialize;

const DEFAULT_DISCOVERY_TIMEOUT_SECONDS: u64 = 12;

#[derive(Deserialize, Debug, Default, Clone)]
pub struct AppConfig {
    pub mqtt: Option<MqttConfig>,
    pub scan: Option<ScanConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub adapter_index: Option<usize>,
    /// Discovery ends on its own after this long; 0 keeps it running until stopped.
    pub discovery_timeout_seconds: Option<u64>,
}

impl ScanConfig {
    pub fn discovery_timeout(&self) -> Option<Duration> {
        match self
            .discovery_timeout_seconds
            .unwrap_or(DEFAULT_DISCOVERY_TIMEOUT_SECONDS)
        {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl AppConfig {
    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::de::from_str(contents)?)
    }

    /// Reads `path`; a missing file is only tolerated when `required` is false.
    pub fn load(path: &Path, required: bool) -> anyhow::Result<Self> {
        if !required && !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(AppConfig::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        AppConfig::parse(&contents).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn scan(&self) -> ScanConfig {
        self.scan.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config() {
        let config_str = r#"
            [mqtt]
            host = "localhost"
            port = 1883
            username = "user"
            password = "pass"

            [scan]
            adapter_index = 1
            discovery_timeout_seconds = 30
        "#;
        let config = AppConfig::parse(config_str).unwrap();
        assert!(config.mqtt.as_ref().map(|m| m.host.as_str()) == Some("localhost"));
        assert_eq!(config.scan().adapter_index, Some(1));
        assert_eq!(config.scan().discovery_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_scan_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert!(config.mqtt.is_none());
        assert_eq!(config.scan().discovery_timeout(), Some(Duration::from_secs(12)));

        let config = AppConfig::parse("[scan]\ndiscovery_timeout_seconds = 0\n").unwrap();
        assert_eq!(config.scan().discovery_timeout(), None);
    }

    #[test]
    fn test_missing_file() {
        let path = Path::new("/nonexistent/btscan-bridge.toml");
        assert!(AppConfig::load(path, false).is_ok());
        assert!(AppConfig::load(path, true).is_err());
    }
}
