//! Run configuration loaded from a TOML file.
//!
//! A reload always produces a fresh [`RunConfiguration`]; a live value is
//! never patched in place.

use crate::errors::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;
use url::Url;

const DEFAULT_APP_NAME: &str = "app name";
const DEFAULT_SERVER: &str = "tcp://192.168.0.103:1883";
const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;

/// Static description of one simulated sensor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceDescriptor {
    pub topic: String,
    #[serde(rename = "dev")]
    pub device_id: String,
    pub tag: String,
    #[serde(default)]
    pub max: f64,
    #[serde(default)]
    pub min: f64,
    /// Milliseconds between publishes, 0 publishes as fast as possible.
    #[serde(rename = "interval")]
    pub interval_ms: u64,
    /// Stop after this many iterations instead of running until cancelled.
    #[serde(default)]
    pub count: Option<u64>,
}

impl DeviceDescriptor {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Logical sender path, `<device id>/<tag>`.
    pub fn address(&self) -> String {
        format!("{}/{}", self.device_id, self.tag)
    }

    fn validate(&self, index: usize) -> Result<()> {
        for (field, value) in [
            ("topic", &self.topic),
            ("dev", &self.device_id),
            ("tag", &self.tag),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!(
                    "device #{}: `{}` cannot be empty",
                    index, field
                )));
            }
        }

        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(Error::Config(format!(
                "device #{} ({}): min/max must be finite",
                index,
                self.address()
            )));
        }

        if self.min > self.max {
            warn!(
                "Device {} has min {} greater than max {}, it will always report {}",
                self.address(),
                self.min,
                self.max,
                self.min
            );
        }

        Ok(())
    }
}

/// Host and port of the MQTT broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    /// Parses `tcp://host:port` or `mqtt://host:port`; the port defaults to 1883.
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri)?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            other => {
                return Err(Error::Config(format!(
                    "unsupported broker scheme `{}` in {}",
                    other, uri
                )))
            }
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::Config(format!("broker address {} has no host", uri)))?;

        Ok(Self {
            host: host.to_string(),
            port: url.port().unwrap_or(DEFAULT_MQTT_PORT),
        })
    }
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize)]
struct RawConfiguration {
    #[serde(default = "default_app_name")]
    app_name: String,
    #[serde(default = "default_server")]
    server: String,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default = "default_keep_alive")]
    keep_alive_secs: u64,
    #[serde(default)]
    mqtt: Vec<DeviceDescriptor>,
}

fn default_app_name() -> String {
    DEFAULT_APP_NAME.to_string()
}

fn default_server() -> String {
    DEFAULT_SERVER.to_string()
}

fn default_keep_alive() -> u64 {
    DEFAULT_KEEP_ALIVE_SECS
}

/// Everything one run generation needs.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfiguration {
    pub app_name: String,
    pub broker: BrokerAddress,
    pub client_id: Option<String>,
    pub keep_alive: Duration,
    pub devices: Vec<DeviceDescriptor>,
}

impl RunConfiguration {
    /// Reads, parses and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: RawConfiguration = toml::from_str(content)?;

        for (index, device) in raw.mqtt.iter().enumerate() {
            device.validate(index)?;
        }

        Ok(Self {
            app_name: raw.app_name,
            broker: BrokerAddress::parse(&raw.server)?,
            client_id: raw.client_id.filter(|id| !id.is_empty()),
            keep_alive: Duration::from_secs(raw.keep_alive_secs),
            devices: raw.mqtt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
app_name = "house simulator"
server = "tcp://broker.local:1884"

[[mqtt]]
topic = "/oneM2M/req/house1"
dev = "house1"
tag = "temp"
min = 10.0
max = 20.0
interval = 500

[[mqtt]]
topic = "/oneM2M/req/house1"
dev = "house1"
tag = "humidity"
max = 80.0
interval = 0
count = 3
"#;

    #[test]
    fn test_parse_sample() {
        let config = RunConfiguration::from_toml_str(SAMPLE).unwrap();

        assert_eq!(config.app_name, "house simulator");
        assert_eq!(
            config.broker,
            BrokerAddress {
                host: "broker.local".to_string(),
                port: 1884
            }
        );
        assert_eq!(config.keep_alive, Duration::from_secs(30));
        assert_eq!(config.devices.len(), 2);

        let temp = &config.devices[0];
        assert_eq!(temp.address(), "house1/temp");
        assert_eq!(temp.interval(), Duration::from_millis(500));
        assert_eq!(temp.count, None);

        let humidity = &config.devices[1];
        assert_eq!(humidity.min, 0.0);
        assert_eq!(humidity.max, 80.0);
        assert_eq!(humidity.count, Some(3));
    }

    #[test]
    fn test_defaults() {
        let config = RunConfiguration::from_toml_str("").unwrap();

        assert_eq!(config.app_name, "app name");
        assert_eq!(config.broker.to_string(), "192.168.0.103:1883");
        assert!(config.client_id.is_none());
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_missing_interval_is_rejected() {
        let content = r#"
[[mqtt]]
topic = "t"
dev = "d"
tag = "x"
"#;
        assert!(RunConfiguration::from_toml_str(content).is_err());
    }

    #[test]
    fn test_empty_topic_is_rejected() {
        let content = r#"
[[mqtt]]
topic = ""
dev = "d"
tag = "x"
interval = 10
"#;
        let err = RunConfiguration::from_toml_str(content).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_inverted_range_is_accepted() {
        let content = r#"
[[mqtt]]
topic = "t"
dev = "d"
tag = "x"
min = 5.0
max = 1.0
interval = 10
"#;
        assert!(RunConfiguration::from_toml_str(content).is_ok());
    }

    #[test]
    fn test_broker_address_default_port() {
        let address = BrokerAddress::parse("mqtt://localhost").unwrap();
        assert_eq!(address.port, 1883);
        assert_eq!(address.host, "localhost");
    }

    #[test]
    fn test_broker_address_rejects_unknown_scheme() {
        assert!(BrokerAddress::parse("http://localhost:1883").is_err());
        assert!(BrokerAddress::parse("not a uri").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = RunConfiguration::load(Path::new("/nonexistent/config.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
