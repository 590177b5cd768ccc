//! Station configuration.
//!
//! Built once at startup and handed by reference to every sink constructor.

use std::fmt::{self, Debug, Formatter};
use std::time::Duration;

/// ThingSpeak accepts one update per channel every 15 seconds.
pub const MIN_CYCLE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct StationConfig {
    pub telemetry: TelemetryConfig,
    pub dashboard: DashboardConfig,
    pub broker: BrokerConfig,
    /// Pause between two cycles.
    pub cycle_interval: Duration,
}

/// ThingSpeak channel update endpoint.
#[derive(Clone)]
pub struct TelemetryConfig {
    pub endpoint: String,
    pub write_api_key: String,
    pub timeout: Duration,
}

/// Blynk external HTTP API.
#[derive(Clone)]
pub struct DashboardConfig {
    pub base_url: String,
    pub auth_token: String,
    pub template_id: String,
    pub template_name: String,
    pub user_agent: String,
    pub pins: DashboardPins,
    pub timeout: Duration,
    pub check_timeout: Duration,
}

/// Virtual pin bound to each observation field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardPins {
    pub temperature: String,
    pub humidity: String,
    pub insolation: String,
    pub rain: String,
    pub alert: String,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
    pub client_id_prefix: String,
    pub topics: BrokerTopics,
}

/// Topic each observation field is published to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTopics {
    pub temperature: String,
    pub humidity: String,
    pub insolation: String,
    pub rain: String,
    pub alert: String,
}

impl BrokerTopics {
    /// The five station topics below `prefix`.
    pub fn with_prefix(prefix: &str) -> Self {
        BrokerTopics {
            temperature: format!("{prefix}/temp"),
            humidity: format!("{prefix}/umid"),
            insolation: format!("{prefix}/solar"),
            rain: format!("{prefix}/chuva"),
            alert: format!("{prefix}/alerta"),
        }
    }
}

impl Default for DashboardPins {
    fn default() -> Self {
        DashboardPins {
            temperature: "V0".to_string(),
            humidity: "V1".to_string(),
            insolation: "V2".to_string(),
            rain: "V3".to_string(),
            alert: "V4".to_string(),
        }
    }
}

impl BrokerConfig {
    /// URI in the form the MQTT client expects.
    pub fn server_uri(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

impl StationConfig {
    /// Configuration of the stock station with the given credentials.
    pub fn new<K: Into<String>, T: Into<String>>(write_api_key: K, auth_token: T) -> Self {
        StationConfig {
            telemetry: TelemetryConfig {
                endpoint: "https://api.thingspeak.com/update.json".to_string(),
                write_api_key: write_api_key.into(),
                timeout: Duration::from_secs(10),
            },
            dashboard: DashboardConfig {
                base_url: "https://blynk.cloud/external/api".to_string(),
                auth_token: auth_token.into(),
                template_id: "TMPL2EzjqzR7P".to_string(),
                template_name: "EMC01".to_string(),
                user_agent: "EstacaoMeteorologica/1.0".to_string(),
                pins: DashboardPins::default(),
                timeout: Duration::from_secs(15),
                check_timeout: Duration::from_secs(10),
            },
            broker: BrokerConfig {
                host: "broker.hivemq.com".to_string(),
                port: 1883,
                keep_alive: Duration::from_secs(30),
                connect_timeout: Duration::from_secs(10),
                publish_timeout: Duration::from_secs(5),
                client_id_prefix: "simulator".to_string(),
                topics: BrokerTopics::with_prefix("est_01"),
            },
            cycle_interval: MIN_CYCLE_INTERVAL,
        }
    }

    /// Create the configuration from the environment variables.
    ///
    /// `WEATHER_STATION_WRITE_API_KEY` and `WEATHER_STATION_BLYNK_TOKEN` are
    /// required, everything else falls back to [`StationConfig::new`].
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`StationConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or(Error::MissingVariable(key))
        };

        let mut config = StationConfig::new(
            required("WEATHER_STATION_WRITE_API_KEY")?,
            required("WEATHER_STATION_BLYNK_TOKEN")?,
        );

        if let Some(url) = lookup("WEATHER_STATION_THINGSPEAK_URL") {
            config.telemetry.endpoint = url;
        }
        if let Some(url) = lookup("WEATHER_STATION_BLYNK_URL") {
            config.dashboard.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(host) = lookup("WEATHER_STATION_MQTT_HOST") {
            config.broker.host = host;
        }
        if let Some(port) = lookup("WEATHER_STATION_MQTT_PORT") {
            config.broker.port = port.parse().map_err(|_| Error::InvalidValue {
                key: "WEATHER_STATION_MQTT_PORT",
                value: port,
            })?;
        }
        if let Some(prefix) = lookup("WEATHER_STATION_TOPIC_PREFIX") {
            config.broker.topics = BrokerTopics::with_prefix(&prefix);
        }
        if let Some(secs) = lookup("WEATHER_STATION_INTERVAL_SECS") {
            let secs: u64 = secs.parse().map_err(|_| Error::InvalidValue {
                key: "WEATHER_STATION_INTERVAL_SECS",
                value: secs,
            })?;
            config.cycle_interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.cycle_interval < MIN_CYCLE_INTERVAL {
            return Err(Error::IntervalTooShort(self.cycle_interval));
        }
        if self.broker.port == 0 {
            return Err(Error::InvalidValue {
                key: "WEATHER_STATION_MQTT_PORT",
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

/// Show only the first 8 characters of a credential.
pub fn mask_secret(secret: &str) -> String {
    let head: String = secret.chars().take(8).collect();
    format!("{head}...")
}

impl Debug for StationConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StationConfig")
            .field("telemetry", &self.telemetry)
            .field("dashboard", &self.dashboard)
            .field("broker", &self.broker)
            .field("cycle_interval", &self.cycle_interval)
            .finish()
    }
}

impl Debug for TelemetryConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryConfig")
            .field("endpoint", &self.endpoint)
            .field("write_api_key", &mask_secret(&self.write_api_key))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Debug for DashboardConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DashboardConfig")
            .field("base_url", &self.base_url)
            .field("auth_token", &mask_secret(&self.auth_token))
            .field("template_id", &self.template_id)
            .field("template_name", &self.template_name)
            .field("pins", &self.pins)
            .finish()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0} is not set")]
    MissingVariable(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("cycle interval {0:?} is shorter than the 15s telemetry rate limit")]
    IntervalTooShort(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    const CREDENTIALS: [(&str, &str); 2] = [
        ("WEATHER_STATION_WRITE_API_KEY", "2PI8MD4NVFEY9XSZ"),
        ("WEATHER_STATION_BLYNK_TOKEN", "token-0123456789"),
    ];

    #[test]
    fn test_defaults() {
        let config = StationConfig::from_lookup(lookup(&CREDENTIALS)).unwrap();

        assert_eq!(config.telemetry.endpoint, "https://api.thingspeak.com/update.json");
        assert_eq!(config.broker.server_uri(), "tcp://broker.hivemq.com:1883");
        assert_eq!(config.broker.topics.temperature, "est_01/temp");
        assert_eq!(config.broker.topics.alert, "est_01/alerta");
        assert_eq!(config.dashboard.pins.rain, "V3");
        assert_eq!(config.cycle_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_missing_credentials() {
        let err = StationConfig::from_lookup(lookup(&CREDENTIALS[..1])).unwrap_err();
        assert!(matches!(err, Error::MissingVariable("WEATHER_STATION_BLYNK_TOKEN")));

        let err = StationConfig::from_lookup(lookup(&[
            ("WEATHER_STATION_WRITE_API_KEY", "  "),
            CREDENTIALS[1],
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::MissingVariable("WEATHER_STATION_WRITE_API_KEY")));
    }

    #[test]
    fn test_overrides() {
        let mut vars = CREDENTIALS.to_vec();
        vars.extend([
            ("WEATHER_STATION_MQTT_HOST", "localhost"),
            ("WEATHER_STATION_MQTT_PORT", "1884"),
            ("WEATHER_STATION_TOPIC_PREFIX", "est_02"),
            ("WEATHER_STATION_INTERVAL_SECS", "60"),
            ("WEATHER_STATION_BLYNK_URL", "http://127.0.0.1:8080/api/"),
        ]);
        let config = StationConfig::from_lookup(lookup(&vars)).unwrap();

        assert_eq!(config.broker.server_uri(), "tcp://localhost:1884");
        assert_eq!(config.broker.topics.humidity, "est_02/umid");
        assert_eq!(config.cycle_interval, Duration::from_secs(60));
        assert_eq!(config.dashboard.base_url, "http://127.0.0.1:8080/api");
    }

    #[test]
    fn test_interval_below_rate_limit_is_rejected() {
        let mut vars = CREDENTIALS.to_vec();
        vars.push(("WEATHER_STATION_INTERVAL_SECS", "5"));

        let err = StationConfig::from_lookup(lookup(&vars)).unwrap_err();
        assert!(matches!(err, Error::IntervalTooShort(_)));
    }

    #[test]
    fn test_bad_port() {
        let mut vars = CREDENTIALS.to_vec();
        vars.push(("WEATHER_STATION_MQTT_PORT", "not-a-port"));

        let err = StationConfig::from_lookup(lookup(&vars)).unwrap_err();
        assert!(matches!(err, Error::InvalidValue { key: "WEATHER_STATION_MQTT_PORT", .. }));
    }

    #[test]
    fn test_debug_masks_credentials() {
        let config = StationConfig::new("2PI8MD4NVFEY9XSZ", "y0YIz5He8zrIW1BF");
        let debug = format!("{config:?}");

        assert!(debug.contains("2PI8MD4N..."));
        assert!(!debug.contains("2PI8MD4NVFEY9XSZ"));
        assert!(!debug.contains("y0YIz5He8zrIW1BF"));
    }
}
