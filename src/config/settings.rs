use std::time::Duration;

use serde::Deserialize;

use crate::transport::Address;
use crate::utils::logging::LogLevel;

/// Top-level configuration settings for the application.
///
/// Includes settings for the listening socket, the broker and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub logging: LoggingSettings,
}

/// Where the broker listens.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl ServerSettings {
    pub fn address(&self) -> Address {
        Address::new(self.host.clone(), self.port)
    }
}

/// Configuration settings for the broker.
///
/// `peers` is the static federation list. Timeouts bound every single delivery
/// and every dial so one unresponsive destination cannot hold up the rest.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub peers: Vec<Address>,
    pub send_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub channel_capacity: usize,
    pub route_idle_ms: u64,
}

impl BrokerSettings {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn route_idle(&self) -> Duration {
        Duration::from_millis(self.route_idle_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: LogLevel,
}

/// Partial configuration settings loaded from files or environment. Missing
/// values fall back to defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub peers: Option<Vec<Address>>,
    pub send_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub channel_capacity: Option<usize>,
    pub route_idle_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<LogLevel>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            send_timeout_ms: 1000,
            connect_timeout_ms: 2000,
            channel_capacity: 256,
            route_idle_ms: 2000,
        }
    }
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            broker: BrokerSettings::default(),
            logging: LoggingSettings {
                level: LogLevel::Info,
            },
        }
    }
}
