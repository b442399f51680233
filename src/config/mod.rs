mod settings;

use std::path::Path;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{BrokerSettings, LoggingSettings, ServerSettings, Settings};

const ENV_PREFIX: &str = "AUTOBAHN";

/// Loads `config/default.*` (if present) and `AUTOBAHN_*` environment variables.
pub fn load_config() -> Result<Settings, ConfigError> {
    load(File::with_name("config/default").required(false))
}

/// Like [`load_config`] but reads the given file, which must exist.
pub fn load_config_from(path: &Path) -> Result<Settings, ConfigError> {
    load(File::from(path).required(true))
}

fn load<F>(file: F) -> Result<Settings, ConfigError>
where
    F: config::Source + Send + Sync + 'static,
{
    let builder = Config::builder().add_source(file).add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("broker.peers")
            .try_parsing(true),
    );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(merge(partial))
}

/// Merges partial settings over the defaults.
fn merge(partial: PartialSettings) -> Settings {
    let default = Settings::default();
    let server = partial.server.as_ref();
    let broker = partial.broker;
    let broker = broker.as_ref();

    let mut settings = Settings {
        server: ServerSettings {
            host: server
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: server.and_then(|s| s.port).unwrap_or(default.server.port),
        },
        broker: BrokerSettings {
            peers: broker
                .and_then(|b| b.peers.clone())
                .unwrap_or(default.broker.peers),
            send_timeout_ms: broker
                .and_then(|b| b.send_timeout_ms)
                .unwrap_or(default.broker.send_timeout_ms),
            connect_timeout_ms: broker
                .and_then(|b| b.connect_timeout_ms)
                .unwrap_or(default.broker.connect_timeout_ms),
            channel_capacity: broker
                .and_then(|b| b.channel_capacity)
                .filter(|&c| c > 0)
                .unwrap_or(default.broker.channel_capacity),
            route_idle_ms: broker
                .and_then(|b| b.route_idle_ms)
                .unwrap_or(default.broker.route_idle_ms),
        },
        logging: LoggingSettings {
            level: partial
                .logging
                .and_then(|l| l.level)
                .unwrap_or(default.logging.level),
        },
    };

    // every node usually shares one peer list, which includes itself
    let own = settings.server.address();
    settings.broker.peers.retain(|peer| peer != &own);

    settings
}
