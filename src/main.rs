//! CLI for Autobahn
//!
//! Subcommands:
//! - `server`: run this node's broker
//! - `publish`: send one message through a broker (useful for smoke tests)
//! - `subscribe`: print every message on a topic until interrupted

use std::path::PathBuf;

use autobahn::config::{Settings, load_config, load_config_from};
use autobahn::transport::websocket;
use autobahn::utils::logging::{self, LogLevel};
use autobahn::{Address, Broker, Client};
use bytes::Bytes;
use clap::Parser;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "autobahn")]
enum Command {
    /// Run the broker for this node
    Server {
        /// Configuration file; defaults to config/default.* when present
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overrides logging.level
        #[arg(long)]
        log_level: Option<LogLevel>,
    },
    /// Publish one message and exit
    Publish {
        #[arg(long, default_value = "127.0.0.1:8080")]
        broker: Address,
        #[arg(long)]
        topic: String,
        #[arg(long)]
        payload: String,
    },
    /// Print messages on a topic until Ctrl-C
    Subscribe {
        #[arg(long, default_value = "127.0.0.1:8080")]
        broker: Address,
        #[arg(long)]
        topic: String,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cmd = Command::parse();

    let result = match cmd {
        Command::Server { config, log_level } => run_server(config, log_level).await,
        Command::Publish {
            broker,
            topic,
            payload,
        } => {
            logging::init(LogLevel::Warn);
            run_publish(broker, &topic, payload).await
        }
        Command::Subscribe { broker, topic } => {
            logging::init(LogLevel::Info);
            run_subscribe(broker, &topic).await
        }
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

fn settings(path: Option<PathBuf>) -> autobahn::Result<Settings> {
    let settings = match path {
        Some(path) => load_config_from(&path)?,
        None => load_config()?,
    };
    Ok(settings)
}

async fn run_server(path: Option<PathBuf>, log_level: Option<LogLevel>) -> autobahn::Result<()> {
    let config = settings(path)?;
    logging::init(log_level.unwrap_or(config.logging.level));

    let addr = config.server.address();
    let listener = websocket::bind(&addr).await?;
    let broker = Broker::new(config.broker.clone());
    info!(
        "Broker {} listening on {addr} with {} peer(s)",
        broker.id(),
        broker.peers().len()
    );

    tokio::select! {
        _ = broker.run(listener) => {
            error!("WebSocket server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    Ok(())
}

async fn run_publish(broker: Address, topic: &str, payload: String) -> autobahn::Result<()> {
    let client = Client::new(broker);
    client.begin().await?;
    client.publish(topic, Bytes::from(payload)).await?;
    // give the writer a moment to flush before the socket closes
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    client.close();
    Ok(())
}

async fn run_subscribe(broker: Address, topic: &str) -> autobahn::Result<()> {
    let client = Client::new(broker);
    let name = topic.to_string();
    client
        .subscribe(topic, move |payload: Bytes| {
            println!("{name}: {}", String::from_utf8_lossy(&payload));
            std::future::ready(())
        })
        .await?;
    client.begin().await?;

    let _ = tokio::signal::ctrl_c().await;
    client.close();
    Ok(())
}
