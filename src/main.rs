use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use log::{debug, error, info};
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::manager::Manager;
use crate::messages::Notification;
use crate::scanner::BtleScanner;

mod config;
mod device;
mod error;
mod manager;
mod messages;
mod mqtt;
mod platform;
mod scanner;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Parser, Debug)]
#[command(version, about = "Bluetooth device discovery bridge")]
struct Cli {
    /// TOML config file (defaults to ./config.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer scan calls arriving over MQTT
    Serve,
    /// Run one discovery locally and print JSON lines
    Scan {
        /// Also print the devices the host is bonded with
        #[arg(long)]
        bonded: bool,
        /// Stop after this many seconds instead of waiting for discovery to finish
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load(path, true)?,
        None => AppConfig::load(Path::new(DEFAULT_CONFIG_PATH), false)?,
    };
    debug!("Config: {:?}", config.scan());

    let scanner = BtleScanner::new(&config.scan()).await?;
    let manager = Arc::new(Manager::new(Arc::new(scanner)));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config, manager).await,
        Command::Scan { bonded, seconds } => scan(manager, bonded, seconds).await,
    }
}

async fn serve(config: &AppConfig, manager: Arc<Manager<BtleScanner>>) -> anyhow::Result<()> {
    let mqtt_config = config
        .mqtt
        .as_ref()
        .context("serving needs an [mqtt] section in the config")?;

    let (mqtt_client, mut eventloop) = mqtt::MqttClient::new(mqtt_config);
    mqtt_client.subscribe().await?;
    info!("Listening for calls on {}", mqtt_client.call_topic());

    let (call_tx, call_rx) = mpsc::channel(10);
    let (result_tx, mut result_rx) = mpsc::channel(10);

    let poller = tokio::spawn({
        let client = mqtt_client.clone();
        async move { client.event_loop(&mut eventloop, call_tx).await }
    });

    let publisher = tokio::spawn({
        let client = mqtt_client.clone();
        let mut notifications = manager.subscribe();
        async move {
            loop {
                tokio::select! {
                    Some((id, result)) = result_rx.recv() => {
                        if let Err(err) = client.publish_result(id, &result).await {
                            error!("Error publishing result for call {id}: {err:?}");
                        }
                    }
                    notification = notifications.recv() => match notification {
                        Some(notification) => {
                            if let Err(err) = client.publish_notification(&notification).await {
                                error!("Error publishing {}: {err:?}", notification.method());
                            }
                        }
                        None => break,
                    },
                }
            }
        }
    });

    let server = tokio::spawn(manager.clone().serve(call_rx, result_tx));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    // Dropping the poller closes the call channel, which ends `serve`.
    poller.abort();
    if let Err(err) = server.await {
        error!("Bridge task failed: {err:?}");
    }
    drop(manager);
    if tokio::time::timeout(Duration::from_secs(2), publisher)
        .await
        .is_err()
    {
        debug!("Publisher still busy, leaving it behind");
    }

    if let Err(err) = mqtt_client.disconnect().await {
        debug!("Error disconnecting MQTT client: {err:?}");
    }
    Ok(())
}

async fn scan(
    manager: Arc<Manager<BtleScanner>>,
    bonded: bool,
    seconds: Option<u64>,
) -> anyhow::Result<()> {
    let mut notifications = manager.subscribe();

    for device in manager.start_scan(bonded).await? {
        println!("{}", serde_json::to_string(&device)?);
    }

    let deadline = async {
        match seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => futures::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut stopping = false;
    loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Some(notification) => {
                    println!("{}", notification.to_json()?);
                    if notification == Notification::ScanStopped {
                        break;
                    }
                }
                None => break,
            },
            _ = &mut deadline, if !stopping => {
                stopping = true;
                manager.stop_scan().await?;
            }
            _ = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                manager.stop_scan().await?;
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}
