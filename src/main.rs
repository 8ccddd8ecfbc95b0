use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use btleplug::api::Manager as _;
use btleplug::platform::Manager;
use clap::Parser;
use log::{error, info, warn};
use tokio::sync::mpsc;

mod address;
mod ble;
mod config;
mod manager;
mod mqtt;
mod payload;
mod presence;
mod registry;
mod relay;
mod transport;

const DRIVER_NAME: &str = "waypoint-presence";

/// Republishes BLE waypoint and device sightings as presence events over MQTT.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(default_filters: &str) {
    let filters = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filters.to_string());
    pretty_env_logger::formatted_builder()
        .parse_filters(&filters)
        .init();
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("Starting {DRIVER_NAME}");

    let config_contents = std::fs::read_to_string(&args.config)
        .with_context(|| format!("Could not read {}", args.config.display()))?;
    let config = config::AppConfig::from_toml(&config_contents).context("Invalid configuration")?;
    let waypoint = config.waypoint();

    let (mqtt_client, mut eventloop) = mqtt::MqttClient::new(&config.mqtt);
    mqtt::MqttClient::wait_for_connection(&mut eventloop).await?;
    tokio::spawn(mqtt::MqttClient::event_loop(eventloop));

    let local_identity = address::local_identity(waypoint.local_mac).await;

    let bt_manager = Manager::new().await?;
    let central = bt_manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .context("No Bluetooth adapter found")?;
    let (transport, transport_events) = ble::BtleplugTransport::new(central);

    let (relay_tx, relay_rx) = mpsc::channel(64);
    let relay = match config.relay.as_ref().filter(|r| r.enabled) {
        Some(relay_config) => match relay::PeerRelay::bind(relay_config).await {
            Ok(relay) => {
                let relay = Arc::new(relay);
                let listener = Arc::clone(&relay);
                tokio::spawn(async move {
                    listener
                        .run(move |packet| {
                            if let Err(err) = relay_tx.try_send(packet) {
                                warn!("Dropping relay packet: {err}");
                            }
                        })
                        .await
                });
                Some(relay)
            }
            Err(err) => {
                error!("Could not start peer relay: {err}");
                None
            }
        },
        None => None,
    };

    let emitter = presence::PresenceEmitter::new(
        mqtt_client.clone(),
        config.mqtt.presence_path.as_deref().unwrap_or("presence"),
        config
            .mqtt
            .waypoint_count_topic
            .as_deref()
            .unwrap_or("$location/waypoints"),
    );
    let core = Arc::new(manager::Manager::new(
        Arc::clone(&transport),
        emitter,
        relay,
        waypoint.name(),
        local_identity,
    ));

    // Subscribed before the scan starts so that early discoveries are kept.
    let central_events = transport.central_events().await?;
    tokio::spawn(async move {
        if let Err(err) = transport.run(central_events).await {
            error!("Error handling BTLE events: {:?}", err);
        }
    });

    core.start(waypoint.allow_duplicates()).await?;
    Arc::clone(&core).spawn_liveness(waypoint.liveness_interval());
    tokio::spawn(Arc::clone(&core).run_loop(transport_events, relay_rx));

    shutdown_signal().await?;
    info!("Got shutdown signal, exiting");

    if let Err(err) = mqtt_client.disconnect().await {
        warn!("Error disconnecting MQTT client: {:?}", err);
    }

    Ok(())
}
