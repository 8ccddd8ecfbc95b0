use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use log::{debug, error, info};
use rumqttc::{ConnectReturnCode, MqttOptions, QoS};

use crate::config;
use crate::presence::Publisher;

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "waypoint-presence".to_string());

        let mut mqttoptions =
            MqttOptions::new(publisher_id, config.host.clone(), config.port.unwrap_or(1883));

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (MqttClient { client }, eventloop)
    }

    /// Drives the event loop until the broker acknowledges the connection.
    pub async fn wait_for_connection(eventloop: &mut rumqttc::EventLoop) -> anyhow::Result<()> {
        loop {
            let notification = eventloop
                .poll()
                .await
                .context("Could not connect to MQTT broker")?;

            if let rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(ack)) = notification {
                if ack.code != ConnectReturnCode::Success {
                    anyhow::bail!("MQTT broker refused connection: {:?}", ack.code);
                }
                info!("Connected to MQTT broker");
                return Ok(());
            }
        }
    }

    /// Keeps the connection serviced for the lifetime of the process.
    pub async fn event_loop(mut eventloop: rumqttc::EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                    debug!("Connection acknowledged");
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

#[async_trait]
impl Publisher for MqttClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        // Fails instead of waiting when the request queue is full.
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)?;
        Ok(())
    }
}
