use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{MqttOptions, QoS};
use tokio::sync::mpsc;

use crate::config;
use crate::messages::{MethodCall, MethodResult, Notification};

pub const DEFAULT_TOPIC_PATH: &str = "flutter_scan_bluetooth";

/// Carries method calls, their results and discovery notifications over MQTT.
#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    topic_path: String,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "btscan-bridge".to_string());

        let mut mqttoptions =
            MqttOptions::new(publisher_id, config.host.clone(), config.port.unwrap_or(1883));

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                topic_path: config
                    .topic_path
                    .clone()
                    .unwrap_or_else(|| DEFAULT_TOPIC_PATH.to_string()),
            },
            eventloop,
        )
    }

    pub fn call_topic(&self) -> String {
        call_topic(&self.topic_path)
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe(self.call_topic(), QoS::AtLeastOnce)
            .await
    }

    /// Polls the connection, forwarding every call published on the call topic.
    /// Returns once the call receiver is gone.
    pub async fn event_loop(&self, eventloop: &mut rumqttc::EventLoop, tx: mpsc::Sender<MethodCall>) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        let call = match MethodCall::from_json(&p.payload) {
                            Ok(call) => call,
                            Err(err) => {
                                warn!("Ignoring malformed call on {}: {err}", p.topic);
                                continue;
                            }
                        };

                        if tx.send(call).await.is_err() {
                            debug!("Call receiver closed");
                            break;
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub async fn publish_result(&self, id: u64, result: &MethodResult) -> anyhow::Result<()> {
        debug!("Publishing result for call {id}");
        self.client
            .publish(
                result_topic(&self.topic_path),
                QoS::AtLeastOnce,
                false,
                result.to_json(id)?,
            )
            .await?;
        Ok(())
    }

    pub async fn publish_notification(&self, notification: &Notification) -> anyhow::Result<()> {
        info!("Publishing {}", notification.method());
        self.client
            .publish(
                event_topic(&self.topic_path),
                QoS::AtMostOnce,
                false,
                notification.to_json()?,
            )
            .await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

fn call_topic(topic_path: &str) -> String {
    format!("{topic_path}/call")
}

fn result_topic(topic_path: &str) -> String {
    format!("{topic_path}/result")
}

fn event_topic(topic_path: &str) -> String {
    format!("{topic_path}/event")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics() {
        assert_eq!(call_topic("home/bt"), "home/bt/call");
        assert_eq!(result_topic("home/bt"), "home/bt/result");
        assert_eq!(event_topic(DEFAULT_TOPIC_PATH), "flutter_scan_bluetooth/event");
    }

    #[test]
    fn test_default_topic_path() {
        let config = config::MqttConfig {
            host: "localhost".to_string(),
            port: None,
            username: None,
            password: None,
            publisher_id: None,
            topic_path: None,
            keep_alive_seconds: None,
        };
        let (client, _eventloop) = MqttClient::new(&config);
        assert_eq!(client.call_topic(), "flutter_scan_bluetooth/call");
    }
}
