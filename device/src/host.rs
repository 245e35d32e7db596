use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Publish, QoS};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use recirc_common::{
    topics::{command_reply_topic, command_topic, status_reply_topic, status_request_topic},
    wire::{CommandReply, CommandRequest, StatusReply, StatusRequest, MAX_PAYLOAD_BYTES},
    RuntimeConfig,
};

use crate::heater::SimulatedHeater;

const STEP_INTERVAL: Duration = Duration::from_secs(2);
const AMBIENT_TEMPERATURE: f32 = 20.0;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let defaults = RuntimeConfig::default();
    let device_id = std::env::var("DEVICE_ID").unwrap_or(defaults.device_id);
    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(defaults.network.mqtt_host);
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(defaults.network.mqtt_port);

    let mut mqtt_options =
        MqttOptions::new(format!("recirculator-device-{device_id}"), mqtt_host, mqtt_port);
    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);
    mqtt.subscribe(status_request_topic(&device_id), QoS::AtLeastOnce)
        .await
        .context("failed to subscribe to status requests")?;
    mqtt.subscribe(command_topic(&device_id), QoS::AtLeastOnce)
        .await
        .context("failed to subscribe to commands")?;

    let (inbox, mut requests) = mpsc::channel::<Publish>(32);
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if inbox.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("device mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    info!("simulated recirculator {device_id} started");

    let mut heater = SimulatedHeater::new(AMBIENT_TEMPERATURE, Utc::now());
    let mut interval = tokio::time::interval(STEP_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                heater.step(STEP_INTERVAL, Utc::now());
                debug!("{device_id}: {:?} at {:.1}", heater.state(), heater.temperature());
            }
            message = requests.recv() => {
                let Some(message) = message else {
                    anyhow::bail!("mqtt event loop stopped");
                };
                handle_message(&mqtt, &device_id, &mut heater, &message).await?;
            }
        }
    }
}

async fn handle_message(
    mqtt: &AsyncClient,
    device_id: &str,
    heater: &mut SimulatedHeater,
    message: &Publish,
) -> anyhow::Result<()> {
    if message.payload.len() > MAX_PAYLOAD_BYTES {
        warn!("dropping oversized request on {}", message.topic);
        return Ok(());
    }

    if message.topic == status_request_topic(device_id) {
        let request = match serde_json::from_slice::<StatusRequest>(&message.payload) {
            Ok(request) => request,
            Err(err) => {
                warn!("bad status request: {err}");
                return Ok(());
            }
        };
        let reply = StatusReply {
            request_id: request.request_id,
            status: heater.status(),
        };
        publish(mqtt, status_reply_topic(device_id), &reply).await
    } else if message.topic == command_topic(device_id) {
        let request = match serde_json::from_slice::<CommandRequest>(&message.payload) {
            Ok(request) => request,
            Err(err) => {
                warn!("bad command: {err}");
                return Ok(());
            }
        };
        let reply = match heater.apply(&request) {
            Ok(()) => {
                info!("{device_id}: applied {}", request.command.as_str());
                CommandReply {
                    request_id: request.request_id,
                    ok: true,
                    message: None,
                }
            }
            Err(message) => {
                warn!("{device_id}: rejected {}: {message}", request.command.as_str());
                CommandReply {
                    request_id: request.request_id,
                    ok: false,
                    message: Some(message),
                }
            }
        };
        publish(mqtt, command_reply_topic(device_id), &reply).await
    } else {
        Ok(())
    }
}

async fn publish<T: serde::Serialize>(
    mqtt: &AsyncClient,
    topic: String,
    payload: &T,
) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(payload)?;
    mqtt.publish(topic, QoS::AtLeastOnce, false, payload)
        .await
        .context("failed to publish reply")
}
