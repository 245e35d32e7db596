use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use recirc_common::{
    topics::{command_reply_topic, command_topic, status_reply_topic, status_request_topic},
    wire::{Command, CommandReply, CommandRequest, StatusReply, StatusRequest, MAX_PAYLOAD_BYTES},
    DeviceStatus,
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("device rejected the command: {0}")]
    Rejected(String),
    #[error("reply channel closed")]
    Closed,
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The device as seen by the control loop: one idempotent read and three
/// fire-and-confirm commands.
#[async_trait]
pub trait DeviceTransport: Send + Sync + 'static {
    async fn get_status(&self, device_id: &str) -> Result<DeviceStatus, TransportError>;
    async fn set_max_temperature(&self, device_id: &str, value: f32) -> Result<(), TransportError>;
    async fn turn_on(&self, device_id: &str) -> Result<(), TransportError>;
    async fn turn_off(&self, device_id: &str) -> Result<(), TransportError>;
}

enum Reply {
    Status(DeviceStatus),
    Command(CommandReply),
}

/// Request/reply over MQTT. Every request carries a `requestId`; replies
/// arriving through [`MqttTransport::route`] complete the matching waiter.
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>,
    next_id: Arc<AtomicU64>,
    request_timeout: Duration,
}

impl MqttTransport {
    pub fn new(client: AsyncClient, request_timeout: Duration) -> Self {
        Self {
            client,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            request_timeout,
        }
    }

    pub async fn subscribe(&self, device_id: &str) -> Result<(), TransportError> {
        for topic in [status_reply_topic(device_id), command_reply_topic(device_id)] {
            self.client.subscribe(topic, QoS::AtMostOnce).await?;
        }
        Ok(())
    }

    /// Hands an incoming publish to whichever request is waiting for it.
    pub async fn route(&self, topic: &str, payload: &[u8]) {
        if payload.len() > MAX_PAYLOAD_BYTES {
            warn!(
                "dropping oversized MQTT payload on topic {} ({} bytes)",
                topic,
                payload.len()
            );
            return;
        }

        let decoded = if topic.ends_with("/status") {
            serde_json::from_slice::<StatusReply>(payload)
                .map(|reply| (reply.request_id, Reply::Status(reply.status)))
        } else if topic.ends_with("/reply") {
            serde_json::from_slice::<CommandReply>(payload)
                .map(|reply| (reply.request_id, Reply::Command(reply)))
        } else {
            return;
        };

        let (request_id, reply) = match decoded {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("undecodable reply on {topic}: {err}");
                return;
            }
        };

        let waiter = self.pending.lock().await.remove(&request_id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(reply);
            }
            None => debug!("reply {request_id} on {topic} arrived after its request gave up"),
        }
    }

    async fn request(
        &self,
        topic: String,
        encode: impl FnOnce(u64) -> serde_json::Result<Vec<u8>>,
    ) -> Result<Reply, TransportError> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = encode(request_id)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        if let Err(err) = self
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            self.pending.lock().await.remove(&request_id);
            return Err(err.into());
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(TransportError::Timeout(self.request_timeout))
            }
        }
    }

    async fn command(
        &self,
        device_id: &str,
        command: Command,
        value: Option<f32>,
    ) -> Result<(), TransportError> {
        let reply = self
            .request(command_topic(device_id), |request_id| {
                serde_json::to_vec(&CommandRequest {
                    request_id,
                    command,
                    value,
                })
            })
            .await?;

        match reply {
            Reply::Command(reply) if reply.ok => Ok(()),
            Reply::Command(reply) => Err(TransportError::Rejected(
                reply
                    .message
                    .unwrap_or_else(|| format!("{} refused", command.as_str())),
            )),
            Reply::Status(_) => Err(TransportError::Rejected(
                "unexpected status reply to a command".to_string(),
            )),
        }
    }
}

#[async_trait]
impl DeviceTransport for MqttTransport {
    async fn get_status(&self, device_id: &str) -> Result<DeviceStatus, TransportError> {
        let reply = self
            .request(status_request_topic(device_id), |request_id| {
                serde_json::to_vec(&StatusRequest { request_id })
            })
            .await?;

        match reply {
            Reply::Status(status) => Ok(status),
            Reply::Command(_) => Err(TransportError::Rejected(
                "unexpected command reply to a status read".to_string(),
            )),
        }
    }

    async fn set_max_temperature(
        &self,
        device_id: &str,
        value: f32,
    ) -> Result<(), TransportError> {
        self.command(device_id, Command::SetMaxTemperature, Some(value))
            .await
    }

    async fn turn_on(&self, device_id: &str) -> Result<(), TransportError> {
        self.command(device_id, Command::TurnOn, None).await
    }

    async fn turn_off(&self, device_id: &str) -> Result<(), TransportError> {
        self.command(device_id, Command::TurnOff, None).await
    }
}
