use std::sync::Arc;

use tracing::{info, warn};

use recirc_common::{ControlError, EngineAction};

use crate::transport::DeviceTransport;

/// Sends engine actions to the device strictly in order. The first failure
/// stops the sequence, so `turnOn` never goes out after a failed
/// `setMaxTemperature`.
pub struct Dispatcher<T> {
    transport: Arc<T>,
    device_id: String,
}

impl<T: DeviceTransport> Dispatcher<T> {
    pub fn new(transport: Arc<T>, device_id: String) -> Self {
        Self {
            transport,
            device_id,
        }
    }

    pub async fn execute(&self, actions: Vec<EngineAction>) -> Result<(), ControlError> {
        for action in actions {
            self.send(action).await?;
        }
        Ok(())
    }

    pub async fn send(&self, action: EngineAction) -> Result<(), ControlError> {
        let device_id = self.device_id.as_str();
        let command = action.command();
        let result = match action {
            EngineAction::SetMaxTemperature(value) => {
                self.transport.set_max_temperature(device_id, value).await
            }
            EngineAction::TurnOn => self.transport.turn_on(device_id).await,
            EngineAction::TurnOff => self.transport.turn_off(device_id).await,
        };

        match result {
            Ok(()) => {
                info!("{} acknowledged by {device_id}", command.as_str());
                Ok(())
            }
            Err(err) => {
                warn!("{} to {device_id} failed: {err}", command.as_str());
                Err(ControlError::Dispatch {
                    command: command.as_str(),
                    message: err.to_string(),
                })
            }
        }
    }
}
