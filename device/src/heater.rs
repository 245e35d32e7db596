use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

use recirc_common::{
    wire::{Command, CommandRequest},
    DeviceStatus, PowerState, TargetConfig,
};

const HEAT_RATE_PER_SEC: f32 = 0.5;
const COOL_RATE_PER_SEC: f32 = 0.05;

/// Physical model of the recirculator tank.
#[derive(Debug, Clone)]
pub struct SimulatedHeater {
    state: PowerState,
    temperature: f32,
    ambient: f32,
    max_temperature: f32,
    updated_at: DateTime<Utc>,
}

impl SimulatedHeater {
    pub fn new(ambient: f32, now: DateTime<Utc>) -> Self {
        Self {
            state: PowerState::Off,
            temperature: ambient,
            ambient,
            max_temperature: TargetConfig::default().max_temperature,
            updated_at: now,
        }
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Advances the model. The reported timestamp moves only here, so reads
    /// between steps look like duplicates to the controller.
    pub fn step(&mut self, elapsed: Duration, now: DateTime<Utc>) {
        let secs = elapsed.as_secs_f32();
        match self.state {
            PowerState::On => {
                self.temperature =
                    (self.temperature + HEAT_RATE_PER_SEC * secs).min(self.max_temperature);
                if self.temperature >= self.max_temperature {
                    self.state = PowerState::Off;
                }
            }
            PowerState::Off => {
                let drop = COOL_RATE_PER_SEC * secs;
                self.temperature = if self.temperature > self.ambient {
                    (self.temperature - drop).max(self.ambient)
                } else {
                    self.temperature
                };
            }
        }
        self.updated_at = now;
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            state: self.state,
            temperature: Some((self.temperature * 10.0).round() / 10.0),
            timestamp: Some(self.updated_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }

    pub fn apply(&mut self, request: &CommandRequest) -> Result<(), String> {
        match request.command {
            Command::SetMaxTemperature => {
                let value = request
                    .value
                    .ok_or_else(|| "setMaxTemperature requires a value".to_string())?;
                let target = TargetConfig::validate(value).map_err(|err| err.to_string())?;
                self.max_temperature = target.max_temperature;
            }
            Command::TurnOn => self.state = PowerState::On,
            Command::TurnOff => self.state = PowerState::Off,
        }
        Ok(())
    }
}
