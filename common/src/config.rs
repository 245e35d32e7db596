use serde::{Deserialize, Serialize};

use crate::error::ControlError;

pub const MIN_SAFE_TEMPERATURE: f32 = 30.0;
pub const MAX_SAFE_TEMPERATURE: f32 = 60.0;
pub const DEFAULT_MAX_TEMPERATURE: f32 = 40.0;
pub const TEMP_REACHED_MARGIN: f32 = 1.5;
pub const TEMP_COOLING_THRESHOLD: f32 = 2.0;
pub const DISCONNECT_TIMEOUT_MS: u64 = 20_000;
pub const COMMAND_TIMEOUT_MS: u64 = 10_000;
pub const HEATING_GRACE_MS: u64 = 2_000;

/// Preference key under which the user's target temperature is stored.
pub const MAX_TEMPERATURE_KEY: &str = "maxTemperature";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecirculatorConfig {
    pub command_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,
    pub heating_grace_ms: u64,
    pub temp_reached_margin: f32,
    pub temp_cooling_threshold: f32,
    pub sending_poll_interval_ms: u64,
    pub steady_poll_interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for RecirculatorConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: COMMAND_TIMEOUT_MS,
            disconnect_timeout_ms: DISCONNECT_TIMEOUT_MS,
            heating_grace_ms: HEATING_GRACE_MS,
            temp_reached_margin: TEMP_REACHED_MARGIN,
            temp_cooling_threshold: TEMP_COOLING_THRESHOLD,
            sending_poll_interval_ms: 1_000,
            steady_poll_interval_ms: 5_000,
            request_timeout_ms: 3_000,
        }
    }
}

impl RecirculatorConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        if self.command_timeout_ms == 0 {
            self.command_timeout_ms = defaults.command_timeout_ms;
        }
        if self.disconnect_timeout_ms == 0 {
            self.disconnect_timeout_ms = defaults.disconnect_timeout_ms;
        }
        if !self.temp_reached_margin.is_finite() || self.temp_reached_margin < 0.0 {
            self.temp_reached_margin = defaults.temp_reached_margin;
        }
        if !self.temp_cooling_threshold.is_finite() || self.temp_cooling_threshold < 0.0 {
            self.temp_cooling_threshold = defaults.temp_cooling_threshold;
        }

        self.sending_poll_interval_ms = self.sending_poll_interval_ms.clamp(100, 60_000);
        self.steady_poll_interval_ms = self.steady_poll_interval_ms.clamp(100, 60_000);
        self.request_timeout_ms = self.request_timeout_ms.clamp(100, 60_000);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(rename = "maxTemperature")]
    pub max_temperature: f32,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            max_temperature: DEFAULT_MAX_TEMPERATURE,
        }
    }
}

impl TargetConfig {
    /// Accepts `value` only if it lies within the safe bounds.
    pub fn validate(value: f32) -> Result<Self, ControlError> {
        if value.is_finite() && (MIN_SAFE_TEMPERATURE..=MAX_SAFE_TEMPERATURE).contains(&value) {
            Ok(Self {
                max_temperature: value,
            })
        } else {
            Err(ControlError::OutOfRange {
                value,
                min: MIN_SAFE_TEMPERATURE,
                max: MAX_SAFE_TEMPERATURE,
            })
        }
    }

    /// Parses a persisted preference. Anything absent, unparsable or out of
    /// bounds falls back to the default.
    pub fn from_stored(raw: Option<&str>) -> Self {
        raw.and_then(|value| value.trim().parse::<f32>().ok())
            .and_then(|value| Self::validate(value).ok())
            .unwrap_or_default()
    }

    pub fn to_stored(self) -> String {
        self.max_temperature.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub device_id: String,
    #[serde(default)]
    pub recirculator: RecirculatorConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device_id: "recirculator-1".to_string(),
            recirculator: RecirculatorConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}
