use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }
}

/// One telemetry sample as reported by the device.
///
/// `timestamp` is the device's own clock and is opaque to the controller; it
/// is only ever compared for equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub state: PowerState,
    pub temperature: Option<f32>,
    pub timestamp: Option<String>,
}

impl DeviceStatus {
    pub fn is_on(&self) -> bool {
        self.state == PowerState::On
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Off,
    Sending,
    Heating,
    Ready,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Sending => "SENDING",
            Self::Heating => "HEATING",
            Self::Ready => "READY",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub phase: Phase,
    #[serde(rename = "deviceState")]
    pub device_state: Option<PowerState>,
    pub temperature: Option<f32>,
    #[serde(rename = "deviceTimestamp")]
    pub device_timestamp: Option<String>,
    #[serde(rename = "maxTemperature")]
    pub max_temperature: f32,
    pub progress: Option<f32>,
    #[serde(rename = "progressPercent")]
    pub progress_percent: Option<u8>,
    #[serde(rename = "disconnectWarning")]
    pub disconnect_warning: bool,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "sessionActive")]
    pub session_active: bool,
    #[serde(rename = "heatingElapsedMs")]
    pub heating_elapsed_ms: u64,
}
