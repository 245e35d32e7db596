/// Bookkeeping for one start-to-stop control attempt. Created when a start is
/// requested (or a running device is recovered) and dropped on return to
/// `Phase::Off`. All times are controller-monotonic milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlSession {
    pub max_temperature: f32,
    /// Temperature observed when heating started; the 0% progress baseline.
    pub initial_temperature: Option<f32>,
    pub last_fresh_telemetry_at_ms: u64,
    pub last_device_timestamp: Option<String>,
    pub command_sent_at_ms: Option<u64>,
    pub heating_started_at_ms: Option<u64>,
}

impl ControlSession {
    /// A session for a user-requested start; commands go out at `now_ms`.
    pub fn for_start(
        max_temperature: f32,
        last_device_timestamp: Option<String>,
        now_ms: u64,
    ) -> Self {
        Self {
            max_temperature,
            initial_temperature: None,
            last_fresh_telemetry_at_ms: now_ms,
            last_device_timestamp,
            command_sent_at_ms: Some(now_ms),
            heating_started_at_ms: None,
        }
    }

    /// A session adopted from a device that was already heating on attach.
    pub fn recovered(
        max_temperature: f32,
        temperature: Option<f32>,
        device_timestamp: Option<String>,
        now_ms: u64,
    ) -> Self {
        Self {
            max_temperature,
            initial_temperature: temperature,
            last_fresh_telemetry_at_ms: now_ms,
            last_device_timestamp: device_timestamp,
            command_sent_at_ms: None,
            heating_started_at_ms: Some(now_ms),
        }
    }

    pub fn mark_heating_started(&mut self, temperature: Option<f32>, now_ms: u64) {
        self.initial_temperature = temperature;
        self.heating_started_at_ms = Some(now_ms);
    }

    pub fn heating_elapsed_ms(&self, now_ms: u64) -> u64 {
        self.heating_started_at_ms
            .map(|start| now_ms.saturating_sub(start))
            .unwrap_or(0)
    }

    pub fn command_elapsed_ms(&self, now_ms: u64) -> u64 {
        self.command_sent_at_ms
            .map(|sent| now_ms.saturating_sub(sent))
            .unwrap_or(0)
    }
}
