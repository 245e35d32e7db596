use thiserror::Error;

use crate::types::Phase;

/// Everything the control loop can report to a caller. None of these are
/// fatal; every variant except `Busy` leaves the loop in `Phase::Off`, or on
/// its way there for `Cancelled`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlError {
    #[error("target temperature {value} is outside the safe range {min}-{max}")]
    OutOfRange { value: f32, min: f32, max: f32 },

    #[error("{command} failed: {message}")]
    Dispatch {
        command: &'static str,
        message: String,
    },

    #[error("device did not respond within {timeout_ms} ms")]
    NoResponse { timeout_ms: u64 },

    #[error("device stopped early at {} (target {target})", display_temperature(.temperature))]
    EarlyStop {
        temperature: Option<f32>,
        target: f32,
    },

    #[error("a session is already active (phase {0})")]
    Busy(Phase),

    #[error("start cancelled before {next} was sent")]
    Cancelled { next: &'static str },
}

fn display_temperature(temperature: &Option<f32>) -> String {
    temperature
        .map(|value| format!("{value:.1}"))
        .unwrap_or_else(|| "unknown temperature".to_string())
}
