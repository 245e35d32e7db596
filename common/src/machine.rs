//! Pure transition logic for an active session.
//!
//! Nothing here touches a clock or a transport: callers hand in the current
//! phase, the session, an optional sample that already passed the freshness
//! check, and `now_ms`.

use std::time::Duration;

use crate::{
    config::RecirculatorConfig,
    error::ControlError,
    session::ControlSession,
    types::{DeviceStatus, Phase, PowerState},
};

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub phase: Phase,
    pub fault: Option<ControlError>,
}

impl Evaluation {
    fn at(phase: Phase) -> Self {
        Self { phase, fault: None }
    }

    fn fail(fault: ControlError) -> Self {
        Self {
            phase: Phase::Off,
            fault: Some(fault),
        }
    }
}

/// One step of the phase machine. `sample` is `None` when nothing evaluable
/// arrived (failed fetch or duplicate); only time-based rules apply then.
pub fn evaluate(
    config: &RecirculatorConfig,
    phase: Phase,
    session: &mut ControlSession,
    sample: Option<&DeviceStatus>,
    now_ms: u64,
) -> Evaluation {
    match phase {
        // Recovery from OFF needs a session that doesn't exist yet; the engine
        // handles it.
        Phase::Off => Evaluation::at(Phase::Off),
        Phase::Sending => evaluate_sending(config, session, sample, now_ms),
        Phase::Heating => evaluate_heating(config, session, sample, now_ms),
        Phase::Ready => evaluate_ready(config, session, sample),
    }
}

fn evaluate_sending(
    config: &RecirculatorConfig,
    session: &mut ControlSession,
    sample: Option<&DeviceStatus>,
    now_ms: u64,
) -> Evaluation {
    if let Some(sample) = sample.filter(|sample| sample.is_on()) {
        session.mark_heating_started(sample.temperature, now_ms);
        return Evaluation::at(Phase::Heating);
    }

    if session.command_elapsed_ms(now_ms) > config.command_timeout_ms {
        return Evaluation::fail(ControlError::NoResponse {
            timeout_ms: config.command_timeout_ms,
        });
    }

    Evaluation::at(Phase::Sending)
}

fn evaluate_heating(
    config: &RecirculatorConfig,
    session: &ControlSession,
    sample: Option<&DeviceStatus>,
    now_ms: u64,
) -> Evaluation {
    let Some(sample) = sample else {
        return Evaluation::at(Phase::Heating);
    };

    // OFF right after the command is usually the device still settling.
    if sample.state != PowerState::Off
        || session.heating_elapsed_ms(now_ms) <= config.heating_grace_ms
    {
        return Evaluation::at(Phase::Heating);
    }

    let reached_at = session.max_temperature - config.temp_reached_margin;
    match sample.temperature {
        Some(temperature) if temperature >= reached_at => Evaluation::at(Phase::Ready),
        temperature => Evaluation::fail(ControlError::EarlyStop {
            temperature,
            target: session.max_temperature,
        }),
    }
}

fn evaluate_ready(
    config: &RecirculatorConfig,
    session: &ControlSession,
    sample: Option<&DeviceStatus>,
) -> Evaluation {
    let Some(sample) = sample else {
        return Evaluation::at(Phase::Ready);
    };

    let cooled_below = session.max_temperature - config.temp_cooling_threshold;
    match sample.temperature {
        Some(temperature) if temperature >= cooled_below => Evaluation::at(Phase::Ready),
        _ => Evaluation::at(Phase::Off),
    }
}

/// Polling cadence for a phase. `None` suspends polling.
pub fn cadence(config: &RecirculatorConfig, phase: Phase) -> Option<Duration> {
    match phase {
        Phase::Off => None,
        Phase::Sending => Some(Duration::from_millis(config.sending_poll_interval_ms)),
        Phase::Heating | Phase::Ready => {
            Some(Duration::from_millis(config.steady_poll_interval_ms))
        }
    }
}

/// Fraction of the way from `initial` to `target`, clamped to `0.0..=1.0`.
pub fn progress(initial: f32, current: f32, target: f32) -> f32 {
    if initial >= target {
        return 0.0;
    }
    ((current - initial) / (target - initial)).clamp(0.0, 1.0)
}
