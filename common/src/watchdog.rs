//! Telemetry freshness and disconnect detection.
//!
//! Freshness is judged by the device's own timestamp, not by when a sample
//! happened to arrive: polling faster than the device reports yields the
//! same timestamp repeatedly, and those repeats must neither re-drive the
//! phase machine nor convince the watchdog that the device is alive.

use crate::{
    config::RecirculatorConfig,
    session::ControlSession,
    types::{DeviceStatus, Phase},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// New device timestamp; resets the watchdog.
    Fresh,
    /// No device timestamp at all; evaluated, but proves nothing about liveness.
    Unstamped,
    /// Same device timestamp as the last sample; ignored.
    Duplicate,
}

impl Freshness {
    pub fn is_evaluable(self) -> bool {
        !matches!(self, Self::Duplicate)
    }
}

pub fn classify(last_device_timestamp: Option<&str>, sample: &DeviceStatus) -> Freshness {
    match sample.timestamp.as_deref() {
        None => Freshness::Unstamped,
        Some(ts) if Some(ts) == last_device_timestamp => Freshness::Duplicate,
        Some(_) => Freshness::Fresh,
    }
}

/// Classifies `sample` against the session and records it when fresh.
pub fn observe(session: &mut ControlSession, sample: &DeviceStatus, now_ms: u64) -> Freshness {
    let freshness = classify(session.last_device_timestamp.as_deref(), sample);
    if freshness == Freshness::Fresh {
        session.last_device_timestamp = sample.timestamp.clone();
        session.last_fresh_telemetry_at_ms = now_ms;
    }
    freshness
}

/// Whether the disconnect warning should be raised. Only armed while heating.
pub fn is_stale(
    config: &RecirculatorConfig,
    phase: Phase,
    session: &ControlSession,
    now_ms: u64,
) -> bool {
    phase == Phase::Heating
        && now_ms.saturating_sub(session.last_fresh_telemetry_at_ms) > config.disconnect_timeout_ms
}
