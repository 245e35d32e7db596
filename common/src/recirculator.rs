use crate::{
    config::{RecirculatorConfig, TargetConfig},
    error::ControlError,
    machine,
    session::ControlSession,
    types::{ControllerStatus, DeviceStatus, Phase},
    watchdog::{self, Freshness},
    wire::Command,
};

/// A device command the runtime must send, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineAction {
    SetMaxTemperature(f32),
    TurnOn,
    TurnOff,
}

impl EngineAction {
    pub fn command(&self) -> Command {
        match self {
            Self::SetMaxTemperature(_) => Command::SetMaxTemperature,
            Self::TurnOn => Command::TurnOn,
            Self::TurnOff => Command::TurnOff,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    PhaseChanged { from: Phase, to: Phase },
    Fault(ControlError),
    DisconnectWarning,
    DisconnectCleared,
}

/// What the runtime needs after an accepted start request.
#[derive(Debug, Clone, PartialEq)]
pub struct StartPlan {
    pub epoch: u64,
    pub actions: Vec<EngineAction>,
    pub events: Vec<EngineEvent>,
}

/// Supervisory state for one device.
///
/// Every input (telemetry, command outcome, clock tick) is tagged with the
/// epoch it was issued under. The epoch moves whenever a session is created
/// or discarded, so results that belong to a session that no longer exists
/// are dropped instead of mutating its successor.
#[derive(Debug, Clone)]
pub struct RecirculatorEngine {
    pub config: RecirculatorConfig,
    target: TargetConfig,

    phase: Phase,
    session: Option<ControlSession>,
    status: Option<DeviceStatus>,

    awaiting_initial_check: bool,
    stop_requested: bool,
    disconnect_warning: bool,
    last_error: Option<ControlError>,
    epoch: u64,
}

impl RecirculatorEngine {
    pub fn new(mut config: RecirculatorConfig, target: TargetConfig) -> Self {
        config.sanitize();
        Self {
            config,
            target,
            phase: Phase::Off,
            session: None,
            status: None,
            awaiting_initial_check: false,
            stop_requested: false,
            disconnect_warning: false,
            last_error: None,
            epoch: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn target(&self) -> TargetConfig {
        self.target
    }

    pub fn status(&self) -> Option<&DeviceStatus> {
        self.status.as_ref()
    }

    pub fn session(&self) -> Option<&ControlSession> {
        self.session.as_ref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn disconnect_warning(&self) -> bool {
        self.disconnect_warning
    }

    pub fn last_error(&self) -> Option<&ControlError> {
        self.last_error.as_ref()
    }

    pub fn is_awaiting_initial_check(&self) -> bool {
        self.awaiting_initial_check
    }

    /// Heating progress in `0.0..=1.0`; only defined while heating.
    pub fn progress(&self) -> Option<f32> {
        if self.phase != Phase::Heating {
            return None;
        }
        let session = self.session.as_ref()?;
        let initial = session.initial_temperature?;
        let current = self.status.as_ref()?.temperature?;
        Some(machine::progress(initial, current, session.max_temperature))
    }

    /// Active polling cadence. While attached and waiting for the first
    /// sample, OFF polls at the steady cadence until one arrives.
    pub fn poll_cadence(&self) -> Option<std::time::Duration> {
        if self.phase == Phase::Off && self.awaiting_initial_check {
            return machine::cadence(&self.config, Phase::Heating);
        }
        machine::cadence(&self.config, self.phase)
    }

    /// Begins observing a device. The next sample decides whether a session
    /// left running elsewhere is adopted.
    pub fn attach(&mut self) -> u64 {
        self.epoch += 1;
        self.awaiting_initial_check = self.phase == Phase::Off;
        self.epoch
    }

    /// Stops observing. Any session is discarded without commanding the device.
    pub fn detach(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        self.awaiting_initial_check = false;
        self.enter_off(&mut events);
        events
    }

    pub fn request_start(&mut self, value: f32, now_ms: u64) -> Result<StartPlan, ControlError> {
        if self.phase != Phase::Off {
            return Err(ControlError::Busy(self.phase));
        }

        let target = TargetConfig::validate(value).inspect_err(|err| {
            self.last_error = Some(err.clone());
        })?;

        let mut events = Vec::new();
        self.target = target;
        self.stop_requested = false;
        self.last_error = None;
        self.awaiting_initial_check = false;
        let last_seen = self.status.as_ref().and_then(|status| status.timestamp.clone());
        self.session = Some(ControlSession::for_start(
            target.max_temperature,
            last_seen,
            now_ms,
        ));
        self.epoch += 1;
        self.set_phase(Phase::Sending, &mut events);

        Ok(StartPlan {
            epoch: self.epoch,
            actions: vec![
                EngineAction::SetMaxTemperature(target.max_temperature),
                EngineAction::TurnOn,
            ],
            events,
        })
    }

    /// Marks a stop as pending so a start still dispatching gives up before
    /// its next command.
    pub fn begin_stop(&mut self) -> Vec<EngineAction> {
        self.stop_requested = true;
        vec![EngineAction::TurnOff]
    }

    /// The device acknowledged `turnOff`.
    pub fn stop_confirmed(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        self.stop_requested = false;
        self.awaiting_initial_check = false;
        self.enter_off(&mut events);
        events
    }

    /// `turnOff` failed; the session carries on as before.
    pub fn stop_failed(&mut self) {
        self.stop_requested = false;
    }

    /// Whether the start issued under `epoch` may send its next command.
    pub fn start_is_current(&self, epoch: u64) -> bool {
        epoch == self.epoch && self.session.is_some() && !self.stop_requested
    }

    /// A start command failed; aborts the session it belonged to.
    pub fn dispatch_failed(&mut self, epoch: u64, error: ControlError) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        if epoch != self.epoch || self.session.is_none() {
            return events;
        }
        self.fail(error, &mut events);
        events
    }

    pub fn on_sample(
        &mut self,
        epoch: u64,
        sample: DeviceStatus,
        now_ms: u64,
    ) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        if epoch != self.epoch {
            return events;
        }

        let freshness = match self.session.as_mut() {
            Some(session) => watchdog::observe(session, &sample, now_ms),
            None => {
                self.status = Some(sample);
                self.recover_if_running(now_ms, &mut events);
                return events;
            }
        };

        if freshness == Freshness::Fresh && self.disconnect_warning {
            self.disconnect_warning = false;
            events.push(EngineEvent::DisconnectCleared);
        }

        self.status = Some(sample);
        if freshness.is_evaluable() {
            let sample = self.status.clone();
            self.step(sample.as_ref(), now_ms, &mut events);
        } else {
            self.step(None, now_ms, &mut events);
        }
        events
    }

    /// Time-only evaluation, used when a poll produced no sample.
    pub fn tick(&mut self, epoch: u64, now_ms: u64) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        if epoch == self.epoch {
            self.step(None, now_ms, &mut events);
        }
        events
    }

    pub fn snapshot(&self, device_id: &str, now_ms: u64) -> ControllerStatus {
        let progress = self.progress();
        ControllerStatus {
            device_id: device_id.to_string(),
            phase: self.phase,
            device_state: self.status.as_ref().map(|status| status.state),
            temperature: self.status.as_ref().and_then(|status| status.temperature),
            device_timestamp: self
                .status
                .as_ref()
                .and_then(|status| status.timestamp.clone()),
            max_temperature: self
                .session
                .as_ref()
                .map(|session| session.max_temperature)
                .unwrap_or(self.target.max_temperature),
            progress,
            progress_percent: progress.map(|value| (value * 100.0).round() as u8),
            disconnect_warning: self.disconnect_warning,
            last_error: self.last_error.as_ref().map(ToString::to_string),
            session_active: self.session.is_some(),
            heating_elapsed_ms: self
                .session
                .as_ref()
                .filter(|_| matches!(self.phase, Phase::Heating | Phase::Ready))
                .map(|session| session.heating_elapsed_ms(now_ms))
                .unwrap_or(0),
        }
    }

    fn recover_if_running(&mut self, now_ms: u64, events: &mut Vec<EngineEvent>) {
        if self.phase != Phase::Off || !self.awaiting_initial_check {
            return;
        }
        self.awaiting_initial_check = false;

        let Some(status) = self.status.as_ref().filter(|status| status.is_on()) else {
            return;
        };
        self.session = Some(ControlSession::recovered(
            self.target.max_temperature,
            status.temperature,
            status.timestamp.clone(),
            now_ms,
        ));
        self.epoch += 1;
        self.set_phase(Phase::Heating, events);
    }

    fn step(
        &mut self,
        sample: Option<&DeviceStatus>,
        now_ms: u64,
        events: &mut Vec<EngineEvent>,
    ) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let evaluation = machine::evaluate(&self.config, self.phase, session, sample, now_ms);
        let stale = watchdog::is_stale(&self.config, evaluation.phase, session, now_ms);

        match (evaluation.phase, evaluation.fault) {
            (_, Some(fault)) => self.fail(fault, events),
            (Phase::Off, None) => self.enter_off(events),
            (phase, None) => {
                self.set_phase(phase, events);
                if stale && !self.disconnect_warning {
                    self.disconnect_warning = true;
                    events.push(EngineEvent::DisconnectWarning);
                }
            }
        }
    }

    fn fail(&mut self, fault: ControlError, events: &mut Vec<EngineEvent>) {
        self.last_error = Some(fault.clone());
        events.push(EngineEvent::Fault(fault));
        self.enter_off(events);
    }

    fn enter_off(&mut self, events: &mut Vec<EngineEvent>) {
        if self.session.take().is_some() {
            self.epoch += 1;
        }
        self.set_phase(Phase::Off, events);
    }

    fn set_phase(&mut self, phase: Phase, events: &mut Vec<EngineEvent>) {
        if self.phase == phase {
            return;
        }
        events.push(EngineEvent::PhaseChanged {
            from: self.phase,
            to: phase,
        });
        self.phase = phase;

        if self.disconnect_warning {
            self.disconnect_warning = false;
            events.push(EngineEvent::DisconnectCleared);
        }
    }
}
