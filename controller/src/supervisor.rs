use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{info, warn};

use recirc_common::{
    config::MAX_TEMPERATURE_KEY, ControlError, ControllerStatus, EngineEvent, RecirculatorEngine,
    TargetConfig,
};

use crate::{
    dispatcher::Dispatcher,
    poller,
    store::{load_target, PreferenceStore},
    transport::DeviceTransport,
};

/// Everything the poller task and the request handlers share. All engine
/// mutation happens under `engine`, which serializes telemetry, command
/// outcomes and user requests into one evaluation order.
pub(crate) struct Shared<T, S> {
    pub engine: Mutex<RecirculatorEngine>,
    pub transport: Arc<T>,
    pub store: Arc<S>,
    pub dispatcher: Dispatcher<T>,
    pub device_id: String,
    pub cadence: watch::Sender<Option<Duration>>,
    /// Held for the whole of a start or stop command sequence.
    commands: Mutex<()>,
    started: Instant,
}

impl<T, S> Shared<T, S> {
    pub fn now_ms(&self) -> u64 {
        self.started
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }

    /// Logs what happened and republishes the cadence. Called with the engine
    /// lock held so the cadence always matches the phase just entered.
    pub fn settle(&self, engine: &RecirculatorEngine, events: &[EngineEvent]) {
        for event in events {
            match event {
                EngineEvent::PhaseChanged { from, to } => {
                    info!("{}: phase {from} -> {to}", self.device_id)
                }
                EngineEvent::Fault(err) => warn!("{}: {err}", self.device_id),
                EngineEvent::DisconnectWarning => warn!(
                    "{}: no fresh telemetry for over {} ms, device may be disconnected",
                    self.device_id, engine.config.disconnect_timeout_ms
                ),
                EngineEvent::DisconnectCleared => info!("{}: telemetry resumed", self.device_id),
            }
        }

        let cadence = engine.poll_cadence();
        self.cadence.send_if_modified(|current| {
            if *current == cadence {
                false
            } else {
                *current = cadence;
                true
            }
        });
    }
}

/// Drives one device: owns the engine, the polling task and the command path.
pub struct Supervisor<T, S> {
    shared: Arc<Shared<T, S>>,
    poller: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<T: DeviceTransport, S: PreferenceStore> Supervisor<T, S> {
    pub fn new(
        engine: RecirculatorEngine,
        transport: Arc<T>,
        store: Arc<S>,
        device_id: String,
    ) -> Self {
        let (cadence, _) = watch::channel(None);
        let dispatcher = Dispatcher::new(transport.clone(), device_id.clone());
        Self {
            shared: Arc::new(Shared {
                engine: Mutex::new(engine),
                transport,
                store,
                dispatcher,
                device_id,
                cadence,
                commands: Mutex::new(()),
                started: Instant::now(),
            }),
            poller: std::sync::Mutex::new(None),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.shared.device_id
    }

    /// Starts observing the device. The first poll happens immediately and
    /// adopts a device that is already heating.
    pub async fn attach(&self) {
        {
            let mut engine = self.shared.engine.lock().await;
            engine.attach();
            self.shared.settle(&engine, &[]);
        }

        let handle = poller::spawn(self.shared.clone());
        if let Some(previous) = self.replace_poller(Some(handle)) {
            previous.abort();
        }
        info!("{}: attached", self.shared.device_id);
    }

    /// Cancels all polling and discards any session. The device is left as is.
    pub async fn detach(&self) {
        if let Some(handle) = self.replace_poller(None) {
            handle.abort();
        }

        let mut engine = self.shared.engine.lock().await;
        let events = engine.detach();
        self.shared.settle(&engine, &events);
        info!("{}: detached", self.shared.device_id);
    }

    /// Validates the target, then sends `setMaxTemperature` followed by
    /// `turnOn`. Without a value the stored preference is used. Each command
    /// goes out only while the session it belongs to is still current, so a
    /// stop or detach that lands mid-sequence cancels the rest.
    pub async fn start(&self, value: Option<f32>) -> Result<ControllerStatus, ControlError> {
        let value = match value {
            Some(value) => value,
            None => load_target(self.shared.store.as_ref()).await.max_temperature,
        };

        let (plan, target) = {
            let mut engine = self.shared.engine.lock().await;
            match engine.request_start(value, self.shared.now_ms()) {
                Ok(plan) => {
                    self.shared.settle(&engine, &plan.events);
                    (plan, engine.target())
                }
                Err(err) => {
                    warn!("{}: start rejected: {err}", self.shared.device_id);
                    return Err(err);
                }
            }
        };
        self.ensure_poller();

        let stored = target.to_stored();
        if let Err(err) = self.shared.store.set(MAX_TEMPERATURE_KEY, &stored).await {
            warn!("failed to persist {MAX_TEMPERATURE_KEY}: {err:#}");
        }

        let _commands = self.shared.commands.lock().await;
        for action in plan.actions {
            if !self.shared.engine.lock().await.start_is_current(plan.epoch) {
                let err = ControlError::Cancelled {
                    next: action.command().as_str(),
                };
                info!("{}: {err}", self.shared.device_id);
                return Err(err);
            }

            if let Err(err) = self.shared.dispatcher.send(action).await {
                let mut engine = self.shared.engine.lock().await;
                let events = engine.dispatch_failed(plan.epoch, err.clone());
                self.shared.settle(&engine, &events);
                return Err(err);
            }
        }

        Ok(self.snapshot().await)
    }

    /// Sends `turnOff`; the session ends only once the device acknowledges.
    /// A start still dispatching is cancelled before its next command.
    pub async fn stop(&self) -> Result<ControllerStatus, ControlError> {
        let actions = self.shared.engine.lock().await.begin_stop();
        let _commands = self.shared.commands.lock().await;
        if let Err(err) = self.shared.dispatcher.execute(actions).await {
            self.shared.engine.lock().await.stop_failed();
            return Err(err);
        }

        let mut engine = self.shared.engine.lock().await;
        let events = engine.stop_confirmed();
        self.shared.settle(&engine, &events);
        Ok(engine.snapshot(&self.shared.device_id, self.shared.now_ms()))
    }

    pub async fn snapshot(&self) -> ControllerStatus {
        let engine = self.shared.engine.lock().await;
        engine.snapshot(&self.shared.device_id, self.shared.now_ms())
    }

    pub async fn stored_target(&self) -> TargetConfig {
        load_target(self.shared.store.as_ref()).await
    }

    /// A start after `detach` (or before any `attach`) still needs someone
    /// watching the command timeout.
    fn ensure_poller(&self) {
        let mut slot = self
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *slot = Some(poller::spawn(self.shared.clone()));
        info!("{}: polling started for new session", self.shared.device_id);
    }

    fn replace_poller(&self, next: Option<JoinHandle<()>>) -> Option<JoinHandle<()>> {
        let mut slot = self
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *slot, next)
    }
}

impl<T, S> Drop for Supervisor<T, S> {
    fn drop(&mut self) {
        let slot = self
            .poller
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    };

    use async_trait::async_trait;
    use recirc_common::{wire::Command, DeviceStatus, Phase, PowerState, RecirculatorConfig};

    use super::*;
    use crate::{store::memory::MemoryStore, transport::TransportError};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        SetMaxTemperature(f32),
        TurnOn,
        TurnOff,
    }

    /// Scriptable device: returns whatever status was last set, or fails the
    /// read when none is set.
    #[derive(Default)]
    struct FakeTransport {
        status: StdMutex<Option<DeviceStatus>>,
        failing: StdMutex<Option<Command>>,
        configure_delay: StdMutex<Option<Duration>>,
        calls: StdMutex<Vec<Call>>,
        polls: AtomicUsize,
    }

    impl FakeTransport {
        fn report(&self, state: PowerState, temperature: f32, ts: &str) {
            *self.status.lock().unwrap() = Some(DeviceStatus {
                state,
                temperature: Some(temperature),
                timestamp: Some(ts.to_string()),
            });
        }

        fn go_silent(&self) {
            *self.status.lock().unwrap() = None;
        }

        fn fail(&self, command: Command) {
            *self.failing.lock().unwrap() = Some(command);
        }

        fn delay_configuration(&self, delay: Duration) {
            *self.configure_delay.lock().unwrap() = Some(delay);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn polls(&self) -> usize {
            self.polls.load(Ordering::SeqCst)
        }

        fn record(&self, command: Command, call: Call) -> Result<(), TransportError> {
            self.calls.lock().unwrap().push(call);
            if *self.failing.lock().unwrap() == Some(command) {
                return Err(TransportError::Rejected("fake failure".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl DeviceTransport for FakeTransport {
        async fn get_status(&self, _device_id: &str) -> Result<DeviceStatus, TransportError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.status
                .lock()
                .unwrap()
                .clone()
                .ok_or(TransportError::Timeout(Duration::from_secs(3)))
        }

        async fn set_max_temperature(
            &self,
            _device_id: &str,
            value: f32,
        ) -> Result<(), TransportError> {
            let delay = *self.configure_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.record(Command::SetMaxTemperature, Call::SetMaxTemperature(value))
        }

        async fn turn_on(&self, _device_id: &str) -> Result<(), TransportError> {
            self.record(Command::TurnOn, Call::TurnOn)
        }

        async fn turn_off(&self, _device_id: &str) -> Result<(), TransportError> {
            self.record(Command::TurnOff, Call::TurnOff)
        }
    }

    fn supervisor(
        transport: Arc<FakeTransport>,
        store: Arc<MemoryStore>,
    ) -> Supervisor<FakeTransport, MemoryStore> {
        let engine = RecirculatorEngine::new(RecirculatorConfig::default(), TargetConfig::default());
        Supervisor::new(engine, transport, store, "test-device".to_string())
    }

    async fn wait(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    async fn phase(supervisor: &Supervisor<FakeTransport, MemoryStore>) -> Phase {
        supervisor.shared.engine.lock().await.phase()
    }

    #[tokio::test(start_paused = true)]
    async fn start_configures_before_power_on_and_persists_target() {
        let transport = Arc::new(FakeTransport::default());
        let store = Arc::new(MemoryStore::default());
        let supervisor = supervisor(transport.clone(), store.clone());

        let status = supervisor.start(Some(45.0)).await.expect("start accepted");

        assert_eq!(
            transport.calls(),
            vec![Call::SetMaxTemperature(45.0), Call::TurnOn]
        );
        assert_eq!(status.phase, Phase::Sending);
        assert_eq!(store.value(MAX_TEMPERATURE_KEY).await.as_deref(), Some("45"));
    }

    #[tokio::test(start_paused = true)]
    async fn start_without_value_uses_stored_preference() {
        let transport = Arc::new(FakeTransport::default());
        let store = Arc::new(MemoryStore::with(MAX_TEMPERATURE_KEY, "52"));
        let supervisor = supervisor(transport.clone(), store);

        supervisor.start(None).await.expect("start accepted");

        assert_eq!(transport.calls()[0], Call::SetMaxTemperature(52.0));
    }

    #[tokio::test(start_paused = true)]
    async fn unsafe_target_is_rejected_locally() {
        let transport = Arc::new(FakeTransport::default());
        let store = Arc::new(MemoryStore::default());
        let supervisor = supervisor(transport.clone(), store.clone());

        let result = supervisor.start(Some(75.0)).await;

        assert!(matches!(result, Err(ControlError::OutOfRange { .. })));
        assert!(transport.calls().is_empty());
        assert_eq!(store.value(MAX_TEMPERATURE_KEY).await, None);
        assert_eq!(phase(&supervisor).await, Phase::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_configuration_never_powers_on() {
        let transport = Arc::new(FakeTransport::default());
        transport.fail(Command::SetMaxTemperature);
        let supervisor = supervisor(transport.clone(), Arc::new(MemoryStore::default()));

        let result = supervisor.start(Some(40.0)).await;

        assert!(matches!(
            result,
            Err(ControlError::Dispatch {
                command: "setMaxTemperature",
                ..
            })
        ));
        assert_eq!(transport.calls(), vec![Call::SetMaxTemperature(40.0)]);
        let status = supervisor.snapshot().await;
        assert_eq!(status.phase, Phase::Off);
        assert!(status.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out_to_off() {
        let transport = Arc::new(FakeTransport::default());
        transport.report(PowerState::Off, 20.0, "t0");
        let supervisor = supervisor(transport.clone(), Arc::new(MemoryStore::default()));
        supervisor.attach().await;
        wait(10).await;

        supervisor.start(Some(40.0)).await.expect("start accepted");
        wait(9_000).await;
        assert_eq!(phase(&supervisor).await, Phase::Sending);

        wait(2_500).await;
        let status = supervisor.snapshot().await;
        assert_eq!(status.phase, Phase::Off);
        assert!(status
            .last_error
            .is_some_and(|message| message.contains("did not respond")));
    }

    #[tokio::test(start_paused = true)]
    async fn full_cycle_reaches_ready() {
        let transport = Arc::new(FakeTransport::default());
        transport.report(PowerState::Off, 20.0, "t0");
        let supervisor = supervisor(transport.clone(), Arc::new(MemoryStore::default()));
        supervisor.attach().await;
        wait(10).await;

        supervisor.start(Some(40.0)).await.expect("start accepted");
        transport.report(PowerState::On, 20.0, "t1");
        wait(1_500).await;
        assert_eq!(phase(&supervisor).await, Phase::Heating);

        transport.report(PowerState::On, 30.0, "t2");
        wait(5_000).await;
        let status = supervisor.snapshot().await;
        assert_eq!(status.progress, Some(0.5));

        transport.report(PowerState::Off, 39.0, "t3");
        wait(5_000).await;
        assert_eq!(phase(&supervisor).await, Phase::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_polling() {
        let transport = Arc::new(FakeTransport::default());
        transport.report(PowerState::Off, 20.0, "t0");
        let supervisor = supervisor(transport.clone(), Arc::new(MemoryStore::default()));
        supervisor.attach().await;
        wait(10).await;

        supervisor.start(Some(40.0)).await.expect("start accepted");
        transport.report(PowerState::On, 20.0, "t1");
        wait(1_500).await;
        assert_eq!(phase(&supervisor).await, Phase::Heating);

        let status = supervisor.stop().await.expect("stop acknowledged");
        assert_eq!(status.phase, Phase::Off);
        assert_eq!(transport.calls().last(), Some(&Call::TurnOff));

        let polls = transport.polls();
        transport.report(PowerState::On, 35.0, "t2");
        wait(60_000).await;

        assert_eq!(transport.polls(), polls);
        assert_eq!(phase(&supervisor).await, Phase::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_stop_keeps_session() {
        let transport = Arc::new(FakeTransport::default());
        transport.report(PowerState::On, 30.0, "t0");
        transport.fail(Command::TurnOff);
        let supervisor = supervisor(transport.clone(), Arc::new(MemoryStore::default()));
        supervisor.attach().await;
        wait(10).await;
        assert_eq!(phase(&supervisor).await, Phase::Heating);

        assert!(supervisor.stop().await.is_err());
        assert_eq!(phase(&supervisor).await, Phase::Heating);
    }

    #[tokio::test(start_paused = true)]
    async fn attach_adopts_running_device_without_commands() {
        let transport = Arc::new(FakeTransport::default());
        transport.report(PowerState::On, 33.0, "t0");
        let supervisor = supervisor(transport.clone(), Arc::new(MemoryStore::default()));

        supervisor.attach().await;
        wait(10).await;

        assert_eq!(phase(&supervisor).await, Phase::Heating);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn initial_check_retries_until_a_sample_arrives() {
        let transport = Arc::new(FakeTransport::default());
        let supervisor = supervisor(transport.clone(), Arc::new(MemoryStore::default()));

        supervisor.attach().await;
        wait(10).await;
        assert_eq!(transport.polls(), 1);
        assert_eq!(phase(&supervisor).await, Phase::Off);

        transport.report(PowerState::On, 31.0, "t0");
        wait(5_000).await;
        assert_eq!(phase(&supervisor).await, Phase::Heating);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_telemetry_warns_without_changing_phase() {
        let transport = Arc::new(FakeTransport::default());
        transport.report(PowerState::On, 30.0, "t0");
        let supervisor = supervisor(transport.clone(), Arc::new(MemoryStore::default()));
        supervisor.attach().await;
        wait(10).await;

        transport.go_silent();
        wait(26_000).await;

        let status = supervisor.snapshot().await;
        assert_eq!(status.phase, Phase::Heating);
        assert!(status.disconnect_warning);

        transport.report(PowerState::On, 31.0, "t1");
        wait(5_000).await;
        assert!(!supervisor.snapshot().await.disconnect_warning);
    }

    #[tokio::test(start_paused = true)]
    async fn detach_cancels_all_timers() {
        let transport = Arc::new(FakeTransport::default());
        transport.report(PowerState::On, 30.0, "t0");
        let supervisor = supervisor(transport.clone(), Arc::new(MemoryStore::default()));
        supervisor.attach().await;
        wait(10).await;

        supervisor.detach().await;
        let polls = transport.polls();
        wait(60_000).await;

        assert_eq!(transport.polls(), polls);
        assert_eq!(phase(&supervisor).await, Phase::Off);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_configuration_cancels_power_on() {
        let transport = Arc::new(FakeTransport::default());
        transport.report(PowerState::Off, 20.0, "t0");
        transport.delay_configuration(Duration::from_millis(500));
        let supervisor = Arc::new(supervisor(
            transport.clone(),
            Arc::new(MemoryStore::default()),
        ));
        supervisor.attach().await;
        wait(10).await;

        let starting = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.start(Some(40.0)).await }
        });
        wait(100).await;

        let status = supervisor.stop().await.expect("stop acknowledged");
        assert_eq!(status.phase, Phase::Off);

        let result = starting.await.unwrap();
        assert_eq!(result.err(), Some(ControlError::Cancelled { next: "turnOn" }));
        assert_eq!(
            transport.calls(),
            vec![Call::SetMaxTemperature(40.0), Call::TurnOff]
        );

        wait(30_000).await;
        assert_eq!(phase(&supervisor).await, Phase::Off);
        assert!(!transport.calls().contains(&Call::TurnOn));
    }

    #[tokio::test(start_paused = true)]
    async fn detach_during_configuration_cancels_power_on() {
        let transport = Arc::new(FakeTransport::default());
        transport.report(PowerState::Off, 20.0, "t0");
        transport.delay_configuration(Duration::from_millis(500));
        let supervisor = Arc::new(supervisor(
            transport.clone(),
            Arc::new(MemoryStore::default()),
        ));
        supervisor.attach().await;
        wait(10).await;

        let starting = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.start(Some(40.0)).await }
        });
        wait(100).await;
        supervisor.detach().await;

        let result = starting.await.unwrap();
        assert!(matches!(result, Err(ControlError::Cancelled { .. })));
        assert_eq!(transport.calls(), vec![Call::SetMaxTemperature(40.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn start_after_detach_still_times_out() {
        let transport = Arc::new(FakeTransport::default());
        transport.report(PowerState::Off, 20.0, "t0");
        let supervisor = supervisor(transport.clone(), Arc::new(MemoryStore::default()));
        supervisor.attach().await;
        wait(10).await;
        supervisor.detach().await;

        supervisor.start(Some(40.0)).await.expect("start accepted");
        wait(12_000).await;

        let status = supervisor.snapshot().await;
        assert_eq!(status.phase, Phase::Off);
        assert!(status
            .last_error
            .is_some_and(|message| message.contains("did not respond")));

        transport.report(PowerState::Off, 20.0, "t1");
        supervisor.start(Some(40.0)).await.expect("not stuck busy");
    }
}
