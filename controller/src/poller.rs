//! Telemetry polling task.
//!
//! The task first performs the mandatory attach-time status check, then
//! follows whatever cadence the supervisor publishes. A cadence change wakes
//! the task immediately and restarts the wait, so only one cadence is ever
//! in effect; `None` parks the task until the next change.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::{store::PreferenceStore, supervisor::Shared, transport::DeviceTransport};

pub(crate) fn spawn<T, S>(shared: Arc<Shared<T, S>>) -> JoinHandle<()>
where
    T: DeviceTransport,
    S: PreferenceStore,
{
    let mut cadence = shared.cadence.subscribe();

    tokio::spawn(async move {
        poll_once(&shared).await;

        loop {
            let period = *cadence.borrow_and_update();
            let Some(period) = period else {
                if cadence.changed().await.is_err() {
                    break;
                }
                continue;
            };

            tokio::select! {
                _ = tokio::time::sleep(period) => poll_once(&shared).await,
                changed = cadence.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// One fetch-and-evaluate step. A failed fetch is not a signal by itself;
/// the engine only re-checks its timers.
async fn poll_once<T, S>(shared: &Shared<T, S>)
where
    T: DeviceTransport,
    S: PreferenceStore,
{
    let epoch = shared.engine.lock().await.epoch();
    let result = shared.transport.get_status(&shared.device_id).await;

    let mut engine = shared.engine.lock().await;
    let now_ms = shared.now_ms();
    let events = match result {
        Ok(sample) => engine.on_sample(epoch, sample, now_ms),
        Err(err) => {
            debug!("{}: no sample this tick: {err}", shared.device_id);
            engine.tick(epoch, now_ms)
        }
    };
    shared.settle(&engine, &events);
}
