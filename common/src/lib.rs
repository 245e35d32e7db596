pub mod config;
pub mod error;
pub mod machine;
pub mod recirculator;
pub mod session;
pub mod topics;
pub mod types;
pub mod watchdog;
pub mod wire;

pub use config::{NetworkConfig, RecirculatorConfig, RuntimeConfig, TargetConfig};
pub use error::ControlError;
pub use machine::{cadence, evaluate, progress, Evaluation};
pub use recirculator::{EngineAction, EngineEvent, RecirculatorEngine, StartPlan};
pub use session::ControlSession;
pub use types::{ControllerStatus, DeviceStatus, Phase, PowerState};
