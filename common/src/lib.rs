pub mod actuator;
pub mod alpaca;
pub mod config;
pub mod device;
pub mod discovery;
pub mod engine;
pub mod flaps;
pub mod setup;
pub mod types;

pub use actuator::{ActuatorDriver, ActuatorError, ServoPulse, SimulatedActuator, MAX_BRIGHTNESS};
pub use alpaca::{AlpacaError, AlpacaResponse, ClientParams, Connection};
pub use config::{
    HardwareConfig, MotionConfig, NetworkConfig, PersistedSettings, RuntimeConfig, ServoTopology,
    StoredConfig,
};
pub use device::{AlpacaReply, CoverCalibratorDevice};
pub use engine::{CoverCalibratorEngine, EngineEvent, RequestError};
pub use flaps::{Flap, FlapError, FlapLimits, FlapSet, MAX_SERVOS};
pub use setup::{render_setup_page, CoverCommand, SetupChange, SetupError};
pub use types::{Axis, CalibratorState, CoverState, DeviceStatus, FlapMovement, FlapStatus};
