//! The per-session runtime: state machine, control loop and collaborators.
//!
//! The state machine synchronizes hardware state, the external task
//! renderer, the imaging-device trigger protocol and the operator signal
//! channels into one coherent per-cycle control loop with pause/resume,
//! cooperative abort and automatic fault recovery.

pub mod logger;
pub mod operator;
pub mod pause;
pub mod renderer;
pub mod sessions;
pub mod signals;
pub mod state_machine;
pub mod trials;
pub mod watchdog;

pub use logger::EventLogger;
pub use operator::{Decision, OperatorInterface, ScriptedOperator, StdinOperator};
pub use renderer::{channel_pair, RendererEndpoint, TaskMessage, TaskRendererChannel};
pub use signals::OperatorSignals;
pub use state_machine::{MesoscopeVr, RewardOutcome, SystemState};
pub use trials::decompose_trials;
