//! Core library for the mesovr_daq application.
//!
//! This library coordinates the Mesoscope-VR data acquisition rig and manages
//! the lifecycle of the acquired data, from the per-session runtime control
//! loop through compression, checksum-verified transfer and staged deletion.

pub mod clock;
pub mod config;
pub mod error;
pub mod hardware;
pub mod lifecycle;
pub mod runtime;
pub mod session;
